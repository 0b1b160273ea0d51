//! Capability interface over the container engine.
//!
//! The lifecycle manager only ever talks to [`ContainerRuntime`]; the
//! production implementation drives the engine CLI ([`super::docker`]) and
//! tests use [`super::mock::MockRuntime`].
//!
//! Contract for implementations:
//! - no internal retries
//! - no panics; every failure is a [`crate::NodeError`]
//! - an unreachable engine is reported as `NodeError::RuntimeUnavailable`

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;

// ---------------------------------------------------------------------------
// Container description
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Host port published to the same container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortBinding {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Udp,
        }
    }

    /// Engine notation, e.g. `51820/udp`.
    pub fn exposed(&self) -> String {
        format!("{}/{}", self.port, self.protocol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

/// Everything needed to create the node container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub mounts: Vec<BindMount>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub sysctls: Vec<(String, String)>,
    pub ports: Vec<PortBinding>,
    /// Keep stdin open so a secret can be written after attach.
    pub interactive: bool,
}

impl ContainerSpec {
    pub fn exposed_ports(&self) -> Vec<String> {
        self.ports.iter().map(PortBinding::exposed).collect()
    }
}

/// One row of the engine's container list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub name: String,
    /// Engine state string (`created`, `running`, `exited`, ...).
    pub state: String,
}

// ---------------------------------------------------------------------------
// Attach session
// ---------------------------------------------------------------------------

/// A live attachment to a container's stdio, opened together with its start.
///
/// Single owner: only the start call that opened it reads or writes it.
/// Dropping the session detaches from the container without stopping it.
pub struct AttachSession {
    /// Container stdin.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Combined stdout/stderr, in arrival order. Closed when the stream ends.
    pub output: mpsc::Receiver<String>,
    /// Resolves with `Err` if starting the container fails. Implementations
    /// deliver all output produced before the failure first.
    pub started: oneshot::Receiver<Result<()>>,
    /// Held to keep the attachment alive; dropping it detaches.
    pub detach: Option<oneshot::Sender<()>>,
}

impl AttachSession {
    /// Detach explicitly. Equivalent to dropping the session.
    pub fn close(mut self) {
        if let Some(tx) = self.detach.take() {
            let _ = tx.send(());
        }
    }
}

impl fmt::Debug for AttachSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachSession").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List containers; `all` includes stopped ones.
    async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>>;

    async fn create(&self, spec: &ContainerSpec) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    /// Force-remove.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Attach to the stdio of a created container and start it. The start
    /// runs concurrently with the session; its outcome arrives on
    /// [`AttachSession::started`].
    async fn start_attached(&self, name: &str) -> Result<AttachSession>;

    /// Last `tail` lines of combined output.
    async fn logs(&self, name: &str, tail: usize) -> Result<String>;
}

/// Look `name` up in a listing.
pub fn find<'a>(list: &'a [ContainerSummary], name: &str) -> Option<&'a ContainerSummary> {
    list.iter().find(|c| c.name == name)
}
