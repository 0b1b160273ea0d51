//! Lifecycle of the single node container.
//!
//! ```text
//! start()
//!   ├─ Running                         → ok, nothing to do
//!   ├─ Created/Stopped, plain          → runtime.start
//!   ├─ Created/Stopped, file+secret    → remove → create -i → unlock channel
//!   └─ Absent                          → create → runtime.start | unlock channel
//! ```
//!
//! The state is queried from the runtime on every call; nothing is cached.
//! Transitions are serialized by one async lock, so two callers can never
//! race a remove-and-recreate. Public operations collapse errors to `bool` /
//! `Option` after logging them.
//!
//! [`ContainerLifecycleManager::shutdown`] interrupts an in-flight start,
//! stops the container it just created and waits for that stop to finish.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::container::descriptor::build_spec;
use crate::container::runtime::{ContainerRuntime, ContainerSpec, find};
use crate::container::unlock::SecretInjectionChannel;
use crate::error::{NodeError, Result};
use crate::node::{ConfigStore, NodeConfig};
use crate::settings::ContainerSettings;

/// Observed state of the node container. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Absent,
    /// Created but never started.
    Created,
    Stopped,
    Running,
}

/// Coarse status reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Absent, or the engine could not be asked.
    Unavailable,
    Stopped,
    Running,
}

impl From<LifecycleState> for ContainerStatus {
    fn from(state: LifecycleState) -> Self {
        match state {
            LifecycleState::Absent => Self::Unavailable,
            LifecycleState::Created | LifecycleState::Stopped => Self::Stopped,
            LifecycleState::Running => Self::Running,
        }
    }
}

// ---------------------------------------------------------------------------
// Orphan guard
// ---------------------------------------------------------------------------

/// Stops a just-created container if the start future is dropped before it
/// finishes, e.g. when an API client goes away. Best effort: needs a live
/// runtime. Daemon shutdown does not rely on it; see `create_and_start`.
struct OrphanGuard {
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
    armed: bool,
}

impl OrphanGuard {
    fn arm(runtime: Arc<dyn ContainerRuntime>, name: &str) -> Self {
        Self {
            runtime,
            name: name.to_string(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for OrphanGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container = %self.name, "start cancelled without a runtime, container left as is");
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        let name = std::mem::take(&mut self.name);
        warn!(container = %name, "start cancelled, stopping just-created container");
        handle.spawn(async move {
            if let Err(e) = runtime.stop(&name).await {
                warn!(container = %name, error = %e, "cleanup stop failed");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ContainerLifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<ConfigStore>,
    settings: ContainerSettings,
    transitions: Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl ContainerLifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<ConfigStore>,
        settings: ContainerSettings,
    ) -> Self {
        Self {
            runtime,
            store,
            settings,
            transitions: Mutex::new(()),
            shutdown: watch::Sender::new(false),
        }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    // -- boolean surface ---------------------------------------------------

    /// A container with the fixed name is present, in any state.
    pub async fn exists(&self) -> bool {
        self.try_exists().await.unwrap_or_else(|e| {
            warn!(container = %self.name(), error = %e, "exists check failed");
            false
        })
    }

    /// The container is in the engine's running list.
    pub async fn running(&self) -> bool {
        self.try_running().await.unwrap_or_else(|e| {
            warn!(container = %self.name(), error = %e, "running check failed");
            false
        })
    }

    /// On success exactly one container with the fixed name is running,
    /// configured from the current node settings.
    pub async fn start(&self) -> bool {
        let _lock = self.transitions.lock().await;
        self.report("start", self.start_locked().await)
    }

    /// Not running on return. Already stopped or absent is a no-op.
    pub async fn stop(&self) -> bool {
        let _lock = self.transitions.lock().await;
        self.report("stop", self.stop_locked().await)
    }

    /// Stop then start under one lock. Fails if either step fails.
    pub async fn restart(&self) -> bool {
        let _lock = self.transitions.lock().await;
        let result = match self.stop_locked().await {
            Ok(()) => self.start_locked().await,
            Err(e) => Err(e),
        };
        self.report("restart", result)
    }

    /// Absent on return; stops first if running. Already absent is success.
    pub async fn remove(&self) -> bool {
        let _lock = self.transitions.lock().await;
        self.report("remove", self.remove_locked().await)
    }

    /// Refuse further transitions and interrupt an in-flight start. Returns
    /// immediately; see [`Self::shutdown`] to wait for the cleanup.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// [`Self::begin_shutdown`], then wait until no transition is running.
    /// A container created by an interrupted start has been stopped by then.
    pub async fn shutdown(&self) {
        self.begin_shutdown();
        let _lock = self.transitions.lock().await;
        info!(container = %self.name(), "lifecycle manager shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn status(&self) -> ContainerStatus {
        match self.state().await {
            Ok(state) => state.into(),
            Err(e) => {
                warn!(container = %self.name(), error = %e, "status query failed");
                ContainerStatus::Unavailable
            }
        }
    }

    /// Last `tail` lines of container output, or the configured default.
    pub async fn logs(&self, tail: Option<usize>) -> Option<String> {
        let tail = tail.unwrap_or(self.settings.log_tail);
        match self.runtime.logs(self.name(), tail).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(container = %self.name(), error = %e, "log fetch failed");
                None
            }
        }
    }

    /// Rewrite the node config files from the in-memory settings.
    pub async fn refresh_config(&self) -> bool {
        self.report("refresh config", self.store.refresh_files().await)
    }

    // -- fallible core -----------------------------------------------------

    pub async fn try_exists(&self) -> Result<bool> {
        let all = self.runtime.list(true).await?;
        Ok(find(&all, self.name()).is_some())
    }

    pub async fn try_running(&self) -> Result<bool> {
        let running = self.runtime.list(false).await?;
        Ok(find(&running, self.name()).is_some())
    }

    pub async fn state(&self) -> Result<LifecycleState> {
        let all = self.runtime.list(true).await?;
        let Some(summary) = find(&all, self.name()) else {
            return Ok(LifecycleState::Absent);
        };
        if self.try_running().await? {
            return Ok(LifecycleState::Running);
        }
        Ok(if summary.state == "created" {
            LifecycleState::Created
        } else {
            LifecycleState::Stopped
        })
    }

    async fn start_locked(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(NodeError::ShuttingDown);
        }
        let node = self.store.snapshot().await;
        let interactive = node.needs_interactive_start();

        match self.state().await? {
            LifecycleState::Running => {
                info!(container = %self.name(), "already running");
                Ok(())
            }
            LifecycleState::Created | LifecycleState::Stopped if !interactive => {
                info!(container = %self.name(), "starting existing container");
                self.runtime.start(self.name()).await
            }
            LifecycleState::Created | LifecycleState::Stopped => {
                // A stopped container cannot be re-fed the secret; recreate.
                // Build the spec first so a bad config never destroys it.
                let spec = self.spec_for(&node, true)?;
                info!(container = %self.name(), "recreating container for interactive unlock");
                self.runtime.remove(self.name()).await?;
                self.create_and_start(spec, &node).await
            }
            LifecycleState::Absent => {
                let spec = self.spec_for(&node, interactive)?;
                self.create_and_start(spec, &node).await
            }
        }
    }

    fn spec_for(&self, node: &NodeConfig, interactive: bool) -> Result<ContainerSpec> {
        build_spec(&self.settings, self.store.dir(), node, interactive)
    }

    async fn create_and_start(&self, spec: ContainerSpec, node: &NodeConfig) -> Result<()> {
        let secret = match (spec.interactive, &node.passphrase) {
            (true, Some(p)) => Some(p.clone()),
            (true, None) => {
                return Err(NodeError::ConfigInvalid(
                    "interactive start without a passphrase".to_string(),
                ));
            }
            (false, _) => None,
        };

        info!(
            container = %spec.name,
            image = %spec.image,
            ports = ?spec.exposed_ports(),
            interactive = spec.interactive,
            "creating container"
        );
        self.runtime.create(&spec).await?;
        let guard = OrphanGuard::arm(Arc::clone(&self.runtime), &spec.name);

        let launch = async {
            match secret {
                Some(secret) => {
                    SecretInjectionChannel::new(
                        Arc::clone(&self.runtime),
                        spec.name.as_str(),
                        secret,
                        Duration::from_secs(self.settings.unlock_timeout_secs),
                    )
                    .run()
                    .await
                }
                None => self.runtime.start(&spec.name).await,
            }
        };
        let mut shutdown = self.shutdown.subscribe();
        let stopping = async move {
            let _ = shutdown.wait_for(|stopping| *stopping).await;
        };

        let result = tokio::select! {
            result = launch => result,
            () = stopping => {
                warn!(container = %spec.name, "shutdown during start, stopping just-created container");
                if let Err(e) = self.runtime.stop(&spec.name).await {
                    warn!(container = %spec.name, error = %e, "cleanup stop failed");
                }
                Err(NodeError::ShuttingDown)
            }
        };
        guard.disarm();
        result
    }

    async fn stop_locked(&self) -> Result<()> {
        if !self.try_running().await? {
            debug!(container = %self.name(), "not running, nothing to stop");
            return Ok(());
        }
        self.runtime.stop(self.name()).await?;
        info!(container = %self.name(), "stopped");
        Ok(())
    }

    async fn remove_locked(&self) -> Result<()> {
        match self.state().await? {
            LifecycleState::Absent => {
                debug!(container = %self.name(), "absent, nothing to remove");
                return Ok(());
            }
            LifecycleState::Running => self.runtime.stop(self.name()).await?,
            LifecycleState::Created | LifecycleState::Stopped => {}
        }
        match self.runtime.remove(self.name()).await {
            Ok(()) | Err(NodeError::ContainerAbsent(_)) => {
                info!(container = %self.name(), "removed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn report(&self, op: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(
                e @ (NodeError::SecretRejected(_)
                | NodeError::ConfigInvalid(_)
                | NodeError::ShuttingDown),
            ) => {
                warn!(container = %self.name(), op, error = %e, "operation refused");
                false
            }
            Err(e) => {
                error!(container = %self.name(), op, error = %e, "operation failed");
                false
            }
        }
    }
}
