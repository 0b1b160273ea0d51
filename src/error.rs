//! Error taxonomy for the node daemon.
//!
//! Every fallible operation below the lifecycle manager returns
//! [`NodeError`]. The manager logs the error with context and collapses it to
//! a `bool` / `Option` before it reaches a caller.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    /// The container engine could not be reached (binary missing, daemon down).
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The engine ran the command but reported failure.
    #[error("container runtime command `{command}` failed: {stderr}")]
    Runtime { command: String, stderr: String },

    /// The container with the fixed name does not exist.
    #[error("container not found: {0}")]
    ContainerAbsent(String),

    /// The node process refused the wallet passphrase.
    #[error("wallet passphrase rejected: {0}")]
    SecretRejected(String),

    /// Node settings are missing or contradict each other.
    #[error("invalid node configuration: {0}")]
    ConfigInvalid(String),

    /// A key expected in a config file was not found; the write was skipped.
    #[error("key `{key}` not found in {path}")]
    ConfigKeyMissing { path: PathBuf, key: String },

    /// The unlock protocol never reached a terminal state.
    #[error("timed out after {0}s waiting for the node to unlock")]
    Timeout(u64),

    /// The attach session ended or failed before an outcome was observed.
    #[error("attach session failed: {0}")]
    Attach(String),

    /// The daemon is stopping; no new transitions are accepted.
    #[error("daemon is shutting down")]
    ShuttingDown,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl NodeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
