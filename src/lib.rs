//! Control daemon for a containerized Sentinel dVPN node.
//!
//! The daemon owns one node container. It derives the container from the
//! node settings, feeds the wallet passphrase through the container's stdin
//! when the file keyring is in use, and keeps the node's bind-mounted config
//! files in step with the in-memory settings.

pub mod api;
pub mod container;
pub mod error;
pub mod logging;
pub mod node;
pub mod paths;
pub mod settings;

pub use error::{NodeError, Result};
