//! Node settings and the config files the containerized node reads.

pub mod config;
pub mod store;
pub mod sync;

pub use config::{KeyringBackend, NodeConfig, NodeLocation, Passphrase, VpnType};
pub use store::ConfigStore;
pub use sync::{ConfigPatcher, LinePatcher};
