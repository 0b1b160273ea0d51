//! Directory layout for dvpn-node-daemon.
//!
//! - Config:  `$XDG_CONFIG_HOME/dvpn-node-daemon/` (`daemon.toml`)
//! - Data:    `$XDG_DATA_HOME/dvpn-node-daemon/`
//! - Logs:    `$XDG_DATA_HOME/dvpn-node-daemon/logs/`
//! - Node:    `~/.sentinelnode/` (bind-mounted into the node container)

use std::path::{Path, PathBuf};

const APP_NAME: &str = "dvpn-node-daemon";
const SETTINGS_FILE: &str = "daemon.toml";
const NODE_DIR: &str = ".sentinelnode";

/// All resolved daemon directory paths.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub config: PathBuf,
    pub data: PathBuf,
    pub logs: PathBuf,
}

impl DaemonPaths {
    /// Resolve all paths from the user's home directory. Creates nothing;
    /// the log directory is created by `logging::init` when file logging is on.
    pub fn resolve() -> Self {
        let home = home_dir();
        let config = match std::env::var("XDG_CONFIG_HOME") {
            Ok(xdg) => PathBuf::from(xdg).join(APP_NAME),
            Err(_) => home.join(".config").join(APP_NAME),
        };
        let data = match std::env::var("XDG_DATA_HOME") {
            Ok(xdg) => PathBuf::from(xdg).join(APP_NAME),
            Err(_) => home.join(".local").join("share").join(APP_NAME),
        };
        Self {
            config,
            logs: data.join("logs"),
            data,
        }
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config.join(SETTINGS_FILE)
    }

}

/// `~/.sentinelnode`, the directory the node image expects its config in.
pub fn default_node_config_dir() -> PathBuf {
    home_dir().join(NODE_DIR)
}

/// `$HOME`, or `/root` on the appliance where the daemon runs without one.
fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/root"))
}

/// Parent of `path`, creating it if needed.
pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
