//! Daemon settings loaded from `daemon.toml`.
//!
//! Initialization order is fixed: read the file (if present), merge compiled
//! defaults for anything it leaves out (`#[serde(default)]`), then
//! [`DaemonSettings::validate`]. The resulting value is passed explicitly to
//! every constructor that needs it; nothing re-reads the file afterwards.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{NodeError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub container: ContainerSettings,
    pub node: NodeSettings,
    pub api: ApiSettings,
}

/// How the node container is named, built and observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Fixed singleton container name.
    pub name: String,
    pub image: String,
    /// Container engine CLI (`docker` or a compatible `podman`).
    pub runtime_binary: String,
    /// Arguments appended after the image.
    pub command: Vec<String>,
    /// Where the host config directory is mounted inside the container.
    pub config_mount_target: String,
    /// Host kernel module directory, mounted read-only at the same path.
    pub kernel_modules_dir: PathBuf,
    /// Upper bound on waiting for the node to accept or reject the passphrase.
    pub unlock_timeout_secs: u64,
    /// Default number of log lines returned by `logs`.
    pub log_tail: usize,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            name: "sentinel-dvpn-node".to_string(),
            image: "ghcr.io/sentinel-official/dvpn-node:latest".to_string(),
            runtime_binary: "docker".to_string(),
            command: vec!["process".to_string(), "start".to_string()],
            config_mount_target: "/root/.sentinelnode".to_string(),
            kernel_modules_dir: PathBuf::from("/lib/modules"),
            unlock_timeout_secs: 120,
            log_tail: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Host directory holding `config.toml`, `wireguard.toml` and `v2ray.toml`.
    pub config_dir: PathBuf,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            config_dir: crate::paths::default_node_config_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Socket address of the HTTP control surface.
    pub bind: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8081".to_string(),
        }
    }
}

impl DaemonSettings {
    pub fn from_toml(s: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Load `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|e| {
                NodeError::ConfigInvalid(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "daemon settings not found, using defaults");
                Self::default()
            }
            Err(e) => return Err(NodeError::io(path, e)),
        };
        settings.validate()?;
        info!(
            path = %path.display(),
            container = %settings.container.name,
            image = %settings.container.image,
            "daemon settings loaded"
        );
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.container;
        if c.name.trim().is_empty() {
            return Err(NodeError::ConfigInvalid("container.name is empty".into()));
        }
        if c.image.trim().is_empty() {
            return Err(NodeError::ConfigInvalid("container.image is empty".into()));
        }
        if c.runtime_binary.trim().is_empty() {
            return Err(NodeError::ConfigInvalid(
                "container.runtime_binary is empty".into(),
            ));
        }
        if c.unlock_timeout_secs == 0 {
            return Err(NodeError::ConfigInvalid(
                "container.unlock_timeout_secs must be positive".into(),
            ));
        }
        if !c.config_mount_target.starts_with('/') {
            return Err(NodeError::ConfigInvalid(format!(
                "container.config_mount_target must be absolute: {}",
                c.config_mount_target
            )));
        }
        if !c.kernel_modules_dir.is_absolute() {
            return Err(NodeError::ConfigInvalid(format!(
                "container.kernel_modules_dir must be absolute: {}",
                c.kernel_modules_dir.display()
            )));
        }
        if !self.node.config_dir.is_absolute() {
            return Err(NodeError::ConfigInvalid(format!(
                "node.config_dir must be absolute: {}",
                self.node.config_dir.display()
            )));
        }
        if self.api.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(NodeError::ConfigInvalid(format!(
                "api.bind is not a socket address: {}",
                self.api.bind
            )));
        }
        Ok(())
    }

    /// Commented `daemon.toml` matching the compiled defaults.
    pub fn default_toml() -> String {
        let d = Self::default();
        format!(
            r#"# dvpn-node-daemon settings. Missing values use compiled defaults.

[container]
name = "{name}"                 # singleton container name
image = "{image}"
runtime_binary = "{binary}"     # docker or podman
command = ["process", "start"]
config_mount_target = "{target}"
kernel_modules_dir = "{modules}"
unlock_timeout_secs = {timeout} # wait for the node to accept the passphrase
log_tail = {tail}

[node]
config_dir = "{config_dir}"     # holds config.toml, wireguard.toml, v2ray.toml

[api]
bind = "{bind}"
"#,
            name = d.container.name,
            image = d.container.image,
            binary = d.container.runtime_binary,
            target = d.container.config_mount_target,
            modules = d.container.kernel_modules_dir.display(),
            timeout = d.container.unlock_timeout_secs,
            tail = d.container.log_tail,
            config_dir = d.node.config_dir.display(),
            bind = d.api.bind,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        DaemonSettings::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn default_toml_parses_back_to_defaults() {
        let parsed = DaemonSettings::from_toml(&DaemonSettings::default_toml()).unwrap();
        let d = DaemonSettings::default();
        assert_eq!(parsed.container.name, d.container.name);
        assert_eq!(parsed.container.command, d.container.command);
        assert_eq!(parsed.container.unlock_timeout_secs, d.container.unlock_timeout_secs);
        assert_eq!(parsed.node.config_dir, d.node.config_dir);
        assert_eq!(parsed.api.bind, d.api.bind);
    }

    #[test]
    fn partial_toml_merges_defaults() {
        let s = DaemonSettings::from_toml(
            r#"
[container]
image = "example.org/dvpn-node:v8"
"#,
        )
        .unwrap();
        assert_eq!(s.container.image, "example.org/dvpn-node:v8");
        assert_eq!(s.container.name, "sentinel-dvpn-node");
        assert_eq!(s.container.unlock_timeout_secs, 120);
    }

    #[test]
    fn invalid_values_fail_validation() {
        let mut s = DaemonSettings::default();
        s.container.unlock_timeout_secs = 0;
        assert!(s.validate().is_err());

        let mut s = DaemonSettings::default();
        s.node.config_dir = PathBuf::from("relative/dir");
        assert!(s.validate().is_err());

        let mut s = DaemonSettings::default();
        s.api.bind = "not-an-addr".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let s = DaemonSettings::load(&dir.path().join("daemon.toml")).unwrap();
        assert_eq!(s.container.name, "sentinel-dvpn-node");
    }

    #[test]
    fn load_rejects_malformed_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("daemon.toml");
        std::fs::write(&path, "this is not [[ valid toml").unwrap();
        assert!(matches!(
            DaemonSettings::load(&path),
            Err(NodeError::ConfigInvalid(_))
        ));
    }
}
