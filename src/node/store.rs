//! Node settings hydrated from, and flushed to, the bind-mounted config files.
//!
//! ```text
//! <config dir>/
//!     config.toml       [chain] [handshake] [keyring] [node] [qos]
//!     wireguard.toml    listen_port      (vpn_type = wireguard)
//!     v2ray.toml        listen_port      (vpn_type = v2ray)
//! ```
//!
//! Only [`ConfigPatcher`] touches file contents. The store owns the in-memory
//! [`NodeConfig`] behind an async lock so the API and the lifecycle manager
//! see one consistent record.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{NodeError, Result};
use crate::node::config::{
    KeyringBackend, NodeConfig, NodeLocation, Passphrase, VpnType, host_of, port_of,
};
use crate::node::sync::{ConfigPatcher, LinePatcher, extract, extract_in_section, quote};

pub const NODE_CONFIG_FILE: &str = "config.toml";
pub const VPN_PORT_KEY: &str = "listen_port";

/// A `NodeConfig` field's location inside `config.toml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileKey {
    pub section: &'static str,
    pub key: &'static str,
}

const fn key(section: &'static str, key: &'static str) -> FileKey {
    FileKey { section, key }
}

pub const MONIKER: FileKey = key("node", "moniker");
pub const CHAIN_ID: FileKey = key("chain", "id");
pub const RPC_ADDRESSES: FileKey = key("chain", "rpc_addresses");
pub const GAS: FileKey = key("chain", "gas");
pub const GAS_ADJUSTMENT: FileKey = key("chain", "gas_adjustment");
pub const GAS_PRICES: FileKey = key("chain", "gas_prices");
pub const HANDSHAKE_ENABLE: FileKey = key("handshake", "enable");
pub const BACKEND: FileKey = key("keyring", "backend");
pub const WALLET_NAME: FileKey = key("keyring", "from");
pub const LISTEN_ON: FileKey = key("node", "listen_on");
pub const REMOTE_URL: FileKey = key("node", "remote_url");
pub const NODE_TYPE: FileKey = key("node", "type");
pub const HOURLY_PRICES: FileKey = key("node", "hourly_prices");
pub const GIGABYTE_PRICES: FileKey = key("node", "gigabyte_prices");
pub const MAX_PEERS: FileKey = key("qos", "max_peers");

/// Every `config.toml` key paired with its rendered value.
fn file_values(node: &NodeConfig) -> Vec<(FileKey, String)> {
    vec![
        (MONIKER, node.moniker.clone()),
        (CHAIN_ID, node.chain_id.clone()),
        (RPC_ADDRESSES, node.rpc_addresses.clone()),
        (GAS, node.gas.to_string()),
        (GAS_ADJUSTMENT, node.gas_adjustment.to_string()),
        (GAS_PRICES, node.gas_prices.clone()),
        (HANDSHAKE_ENABLE, node.handshake_enabled.to_string()),
        (BACKEND, node.backend.as_str().to_string()),
        (WALLET_NAME, node.wallet_name.clone()),
        (LISTEN_ON, node.listen_on()),
        (REMOTE_URL, node.remote_url()),
        (NODE_TYPE, node.vpn_type.clone()),
        (HOURLY_PRICES, node.hourly_prices.clone()),
        (GIGABYTE_PRICES, node.gigabyte_prices.clone()),
        (MAX_PEERS, node.max_peers.to_string()),
    ]
}

pub struct ConfigStore {
    dir: PathBuf,
    patcher: Arc<dyn ConfigPatcher>,
    node: RwLock<NodeConfig>,
}

impl ConfigStore {
    /// Store over `dir` holding `node` as-is. Nothing is read from disk.
    pub fn new(dir: impl Into<PathBuf>, patcher: Arc<dyn ConfigPatcher>, node: NodeConfig) -> Self {
        Self {
            dir: dir.into(),
            patcher,
            node: RwLock::new(node),
        }
    }

    /// Load from `dir` with the default [`LinePatcher`].
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::load(dir, Arc::new(LinePatcher)).await
    }

    /// Hydrate from `config.toml` and the VPN file, merging defaults for
    /// absent keys, then validate. A missing `config.toml` yields defaults;
    /// validation problems are logged, not fatal, because the node may not be
    /// configured yet. Start refuses an invalid config later.
    pub async fn load(dir: impl Into<PathBuf>, patcher: Arc<dyn ConfigPatcher>) -> Result<Self> {
        let dir = dir.into();
        let mut node = NodeConfig::default();

        let config_path = dir.join(NODE_CONFIG_FILE);
        match patcher.read(&config_path).await {
            Ok(content) => merge_config_toml(&mut node, &content),
            Err(NodeError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %config_path.display(), "node config not found, using defaults");
            }
            Err(e) => return Err(e),
        }

        if let Some(vpn) = node.vpn() {
            let vpn_path = dir.join(vpn.config_file());
            match patcher.read(&vpn_path).await {
                Ok(content) => {
                    if let Ok(port) = extract(&content, VPN_PORT_KEY).parse() {
                        node.vpn_port = port;
                    }
                }
                Err(e) => warn!(path = %vpn_path.display(), error = %e, "vpn config unreadable"),
            }
        }

        if let Err(e) = node.validate() {
            warn!(error = %e, "node config loaded but not startable");
        }
        info!(
            dir = %dir.display(),
            moniker = %node.moniker,
            vpn_type = %node.vpn_type,
            backend = node.backend.as_str(),
            "node config loaded"
        );

        Ok(Self::new(dir, patcher, node))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(NODE_CONFIG_FILE)
    }

    /// Clone of the current settings, passphrase included.
    pub async fn snapshot(&self) -> NodeConfig {
        self.node.read().await.clone()
    }

    /// Mutate the in-memory record. Call [`Self::refresh_files`] to persist.
    pub async fn modify<F>(&self, f: F)
    where
        F: FnOnce(&mut NodeConfig),
    {
        f(&mut *self.node.write().await);
    }

    pub async fn set_passphrase(&self, passphrase: Passphrase) {
        self.node.write().await.passphrase = Some(passphrase);
        info!("wallet passphrase set (memory only)");
    }

    pub async fn clear_passphrase(&self) {
        self.node.write().await.passphrase = None;
        info!("wallet passphrase cleared");
    }

    pub async fn has_passphrase(&self) -> bool {
        self.node.read().await.passphrase.is_some()
    }

    /// Switch price tables to those of `location` and persist them.
    pub async fn set_location(&self, location: NodeLocation) -> Result<()> {
        let (hourly, gigabyte) = location.price_tables();
        self.modify(|n| {
            n.hourly_prices = hourly.to_string();
            n.gigabyte_prices = gigabyte.to_string();
        })
        .await;
        let path = self.config_path();
        self.write_key(&path, HOURLY_PRICES, hourly).await?;
        self.write_key(&path, GIGABYTE_PRICES, gigabyte).await?;
        Ok(())
    }

    /// Write every file-backed field into `config.toml`, then the VPN port
    /// into the file selected by `vpn_type`. Missing keys are skipped with a
    /// warning. A config that fails [`NodeConfig::validate`] is refused
    /// before any file is touched.
    pub async fn refresh_files(&self) -> Result<()> {
        let node = self.snapshot().await;
        let vpn = node.validate()?;
        let path = self.config_path();

        let mut skipped = 0usize;
        for (file_key, value) in file_values(&node) {
            if !self.write_key(&path, file_key, &value).await? {
                skipped += 1;
            }
        }

        let vpn_path = self.dir.join(vpn.config_file());
        if !self
            .patcher
            .update(&vpn_path, VPN_PORT_KEY, &node.vpn_port.to_string())
            .await?
        {
            skipped += 1;
        }

        info!(dir = %self.dir.display(), skipped, vpn = %vpn, "node config files refreshed");
        Ok(())
    }

    async fn write_key(&self, path: &Path, file_key: FileKey, value: &str) -> Result<bool> {
        self.patcher
            .update_in_section(path, file_key.section, file_key.key, value)
            .await
    }
}

fn section_value(content: &str, file_key: FileKey) -> Option<String> {
    let value = extract_in_section(content, file_key.section, file_key.key);
    if value.is_empty() { None } else { Some(value) }
}

fn merge_config_toml(node: &mut NodeConfig, content: &str) {
    if let Some(v) = section_value(content, MONIKER) {
        node.moniker = v;
    }
    if let Some(v) = section_value(content, CHAIN_ID) {
        node.chain_id = v;
    }
    if let Some(v) = section_value(content, RPC_ADDRESSES) {
        node.rpc_addresses = v;
    }
    if let Some(v) = section_value(content, GAS).and_then(|v| v.parse().ok()) {
        node.gas = v;
    }
    if let Some(v) = section_value(content, GAS_ADJUSTMENT).and_then(|v| v.parse().ok()) {
        node.gas_adjustment = v;
    }
    if let Some(v) = section_value(content, GAS_PRICES) {
        node.gas_prices = v;
    }
    if let Some(v) = section_value(content, HANDSHAKE_ENABLE).and_then(|v| v.parse().ok()) {
        node.handshake_enabled = v;
    }
    if let Some(v) = section_value(content, BACKEND) {
        match KeyringBackend::parse(&v) {
            Some(backend) => node.backend = backend,
            None => warn!(backend = %v, "unknown keyring backend, keeping default"),
        }
    }
    if let Some(v) = section_value(content, WALLET_NAME) {
        node.wallet_name = v;
    }
    if let Some(port) = section_value(content, LISTEN_ON).and_then(|v| port_of(&v)) {
        node.node_port = port;
    }
    if let Some(v) = section_value(content, REMOTE_URL) {
        if let Some(host) = host_of(&v) {
            node.node_ip = host.to_string();
        }
    }
    if let Some(v) = section_value(content, NODE_TYPE) {
        node.vpn_type = v;
    }
    if let Some(v) = section_value(content, HOURLY_PRICES) {
        node.hourly_prices = v;
    }
    if let Some(v) = section_value(content, GIGABYTE_PRICES) {
        node.gigabyte_prices = v;
    }
    if let Some(v) = section_value(content, MAX_PEERS).and_then(|v| v.parse().ok()) {
        node.max_peers = v;
    }
}

/// Default `config.toml` layout with every key the store writes.
pub fn config_toml_template(node: &NodeConfig) -> String {
    let mut out = String::new();
    let mut current = "";
    let mut values = file_values(node);
    values.sort_by_key(|(k, _)| k.section);
    for (file_key, value) in values {
        if file_key.section != current {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", file_key.section));
            current = file_key.section;
        }
        out.push_str(&format!("{} = {}\n", file_key.key, quote(&value)));
    }
    out
}

/// Default VPN file with only `listen_port`.
pub fn vpn_toml_template(port: u16) -> String {
    format!("{VPN_PORT_KEY} = {port}\n")
}

async fn exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| NodeError::io(path, e))
}

/// Write template files for `node` into `dir`, leaving existing files alone.
pub async fn seed_config_dir(dir: &Path, node: &NodeConfig) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| NodeError::io(dir, e))?;
    let config_path = dir.join(NODE_CONFIG_FILE);
    if !exists(&config_path).await? {
        tokio::fs::write(&config_path, config_toml_template(node))
            .await
            .map_err(|e| NodeError::io(&config_path, e))?;
    }
    for vpn in [VpnType::Wireguard, VpnType::V2ray] {
        let path = dir.join(vpn.config_file());
        if !exists(&path).await? {
            tokio::fs::write(&path, vpn_toml_template(node.vpn_port))
                .await
                .map_err(|e| NodeError::io(&path, e))?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::config::RESIDENTIAL_HOURLY_PRICES;

    const CONFIG: &str = r#"[chain]
gas = 200000
gas_adjustment = 1.05
gas_prices = "0.2udvpn"
id = "sentinelhub-2"
rpc_addresses = "https://rpc.sentinel.co:443"

[handshake]
enable = false
peers = 8

[keyring]
backend = "file"
from = "operator"

[node]
hourly_prices = "1udvpn"
gigabyte_prices = "2udvpn"
listen_on = "0.0.0.0:16567"
moniker = "casa-01"
remote_url = "https://198.51.100.4:16567"
type = "v2ray"

[qos]
max_peers = 42
"#;

    async fn store_with_files() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("config.toml"), CONFIG).await.unwrap();
        tokio::fs::write(dir.path().join("v2ray.toml"), "listen_port = 8443\n").await.unwrap();
        tokio::fs::write(dir.path().join("wireguard.toml"), "listen_port = 51820\n").await.unwrap();
        let store = ConfigStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn load_hydrates_every_field() {
        let (_dir, store) = store_with_files().await;
        let node = store.snapshot().await;
        assert_eq!(node.moniker, "casa-01");
        assert_eq!(node.chain_id, "sentinelhub-2");
        assert_eq!(node.node_port, 16567);
        assert_eq!(node.node_ip, "198.51.100.4");
        assert_eq!(node.vpn_type, "v2ray");
        assert_eq!(node.vpn_port, 8443);
        assert_eq!(node.backend, KeyringBackend::File);
        assert_eq!(node.max_peers, 42);
        assert!(!node.handshake_enabled);
        assert!(node.passphrase.is_none());
    }

    #[tokio::test]
    async fn load_without_files_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ConfigStore::open(dir.path()).await.unwrap();
        let node = store.snapshot().await;
        assert_eq!(node.chain_id, NodeConfig::default().chain_id);
        assert_eq!(node.vpn_port, 51820);
    }

    #[tokio::test]
    async fn refresh_writes_fields_and_vpn_port() {
        let (dir, store) = store_with_files().await;
        store
            .modify(|n| {
                n.moniker = "my-node-01".into();
                n.handshake_enabled = true;
                n.vpn_port = 9443;
            })
            .await;
        store.refresh_files().await.unwrap();

        let config = tokio::fs::read_to_string(dir.path().join("config.toml")).await.unwrap();
        assert_eq!(extract_in_section(&config, "node", "moniker"), "my-node-01");
        assert_eq!(extract_in_section(&config, "handshake", "enable"), "true");
        assert_eq!(extract_in_section(&config, "handshake", "peers"), "8");

        let v2ray = tokio::fs::read_to_string(dir.path().join("v2ray.toml")).await.unwrap();
        assert_eq!(extract(&v2ray, "listen_port"), "9443");
        let wg = tokio::fs::read_to_string(dir.path().join("wireguard.toml")).await.unwrap();
        assert_eq!(extract(&wg, "listen_port"), "51820", "inactive vpn file untouched");
    }

    #[tokio::test]
    async fn refresh_never_writes_passphrase() {
        let (dir, store) = store_with_files().await;
        store.set_passphrase(Passphrase::new("s3cret-passphrase")).await;
        store.refresh_files().await.unwrap();

        for file in ["config.toml", "v2ray.toml", "wireguard.toml"] {
            let content = tokio::fs::read_to_string(dir.path().join(file)).await.unwrap();
            assert!(!content.contains("s3cret-passphrase"), "{file} leaked the passphrase");
        }
    }

    async fn read_all(dir: &Path) -> Vec<String> {
        let mut out = Vec::new();
        for file in ["config.toml", "v2ray.toml", "wireguard.toml"] {
            out.push(tokio::fs::read_to_string(dir.join(file)).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn refresh_rejects_unknown_vpn_type_without_writing() {
        let (dir, store) = store_with_files().await;
        let before = read_all(dir.path()).await;
        store
            .modify(|n| {
                n.moniker = "never-written".into();
                n.vpn_type = "openvpn".into();
            })
            .await;
        assert!(matches!(
            store.refresh_files().await,
            Err(NodeError::ConfigInvalid(_))
        ));
        assert_eq!(read_all(dir.path()).await, before);
    }

    #[tokio::test]
    async fn refresh_rejects_zero_vpn_port_without_writing() {
        let (dir, store) = store_with_files().await;
        let before = read_all(dir.path()).await;
        store.modify(|n| n.vpn_port = 0).await;
        assert!(matches!(
            store.refresh_files().await,
            Err(NodeError::ConfigInvalid(_))
        ));
        assert_eq!(read_all(dir.path()).await, before);
    }

    #[tokio::test]
    async fn set_location_rewrites_price_tables() {
        let (dir, store) = store_with_files().await;
        store.set_location(NodeLocation::Residential).await.unwrap();

        assert_eq!(store.snapshot().await.location(), Some(NodeLocation::Residential));
        let config = tokio::fs::read_to_string(dir.path().join("config.toml")).await.unwrap();
        assert_eq!(
            extract_in_section(&config, "node", "hourly_prices"),
            RESIDENTIAL_HOURLY_PRICES
        );
    }

    #[tokio::test]
    async fn seeded_templates_load_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let node = NodeConfig {
            moniker: "seeded".into(),
            node_ip: "192.0.2.1".into(),
            ..NodeConfig::default()
        };
        seed_config_dir(dir.path(), &node).await.unwrap();

        let store = ConfigStore::open(dir.path()).await.unwrap();
        let loaded = store.snapshot().await;
        assert_eq!(loaded.moniker, "seeded");
        assert_eq!(loaded.node_ip, "192.0.2.1");
        assert_eq!(loaded.vpn_port, node.vpn_port);
    }

    #[tokio::test]
    async fn seeded_template_escapes_quotes() {
        let dir = tempfile::TempDir::new().unwrap();
        let node = NodeConfig {
            moniker: r#"casa "north" \ 1"#.into(),
            ..NodeConfig::default()
        };
        seed_config_dir(dir.path(), &node).await.unwrap();

        let loaded = ConfigStore::open(dir.path()).await.unwrap().snapshot().await;
        assert_eq!(loaded.moniker, node.moniker);
        assert_eq!(loaded.node_port, node.node_port);
    }

    #[tokio::test]
    async fn seeding_keeps_existing_files() {
        let dir = tempfile::TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("config.toml"), CONFIG).await.unwrap();
        seed_config_dir(dir.path(), &NodeConfig::default()).await.unwrap();

        let config = tokio::fs::read_to_string(dir.path().join("config.toml")).await.unwrap();
        assert_eq!(config, CONFIG);
        assert!(dir.path().join("wireguard.toml").exists());
    }

    #[tokio::test]
    async fn passphrase_lifecycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ConfigStore::open(dir.path()).await.unwrap();
        assert!(!store.has_passphrase().await);
        store.set_passphrase(Passphrase::new("abcdefgh")).await;
        assert!(store.has_passphrase().await);
        store.clear_passphrase().await;
        assert!(!store.has_passphrase().await);
    }
}
