//! In-memory node settings.
//!
//! [`NodeConfig`] mirrors the keys the dVPN node reads from its bind-mounted
//! `config.toml` and VPN file. The wallet passphrase is the only field that
//! never reaches disk.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{NodeError, Result};

// ---------------------------------------------------------------------------
// Price tables used for location classification
// ---------------------------------------------------------------------------

pub const DATACENTER_HOURLY_PRICES: &str = "18480ibc/31FEE1A2A9F9C01113F90BD0BBCCE8FD6BBB8585FAF109A2101827DD1D5B95B8,770ibc/A8C2D23A1E6F95DA4E48BA349667E322BD7A6C996D8A4AAE8BA72E190F3D1477,1871892ibc/B1C0DDB14F25279A2026BC8794E12B259F8BDA546A3C5132CCAEE4431CE36783,18897ibc/ED07A3391A112B175915CD8FAF43A2DA8E4790EDE12566649D0C2F97716B8518,4160000udvpn";
pub const DATACENTER_GIGABYTE_PRICES: &str = "52573ibc/31FEE1A2A9F9C01113F90BD0BBCCE8FD6BBB8585FAF109A2101827DD1D5B95B8,9204ibc/A8C2D23A1E6F95DA4E48BA349667E322BD7A6C996D8A4AAE8BA72E190F3D1477,1180852ibc/B1C0DDB14F25279A2026BC8794E12B259F8BDA546A3C5132CCAEE4431CE36783,122740ibc/ED07A3391A112B175915CD8FAF43A2DA8E4790EDE12566649D0C2F97716B8518,15342624udvpn";
pub const RESIDENTIAL_HOURLY_PRICES: &str = "27720ibc/31FEE1A2A9F9C01113F90BD0BBCCE8FD6BBB8585FAF109A2101827DD1D5B95B8,1155ibc/A8C2D23A1E6F95DA4E48BA349667E322BD7A6C996D8A4AAE8BA72E190F3D1477,2807838ibc/B1C0DDB14F25279A2026BC8794E12B259F8BDA546A3C5132CCAEE4431CE36783,28346ibc/ED07A3391A112B175915CD8FAF43A2DA8E4790EDE12566649D0C2F97716B8518,6240000udvpn";
pub const RESIDENTIAL_GIGABYTE_PRICES: &str = "78860ibc/31FEE1A2A9F9C01113F90BD0BBCCE8FD6BBB8585FAF109A2101827DD1D5B95B8,13806ibc/A8C2D23A1E6F95DA4E48BA349667E322BD7A6C996D8A4AAE8BA72E190F3D1477,1771278ibc/B1C0DDB14F25279A2026BC8794E12B259F8BDA546A3C5132CCAEE4431CE36783,184110ibc/ED07A3391A112B175915CD8FAF43A2DA8E4790EDE12566649D0C2F97716B8518,23013936udvpn";

/// Minimum passphrase length accepted by the node's file keyring.
pub const MIN_PASSPHRASE_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// VPN service flavour run by the node. Decides the transport of `vpn_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnType {
    Wireguard,
    V2ray,
}

impl VpnType {
    /// Parse the `[node] type` value. Anything else is `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wireguard" => Some(Self::Wireguard),
            "v2ray" => Some(Self::V2ray),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wireguard => "wireguard",
            Self::V2ray => "v2ray",
        }
    }

    /// Name of the VPN-specific config file next to `config.toml`.
    pub fn config_file(self) -> &'static str {
        match self {
            Self::Wireguard => "wireguard.toml",
            Self::V2ray => "v2ray.toml",
        }
    }
}

impl fmt::Display for VpnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wallet key storage mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyringBackend {
    /// Unencrypted keyring; the node never prompts.
    #[default]
    Test,
    /// Passphrase-encrypted key file; the node prompts on every start.
    File,
}

impl KeyringBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "test" => Some(Self::Test),
            "file" => Some(Self::File),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::File => "file",
        }
    }
}

/// Where the node is hosted, inferred from its price table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeLocation {
    Residential,
    Datacenter,
}

impl NodeLocation {
    /// Match `hourly_prices` against the fixed tables. Unknown tables yield `None`.
    pub fn classify(hourly_prices: &str) -> Option<Self> {
        match hourly_prices.trim() {
            RESIDENTIAL_HOURLY_PRICES => Some(Self::Residential),
            DATACENTER_HOURLY_PRICES => Some(Self::Datacenter),
            _ => None,
        }
    }

    /// `(hourly_prices, gigabyte_prices)` for this location.
    pub fn price_tables(self) -> (&'static str, &'static str) {
        match self {
            Self::Residential => (RESIDENTIAL_HOURLY_PRICES, RESIDENTIAL_GIGABYTE_PRICES),
            Self::Datacenter => (DATACENTER_HOURLY_PRICES, DATACENTER_GIGABYTE_PRICES),
        }
    }
}

// ---------------------------------------------------------------------------
// Passphrase
// ---------------------------------------------------------------------------

/// Wallet passphrase. Zeroed on drop and never printed.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// First line of `reader`, without its line ending. Refuses passphrases
    /// shorter than [`MIN_PASSPHRASE_LEN`] characters.
    pub async fn read_line<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await;
        let passphrase = Self::new(line.trim_end_matches(['\r', '\n']));
        line.zeroize();
        read.map_err(|e| NodeError::io("<stdin>", e))?;
        if passphrase.expose().chars().count() < MIN_PASSPHRASE_LEN {
            return Err(NodeError::ConfigInvalid(format!(
                "passphrase must be at least {MIN_PASSPHRASE_LEN} characters"
            )));
        }
        Ok(passphrase)
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// NodeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub moniker: String,
    pub chain_id: String,
    /// Comma-separated RPC endpoints, kept in file form.
    pub rpc_addresses: String,
    /// Public address advertised in `remote_url`.
    pub node_ip: String,
    /// TCP port of the node's own API (`listen_on`).
    pub node_port: u16,
    /// `[node] type`. Kept raw so unsupported values can be rejected at start.
    pub vpn_type: String,
    pub vpn_port: u16,
    pub backend: KeyringBackend,
    pub handshake_enabled: bool,
    pub max_peers: u32,
    pub gas: u64,
    pub gas_adjustment: f64,
    pub gas_prices: String,
    pub hourly_prices: String,
    pub gigabyte_prices: String,
    /// Key name inside the keyring (`[keyring] from`).
    pub wallet_name: String,
    pub passphrase: Option<Passphrase>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            moniker: String::new(),
            chain_id: "sentinelhub-2".to_string(),
            rpc_addresses: "https://rpc.sentinel.co:443".to_string(),
            node_ip: String::new(),
            node_port: 7777,
            vpn_type: VpnType::Wireguard.as_str().to_string(),
            vpn_port: 51820,
            backend: KeyringBackend::Test,
            handshake_enabled: false,
            max_peers: 250,
            gas: 200_000,
            gas_adjustment: 1.05,
            gas_prices: "0.2udvpn".to_string(),
            hourly_prices: DATACENTER_HOURLY_PRICES.to_string(),
            gigabyte_prices: DATACENTER_GIGABYTE_PRICES.to_string(),
            wallet_name: "operator".to_string(),
            passphrase: None,
        }
    }
}

impl NodeConfig {
    pub fn vpn(&self) -> Option<VpnType> {
        VpnType::parse(&self.vpn_type)
    }

    pub fn location(&self) -> Option<NodeLocation> {
        NodeLocation::classify(&self.hourly_prices)
    }

    /// True when starting the node requires feeding the passphrase over stdin.
    pub fn needs_interactive_start(&self) -> bool {
        self.backend == KeyringBackend::File && self.passphrase.is_some()
    }

    pub fn listen_on(&self) -> String {
        format!("0.0.0.0:{}", self.node_port)
    }

    pub fn remote_url(&self) -> String {
        format!("https://{}:{}", self.node_ip, self.node_port)
    }

    /// Check the fields the container descriptor depends on.
    pub fn validate(&self) -> Result<VpnType> {
        let vpn = self.vpn().ok_or_else(|| {
            NodeError::ConfigInvalid(format!("unsupported vpn type `{}`", self.vpn_type))
        })?;
        if self.vpn_port == 0 {
            return Err(NodeError::ConfigInvalid("vpn port is not set".into()));
        }
        if self.node_port == 0 {
            return Err(NodeError::ConfigInvalid("node port is not set".into()));
        }
        // v2ray and the node API both bind TCP.
        if vpn == VpnType::V2ray && self.vpn_port == self.node_port {
            return Err(NodeError::ConfigInvalid(format!(
                "vpn port {} collides with node port",
                self.vpn_port
            )));
        }
        Ok(vpn)
    }
}

/// Extract the port from `listen_on` / `remote_url` style values.
pub(crate) fn port_of(value: &str) -> Option<u16> {
    value.rsplit(':').next()?.trim_end_matches('/').parse().ok()
}

/// Extract the host from `https://<ip>:<port>`.
pub(crate) fn host_of(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let (host, _) = rest.rsplit_once(':')?;
    if host.is_empty() { None } else { Some(host) }
}
