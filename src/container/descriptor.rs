//! Derive the node container's [`ContainerSpec`] from current settings.
//!
//! Nothing here is stored; the spec is recomputed on every create so it always
//! reflects the live [`NodeConfig`].

use crate::container::runtime::{BindMount, ContainerSpec, PortBinding};
use crate::error::Result;
use crate::node::{NodeConfig, VpnType};
use crate::settings::ContainerSettings;

pub const CAP_ADD: &[&str] = &["NET_ADMIN", "NET_BIND_SERVICE", "NET_RAW", "SYS_MODULE"];
pub const CAP_DROP: &[&str] = &["ALL"];
pub const SYSCTLS: &[(&str, &str)] = &[
    ("net.ipv4.ip_forward", "1"),
    ("net.ipv6.conf.all.disable_ipv6", "0"),
    ("net.ipv6.conf.all.forwarding", "1"),
    ("net.ipv6.conf.default.forwarding", "1"),
];

/// Node API port over TCP, VPN port over the transport its type dictates.
///
/// Fails closed: an unknown `vpn_type` or a zero port is a
/// `ConfigInvalid` error and no bindings are produced.
pub fn port_bindings(node: &NodeConfig) -> Result<Vec<PortBinding>> {
    let vpn = node.validate()?;
    let vpn_binding = match vpn {
        VpnType::Wireguard => PortBinding::udp(node.vpn_port),
        VpnType::V2ray => PortBinding::tcp(node.vpn_port),
    };
    Ok(vec![PortBinding::tcp(node.node_port), vpn_binding])
}

/// Full create-time description of the node container.
pub fn build_spec(
    settings: &ContainerSettings,
    node_config_dir: &std::path::Path,
    node: &NodeConfig,
    interactive: bool,
) -> Result<ContainerSpec> {
    let ports = port_bindings(node)?;
    let modules = settings.kernel_modules_dir.clone();
    let modules_target = modules.display().to_string();

    Ok(ContainerSpec {
        name: settings.name.clone(),
        image: settings.image.clone(),
        command: settings.command.clone(),
        mounts: vec![
            BindMount {
                host: node_config_dir.to_path_buf(),
                container: settings.config_mount_target.clone(),
                read_only: false,
            },
            BindMount {
                host: modules,
                container: modules_target,
                read_only: true,
            },
        ],
        cap_add: CAP_ADD.iter().map(|c| c.to_string()).collect(),
        cap_drop: CAP_DROP.iter().map(|c| c.to_string()).collect(),
        sysctls: SYSCTLS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ports,
        interactive,
    })
}
