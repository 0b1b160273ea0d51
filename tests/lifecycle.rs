//! Lifecycle manager behaviour against the in-memory runtime.
//!
//! Every test builds a `ContainerLifecycleManager` over `MockRuntime` and a
//! node config held in memory, then checks both the boolean result and the
//! exact sequence of runtime calls it produced.

use std::sync::Arc;

use dvpn_node_daemon::container::mock::{MockRuntime, RuntimeCall};
use dvpn_node_daemon::container::{ContainerLifecycleManager, ContainerStatus, LifecycleState};
use dvpn_node_daemon::node::{ConfigStore, KeyringBackend, LinePatcher, NodeConfig, Passphrase};
use dvpn_node_daemon::settings::ContainerSettings;
use tempfile::TempDir;

const NAME: &str = "sentinel-dvpn-node";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Fixture {
    runtime: Arc<MockRuntime>,
    manager: ContainerLifecycleManager,
    _dir: TempDir,
}

fn fixture(runtime: MockRuntime, node: NodeConfig) -> Fixture {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(runtime);
    let store = ConfigStore::new(dir.path(), Arc::new(LinePatcher), node);
    let manager =
        ContainerLifecycleManager::new(runtime.clone(), Arc::new(store), ContainerSettings::default());
    Fixture {
        runtime,
        manager,
        _dir: dir,
    }
}

fn plain_node() -> NodeConfig {
    NodeConfig::default()
}

fn file_backend_node(passphrase: Option<&str>) -> NodeConfig {
    NodeConfig {
        backend: KeyringBackend::File,
        passphrase: passphrase.map(Passphrase::new),
        ..NodeConfig::default()
    }
}

fn count(calls: &[RuntimeCall], wanted: &RuntimeCall) -> usize {
    calls.iter().filter(|c| *c == wanted).count()
}

// ---------------------------------------------------------------------------
// stop / remove
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_on_absent_container_is_noop_success() {
    let f = fixture(MockRuntime::new(), plain_node());
    assert!(f.manager.stop().await);
    assert!(f.runtime.mutating_calls().is_empty());
}

#[tokio::test]
async fn stop_on_stopped_container_is_noop_success() {
    let f = fixture(MockRuntime::new().with_container(NAME, "exited"), plain_node());
    assert!(f.manager.stop().await);
    assert!(f.runtime.mutating_calls().is_empty());
}

#[tokio::test]
async fn stop_on_running_container_stops_it() {
    let f = fixture(MockRuntime::new().with_container(NAME, "running"), plain_node());
    assert!(f.manager.stop().await);
    assert_eq!(f.runtime.mutating_calls(), vec![RuntimeCall::Stop(NAME.into())]);
    assert!(!f.manager.running().await);
    assert!(f.manager.exists().await);
}

#[tokio::test]
async fn remove_running_container_stops_then_removes() {
    let f = fixture(MockRuntime::new().with_container(NAME, "running"), plain_node());
    assert!(f.manager.remove().await);
    assert_eq!(
        f.runtime.mutating_calls(),
        vec![RuntimeCall::Stop(NAME.into()), RuntimeCall::Remove(NAME.into())]
    );
    assert!(!f.manager.exists().await);
}

#[tokio::test]
async fn remove_absent_container_is_success() {
    let f = fixture(MockRuntime::new(), plain_node());
    assert!(f.manager.remove().await);
    assert!(f.runtime.mutating_calls().is_empty());
}

// ---------------------------------------------------------------------------
// start: plain path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_absent_creates_and_starts() {
    let f = fixture(MockRuntime::new(), plain_node());
    assert!(f.manager.start().await);
    assert_eq!(
        f.runtime.mutating_calls(),
        vec![RuntimeCall::Create(NAME.into()), RuntimeCall::Start(NAME.into())]
    );
    assert_eq!(f.manager.status().await, ContainerStatus::Running);

    let specs = f.runtime.created_specs();
    assert_eq!(specs.len(), 1);
    assert!(!specs[0].interactive);
    assert!(specs[0].exposed_ports().contains(&"51820/udp".to_string()));
}

#[tokio::test]
async fn start_when_running_does_nothing() {
    let f = fixture(MockRuntime::new().with_container(NAME, "running"), plain_node());
    assert!(f.manager.start().await);
    assert!(f.runtime.mutating_calls().is_empty());
}

#[tokio::test]
async fn start_existing_stopped_container_in_place_with_test_backend() {
    let f = fixture(MockRuntime::new().with_container(NAME, "exited"), plain_node());
    assert!(f.manager.start().await);
    assert_eq!(f.runtime.mutating_calls(), vec![RuntimeCall::Start(NAME.into())]);
}

#[tokio::test]
async fn file_backend_without_passphrase_starts_in_place() {
    let f = fixture(
        MockRuntime::new().with_container(NAME, "exited"),
        file_backend_node(None),
    );
    assert!(f.manager.start().await);
    assert_eq!(f.runtime.mutating_calls(), vec![RuntimeCall::Start(NAME.into())]);
}

#[tokio::test]
async fn plain_start_failure_is_false() {
    let runtime = MockRuntime::new().with_container(NAME, "exited");
    runtime.fail_start("port is already allocated");
    let f = fixture(runtime, plain_node());
    assert!(!f.manager.start().await);
    assert_eq!(f.manager.state().await.unwrap(), LifecycleState::Stopped);
}

#[tokio::test]
async fn unreachable_engine_fails_start() {
    let runtime = MockRuntime::new();
    runtime.set_unavailable(true);
    let f = fixture(runtime, plain_node());
    assert!(!f.manager.start().await);
    assert_eq!(f.manager.status().await, ContainerStatus::Unavailable);
}

// ---------------------------------------------------------------------------
// start: fail-closed port policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_vpn_type_creates_nothing() {
    for vpn_type in ["openvpn", "", "wire guard"] {
        let node = NodeConfig {
            vpn_type: vpn_type.to_string(),
            ..NodeConfig::default()
        };
        let f = fixture(MockRuntime::new(), node);
        assert!(!f.manager.start().await, "vpn_type {vpn_type:?}");
        assert!(f.runtime.mutating_calls().is_empty(), "vpn_type {vpn_type:?}");
        assert!(!f.manager.exists().await);
    }
}

#[tokio::test]
async fn zero_vpn_port_creates_nothing() {
    let node = NodeConfig {
        vpn_port: 0,
        ..NodeConfig::default()
    };
    let f = fixture(MockRuntime::new(), node);
    assert!(!f.manager.start().await);
    assert!(f.runtime.created_specs().is_empty());
}

#[tokio::test]
async fn v2ray_publishes_vpn_port_over_tcp() {
    let node = NodeConfig {
        vpn_type: "v2ray".to_string(),
        vpn_port: 8443,
        ..NodeConfig::default()
    };
    let f = fixture(MockRuntime::new(), node);
    assert!(f.manager.start().await);
    let exposed = f.runtime.created_specs()[0].exposed_ports();
    assert!(exposed.contains(&"8443/tcp".to_string()));
    assert!(!exposed.contains(&"8443/udp".to_string()));
}

// ---------------------------------------------------------------------------
// start: interactive path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stopped_container_is_recreated_for_passphrase() {
    let f = fixture(
        MockRuntime::new().with_container(NAME, "exited"),
        file_backend_node(Some("correct-horse")),
    );
    assert!(f.manager.start().await);

    let calls = f.runtime.mutating_calls();
    assert_eq!(
        calls,
        vec![
            RuntimeCall::Remove(NAME.into()),
            RuntimeCall::Create(NAME.into()),
            RuntimeCall::StartAttached(NAME.into()),
        ]
    );
    assert_eq!(count(&calls, &RuntimeCall::Start(NAME.into())), 0);
    assert!(f.runtime.created_specs()[0].interactive);
    assert_eq!(f.runtime.stdin_written(), "correct-horse\n");
    assert!(f.manager.running().await);
}

#[tokio::test]
async fn absent_container_with_passphrase_starts_interactively() {
    let f = fixture(MockRuntime::new(), file_backend_node(Some("correct-horse")));
    assert!(f.manager.start().await);
    assert_eq!(
        f.runtime.mutating_calls(),
        vec![
            RuntimeCall::Create(NAME.into()),
            RuntimeCall::StartAttached(NAME.into()),
        ]
    );
}

#[tokio::test]
async fn recreate_with_invalid_config_keeps_existing_container() {
    let mut node = file_backend_node(Some("correct-horse"));
    node.vpn_type = "openvpn".to_string();
    let f = fixture(MockRuntime::new().with_container(NAME, "exited"), node);

    assert!(!f.manager.start().await);
    assert!(f.runtime.mutating_calls().is_empty());
    assert!(f.manager.exists().await);
}

#[tokio::test]
async fn rejected_passphrase_fails_start_and_stops_container() {
    let runtime = MockRuntime::new();
    runtime.script_attach(&["Enter keyring passphrase:", "Error: Incorrect Passphrase"]);
    let f = fixture(runtime, file_backend_node(Some("wrong-horse")));

    assert!(!f.manager.start().await);
    assert!(f.runtime.calls().contains(&RuntimeCall::Stop(NAME.into())));
    assert!(!f.manager.running().await);
}

#[tokio::test]
async fn restart_stops_then_recreates_for_passphrase() {
    let f = fixture(
        MockRuntime::new().with_container(NAME, "running"),
        file_backend_node(Some("correct-horse")),
    );
    assert!(f.manager.restart().await);
    assert_eq!(
        f.runtime.mutating_calls(),
        vec![
            RuntimeCall::Stop(NAME.into()),
            RuntimeCall::Remove(NAME.into()),
            RuntimeCall::Create(NAME.into()),
            RuntimeCall::StartAttached(NAME.into()),
        ]
    );
}

#[tokio::test]
async fn restart_fails_when_start_fails() {
    let runtime = MockRuntime::new().with_container(NAME, "running");
    runtime.fail_start("boom");
    let f = fixture(runtime, plain_node());
    assert!(!f.manager.restart().await);
    assert_eq!(f.manager.status().await, ContainerStatus::Stopped);
}

// ---------------------------------------------------------------------------
// serialization
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_starts_create_one_container() {
    let f = fixture(MockRuntime::new(), file_backend_node(Some("correct-horse")));
    let (a, b) = tokio::join!(f.manager.start(), f.manager.start());
    assert!(a && b);

    let calls = f.runtime.mutating_calls();
    assert_eq!(count(&calls, &RuntimeCall::Create(NAME.into())), 1);
    assert_eq!(count(&calls, &RuntimeCall::Remove(NAME.into())), 0);
}

#[tokio::test]
async fn logs_default_to_configured_tail() {
    let runtime = MockRuntime::new().with_container(NAME, "running");
    runtime.set_logs("a\nb\nc");
    let f = fixture(runtime, plain_node());
    assert_eq!(f.manager.logs(None).await.as_deref(), Some("a\nb\nc"));
    assert!(f.runtime.calls().contains(&RuntimeCall::Logs {
        name: NAME.into(),
        tail: 100,
    }));
}
