//! Node container management.
//!
//! - [`runtime`]: engine capability trait and container description types
//! - [`docker`]: the trait over the `docker` / `podman` CLI
//! - [`descriptor`]: container spec derived from node settings
//! - [`unlock`]: interactive passphrase protocol
//! - [`lifecycle`]: start / stop / restart / remove orchestration
//! - [`mock`]: scriptable in-memory runtime for tests

pub mod descriptor;
pub mod docker;
pub mod lifecycle;
pub mod mock;
pub mod runtime;
pub mod unlock;

pub use docker::DockerCli;
pub use lifecycle::{ContainerLifecycleManager, ContainerStatus, LifecycleState};
pub use runtime::{ContainerRuntime, ContainerSpec, ContainerSummary};
pub use unlock::SecretInjectionChannel;
