//! Adapters
//!
//! Implementations of the domain ports against the real systems: the `zfs`
//! CLI, the Kubernetes API and the host middleware.

pub mod k8s;
pub mod middleware;
pub mod zfs;

pub use k8s::{KubeRuntime, KubeWorkloads};
pub use middleware::MiddlewareClient;
pub use zfs::ZfsCli;
