//! Apps Orchestrator
//!
//! Lifecycle, backup and restore orchestration for a single-node k3s
//! applications cluster whose state lives on a ZFS dataset.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          Apps Orchestrator (facade)                          │
//! │                    jobs · locks · progress · REST API                        │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │    Cluster      │  │     Backup      │  │          Restore            │  │
//! │  │   Lifecycle     │  │    Catalog      │  │        Orchestrator         │  │
//! │  │ (status, taints)│  │(export, retain) │  │ (rollback, import, rescale) │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │   Snapshot Store /    │                                │
//! │                    │   Dataset Layout      │                                │
//! │                    └───────────────────────┘                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                              Domain Ports                                    │
//! │   SnapshotApi · DatasetApi · WorkloadApi · ClusterRuntime · ReleaseManager  │
//! │   HostServices                                                               │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                               Adapters                                       │
//! │  ┌──────────────┐  ┌──────────────────────────┐  ┌───────────────────────┐  │
//! │  │   zfs CLI    │  │  Kubernetes API (kube)   │  │  Middleware JSON-RPC  │  │
//! │  └──────────────┘  └──────────────────────────┘  └───────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Orchestrator facade and REST API
//! - [`cluster`]: Cluster status machine, start/stop, taints
//! - [`backup`]: Backup catalog, release export/import, retention
//! - [`restore`]: Restore orchestration
//! - [`storage`]: Dataset layout and snapshot store
//! - [`jobs`]: Progress-reporting, lockable, abortable jobs
//! - [`adapters`]: ZFS, Kubernetes and middleware implementations of the ports
//! - [`domain`]: Port traits and shared types
//! - [`error`]: Error types and handling

pub mod adapters;
pub mod backup;
pub mod best_effort;
pub mod cluster;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod restore;
pub mod retry;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use controlplane::{AppsOrchestrator, ApiServer, ApiServerConfig, OrchestratorPorts};

pub use backup::{Backup, BackupCatalog, ReleaseExporter, ReleaseImporter};
pub use cluster::{ClusterLifecycle, ClusterStatus, StatusSnapshot};
pub use config::{ClusterConfig, Settings};
pub use jobs::{JobId, JobManager, JobSnapshot, JobState};
pub use restore::{RestoreOrchestrator, RestoreReport};
pub use storage::SnapshotStore;

pub use domain::ports::{
    ClusterRuntime, DatasetApi, HostServices, ReleaseManager, SnapshotApi, WorkloadApi,
};

pub use adapters::{KubeRuntime, KubeWorkloads, MiddlewareClient, ZfsCli};

pub use error::{Error, Result};
pub use metrics::Metrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
