//! Domain Ports - Core trait definitions for the applications orchestrator
//!
//! These traits define the boundaries between the orchestration logic and the
//! external systems it drives: ZFS, the Kubernetes API, and the host
//! middleware. Adapters implement these traits; the composition root binds
//! them.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// A serialized Kubernetes object (namespace, secret, ...)
pub type Manifest = serde_yaml::Value;

// =============================================================================
// Storage Types
// =============================================================================

/// Snapshot as reported by the storage layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Full snapshot name (`dataset@snap`)
    pub name: String,
    /// Creation time
    pub created_on: DateTime<Utc>,
}

/// Options for a snapshot rollback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackOptions {
    pub force: bool,
    pub recursive: bool,
    pub recursive_clones: bool,
    pub recursive_rollback: bool,
}

impl RollbackOptions {
    /// Roll back and destroy everything newer than the target
    pub fn destructive() -> Self {
        Self {
            force: true,
            recursive: true,
            recursive_clones: true,
            recursive_rollback: true,
        }
    }
}

/// A dataset whose encryption key is not loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedDataset {
    pub id: String,
    pub mountpoint: Option<String>,
}

// =============================================================================
// Kubernetes Types
// =============================================================================

/// Node-level scheduling marker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub effect: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Taint {
    pub fn new(key: impl Into<String>, effect: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            effect: effect.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

impl std::fmt::Display for Taint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}:{}", self.key, value, self.effect),
            None => write!(f, "{}:{}", self.key, self.effect),
        }
    }
}

/// State of the single cluster node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node object exists and reports Ready
    pub configured: bool,
    pub taints: Vec<Taint>,
    /// Reason the node is not configured, if known
    pub error: Option<String>,
}

/// Kind of a scalable workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadKind::Deployment => write!(f, "deployment"),
            WorkloadKind::StatefulSet => write!(f, "statefulset"),
        }
    }
}

/// Reference to a scalable workload, rendered as `kind/name`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(kind: WorkloadKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl FromStr for WorkloadRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, name) = s
            .split_once('/')
            .ok_or_else(|| Error::Validation(format!("{s:?} is not a kind/name reference")))?;
        let kind = match kind.to_lowercase().as_str() {
            "deployment" => WorkloadKind::Deployment,
            "statefulset" => WorkloadKind::StatefulSet,
            other => return Err(Error::Validation(format!("unsupported workload kind {other:?}"))),
        };
        if name.is_empty() {
            return Err(Error::Validation(format!("{s:?} has an empty name")));
        }
        Ok(Self::new(kind, name))
    }
}

impl Serialize for WorkloadRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WorkloadRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Replica count per workload of one release
pub type ReplicaCounts = BTreeMap<WorkloadRef, i32>;

/// A scalable workload and its current replica count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalableWorkload {
    pub kind: WorkloadKind,
    pub name: String,
    pub replicas: i32,
}

impl ScalableWorkload {
    pub fn reference(&self) -> WorkloadRef {
        WorkloadRef::new(self.kind, self.name.clone())
    }
}

/// Persistent volume bound to a release PVC, as captured at backup time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeRecord {
    pub pvc_name: String,
    pub pv_name: String,
    /// Backing ZFS dataset (`pool/ix-applications/releases/...`)
    pub dataset: String,
    /// Capacity as a Kubernetes quantity (`10Gi`) or byte count
    pub capacity: String,
    /// Pool path used by the CSI driver
    pub pool_name: String,
    pub volume_handle: String,
    pub storage_class: String,
    pub claim_namespace: String,
}

// =============================================================================
// Release / Host Types
// =============================================================================

/// A deployed release known to the release manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    /// Path of the installed chart version, used to locate CRD manifests
    #[serde(default)]
    pub chart_path: Option<PathBuf>,
}

/// Identifier of a job running in the host middleware
pub type HostJobId = u64;

/// State of a host middleware job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostJobState {
    Waiting,
    Running,
    Success,
    Failed,
    Aborted,
}

impl HostJobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, HostJobState::Success | HostJobState::Failed | HostJobState::Aborted)
    }
}

/// A host middleware job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostJob {
    pub id: HostJobId,
    pub method: String,
    pub state: HostJobState,
    #[serde(default)]
    pub error: Option<String>,
}

// =============================================================================
// Snapshot Port
// =============================================================================

/// Port for snapshot operations on the storage layer
#[async_trait]
pub trait SnapshotApi: Send + Sync {
    /// Recursive snapshot of `dataset`, skipping the `exclude` children
    async fn create(&self, dataset: &str, name: &str, exclude: &BTreeSet<String>) -> Result<()>;

    /// Roll back to the named snapshot
    async fn rollback(&self, snapshot: &str, options: RollbackOptions) -> Result<()>;

    /// Destroy a snapshot
    async fn delete(&self, snapshot: &str, recursive: bool) -> Result<()>;

    /// Snapshots whose full name starts with `prefix`
    async fn query(&self, prefix: &str) -> Result<Vec<SnapshotInfo>>;
}

// =============================================================================
// Dataset Port
// =============================================================================

/// Port for dataset operations on the storage layer
#[async_trait]
pub trait DatasetApi: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool>;

    async fn create(&self, name: &str, properties: &BTreeMap<String, String>) -> Result<()>;

    async fn delete(&self, name: &str, recursive: bool, force: bool) -> Result<()>;

    async fn mount(&self, name: &str) -> Result<()>;

    /// Names of the direct children of `name`, relative to it
    async fn children(&self, name: &str) -> Result<Vec<String>>;

    /// Full names of all datasets below `name`
    async fn descendants(&self, name: &str) -> Result<Vec<String>>;

    /// Datasets that are encrypted and whose keys are not loaded
    async fn locked(&self) -> Result<Vec<LockedDataset>>;
}

// =============================================================================
// Workload Port
// =============================================================================

/// Port for namespaced workload objects in the cluster
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    async fn export_namespace(&self, namespace: &str) -> Result<Manifest>;

    /// Every secret in the namespace, unfiltered
    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Manifest>>;

    async fn create_namespace(&self, manifest: Manifest) -> Result<()>;

    async fn create_secret(&self, namespace: &str, manifest: Manifest) -> Result<()>;

    async fn list_scalable(&self, namespace: &str) -> Result<Vec<ScalableWorkload>>;

    /// Scale the listed workloads of a release namespace
    async fn scale_release(&self, namespace: &str, replica_counts: &ReplicaCounts) -> Result<()>;

    /// Persistent volumes bound to claims in the namespace
    async fn list_volumes(&self, namespace: &str) -> Result<Vec<PersistentVolumeRecord>>;

    /// Recreate the CSI volume object and the persistent volume
    async fn create_volume(&self, record: &PersistentVolumeRecord) -> Result<()>;

    /// Apply a manifest file (used for chart CRDs)
    async fn apply_file(&self, path: &std::path::Path) -> Result<()>;
}

// =============================================================================
// Cluster Runtime Port
// =============================================================================

/// Port for node-level cluster operations
#[async_trait]
pub trait ClusterRuntime: Send + Sync {
    async fn node_config(&self) -> Result<NodeConfig>;

    /// Replace the node's taints
    async fn set_taints(&self, taints: Vec<Taint>) -> Result<()>;

    async fn running_pods(&self) -> Result<usize>;

    /// Default storage class and volume snapshot class for `pool_dataset`
    async fn setup_storage_classes(&self, pool_dataset: &str) -> Result<()>;
}

// =============================================================================
// Release Manager Port
// =============================================================================

/// Port for the higher-level release manager
#[async_trait]
pub trait ReleaseManager: Send + Sync {
    async fn list_releases(&self) -> Result<Vec<Release>>;

    /// Redeploy a release with its existing values
    async fn redeploy(&self, release: &str) -> Result<HostJobId>;
}

// =============================================================================
// Host Services Port
// =============================================================================

/// Port for host middleware services
#[async_trait]
pub trait HostServices: Send + Sync {
    async fn start_service(&self, service: &str) -> Result<()>;

    async fn stop_service(&self, service: &str) -> Result<()>;

    async fn service_started(&self, service: &str) -> Result<bool>;

    /// Run pending data migrations
    async fn run_migrations(&self) -> Result<()>;

    /// Run pending app migrations (cluster must be up)
    async fn run_app_migrations(&self) -> Result<()>;

    async fn raise_alert(&self, alert: &str, error: &str) -> Result<()>;

    async fn clear_alert(&self, alert: &str) -> Result<()>;

    /// Forget the persisted CNI configuration
    async fn reset_cni_config(&self) -> Result<()>;

    async fn list_jobs(&self, methods: &[&str], states: &[HostJobState]) -> Result<Vec<HostJob>>;

    async fn abort_job(&self, id: HostJobId) -> Result<()>;

    /// Block until the job finishes
    async fn wait_job(&self, id: HostJobId) -> Result<HostJob>;

    /// Start a full catalog sync
    async fn sync_catalogs(&self) -> Result<HostJobId>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type SnapshotApiRef = Arc<dyn SnapshotApi>;
pub type DatasetApiRef = Arc<dyn DatasetApi>;
pub type WorkloadApiRef = Arc<dyn WorkloadApi>;
pub type ClusterRuntimeRef = Arc<dyn ClusterRuntime>;
pub type ReleaseManagerRef = Arc<dyn ReleaseManager>;
pub type HostServicesRef = Arc<dyn HostServices>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_ref_round_trip() {
        let r: WorkloadRef = "deployment/plex".parse().unwrap();
        assert_eq!(r, WorkloadRef::new(WorkloadKind::Deployment, "plex"));
        assert_eq!(r.to_string(), "deployment/plex");

        let r: WorkloadRef = "StatefulSet/db".parse().unwrap();
        assert_eq!(r.kind, WorkloadKind::StatefulSet);
    }

    #[test]
    fn test_workload_ref_rejects_garbage() {
        assert!("plex".parse::<WorkloadRef>().is_err());
        assert!("daemonset/x".parse::<WorkloadRef>().is_err());
        assert!("deployment/".parse::<WorkloadRef>().is_err());
    }

    #[test]
    fn test_replica_counts_serialize_as_map() {
        let counts = ReplicaCounts::from([
            (WorkloadRef::new(WorkloadKind::Deployment, "plex"), 2),
            (WorkloadRef::new(WorkloadKind::StatefulSet, "db"), 1),
        ]);
        let json = serde_json::to_string(&counts).unwrap();
        assert_eq!(json, r#"{"deployment/plex":2,"statefulset/db":1}"#);

        let parsed: ReplicaCounts = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, counts);
    }

    #[test]
    fn test_taint_display() {
        assert_eq!(Taint::new("ix-svc-start", "NoExecute").to_string(), "ix-svc-start:NoExecute");
        assert_eq!(
            Taint::new("gpu", "NoSchedule").with_value("nvidia").to_string(),
            "gpu=nvidia:NoSchedule"
        );
    }

    #[test]
    fn test_host_job_state_finished() {
        assert!(HostJobState::Success.is_finished());
        assert!(HostJobState::Aborted.is_finished());
        assert!(!HostJobState::Running.is_finished());
    }
}
