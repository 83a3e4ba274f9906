//! In-memory port implementations for unit tests

use crate::domain::ports::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

fn tool_error(command: &str, reason: impl Into<String>) -> Error {
    Error::ExternalTool {
        tool: "zfs".into(),
        command: command.into(),
        reason: reason.into(),
    }
}

// =============================================================================
// ZFS
// =============================================================================

#[derive(Default)]
struct ZfsState {
    datasets: BTreeSet<String>,
    snapshots: BTreeMap<String, (DateTime<Utc>, BTreeSet<String>)>,
    rollbacks: Vec<(String, RollbackOptions)>,
    mounted: Vec<String>,
    locked: Vec<LockedDataset>,
    events: Vec<String>,
    ticks: i64,
    fail_snapshot_deletes: bool,
}

/// Datasets and snapshots kept in maps
#[derive(Default)]
pub struct FakeZfs {
    state: Mutex<ZfsState>,
}

impl FakeZfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_datasets(names: &[&str]) -> Self {
        let zfs = Self::new();
        for name in names {
            zfs.add_dataset(name);
        }
        zfs
    }

    pub fn add_dataset(&self, name: &str) {
        self.state.lock().datasets.insert(name.to_string());
    }

    pub fn has_dataset(&self, name: &str) -> bool {
        self.state.lock().datasets.contains(name)
    }

    pub fn lock_dataset(&self, id: &str) {
        self.state.lock().locked.push(LockedDataset {
            id: id.to_string(),
            mountpoint: Some(format!("/mnt/{id}")),
        });
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        self.state.lock().snapshots.keys().cloned().collect()
    }

    pub fn snapshot_excludes(&self, name: &str) -> Option<BTreeSet<String>> {
        self.state.lock().snapshots.get(name).map(|(_, ex)| ex.clone())
    }

    pub fn rollbacks(&self) -> Vec<(String, RollbackOptions)> {
        self.state.lock().rollbacks.clone()
    }

    pub fn mounted(&self) -> Vec<String> {
        self.state.lock().mounted.clone()
    }

    /// Mutating calls in order (`create x`, `delete x`, `rollback s`, ...)
    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    pub fn fail_snapshot_deletes(&self, fail: bool) {
        self.state.lock().fail_snapshot_deletes = fail;
    }
}

#[async_trait]
impl SnapshotApi for FakeZfs {
    async fn create(&self, dataset: &str, name: &str, exclude: &BTreeSet<String>) -> Result<()> {
        let mut state = self.state.lock();
        let full = format!("{dataset}@{name}");
        if state.snapshots.contains_key(&full) {
            return Err(tool_error("snapshot", format!("{full} already exists")));
        }
        state.ticks += 1;
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(state.ticks);
        state.snapshots.insert(full.clone(), (created, exclude.clone()));
        state.events.push(format!("snapshot {full}"));
        Ok(())
    }

    async fn rollback(&self, snapshot: &str, options: RollbackOptions) -> Result<()> {
        let mut state = self.state.lock();
        if !state.snapshots.contains_key(snapshot) {
            return Err(tool_error("rollback", format!("{snapshot} does not exist")));
        }
        state.rollbacks.push((snapshot.to_string(), options));
        state.events.push(format!("rollback {snapshot}"));
        Ok(())
    }

    async fn delete(&self, snapshot: &str, _recursive: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_snapshot_deletes {
            return Err(tool_error("destroy", "dataset is busy"));
        }
        state
            .snapshots
            .remove(snapshot)
            .ok_or_else(|| tool_error("destroy", format!("{snapshot} does not exist")))?;
        state.events.push(format!("destroy {snapshot}"));
        Ok(())
    }

    async fn query(&self, prefix: &str) -> Result<Vec<SnapshotInfo>> {
        Ok(self
            .state
            .lock()
            .snapshots
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, (created_on, _))| SnapshotInfo {
                name: name.clone(),
                created_on: *created_on,
            })
            .collect())
    }
}

#[async_trait]
impl DatasetApi for FakeZfs {
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.has_dataset(name))
    }

    async fn create(&self, name: &str, _properties: &BTreeMap<String, String>) -> Result<()> {
        let mut state = self.state.lock();
        if !state.datasets.insert(name.to_string()) {
            return Err(tool_error("create", format!("{name} already exists")));
        }
        state.events.push(format!("create {name}"));
        Ok(())
    }

    async fn delete(&self, name: &str, _recursive: bool, _force: bool) -> Result<()> {
        let mut state = self.state.lock();
        let below = format!("{name}/");
        state
            .datasets
            .retain(|d| d != name && !d.starts_with(&below));
        state.events.push(format!("delete {name}"));
        Ok(())
    }

    async fn mount(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.mounted.push(name.to_string());
        state.events.push(format!("mount {name}"));
        Ok(())
    }

    async fn children(&self, name: &str) -> Result<Vec<String>> {
        let below = format!("{name}/");
        Ok(self
            .state
            .lock()
            .datasets
            .iter()
            .filter_map(|d| d.strip_prefix(&below))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    async fn descendants(&self, name: &str) -> Result<Vec<String>> {
        let below = format!("{name}/");
        Ok(self
            .state
            .lock()
            .datasets
            .iter()
            .filter(|d| d.starts_with(&below))
            .cloned()
            .collect())
    }

    async fn locked(&self) -> Result<Vec<LockedDataset>> {
        Ok(self.state.lock().locked.clone())
    }
}

// =============================================================================
// Workloads
// =============================================================================

#[derive(Default)]
struct WorkloadState {
    namespaces: BTreeMap<String, Manifest>,
    secrets: BTreeMap<String, Vec<Manifest>>,
    scalable: BTreeMap<String, Vec<ScalableWorkload>>,
    volumes: BTreeMap<String, Vec<PersistentVolumeRecord>>,
    created_namespaces: Vec<Manifest>,
    created_secrets: Vec<(String, Manifest)>,
    scale_calls: Vec<(String, ReplicaCounts)>,
    created_volumes: Vec<PersistentVolumeRecord>,
    applied_files: Vec<PathBuf>,
    failing_namespaces: BTreeSet<String>,
}

/// Namespaced objects of a fake cluster
#[derive(Default)]
pub struct FakeWorkloads {
    state: Mutex<WorkloadState>,
}

impl FakeWorkloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_namespace(&self, name: &str) {
        self.state
            .lock()
            .namespaces
            .insert(name.to_string(), namespace_manifest(name));
    }

    pub fn add_secret(&self, namespace: &str, secret: Manifest) {
        self.state
            .lock()
            .secrets
            .entry(namespace.to_string())
            .or_default()
            .push(secret);
    }

    pub fn set_scalable(&self, namespace: &str, workloads: Vec<ScalableWorkload>) {
        self.state
            .lock()
            .scalable
            .insert(namespace.to_string(), workloads);
    }

    pub fn set_volumes(&self, namespace: &str, volumes: Vec<PersistentVolumeRecord>) {
        self.state.lock().volumes.insert(namespace.to_string(), volumes);
    }

    /// Namespace creation for `name` fails
    pub fn fail_namespace(&self, name: &str) {
        self.state.lock().failing_namespaces.insert(name.to_string());
    }

    pub fn created_namespaces(&self) -> Vec<Manifest> {
        self.state.lock().created_namespaces.clone()
    }

    pub fn created_secrets(&self) -> Vec<(String, Manifest)> {
        self.state.lock().created_secrets.clone()
    }

    pub fn scale_calls(&self) -> Vec<(String, ReplicaCounts)> {
        self.state.lock().scale_calls.clone()
    }

    pub fn created_volumes(&self) -> Vec<PersistentVolumeRecord> {
        self.state.lock().created_volumes.clone()
    }

    pub fn applied_files(&self) -> Vec<PathBuf> {
        self.state.lock().applied_files.clone()
    }
}

#[async_trait]
impl WorkloadApi for FakeWorkloads {
    async fn export_namespace(&self, namespace: &str) -> Result<Manifest> {
        self.state
            .lock()
            .namespaces
            .get(namespace)
            .cloned()
            .ok_or_else(|| Error::not_found("Namespace", namespace))
    }

    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Manifest>> {
        Ok(self
            .state
            .lock()
            .secrets
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_namespace(&self, manifest: Manifest) -> Result<()> {
        let name = manifest_name(&manifest);
        let mut state = self.state.lock();
        if state.failing_namespaces.contains(&name) {
            return Err(Error::Internal(format!("namespace {name} rejected")));
        }
        state.namespaces.insert(name, manifest.clone());
        state.created_namespaces.push(manifest);
        Ok(())
    }

    async fn create_secret(&self, namespace: &str, manifest: Manifest) -> Result<()> {
        self.state
            .lock()
            .created_secrets
            .push((namespace.to_string(), manifest));
        Ok(())
    }

    async fn list_scalable(&self, namespace: &str) -> Result<Vec<ScalableWorkload>> {
        Ok(self
            .state
            .lock()
            .scalable
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn scale_release(&self, namespace: &str, replica_counts: &ReplicaCounts) -> Result<()> {
        self.state
            .lock()
            .scale_calls
            .push((namespace.to_string(), replica_counts.clone()));
        Ok(())
    }

    async fn list_volumes(&self, namespace: &str) -> Result<Vec<PersistentVolumeRecord>> {
        Ok(self
            .state
            .lock()
            .volumes
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_volume(&self, record: &PersistentVolumeRecord) -> Result<()> {
        self.state.lock().created_volumes.push(record.clone());
        Ok(())
    }

    async fn apply_file(&self, path: &Path) -> Result<()> {
        self.state.lock().applied_files.push(path.to_path_buf());
        Ok(())
    }
}

/// Namespace object as the API server returns it
pub fn namespace_manifest(name: &str) -> Manifest {
    serde_yaml::from_str(&format!(
        "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {name}\n  uid: 0d7c-{name}\n  resourceVersion: \"4711\"\n  creationTimestamp: \"2024-01-01T00:00:00Z\"\n  labels:\n    catalog: OFFICIAL\n"
    ))
    .unwrap()
}

/// Secret object with an optional data payload
pub fn secret_manifest(name: &str, secret_type: &str, with_data: bool) -> Manifest {
    let data = if with_data { "data:\n  release: SDRzSQ==\n" } else { "" };
    serde_yaml::from_str(&format!(
        "apiVersion: v1\nkind: Secret\ntype: {secret_type}\nmetadata:\n  name: {name}\n  uid: 11-{name}\n  resourceVersion: \"99\"\n{data}"
    ))
    .unwrap()
}

pub fn manifest_name(manifest: &Manifest) -> String {
    manifest["metadata"]["name"].as_str().unwrap_or_default().to_string()
}

// =============================================================================
// Cluster Runtime
// =============================================================================

struct RuntimeState {
    configured: bool,
    taints: Vec<Taint>,
    /// Taints the node never drops on its own
    sticky: Vec<Taint>,
    running_pods: usize,
    storage_setups: Vec<String>,
    taint_writes: usize,
}

/// Single node whose taints are under test control
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            state: Mutex::new(RuntimeState {
                configured: true,
                taints: Vec::new(),
                sticky: Vec::new(),
                running_pods: 3,
                storage_setups: Vec::new(),
                taint_writes: 0,
            }),
        }
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_configured(&self, configured: bool) {
        self.state.lock().configured = configured;
    }

    pub fn set_running_pods(&self, pods: usize) {
        self.state.lock().running_pods = pods;
    }

    /// A taint that stays on the node whatever is written
    pub fn add_sticky_taint(&self, taint: Taint) {
        let mut state = self.state.lock();
        state.taints.push(taint.clone());
        state.sticky.push(taint);
    }

    pub fn taints(&self) -> Vec<Taint> {
        self.state.lock().taints.clone()
    }

    pub fn taint_writes(&self) -> usize {
        self.state.lock().taint_writes
    }

    pub fn storage_setups(&self) -> Vec<String> {
        self.state.lock().storage_setups.clone()
    }
}

#[async_trait]
impl ClusterRuntime for FakeRuntime {
    async fn node_config(&self) -> Result<NodeConfig> {
        let state = self.state.lock();
        Ok(NodeConfig {
            configured: state.configured,
            taints: state.taints.clone(),
            error: (!state.configured).then(|| "node is not ready".to_string()),
        })
    }

    async fn set_taints(&self, taints: Vec<Taint>) -> Result<()> {
        let mut state = self.state.lock();
        let mut next = taints;
        for sticky in state.sticky.clone() {
            if !next.contains(&sticky) {
                next.push(sticky);
            }
        }
        state.taints = next;
        state.taint_writes += 1;
        Ok(())
    }

    async fn running_pods(&self) -> Result<usize> {
        Ok(self.state.lock().running_pods)
    }

    async fn setup_storage_classes(&self, pool_dataset: &str) -> Result<()> {
        self.state.lock().storage_setups.push(pool_dataset.to_string());
        Ok(())
    }
}

// =============================================================================
// Releases
// =============================================================================

#[derive(Default)]
struct ReleaseState {
    releases: Vec<Release>,
    redeployed: Vec<String>,
    next_job: HostJobId,
}

#[derive(Default)]
pub struct FakeReleases {
    state: Mutex<ReleaseState>,
}

impl FakeReleases {
    pub fn new(names: &[&str]) -> Self {
        let fake = Self::default();
        for name in names {
            fake.add_release(Release {
                name: name.to_string(),
                namespace: format!("ix-{name}"),
                chart_path: None,
            });
        }
        fake
    }

    pub fn add_release(&self, release: Release) {
        self.state.lock().releases.push(release);
    }

    pub fn remove_release(&self, name: &str) {
        self.state.lock().releases.retain(|r| r.name != name);
    }

    pub fn redeployed(&self) -> Vec<String> {
        self.state.lock().redeployed.clone()
    }
}

#[async_trait]
impl ReleaseManager for FakeReleases {
    async fn list_releases(&self) -> Result<Vec<Release>> {
        Ok(self.state.lock().releases.clone())
    }

    async fn redeploy(&self, release: &str) -> Result<HostJobId> {
        let mut state = self.state.lock();
        state.redeployed.push(release.to_string());
        state.next_job += 1;
        Ok(1000 + state.next_job)
    }
}

// =============================================================================
// Host Services
// =============================================================================

#[derive(Default)]
struct HostState {
    started: bool,
    calls: Vec<String>,
    alerts: BTreeMap<String, String>,
    jobs: Vec<HostJob>,
    failed_jobs: BTreeSet<HostJobId>,
    fail_start: Option<String>,
}

/// Host middleware recording every call
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_started(&self, started: bool) {
        self.state.lock().started = started;
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn fail_service_start(&self, reason: &str) {
        self.state.lock().fail_start = Some(reason.to_string());
    }

    pub fn add_job(&self, id: HostJobId, method: &str, state: HostJobState) {
        self.state.lock().jobs.push(HostJob {
            id,
            method: method.to_string(),
            state,
            error: None,
        });
    }

    /// `wait_job` reports the job as failed
    pub fn fail_job(&self, id: HostJobId) {
        self.state.lock().failed_jobs.insert(id);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn alert(&self, name: &str) -> Option<String> {
        self.state.lock().alerts.get(name).cloned()
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().calls.push(call.into());
    }
}

#[async_trait]
impl HostServices for FakeHost {
    async fn start_service(&self, service: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("start {service}"));
        if let Some(reason) = state.fail_start.clone() {
            return Err(Error::MiddlewareCall {
                method: "service.start".into(),
                reason,
            });
        }
        state.started = true;
        Ok(())
    }

    async fn stop_service(&self, service: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("stop {service}"));
        state.started = false;
        Ok(())
    }

    async fn service_started(&self, _service: &str) -> Result<bool> {
        Ok(self.is_started())
    }

    async fn run_migrations(&self) -> Result<()> {
        self.record("migrations");
        Ok(())
    }

    async fn run_app_migrations(&self) -> Result<()> {
        self.record("app migrations");
        Ok(())
    }

    async fn raise_alert(&self, alert: &str, error: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("raise {alert}"));
        state.alerts.insert(alert.to_string(), error.to_string());
        Ok(())
    }

    async fn clear_alert(&self, alert: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("clear {alert}"));
        state.alerts.remove(alert);
        Ok(())
    }

    async fn reset_cni_config(&self) -> Result<()> {
        self.record("reset cni");
        Ok(())
    }

    async fn list_jobs(&self, methods: &[&str], states: &[HostJobState]) -> Result<Vec<HostJob>> {
        Ok(self
            .state
            .lock()
            .jobs
            .iter()
            .filter(|j| methods.contains(&j.method.as_str()) && states.contains(&j.state))
            .cloned()
            .collect())
    }

    async fn abort_job(&self, id: HostJobId) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("abort {id}"));
        if let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) {
            job.state = HostJobState::Aborted;
        }
        Ok(())
    }

    async fn wait_job(&self, id: HostJobId) -> Result<HostJob> {
        let mut state = self.state.lock();
        state.calls.push(format!("wait {id}"));
        let failed = state.failed_jobs.contains(&id);
        let job = match state.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) => {
                job.state = if failed { HostJobState::Failed } else { HostJobState::Success };
                job.clone()
            }
            None => HostJob {
                id,
                method: "unknown".into(),
                state: if failed { HostJobState::Failed } else { HostJobState::Success },
                error: failed.then(|| "job failed".to_string()),
            },
        };
        Ok(job)
    }

    async fn sync_catalogs(&self) -> Result<HostJobId> {
        self.record("sync catalogs");
        Ok(1)
    }
}
