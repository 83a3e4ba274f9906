//! Apps Orchestrator - the public face of the crate
//!
//! Composes the lifecycle, the backup catalog and the restore orchestrator
//! over one set of ports, and runs long operations as jobs:
//! - backup creation (lock `chart_releases_backup`, abortable)
//! - backup restore (lock `kubernetes_restore_backup`, not abortable)
//! - the post-update backup with retention

use crate::backup::retention::{prune_update_backups, update_backup_name};
use crate::backup::{Backup, BackupCatalog, ReleaseExporter};
use crate::cluster::{ClusterLifecycle, StatusSnapshot};
use crate::config::{ClusterConfig, ConfigHandle, Settings};
use crate::domain::ports::{
    ClusterRuntimeRef, DatasetApiRef, HostServicesRef, ReleaseManagerRef, SnapshotApiRef, Taint,
    WorkloadApiRef,
};
use crate::error::Result;
use crate::jobs::{JobHandle, JobId, JobManager, JobOptions, JobSnapshot};
use crate::metrics::Metrics;
use crate::restore::{RestoreOrchestrator, RestorePorts, RestoreReport};
use crate::storage::SnapshotStore;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

/// Lock held by backup creation
pub const BACKUP_LOCK: &str = "chart_releases_backup";

/// Lock held by restores
pub const RESTORE_LOCK: &str = "kubernetes_restore_backup";

pub const BACKUP_METHOD: &str = "kubernetes.backup_chart_releases";
pub const RESTORE_METHOD: &str = "kubernetes.restore_backup";
pub const START_METHOD: &str = "kubernetes.start_service";

// =============================================================================
// Ports
// =============================================================================

/// Every adapter the orchestrator needs, bound once at startup
#[derive(Clone)]
pub struct OrchestratorPorts {
    pub snapshots: SnapshotApiRef,
    pub datasets: DatasetApiRef,
    pub workloads: WorkloadApiRef,
    pub runtime: ClusterRuntimeRef,
    pub releases: ReleaseManagerRef,
    pub host: HostServicesRef,
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct AppsOrchestrator {
    settings: Settings,
    config: ConfigHandle,
    lifecycle: Arc<ClusterLifecycle>,
    catalog: Arc<BackupCatalog>,
    restorer: Arc<RestoreOrchestrator>,
    jobs: Arc<JobManager>,
    metrics: Arc<Metrics>,
}

impl AppsOrchestrator {
    pub fn new(settings: Settings, ports: OrchestratorPorts, metrics: Arc<Metrics>) -> Arc<Self> {
        let config = ConfigHandle::new(settings.cluster.clone());
        let snapshots = SnapshotStore::new(ports.snapshots.clone());

        let lifecycle = ClusterLifecycle::new(
            config.clone(),
            settings.clone(),
            ports.runtime.clone(),
            ports.host.clone(),
            ports.datasets.clone(),
        );
        let catalog = Arc::new(BackupCatalog::new(
            config.clone(),
            settings.clone(),
            snapshots.clone(),
            ports.datasets.clone(),
            ports.releases.clone(),
            ReleaseExporter::new(ports.workloads.clone()),
        ));
        let restorer = Arc::new(RestoreOrchestrator::new(
            config.clone(),
            settings.clone(),
            lifecycle.clone(),
            catalog.clone(),
            snapshots,
            RestorePorts {
                datasets: ports.datasets,
                workloads: ports.workloads,
                releases: ports.releases,
                host: ports.host,
            },
        ));

        let jobs = JobManager::with_retention(settings.finished_jobs_to_keep);
        Arc::new(Self {
            settings,
            config,
            lifecycle,
            catalog,
            restorer,
            jobs,
            metrics,
        })
    }

    /// Discover the initial status and start tracking it in metrics
    pub async fn initialize(&self) -> Result<()> {
        let mut events = self.lifecycle.subscribe();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => metrics.observe_status(event.current.status),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Status metrics lagged by {} event(s)", missed)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let status = self.lifecycle.initialize_status().await?;
        info!("Applications cluster status: {}", status);
        Ok(())
    }

    pub fn lifecycle(&self) -> &Arc<ClusterLifecycle> {
        &self.lifecycle
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    // =========================================================================
    // Cluster
    // =========================================================================

    pub fn cluster_status(&self) -> StatusSnapshot {
        self.lifecycle.status()
    }

    pub async fn start_cluster(&self) -> Result<()> {
        self.lifecycle.start().await
    }

    /// Start the cluster in the background
    pub fn start_job(&self) -> JobHandle<()> {
        let lifecycle = self.lifecycle.clone();
        self.jobs
            .submit(START_METHOD, JobOptions::default(), move |_job| async move {
                lifecycle.start().await
            })
    }

    pub async fn stop_cluster(&self) -> Result<()> {
        self.lifecycle.stop().await
    }

    pub fn config(&self) -> ClusterConfig {
        self.config.current()
    }

    /// Apply a new cluster configuration; returns whether it was a clean start
    pub async fn reconfigure(&self, config: ClusterConfig) -> Result<bool> {
        self.lifecycle.reconfigure(config).await
    }

    pub async fn taints(&self) -> Result<Vec<Taint>> {
        self.lifecycle.taints().await
    }

    pub async fn add_taint(&self, taint: Taint) -> Result<bool> {
        self.lifecycle.add_taint(taint).await
    }

    pub async fn remove_taint(&self, key: &str) -> Result<()> {
        self.lifecycle.remove_taint(key).await
    }

    // =========================================================================
    // Backups
    // =========================================================================

    /// Start a backup job; its result is the backup name
    pub fn backup(&self, name: Option<String>) -> JobHandle<String> {
        let catalog = self.catalog.clone();
        let metrics = self.metrics.clone();
        self.jobs.submit(
            BACKUP_METHOD,
            JobOptions::locked(BACKUP_LOCK).abortable(),
            move |job| async move {
                let result = catalog.create(name, &job).await;
                let label = if result.is_ok() { "success" } else { "failure" };
                metrics.backups.with_label_values(&[label]).inc();
                result
            },
        )
    }

    pub async fn list_backups(&self) -> Result<BTreeMap<String, Backup>> {
        self.catalog.list().await
    }

    pub async fn delete_backup(&self, name: &str) -> Result<()> {
        self.catalog.delete(name).await
    }

    /// Start a restore job
    pub fn restore(&self, name: &str) -> JobHandle<RestoreReport> {
        let restorer = self.restorer.clone();
        let metrics = self.metrics.clone();
        let name = name.to_string();
        self.jobs.submit(
            RESTORE_METHOD,
            JobOptions::locked(RESTORE_LOCK),
            move |job| async move {
                let result = restorer.restore(&name, &job).await;
                let label = match &result {
                    Ok(report) if report.is_clean() => "success",
                    Ok(_) => "partial",
                    Err(_) => "failure",
                };
                metrics.restores.with_label_values(&[label]).inc();
                if let Ok(report) = &result {
                    for failure in &report.failures {
                        metrics
                            .restore_item_failures
                            .with_label_values(&[failure.stage])
                            .inc();
                    }
                }
                result
            },
        )
    }

    /// Back up after a system update, keeping only the newest update backups.
    ///
    /// Failures are logged; the update itself must not fail on them.
    pub async fn post_update_hook(&self) -> Option<String> {
        if !self.config.current().is_configured() {
            return None;
        }

        match prune_update_backups(&self.catalog, self.settings.update_backups_to_keep).await {
            Ok(deleted) if !deleted.is_empty() => {
                info!("Removed {} old update backup(s)", deleted.len())
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to list update backups"),
        }

        let name = update_backup_name(Utc::now());
        match self.backup(Some(name)).wait().await {
            Ok(name) => Some(name),
            Err(e) => {
                error!(error = %e, "Failed to back up applications after update");
                None
            }
        }
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    pub fn job(&self, id: JobId) -> Option<JobSnapshot> {
        self.jobs.get(id)
    }

    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.jobs.list()
    }

    pub fn abort_job(&self, id: JobId) -> Result<()> {
        self.jobs.abort(id)
    }
}
