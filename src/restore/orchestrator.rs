//! Restore Orchestrator
//!
//! Rolls the applications dataset back to a backup and rebuilds the cluster
//! on top of it:
//!
//! 1. validate the backup
//! 2. stop the cluster and forget its runtime configuration
//! 3. quiesce catalog sync jobs
//! 4. roll back, recreating the excluded datasets fresh
//! 5. clear stale k3s state
//! 6. start a new cluster and wait for the node
//! 7. import releases, recreate volumes and chart CRDs
//! 8. redeploy the imported releases
//! 9. restore replica counts
//! 10. resync catalogs
//!
//! Steps 1 to 6 abort the restore on the first error. From step 7 on the
//! rollback has happened and cannot be undone, so failures are recorded per
//! item in the [`RestoreReport`] and the restore carries on.
//!
//! Step 6 runs the regular [`ClusterLifecycle::start`], so its taint and pod
//! waits keep their configured timeouts and a cluster that never settles
//! fails the restore with [`Error::Timeout`] before any release is imported.
//! Only the node readiness wait that follows is uncapped
//! (`readiness.restoreNodeReady`).

use super::report::RestoreReport;
use super::volumes::restore_volumes;
use crate::backup::catalog::release_dirs;
use crate::backup::{Backup, BackupCatalog, ImportOutcome, ReleaseBackupRecord, ReleaseImporter};
use crate::best_effort;
use crate::cluster::ClusterLifecycle;
use crate::config::{ConfigHandle, Settings};
use crate::domain::ports::{
    DatasetApiRef, HostJobState, HostServicesRef, Release, ReleaseManagerRef, ReplicaCounts,
    WorkloadApiRef, WorkloadRef,
};
use crate::error::{Error, Result};
use crate::jobs::Job;
use crate::storage::layout::{excluded_datasets, releases_dataset};
use crate::storage::SnapshotStore;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Host jobs that write into the catalogs dataset
pub const CATALOG_SYNC_METHODS: [&str; 2] = ["catalog.sync", "catalog.sync_all"];

/// External systems the restore drives directly
#[derive(Clone)]
pub struct RestorePorts {
    pub datasets: DatasetApiRef,
    pub workloads: WorkloadApiRef,
    pub releases: ReleaseManagerRef,
    pub host: HostServicesRef,
}

pub struct RestoreOrchestrator {
    config: ConfigHandle,
    settings: Settings,
    lifecycle: Arc<ClusterLifecycle>,
    catalog: Arc<BackupCatalog>,
    snapshots: SnapshotStore,
    ports: RestorePorts,
    importer: ReleaseImporter,
}

impl RestoreOrchestrator {
    pub fn new(
        config: ConfigHandle,
        settings: Settings,
        lifecycle: Arc<ClusterLifecycle>,
        catalog: Arc<BackupCatalog>,
        snapshots: SnapshotStore,
        ports: RestorePorts,
    ) -> Self {
        let importer = ReleaseImporter::new(ports.workloads.clone());
        Self {
            config,
            settings,
            lifecycle,
            catalog,
            snapshots,
            ports,
            importer,
        }
    }

    /// Restore backup `name`, reporting progress on `job`
    pub async fn restore(&self, name: &str, job: &Job) -> Result<RestoreReport> {
        let backup = self.catalog.get(name).await?;
        let config = self.config.current();
        let dataset = config.require_dataset()?;
        let pool = config
            .pool
            .clone()
            .unwrap_or_else(|| dataset.split('/').next().unwrap_or(&dataset).to_string());
        job.set_progress(5.0, "Basic validation complete");

        self.lifecycle.stop().await?;
        job.set_progress(15.0, "Stopped kubernetes");
        best_effort::remove_dir_all(&self.settings.rancher_config_dir).await.log();
        self.ports.host.reset_cni_config().await?;

        self.quiesce_catalog_syncs(job).await?;
        self.rollback(&dataset, &backup, job).await?;
        self.clear_k3s_state(&dataset).await?;

        job.set_progress(25.0, "Initializing new kubernetes cluster");
        self.lifecycle.start().await?;
        self.lifecycle.wait_node_ready().await?;
        job.set_progress(30.0, "Kubernetes cluster re-initialized");

        let mut report = RestoreReport::new(name);
        let restored = self
            .import_releases(&dataset, &pool, &backup, job, &mut report)
            .await;

        job.set_progress(92.0, "Creating kubernetes resources");
        self.redeploy(&restored, &mut report).await;

        job.set_progress(97.0, "Scaling scalable workloads");
        self.rescale(&restored, &mut report).await;

        job.set_progress(99.0, "Syncing catalogs");
        report.catalogs_synced = self.sync_catalogs().await;

        job.set_progress(100.0, format!("Restore of {name:?} backup complete"));
        match report.partial_failure() {
            Some(e) => warn!("{}", e),
            None => info!(backup = %name, restored = report.restored.len(), "Restore complete"),
        }
        Ok(report)
    }

    // =========================================================================
    // Steps 3-5: before the new cluster
    // =========================================================================

    async fn quiesce_catalog_syncs(&self, job: &Job) -> Result<()> {
        let host = &self.ports.host;
        let syncs = host
            .list_jobs(&CATALOG_SYNC_METHODS, &[HostJobState::Running, HostJobState::Waiting])
            .await?;

        for sync in syncs.iter().filter(|j| j.state == HostJobState::Waiting) {
            info!(job = sync.id, "Aborting queued catalog sync");
            host.abort_job(sync.id).await?;
        }

        job.set_progress(17.0, "Waiting for catalog sync jobs to complete");
        for sync in syncs.iter().filter(|j| j.state == HostJobState::Running) {
            debug!(job = sync.id, "Waiting for catalog sync");
            host.wait_job(sync.id).await?;
        }
        Ok(())
    }

    async fn rollback(&self, dataset: &str, backup: &Backup, job: &Job) -> Result<()> {
        let datasets = &self.ports.datasets;
        let fresh = excluded_datasets(dataset);

        for ds in &fresh {
            if datasets.exists(&ds.name).await? {
                datasets.delete(&ds.name, true, true).await?;
            }
        }

        job.set_progress(20.0, format!("Rolling back {}", backup.snapshot_name));
        self.snapshots.rollback(&backup.snapshot_name).await?;

        for ds in &fresh {
            datasets.create(&ds.name, &ds.properties).await?;
            if ds.mount {
                datasets.mount(&ds.name).await?;
            }
        }
        Ok(())
    }

    /// Remove directories under the k3s dataset mountpoint
    async fn clear_k3s_state(&self, dataset: &str) -> Result<()> {
        let k3s = self.settings.mountpoint(dataset).join("k3s");
        let mut entries = match tokio::fs::read_dir(&k3s).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} not mounted, nothing to clear", k3s.display());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Step 7: releases
    // =========================================================================

    async fn import_releases(
        &self,
        dataset: &str,
        pool: &str,
        backup: &Backup,
        job: &Job,
        report: &mut RestoreReport,
    ) -> Vec<ReleaseBackupRecord> {
        let live = match self.catalog.live_release_datasets(dataset).await {
            Ok(live) => live,
            Err(e) => {
                report.fail(releases_dataset(dataset), "import", e);
                BTreeSet::new()
            }
        };
        let names = match release_dirs(&backup.backup_path).await {
            Ok(names) => names,
            Err(e) => {
                report.fail(backup.backup_path.display().to_string(), "import", e);
                Vec::new()
            }
        };
        let charts: BTreeMap<String, Release> = match self.ports.releases.list_releases().await {
            Ok(releases) => releases.into_iter().map(|r| (r.name.clone(), r)).collect(),
            Err(e) => {
                report.fail("releases", "crds", e);
                BTreeMap::new()
            }
        };
        let volume_datasets: BTreeSet<String> = match self
            .ports
            .datasets
            .descendants(&releases_dataset(dataset))
            .await
        {
            Ok(found) => found.into_iter().collect(),
            Err(e) => {
                report.fail(releases_dataset(dataset), "volumes", e);
                BTreeSet::new()
            }
        };

        let total = names.len().max(1) as f64;
        let mut restored = Vec::new();
        for (i, name) in names.iter().enumerate() {
            job.set_progress(
                30.0 + 60.0 * (i as f64 + 1.0) / total,
                format!("Restoring helm configuration for {name:?} chart release"),
            );

            let record = match self
                .importer
                .import(name, &backup.backup_path.join(name), &live)
                .await
            {
                Ok(ImportOutcome::Imported(record)) => record,
                Ok(ImportOutcome::Skipped(reason)) => {
                    report.skipped.insert(name.clone(), reason);
                    continue;
                }
                Err(e) => {
                    error!(release = %name, error = %e, "Failed to import release");
                    report.fail(name.clone(), "import", e);
                    continue;
                }
            };

            for (pv, e) in restore_volumes(
                self.ports.workloads.as_ref(),
                &volume_datasets,
                pool,
                &record.volumes,
            )
            .await
            {
                report.fail(pv, "volumes", e);
            }

            if let Some(chart_path) = charts.get(name).and_then(|r| r.chart_path.as_deref()) {
                self.apply_crds(name, chart_path, report).await;
            }

            report.restored.push(name.clone());
            restored.push(record);
        }
        restored
    }

    async fn apply_crds(&self, release: &str, chart_path: &Path, report: &mut RestoreReport) {
        let manifests = match crd_manifests(chart_path) {
            Ok(manifests) => manifests,
            Err(e) => {
                report.fail(release, "crds", e);
                return;
            }
        };
        for manifest in manifests {
            if let Err(e) = self.ports.workloads.apply_file(&manifest).await {
                error!(release = %release, file = %manifest.display(), error = %e, "Failed to apply CRD");
                report.fail(manifest.display().to_string(), "crds", e);
            }
        }
    }

    // =========================================================================
    // Steps 8-10: after import
    // =========================================================================

    async fn redeploy(&self, restored: &[ReleaseBackupRecord], report: &mut RestoreReport) {
        let mut pending = Vec::new();
        for record in restored {
            match self.ports.releases.redeploy(&record.release_name).await {
                Ok(id) => pending.push((record.release_name.as_str(), id)),
                Err(e) => report.fail(record.release_name.clone(), "redeploy", e),
            }
        }

        for (release, id) in pending {
            match self.ports.host.wait_job(id).await {
                Ok(job) if job.state == HostJobState::Success => {}
                Ok(job) => {
                    let reason = job
                        .error
                        .unwrap_or_else(|| format!("job {} ended {:?}", job.id, job.state));
                    error!(release = %release, "Failed to redeploy: {}", reason);
                    report.fail(release, "redeploy", reason);
                }
                Err(e) => report.fail(release, "redeploy", e),
            }
        }
    }

    async fn rescale(&self, restored: &[ReleaseBackupRecord], report: &mut RestoreReport) {
        let releases: BTreeMap<String, Release> = match self.ports.releases.list_releases().await {
            Ok(releases) => releases.into_iter().map(|r| (r.name.clone(), r)).collect(),
            Err(e) => {
                report.fail("releases", "scale", e);
                return;
            }
        };

        for record in restored {
            let Some(release) = releases.get(&record.release_name) else {
                warn!(release = %record.release_name, "Release vanished after redeploy, not scaling");
                continue;
            };
            if let Err(e) = self.scale_release(release, &record.replica_counts).await {
                error!(release = %release.name, error = %e, "Failed to scale release");
                report.fail(release.name.clone(), "scale", e);
            }
        }
    }

    /// Scale the workloads of `release` that exist now back to their counts
    async fn scale_release(&self, release: &Release, counts: &ReplicaCounts) -> Result<()> {
        let present: BTreeSet<WorkloadRef> = self
            .ports
            .workloads
            .list_scalable(&release.namespace)
            .await?
            .iter()
            .map(|w| w.reference())
            .collect();
        let counts: ReplicaCounts = counts
            .iter()
            .filter(|(workload, _)| present.contains(*workload))
            .map(|(workload, replicas)| (workload.clone(), *replicas))
            .collect();
        if counts.is_empty() {
            return Ok(());
        }
        self.ports
            .workloads
            .scale_release(&release.namespace, &counts)
            .await
    }

    async fn sync_catalogs(&self) -> bool {
        let outcome = async {
            let id = self.ports.host.sync_catalogs().await?;
            self.ports.host.wait_job(id).await
        }
        .await;
        match outcome {
            Ok(job) if job.state == HostJobState::Success => true,
            Ok(job) => {
                error!(
                    "Failed to sync catalogs after restoring backup: {}",
                    job.error.unwrap_or_default()
                );
                false
            }
            Err(e) => {
                error!(error = %e, "Failed to sync catalogs after restoring backup");
                false
            }
        }
    }
}

/// CRD manifests shipped in a chart's `crds` directory, sorted
pub fn crd_manifests(chart_path: &Path) -> Result<Vec<PathBuf>> {
    let crds = chart_path.join("crds");
    let mut found = Vec::new();
    for extension in ["yaml", "yml"] {
        let pattern = crds.join(format!("*.{extension}"));
        let paths = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| Error::Validation(format!("bad CRD pattern {}: {}", pattern.display(), e)))?;
        found.extend(paths.filter_map(|p| p.ok()));
    }
    found.sort();
    Ok(found)
}
