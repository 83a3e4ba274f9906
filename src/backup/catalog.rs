//! Backup Catalog
//!
//! A backup is a recursive snapshot of the applications dataset plus a
//! directory of exported release state under `<mountpoint>/backups/<name>`.
//! A snapshot without its directory is not a backup.

use super::exporter::ReleaseExporter;
use crate::best_effort;
use crate::config::{ConfigHandle, Settings};
use crate::domain::ports::{DatasetApiRef, ReleaseManagerRef, SnapshotInfo};
use crate::error::{Error, Result};
use crate::jobs::Job;
use crate::storage::layout::{
    backup_name_from_snapshot, backup_snapshot, backup_snapshot_name, excluded_datasets,
    releases_dataset, validate_backup_name, BACKUP_NAME_PREFIX,
};
use crate::storage::SnapshotStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Directory under the dataset mountpoint holding backup trees
pub const BACKUPS_DIR: &str = "backups";

/// A named backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub name: String,
    pub snapshot_name: String,
    pub created_on: DateTime<Utc>,
    pub backup_path: PathBuf,
    /// Releases present in the backup that still have a dataset
    pub releases: Vec<String>,
}

pub struct BackupCatalog {
    config: ConfigHandle,
    settings: Settings,
    snapshots: SnapshotStore,
    datasets: DatasetApiRef,
    releases: ReleaseManagerRef,
    exporter: ReleaseExporter,
}

impl BackupCatalog {
    pub fn new(
        config: ConfigHandle,
        settings: Settings,
        snapshots: SnapshotStore,
        datasets: DatasetApiRef,
        releases: ReleaseManagerRef,
        exporter: ReleaseExporter,
    ) -> Self {
        Self {
            config,
            settings,
            snapshots,
            datasets,
            releases,
            exporter,
        }
    }

    pub fn backups_dir(&self, dataset: &str) -> PathBuf {
        self.settings.mountpoint(dataset).join(BACKUPS_DIR)
    }

    /// Names of the release datasets currently present
    pub async fn live_release_datasets(&self, dataset: &str) -> Result<BTreeSet<String>> {
        let releases = releases_dataset(dataset);
        if !self.datasets.exists(&releases).await? {
            return Ok(BTreeSet::new());
        }
        Ok(self.datasets.children(&releases).await?.into_iter().collect())
    }

    // =========================================================================
    // Listing
    // =========================================================================

    /// All backups by name
    pub async fn list(&self) -> Result<BTreeMap<String, Backup>> {
        let config = self.config.current();
        let dataset = match config.dataset() {
            Some(dataset) if !config.passthrough_mode => dataset,
            _ => return Ok(BTreeMap::new()),
        };

        let base = self.backups_dir(&dataset);
        let snapshots = self
            .snapshots
            .query(&format!("{dataset}@{BACKUP_NAME_PREFIX}"))
            .await?;
        let live = self.live_release_datasets(&dataset).await?;

        let mut backups = BTreeMap::new();
        for SnapshotInfo { name: snapshot_name, created_on } in snapshots {
            let Some(name) = backup_name_from_snapshot(&snapshot_name).map(str::to_string) else {
                continue;
            };
            if let Err(e) = validate_backup_name(&name) {
                warn!(snapshot = %snapshot_name, error = %e, "Ignoring snapshot with unusable backup name");
                continue;
            }
            let backup_path = base.join(&name);
            if !tokio::fs::try_exists(&backup_path).await.unwrap_or(false) {
                continue;
            }
            let releases = release_dirs(&backup_path)
                .await?
                .into_iter()
                .filter(|r| live.contains(r))
                .collect();
            backups.insert(
                name.clone(),
                Backup {
                    name,
                    snapshot_name,
                    created_on,
                    backup_path,
                    releases,
                },
            );
        }
        Ok(backups)
    }

    pub async fn get(&self, name: &str) -> Result<Backup> {
        self.list()
            .await?
            .remove(name)
            .ok_or_else(|| Error::not_found("Backup", name))
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Create a backup, reporting progress on `job`. Returns the backup name.
    pub async fn create(&self, name: Option<String>, job: &Job) -> Result<String> {
        let config = self.config.current();
        let dataset = config.require_dataset()?;
        if config.passthrough_mode {
            return Err(Error::Validation(
                "Backups are not supported in passthrough mode".into(),
            ));
        }

        let name = name.unwrap_or_else(|| Utc::now().format("%F_%T").to_string());
        validate_backup_name(&name)?;

        let snapshot_name = backup_snapshot_name(&dataset, &name);
        if self.snapshots.exists(&snapshot_name).await? {
            return Err(Error::duplicate("Snapshot", snapshot_name));
        }

        let base = self.backups_dir(&dataset);
        let backup_dir = base.join(&name);
        tokio::fs::create_dir_all(&base).await?;
        match tokio::fs::create_dir(&backup_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::duplicate("Backup", name));
            }
            Err(e) => return Err(e.into()),
        }
        job.set_progress(10.0, "Basic validation complete");

        if let Err(e) = self.export_and_snapshot(&dataset, &name, &backup_dir, job).await {
            error!(backup = %name, error = %e, "Backup failed, removing partial directory");
            best_effort::remove_dir_all(&backup_dir).await.log();
            return Err(e);
        }

        job.set_progress(100.0, format!("Backup {name:?} complete"));
        info!(backup = %name, "Backup created");
        Ok(name)
    }

    async fn export_and_snapshot(
        &self,
        dataset: &str,
        name: &str,
        backup_dir: &Path,
        job: &Job,
    ) -> Result<()> {
        let releases = self.releases.list_releases().await?;
        let total = releases.len().max(1) as f64;

        let mut failures = Vec::new();
        for (i, release) in releases.iter().enumerate() {
            job.check_cancelled()?;
            job.set_progress(
                10.0 + 80.0 * (i as f64 + 1.0) / total,
                format!("Backing up {}", release.name),
            );

            let release_dir = backup_dir.join(&release.name);
            if let Err(e) = self.exporter.export(release, &release_dir).await {
                error!(release = %release.name, error = %e, "Failed to back up release");
                best_effort::remove_dir_all(&release_dir).await.log();
                failures.push(format!("{}: {}", release.name, e));
            }
        }
        if !failures.is_empty() {
            warn!(
                "{}",
                Error::PartialFailure {
                    operation: format!("Backup {name:?}"),
                    failures,
                }
            );
        }

        job.check_cancelled()?;
        job.set_progress(90.0, "Taking snapshot of applications dataset");
        let exclude: BTreeSet<String> = excluded_datasets(dataset)
            .into_iter()
            .map(|d| d.name)
            .collect();
        self.snapshots
            .snapshot(dataset, &backup_snapshot(name), &exclude)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Remove a backup's snapshot and directory, both best-effort
    pub async fn delete(&self, name: &str) -> Result<()> {
        let backup = self.get(name).await?;

        self.snapshots.delete(&backup.snapshot_name).await.log();
        best_effort::remove_dir_all(&backup.backup_path).await.log();
        info!(backup = %name, "Backup deleted");
        Ok(())
    }
}

/// Release directory names in a backup, sorted
pub async fn release_dirs(backup_path: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(backup_path).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::domain::ports::SnapshotApi;
    use crate::testing::{FakeReleases, FakeWorkloads, FakeZfs};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    struct Fixture {
        zfs: Arc<FakeZfs>,
        catalog: BackupCatalog,
        mnt: tempfile::TempDir,
    }

    fn fixture(releases: &[&str]) -> Fixture {
        let mnt = tempfile::tempdir().unwrap();
        let zfs = Arc::new(FakeZfs::with_datasets(&[
            "tank",
            "tank/ix-applications",
            "tank/ix-applications/releases",
        ]));
        let workloads = Arc::new(FakeWorkloads::new());
        for release in releases {
            zfs.add_dataset(&format!("tank/ix-applications/releases/{release}"));
            workloads.add_namespace(&format!("ix-{release}"));
        }
        let settings = Settings {
            mount_root: mnt.path().to_path_buf(),
            ..Default::default()
        };
        let catalog = BackupCatalog::new(
            ConfigHandle::new(ClusterConfig {
                pool: Some("tank".into()),
                ..Default::default()
            }),
            settings,
            SnapshotStore::new(zfs.clone()),
            zfs.clone(),
            Arc::new(FakeReleases::new(releases)),
            ReleaseExporter::new(workloads),
        );
        Fixture { zfs, catalog, mnt }
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let f = fixture(&["plex", "nextcloud"]);
        let job = Job::new("backup", true);
        let name = f.catalog.create(Some("nightly".into()), &job).await.unwrap();
        assert_eq!(name, "nightly");
        assert_eq!(job.progress().percent, 100.0);

        let snapshot = "tank/ix-applications@ix-applications-backup-nightly";
        assert_eq!(
            f.zfs.snapshot_excludes(snapshot).unwrap(),
            BTreeSet::from([
                "tank/ix-applications/catalogs".to_string(),
                "tank/ix-applications/k3s/kubelet".to_string()
            ])
        );

        let backups = f.catalog.list().await.unwrap();
        let backup = &backups["nightly"];
        assert_eq!(backup.snapshot_name, snapshot);
        assert_eq!(backup.releases, vec!["nextcloud", "plex"]);
        assert!(f
            .mnt
            .path()
            .join("tank/ix-applications/backups/nightly/plex/namespace.yaml")
            .is_file());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let f = fixture(&["plex"]);
        let job = Job::new("backup", true);
        f.catalog.create(Some("a".into()), &job).await.unwrap();

        let err = f.catalog.create(Some("a".into()), &job).await.unwrap_err();
        assert_matches!(err, Error::Duplicate { .. });
        assert_eq!(f.zfs.snapshot_names().len(), 1);
    }

    #[tokio::test]
    async fn test_generated_name_is_timestamp() {
        let f = fixture(&[]);
        let name = f.catalog.create(None, &Job::new("backup", true)).await.unwrap();
        assert!(DateTime::parse_from_rfc3339(&format!("{}Z", name.replacen('_', "T", 1))).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_name_leaves_nothing() {
        let f = fixture(&["plex"]);
        let err = f
            .catalog
            .create(Some("bad name".into()), &Job::new("backup", true))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Validation(_));
        assert!(!f.mnt.path().join("tank/ix-applications/backups/bad name").exists());
    }

    #[tokio::test]
    async fn test_dot_names_never_address_the_mountpoint() {
        let f = fixture(&["plex"]);
        let state = f.mnt.path().join("tank/ix-applications/k3s/server");
        std::fs::create_dir_all(&state).unwrap();
        std::fs::create_dir_all(f.mnt.path().join("tank/ix-applications/backups")).unwrap();

        assert_matches!(
            f.catalog.create(Some("..".into()), &Job::new("backup", true)).await,
            Err(Error::Validation(_))
        );

        // a stray snapshot that a name check never saw
        SnapshotApi::create(
            f.zfs.as_ref(),
            "tank/ix-applications",
            "ix-applications-backup-..",
            &BTreeSet::new(),
        )
        .await
        .unwrap();
        assert!(f.catalog.list().await.unwrap().is_empty());
        assert_matches!(f.catalog.delete("..").await, Err(Error::NotFound { .. }));
        assert!(state.is_dir());
    }

    #[tokio::test]
    async fn test_failed_export_is_cleaned_up() {
        let f = fixture(&["plex"]);
        let job = Job::new("backup", true);
        job.cancellation().cancel();

        let err = f.catalog.create(Some("x".into()), &job).await.unwrap_err();
        assert_matches!(err, Error::Cancelled { .. });
        assert!(!f.mnt.path().join("tank/ix-applications/backups/x").exists());
        assert!(f.zfs.snapshot_names().is_empty());

        // name is reusable
        f.catalog.create(Some("x".into()), &Job::new("backup", true)).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_hides_orphan_snapshots_and_dead_releases() {
        let f = fixture(&["plex"]);
        f.catalog
            .create(Some("keep".into()), &Job::new("backup", true))
            .await
            .unwrap();
        std::fs::create_dir_all(f.mnt.path().join("tank/ix-applications/backups/keep/gone")).unwrap();
        f.catalog
            .create(Some("orphan".into()), &Job::new("backup", true))
            .await
            .unwrap();
        std::fs::remove_dir_all(f.mnt.path().join("tank/ix-applications/backups/orphan")).unwrap();

        let backups = f.catalog.list().await.unwrap();
        assert_eq!(backups.keys().collect::<Vec<_>>(), vec!["keep"]);
        assert_eq!(backups["keep"].releases, vec!["plex"]);
    }

    #[tokio::test]
    async fn test_delete_survives_snapshot_failure() {
        let f = fixture(&["plex"]);
        f.catalog
            .create(Some("old".into()), &Job::new("backup", true))
            .await
            .unwrap();
        f.zfs.fail_snapshot_deletes(true);

        f.catalog.delete("old").await.unwrap();
        assert!(f.catalog.list().await.unwrap().is_empty());
        assert_matches!(f.catalog.delete("old").await, Err(Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unconfigured_or_passthrough_lists_nothing() {
        let f = fixture(&["plex"]);
        f.catalog.config.replace(ClusterConfig::default());
        assert!(f.catalog.list().await.unwrap().is_empty());

        f.catalog.config.replace(ClusterConfig {
            pool: Some("tank".into()),
            passthrough_mode: true,
            ..Default::default()
        });
        assert!(f.catalog.list().await.unwrap().is_empty());
        assert_matches!(
            f.catalog.create(None, &Job::new("backup", true)).await,
            Err(Error::Validation(_))
        );
    }
}
