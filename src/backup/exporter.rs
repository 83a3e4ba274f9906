//! Release Exporter - captures one release's cluster state

use super::record::ReleaseBackupRecord;
use crate::domain::ports::{Manifest, Release, ReplicaCounts, WorkloadApiRef};
use crate::error::Result;
use std::path::Path;
use tracing::debug;

/// Secret types that belong to a release
pub const RECOGNIZED_SECRET_TYPES: [&str; 2] = ["helm.sh/release.v1", "Opaque"];

/// Keep recognized secrets that carry data, keyed and sorted by name
pub fn recognized_secrets(secrets: Vec<Manifest>) -> Vec<(String, Manifest)> {
    let mut kept: Vec<(String, Manifest)> = secrets
        .into_iter()
        .filter(|s| {
            s["type"]
                .as_str()
                .is_some_and(|t| RECOGNIZED_SECRET_TYPES.contains(&t))
        })
        .filter(|s| s["data"].as_mapping().is_some_and(|d| !d.is_empty()))
        .filter_map(|s| {
            let name = s["metadata"]["name"].as_str()?.to_string();
            Some((name, s))
        })
        .collect();
    kept.sort_by(|a, b| a.0.cmp(&b.0));
    kept
}

pub struct ReleaseExporter {
    workloads: WorkloadApiRef,
}

impl ReleaseExporter {
    pub fn new(workloads: WorkloadApiRef) -> Self {
        Self { workloads }
    }

    /// Read the release's namespace, secrets, replica counts and volumes
    pub async fn collect(&self, release: &Release) -> Result<ReleaseBackupRecord> {
        let namespace = self.workloads.export_namespace(&release.namespace).await?;
        let secrets = recognized_secrets(self.workloads.list_secrets(&release.namespace).await?);
        let replica_counts: ReplicaCounts = self
            .workloads
            .list_scalable(&release.namespace)
            .await?
            .into_iter()
            .map(|w| (w.reference(), w.replicas))
            .collect();
        let volumes = self.workloads.list_volumes(&release.namespace).await?;

        debug!(
            release = %release.name,
            secrets = secrets.len(),
            workloads = replica_counts.len(),
            volumes = volumes.len(),
            "Collected release state"
        );
        Ok(ReleaseBackupRecord {
            release_name: release.name.clone(),
            namespace,
            secrets,
            replica_counts,
            volumes,
        })
    }

    /// Collect the release and write it under `dir`
    pub async fn export(&self, release: &Release, dir: &Path) -> Result<ReleaseBackupRecord> {
        let record = self.collect(release).await?;
        record.write_to(dir).await?;
        Ok(record)
    }
}
