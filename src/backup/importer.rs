//! Release Importer - recreates a release's namespace and secrets

use super::record::ReleaseBackupRecord;
use crate::domain::ports::{Manifest, WorkloadApiRef};
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, error, warn};

/// Server-populated metadata that must not be sent back on create
pub const VOLATILE_METADATA: [&str; 4] = ["resourceVersion", "uid", "creationTimestamp", "managedFields"];

/// Why a release in a backup was not imported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The release's dataset is not present after rollback
    MissingDataset,
    /// The backup directory lacks the namespace or secrets
    MissingArtifacts,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingDataset => write!(f, "release dataset is missing"),
            SkipReason::MissingArtifacts => write!(f, "namespace or secrets missing from backup"),
        }
    }
}

#[derive(Debug)]
pub enum ImportOutcome {
    Imported(ReleaseBackupRecord),
    Skipped(SkipReason),
}

/// Copy of `manifest` without volatile metadata fields
pub fn strip_volatile_metadata(mut manifest: Manifest) -> Manifest {
    if let Some(metadata) = manifest
        .get_mut("metadata")
        .and_then(|m| m.as_mapping_mut())
    {
        for field in VOLATILE_METADATA {
            metadata.remove(field);
        }
    }
    manifest
}

pub struct ReleaseImporter {
    workloads: WorkloadApiRef,
}

impl ReleaseImporter {
    pub fn new(workloads: WorkloadApiRef) -> Self {
        Self { workloads }
    }

    /// Recreate the namespace and secrets of `release` from `dir`.
    ///
    /// `live_datasets` holds the release datasets present after rollback; a
    /// release without one is skipped.
    pub async fn import(
        &self,
        release: &str,
        dir: &Path,
        live_datasets: &BTreeSet<String>,
    ) -> Result<ImportOutcome> {
        if !live_datasets.contains(release) {
            error!(release = %release, "Release dataset not found, skipping");
            return Ok(ImportOutcome::Skipped(SkipReason::MissingDataset));
        }
        if !ReleaseBackupRecord::is_complete(dir).await {
            warn!(release = %release, "Backup of release is incomplete, skipping");
            return Ok(ImportOutcome::Skipped(SkipReason::MissingArtifacts));
        }

        let record = ReleaseBackupRecord::read_from(release, dir).await?;
        let namespace = record.namespace["metadata"]["name"]
            .as_str()
            .ok_or_else(|| Error::Validation(format!("namespace manifest of {release} has no name")))?
            .to_string();

        self.workloads
            .create_namespace(strip_volatile_metadata(record.namespace.clone()))
            .await?;
        for (name, secret) in &record.secrets {
            debug!(release = %release, secret = %name, "Creating secret");
            self.workloads
                .create_secret(&namespace, strip_volatile_metadata(secret.clone()))
                .await?;
        }
        Ok(ImportOutcome::Imported(record))
    }
}
