//! On-disk form of one release's backup
//!
//! ```text
//! backups/<backup>/<release>/
//!     namespace.yaml
//!     secrets/<secret name>
//!     workloads_replica_counts.json
//!     volumes.json               (only when the release has bound PVs)
//! ```

use crate::domain::ports::{Manifest, PersistentVolumeRecord, ReplicaCounts};
use crate::error::Result;
use std::path::Path;

pub const NAMESPACE_FILE: &str = "namespace.yaml";
pub const SECRETS_DIR: &str = "secrets";
pub const REPLICA_COUNTS_FILE: &str = "workloads_replica_counts.json";
pub const VOLUMES_FILE: &str = "volumes.json";

/// Everything captured for one release
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseBackupRecord {
    pub release_name: String,
    pub namespace: Manifest,
    /// Secret name to manifest, sorted by name
    pub secrets: Vec<(String, Manifest)>,
    pub replica_counts: ReplicaCounts,
    pub volumes: Vec<PersistentVolumeRecord>,
}

impl ReleaseBackupRecord {
    /// Write the record under `dir`, creating it
    pub async fn write_to(&self, dir: &Path) -> Result<()> {
        let secrets_dir = dir.join(SECRETS_DIR);
        tokio::fs::create_dir_all(&secrets_dir).await?;

        tokio::fs::write(dir.join(NAMESPACE_FILE), serde_yaml::to_string(&self.namespace)?).await?;
        for (name, secret) in &self.secrets {
            tokio::fs::write(secrets_dir.join(name), serde_yaml::to_string(secret)?).await?;
        }
        tokio::fs::write(
            dir.join(REPLICA_COUNTS_FILE),
            serde_json::to_string(&self.replica_counts)?,
        )
        .await?;
        if !self.volumes.is_empty() {
            tokio::fs::write(dir.join(VOLUMES_FILE), serde_json::to_string(&self.volumes)?).await?;
        }
        Ok(())
    }

    /// Whether `dir` holds the files an import needs
    pub async fn is_complete(dir: &Path) -> bool {
        if !tokio::fs::try_exists(dir.join(NAMESPACE_FILE)).await.unwrap_or(false) {
            return false;
        }
        match tokio::fs::read_dir(dir.join(SECRETS_DIR)).await {
            Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
            Err(_) => false,
        }
    }

    /// Read a record previously written with [`write_to`](Self::write_to).
    ///
    /// Missing replica counts or volumes read as empty.
    pub async fn read_from(release_name: &str, dir: &Path) -> Result<Self> {
        let namespace = serde_yaml::from_str(&tokio::fs::read_to_string(dir.join(NAMESPACE_FILE)).await?)?;

        let mut secrets = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.join(SECRETS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let manifest = serde_yaml::from_str(&tokio::fs::read_to_string(entry.path()).await?)?;
            secrets.push((name, manifest));
        }
        secrets.sort_by(|a, b| a.0.cmp(&b.0));

        let replica_counts = match tokio::fs::read_to_string(dir.join(REPLICA_COUNTS_FILE)).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ReplicaCounts::new(),
            Err(e) => return Err(e.into()),
        };
        let volumes = match tokio::fs::read_to_string(dir.join(VOLUMES_FILE)).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            release_name: release_name.to_string(),
            namespace,
            secrets,
            replica_counts,
            volumes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{WorkloadKind, WorkloadRef};
    use crate::testing::{namespace_manifest, secret_manifest};

    fn record() -> ReleaseBackupRecord {
        ReleaseBackupRecord {
            release_name: "plex".into(),
            namespace: namespace_manifest("ix-plex"),
            secrets: vec![
                ("a-values".into(), secret_manifest("a-values", "Opaque", true)),
                ("sh.helm.release.v1.plex.v1".into(), secret_manifest("sh.helm.release.v1.plex.v1", "helm.sh/release.v1", true)),
            ],
            replica_counts: ReplicaCounts::from([(WorkloadRef::new(WorkloadKind::Deployment, "plex"), 2)]),
            volumes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_layout_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plex");
        record().write_to(&path).await.unwrap();

        assert!(path.join(NAMESPACE_FILE).is_file());
        assert!(path.join(SECRETS_DIR).join("a-values").is_file());
        assert!(!path.join(VOLUMES_FILE).exists());
        let counts = std::fs::read_to_string(path.join(REPLICA_COUNTS_FILE)).unwrap();
        assert_eq!(counts, r#"{"deployment/plex":2}"#);
        assert!(ReleaseBackupRecord::is_complete(&path).await);

        let read = ReleaseBackupRecord::read_from("plex", &path).await.unwrap();
        assert_eq!(read, record());
    }

    #[tokio::test]
    async fn test_incomplete_without_secrets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(NAMESPACE_FILE), "metadata: {name: ix-x}\n").unwrap();
        assert!(!ReleaseBackupRecord::is_complete(dir.path()).await);

        std::fs::create_dir(dir.path().join(SECRETS_DIR)).unwrap();
        assert!(!ReleaseBackupRecord::is_complete(dir.path()).await);
    }

    #[tokio::test]
    async fn test_older_backup_without_counts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(NAMESPACE_FILE), "metadata: {name: ix-x}\n").unwrap();
        std::fs::create_dir(dir.path().join(SECRETS_DIR)).unwrap();
        std::fs::write(dir.path().join(SECRETS_DIR).join("s"), "type: Opaque\n").unwrap();

        let read = ReleaseBackupRecord::read_from("x", dir.path()).await.unwrap();
        assert!(read.replica_counts.is_empty());
        assert!(read.volumes.is_empty());
        assert_eq!(read.secrets.len(), 1);
    }
}
