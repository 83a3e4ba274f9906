//! Dataset and snapshot naming conventions
//!
//! Everything the applications cluster persists lives under one dataset
//! (`<pool>/ix-applications`). This module knows its children, their
//! creation properties, which of them are recreated instead of snapshotted,
//! and how backup snapshots are named.

use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Prefix of every backup snapshot name
pub const BACKUP_NAME_PREFIX: &str = "ix-applications-backup-";

/// Prefix of backups taken automatically after a system update
pub const UPDATE_BACKUP_PREFIX: &str = "system-update-";

/// Longest accepted backup name
pub const MAX_BACKUP_NAME_LEN: usize = 200;

/// A dataset the cluster needs, with the properties it is created with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpec {
    /// Full dataset name
    pub name: String,
    pub properties: BTreeMap<String, String>,
    /// Whether the dataset is mounted after creation
    pub mount: bool,
}

fn default_properties() -> BTreeMap<String, String> {
    [
        ("aclmode", "discard"),
        ("acltype", "posix"),
        ("exec", "on"),
        ("setuid", "on"),
        ("casesensitivity", "sensitive"),
        ("atime", "off"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Every dataset of the cluster, parents first
pub fn cluster_datasets(dataset: &str) -> Vec<DatasetSpec> {
    ["", "k3s", "k3s/kubelet", "releases", "default_volumes", "catalogs"]
        .into_iter()
        .map(|child| {
            let mut properties = default_properties();
            let mut mount = true;
            match child {
                "" => {
                    properties.insert("encryption".into(), "off".into());
                }
                "k3s/kubelet" => {
                    properties.insert("mountpoint".into(), "legacy".into());
                    mount = false;
                }
                _ => {}
            }
            let name = if child.is_empty() {
                dataset.to_string()
            } else {
                format!("{dataset}/{child}")
            };
            DatasetSpec {
                name,
                properties,
                mount,
            }
        })
        .collect()
}

/// Datasets without which the cluster cannot start
pub fn required_datasets(dataset: &str) -> Vec<String> {
    vec![
        dataset.to_string(),
        format!("{dataset}/k3s"),
        format!("{dataset}/releases"),
    ]
}

/// Children excluded from backup snapshots and recreated fresh on restore
pub fn excluded_datasets(dataset: &str) -> Vec<DatasetSpec> {
    vec![
        DatasetSpec {
            name: format!("{dataset}/catalogs"),
            properties: BTreeMap::new(),
            mount: true,
        },
        DatasetSpec {
            name: format!("{dataset}/k3s/kubelet"),
            properties: BTreeMap::from([("mountpoint".to_string(), "legacy".to_string())]),
            mount: false,
        },
    ]
}

/// Dataset holding one dataset per release
pub fn releases_dataset(dataset: &str) -> String {
    format!("{dataset}/releases")
}

/// Snapshot component of a backup (`ix-applications-backup-<name>`)
pub fn backup_snapshot(name: &str) -> String {
    format!("{BACKUP_NAME_PREFIX}{name}")
}

/// Full snapshot name of a backup (`<dataset>@ix-applications-backup-<name>`)
pub fn backup_snapshot_name(dataset: &str, name: &str) -> String {
    format!("{dataset}@{}", backup_snapshot(name))
}

/// Backup name from a full snapshot name, if it follows the convention
pub fn backup_name_from_snapshot(snapshot: &str) -> Option<&str> {
    snapshot
        .split_once('@')
        .and_then(|(_, snap)| snap.strip_prefix(BACKUP_NAME_PREFIX))
        .filter(|name| !name.is_empty())
}

/// Check that `name` can be used as a snapshot name component
pub fn validate_backup_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("Backup name must not be empty".into()));
    }
    if name.len() > MAX_BACKUP_NAME_LEN {
        return Err(Error::Validation(format!(
            "Backup name must be at most {MAX_BACKUP_NAME_LEN} characters"
        )));
    }
    if name.chars().all(|c| c == '.') {
        return Err(Error::Validation(format!("{name:?} is not a valid backup name")));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
    {
        return Err(Error::Validation(format!(
            "{name:?} is not a valid snapshot name: {bad:?} is not allowed"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_names() {
        assert_eq!(
            backup_snapshot_name("tank/ix-applications", "2024-01-01"),
            "tank/ix-applications@ix-applications-backup-2024-01-01"
        );
        assert_eq!(
            backup_name_from_snapshot("tank/ix-applications@ix-applications-backup-2024-01-01"),
            Some("2024-01-01")
        );
        assert_eq!(backup_name_from_snapshot("tank/ix-applications@manual"), None);
        assert_eq!(backup_name_from_snapshot("tank/ix-applications@ix-applications-backup-"), None);
    }

    #[test]
    fn test_validate_backup_name() {
        assert!(validate_backup_name("2024-01-01_12:00:00").is_ok());
        assert!(validate_backup_name("system-update-2024.1").is_ok());
        assert!(validate_backup_name("").is_err());
        assert!(validate_backup_name("a b").is_err());
        assert!(validate_backup_name("a@b").is_err());
        assert!(validate_backup_name("a/b").is_err());
        assert!(validate_backup_name(".").is_err());
        assert!(validate_backup_name("..").is_err());
        assert!(validate_backup_name("...").is_err());
        assert!(validate_backup_name("v1..2").is_ok());
        assert!(validate_backup_name(&"x".repeat(MAX_BACKUP_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_cluster_datasets() {
        let specs = cluster_datasets("tank/ix-applications");
        assert_eq!(specs[0].name, "tank/ix-applications");
        assert_eq!(specs[0].properties.get("encryption").map(String::as_str), Some("off"));

        let kubelet = specs
            .iter()
            .find(|s| s.name == "tank/ix-applications/k3s/kubelet")
            .unwrap();
        assert!(!kubelet.mount);
        assert_eq!(kubelet.properties.get("mountpoint").map(String::as_str), Some("legacy"));
    }

    #[test]
    fn test_excluded_datasets() {
        let excluded = excluded_datasets("tank/ix-applications");
        let names: Vec<_> = excluded.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["tank/ix-applications/catalogs", "tank/ix-applications/k3s/kubelet"]
        );
    }
}
