//! Retention of backups taken after system updates

use super::catalog::{Backup, BackupCatalog};
use crate::error::Result;
use crate::storage::layout::UPDATE_BACKUP_PREFIX;
use chrono::{DateTime, Utc};
use tracing::{error, info};

/// Name of the backup taken after an update at `now`
pub fn update_backup_name(now: DateTime<Utc>) -> String {
    format!("{UPDATE_BACKUP_PREFIX}{}", now.format("%F_%T"))
}

/// Delete the oldest update backups so that one more leaves `keep` in place.
///
/// Stops at the first failed delete. Returns the deleted names.
pub async fn prune_update_backups(catalog: &BackupCatalog, keep: usize) -> Result<Vec<String>> {
    let mut backups: Vec<Backup> = catalog
        .list()
        .await?
        .into_values()
        .filter(|b| b.name.starts_with(UPDATE_BACKUP_PREFIX))
        .collect();
    backups.sort_by_key(|b| b.created_on);

    let mut deleted = Vec::new();
    let mut backups = backups.into_iter();
    let mut remaining = backups.len();
    while remaining >= keep {
        let Some(oldest) = backups.next() else { break };
        match catalog.delete(&oldest.name).await {
            Ok(()) => {
                info!(backup = %oldest.name, "Removed old update backup");
                deleted.push(oldest.name);
                remaining -= 1;
            }
            Err(e) => {
                error!(backup = %oldest.name, error = %e, "Failed to remove old update backup");
                break;
            }
        }
    }
    Ok(deleted)
}
