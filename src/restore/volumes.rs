//! Persistent volume re-creation
//!
//! Release PVs are backed by datasets under the release dataset. After a
//! rollback the datasets are back, but the PV and CSI volume objects are not.
//! A backup taken on one pool can be restored on another, so dataset paths
//! are rebased onto the current pool.

use crate::domain::ports::{PersistentVolumeRecord, WorkloadApi};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Replace the pool (first path component) of a dataset path
pub fn substitute_pool(path: &str, pool: &str) -> String {
    match path.split_once('/') {
        Some((_, rest)) => format!("{pool}/{rest}"),
        None => path.to_string(),
    }
}

/// Recreate the volumes of one release.
///
/// Volumes whose dataset is not in `datasets` are skipped. Returns
/// `(pv name, error)` for every failed create.
pub async fn restore_volumes(
    workloads: &dyn WorkloadApi,
    datasets: &BTreeSet<String>,
    pool: &str,
    records: &[PersistentVolumeRecord],
) -> Vec<(String, String)> {
    let mut failures = Vec::new();
    for record in records {
        let rebased = PersistentVolumeRecord {
            dataset: substitute_pool(&record.dataset, pool),
            pool_name: substitute_pool(&record.pool_name, pool),
            ..record.clone()
        };
        if !datasets.contains(&rebased.dataset) {
            warn!(pv = %record.pv_name, dataset = %rebased.dataset, "Volume dataset missing, not recreating");
            continue;
        }

        debug!(pv = %rebased.pv_name, "Recreating persistent volume");
        if let Err(e) = workloads.create_volume(&rebased).await {
            warn!(pv = %rebased.pv_name, error = %e, "Failed to recreate persistent volume");
            failures.push((rebased.pv_name.clone(), e.to_string()));
        }
    }
    failures
}
