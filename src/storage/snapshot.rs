//! Snapshot Store
//!
//! Point-in-time capture and restore of the cluster's dataset tree. All
//! mutation of the tree goes through here; callers serialize access with the
//! backup and restore job locks.

use crate::best_effort::BestEffort;
use crate::domain::ports::{RollbackOptions, SnapshotApiRef, SnapshotInfo};
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Recursive snapshot create / rollback / delete over the storage layer
#[derive(Clone)]
pub struct SnapshotStore {
    api: SnapshotApiRef,
}

impl SnapshotStore {
    pub fn new(api: SnapshotApiRef) -> Self {
        Self { api }
    }

    /// Snapshots whose full name starts with `prefix`
    pub async fn query(&self, prefix: &str) -> Result<Vec<SnapshotInfo>> {
        self.api.query(prefix).await
    }

    /// Look up one snapshot by full name
    pub async fn get(&self, snapshot: &str) -> Result<Option<SnapshotInfo>> {
        Ok(self
            .api
            .query(snapshot)
            .await?
            .into_iter()
            .find(|s| s.name == snapshot))
    }

    pub async fn exists(&self, snapshot: &str) -> Result<bool> {
        Ok(self.get(snapshot).await?.is_some())
    }

    /// Take a recursive snapshot of `dataset` named `name`.
    ///
    /// Children in `exclude` are left out; they are recreated rather than
    /// rolled back. Returns the full snapshot name.
    pub async fn snapshot(
        &self,
        dataset: &str,
        name: &str,
        exclude: &BTreeSet<String>,
    ) -> Result<String> {
        let full_name = format!("{dataset}@{name}");
        if self.exists(&full_name).await? {
            return Err(Error::duplicate("Snapshot", full_name));
        }

        info!(
            "Taking recursive snapshot {} (excluding {} dataset(s))",
            full_name,
            exclude.len()
        );
        self.api.create(dataset, name, exclude).await?;
        Ok(full_name)
    }

    /// Force, recursive rollback to `snapshot`.
    ///
    /// Destroys every snapshot and clone newer than the target. This cannot
    /// be undone and cannot be interrupted once started.
    pub async fn rollback(&self, snapshot: &str) -> Result<()> {
        if !self.exists(snapshot).await? {
            return Err(Error::not_found("Snapshot", snapshot));
        }

        warn!("Rolling back to {} (newer snapshots will be destroyed)", snapshot);
        self.api
            .rollback(snapshot, RollbackOptions::destructive())
            .await
    }

    /// Recursive delete; failures are reported, never raised
    pub async fn delete(&self, snapshot: &str) -> BestEffort<()> {
        BestEffort::run(
            format!("Deleting snapshot {snapshot}"),
            self.api.delete(snapshot, true),
        )
        .await
    }
}
