//! Restore report

use crate::backup::SkipReason;
use crate::error::Error;
use serde::Serialize;
use std::collections::BTreeMap;

/// A per-item failure after the point of no return
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    /// Release, volume or manifest the failure belongs to
    pub item: String,
    pub stage: &'static str,
    pub error: String,
}

/// Outcome of a restore
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub backup: String,
    /// Releases whose namespace and secrets were recreated
    pub restored: Vec<String>,
    pub skipped: BTreeMap<String, SkipReason>,
    pub failures: Vec<ItemFailure>,
    pub catalogs_synced: bool,
}

impl RestoreReport {
    pub fn new(backup: impl Into<String>) -> Self {
        Self {
            backup: backup.into(),
            ..Default::default()
        }
    }

    pub fn fail(&mut self, item: impl Into<String>, stage: &'static str, error: impl ToString) {
        self.failures.push(ItemFailure {
            item: item.into(),
            stage,
            error: error.to_string(),
        });
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures folded into one error, if there were any
    pub fn partial_failure(&self) -> Option<Error> {
        if self.failures.is_empty() {
            return None;
        }
        Some(Error::PartialFailure {
            operation: format!("Restore of backup {:?}", self.backup),
            failures: self
                .failures
                .iter()
                .map(|f| format!("{} ({}): {}", f.item, f.stage, f.error))
                .collect(),
        })
    }
}
