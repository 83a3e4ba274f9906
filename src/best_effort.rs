//! Best-effort outcomes
//!
//! Cleanup steps (snapshot deletes, directory removal, stale runtime state)
//! must not fail the operation that triggered them. They return a
//! [`BestEffort`] instead of a `Result`, and callers hand it to
//! [`BestEffort::log`] so every swallowed failure is reported the same way.

use crate::error::{Error, Result};
use std::future::Future;
use tracing::{debug, warn};

/// Outcome of a step whose failure does not abort the caller
#[derive(Debug)]
pub enum BestEffort<T> {
    Succeeded(T),
    Failed { context: String, error: Error },
}

impl<T> BestEffort<T> {
    pub fn from_result(context: impl Into<String>, result: Result<T>) -> Self {
        match result {
            Ok(value) => BestEffort::Succeeded(value),
            Err(error) => BestEffort::Failed {
                context: context.into(),
                error,
            },
        }
    }

    /// Await `fut` and capture its outcome
    pub async fn run<F>(context: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = Result<T>>,
    {
        Self::from_result(context, fut.await)
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, BestEffort::Succeeded(_))
    }

    /// Log a failure and keep going
    pub fn log(self) -> Option<T> {
        match self {
            BestEffort::Succeeded(value) => Some(value),
            BestEffort::Failed { context, error } => {
                warn!(error = %error, "{} failed, continuing", context);
                None
            }
        }
    }

    /// Failure description, if any, for aggregation into a report
    pub fn failure(&self) -> Option<String> {
        match self {
            BestEffort::Succeeded(_) => None,
            BestEffort::Failed { context, error } => Some(format!("{context}: {error}")),
        }
    }
}

/// Remove a directory tree, ignoring a tree that is already gone
pub async fn remove_dir_all(path: &std::path::Path) -> BestEffort<()> {
    let context = format!("Removing {}", path.display());
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => BestEffort::Succeeded(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} skipped, nothing to remove", context);
            BestEffort::Succeeded(())
        }
        Err(e) => BestEffort::Failed {
            context,
            error: e.into(),
        },
    }
}
