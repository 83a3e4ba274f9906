//! Job - a long-running operation with progress and cancellation

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

pub type JobId = Uuid;

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    /// Waiting for its lock
    Waiting,
    Running,
    Success,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Aborted)
    }
}

/// Progress report (percent never decreases)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgress {
    pub percent: f64,
    pub description: String,
}

#[derive(Debug)]
struct JobInner {
    state: JobState,
    progress: JobProgress,
    result: Option<serde_json::Value>,
    error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

/// A running operation as seen by the operation itself
#[derive(Debug)]
pub struct Job {
    id: JobId,
    method: String,
    abortable: bool,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    inner: RwLock<JobInner>,
}

/// Serializable view of a job
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub method: String,
    pub state: JobState,
    pub progress: JobProgress,
    pub abortable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(method: impl Into<String>, abortable: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            method: method.into(),
            abortable,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            inner: RwLock::new(JobInner {
                state: JobState::Waiting,
                progress: JobProgress {
                    percent: 0.0,
                    description: String::new(),
                },
                result: None,
                error: None,
                finished_at: None,
            }),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_abortable(&self) -> bool {
        self.abortable
    }

    pub fn state(&self) -> JobState {
        self.inner.read().state
    }

    pub fn progress(&self) -> JobProgress {
        self.inner.read().progress.clone()
    }

    /// Report progress; a lower percentage than already reported is ignored
    pub fn set_progress(&self, percent: f64, description: impl Into<String>) {
        let description = description.into();
        let mut inner = self.inner.write();
        let percent = percent.clamp(0.0, 100.0).max(inner.progress.percent);
        debug!(job = %self.id, percent, "{}", description);
        inner.progress = JobProgress {
            percent,
            description,
        };
    }

    /// Fail with [`Error::Cancelled`] once an abort was requested
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled {
                job: self.id.to_string(),
            });
        }
        Ok(())
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().finished_at
    }

    pub(crate) fn mark_running(&self) {
        self.inner.write().state = JobState::Running;
    }

    pub(crate) fn finish(&self, outcome: std::result::Result<serde_json::Value, &Error>) {
        let mut inner = self.inner.write();
        match outcome {
            Ok(value) => {
                inner.state = JobState::Success;
                inner.result = Some(value);
            }
            Err(Error::Cancelled { .. }) => {
                inner.state = JobState::Aborted;
                inner.error = Some("aborted".to_string());
            }
            Err(e) => {
                inner.state = JobState::Failed;
                inner.error = Some(e.to_string());
            }
        }
        inner.finished_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let inner = self.inner.read();
        JobSnapshot {
            id: self.id,
            method: self.method.clone(),
            state: inner.state,
            progress: inner.progress.clone(),
            abortable: self.abortable,
            result: inner.result.clone(),
            error: inner.error.clone(),
            started_at: self.started_at,
            finished_at: inner.finished_at,
        }
    }
}
