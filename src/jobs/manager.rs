//! Job Manager
//!
//! Spawns operations as jobs, serializes them on named locks and keeps their
//! state for later queries. A job that finds its lock held waits in
//! [`JobState::Waiting`](super::JobState::Waiting) until the holder is done.
//! Only the most recently finished jobs are kept; older ones are evicted when
//! a new job is submitted.

use super::job::{Job, JobId, JobSnapshot};
use crate::error::{Error, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How a job is scheduled
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Jobs sharing a lock name never run concurrently
    pub lock: Option<String>,
    /// Whether [`JobManager::abort`] may cancel it
    pub abortable: bool,
}

impl JobOptions {
    pub fn locked(lock: impl Into<String>) -> Self {
        Self {
            lock: Some(lock.into()),
            abortable: false,
        }
    }

    pub fn abortable(mut self) -> Self {
        self.abortable = true;
        self
    }
}

/// Handle to a spawned job
pub struct JobHandle<T> {
    job: Arc<Job>,
    task: JoinHandle<Result<T>>,
}

impl<T> JobHandle<T> {
    pub fn id(&self) -> JobId {
        self.job.id()
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    /// Wait for the job and return its outcome
    pub async fn wait(self) -> Result<T> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("job task failed: {e}")))?
    }
}

/// Finished jobs kept for queries unless configured otherwise
pub const DEFAULT_FINISHED_JOBS_TO_KEEP: usize = 100;

/// Registry of jobs and their locks
pub struct JobManager {
    jobs: DashMap<JobId, Arc<Job>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    finished_to_keep: usize,
}

impl Default for JobManager {
    fn default() -> Self {
        Self {
            jobs: DashMap::new(),
            locks: DashMap::new(),
            finished_to_keep: DEFAULT_FINISHED_JOBS_TO_KEEP,
        }
    }
}

impl JobManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Manager keeping at most `finished_to_keep` finished jobs
    pub fn with_retention(finished_to_keep: usize) -> Arc<Self> {
        Arc::new(Self {
            finished_to_keep,
            ..Self::default()
        })
    }

    /// Drop the oldest finished jobs beyond the retention limit
    fn evict_finished(&self) {
        let mut finished: Vec<_> = self
            .jobs
            .iter()
            .filter_map(|entry| entry.value().finished_at().map(|at| (at, *entry.key())))
            .collect();
        if finished.len() <= self.finished_to_keep {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.finished_to_keep;
        for (_, id) in finished.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
        debug!(evicted = excess, "Evicted finished jobs");
    }

    fn lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Spawn `f` as a job.
    ///
    /// The returned handle yields the operation's own result; the job record
    /// keeps a JSON copy of it for status queries.
    pub fn submit<T, F, Fut>(&self, method: &str, options: JobOptions, f: F) -> JobHandle<T>
    where
        T: Serialize + Send + 'static,
        F: FnOnce(Arc<Job>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.evict_finished();
        let job = Arc::new(Job::new(method, options.abortable));
        self.jobs.insert(job.id(), job.clone());
        let lock = options.lock.as_deref().map(|name| (name.to_string(), self.lock(name)));

        let task_job = job.clone();
        let task = tokio::spawn(async move {
            let job = task_job;
            let _guard = match lock {
                Some((name, lock)) => {
                    let cancelled = job.cancellation().clone();
                    tokio::select! {
                        guard = lock.lock_owned() => Some(guard),
                        _ = cancelled.cancelled() => {
                            warn!(job = %job.id(), lock = %name, "Job aborted while waiting for its lock");
                            let err = Error::Cancelled { job: job.id().to_string() };
                            job.finish(Err(&err));
                            return Err(err);
                        }
                    }
                }
                None => None,
            };

            job.mark_running();
            info!(job = %job.id(), method = %job.method(), "Job started");

            let result = f(job.clone()).await;
            match &result {
                Ok(value) => {
                    let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
                    job.finish(Ok(value));
                    info!(job = %job.id(), method = %job.method(), "Job finished");
                }
                Err(e) => {
                    job.finish(Err(e));
                    error!(job = %job.id(), method = %job.method(), error = %e, "Job failed");
                }
            }
            result
        });

        JobHandle { job, task }
    }

    pub fn get(&self, id: JobId) -> Option<JobSnapshot> {
        self.jobs.get(&id).map(|job| job.snapshot())
    }

    pub fn list(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<_> = self.jobs.iter().map(|job| job.snapshot()).collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    /// Request cancellation of an abortable job
    pub fn abort(&self, id: JobId) -> Result<()> {
        let job = self
            .jobs
            .get(&id)
            .map(|job| job.clone())
            .ok_or_else(|| Error::not_found("Job", id.to_string()))?;

        if !job.is_abortable() {
            return Err(Error::Validation(format!(
                "Job {} ({}) cannot be aborted",
                id,
                job.method()
            )));
        }
        if job.state().is_finished() {
            return Ok(());
        }

        info!(job = %id, "Abort requested");
        job.cancellation().cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobState;
    use std::time::Duration;

    #[tokio::test]
    async fn test_job_result_is_recorded() {
        let manager = JobManager::new();
        let handle = manager.submit("kubernetes.backup", JobOptions::default(), |job| async move {
            job.set_progress(100.0, "done");
            Ok("nightly".to_string())
        });
        let id = handle.id();

        assert_eq!(handle.wait().await.unwrap(), "nightly");
        let snapshot = manager.get(id).unwrap();
        assert_eq!(snapshot.state, JobState::Success);
        assert_eq!(snapshot.result, Some(serde_json::json!("nightly")));
    }

    #[tokio::test]
    async fn test_same_lock_serializes_jobs() {
        let manager = JobManager::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let first = manager.submit("backup", JobOptions::locked("backup"), move |_| async move {
            let _ = rx.await;
            Ok(1)
        });
        let second = manager.submit("backup", JobOptions::locked("backup"), |_| async move { Ok(2) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(second.job().state(), JobState::Waiting);
        assert_eq!(first.job().state(), JobState::Running);

        tx.send(()).unwrap();
        assert_eq!(first.wait().await.unwrap(), 1);
        assert_eq!(second.wait().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_abort_rules() {
        let manager = JobManager::new();
        let restore = manager.submit("restore", JobOptions::locked("restore"), |_| async move { Ok(()) });
        let err = manager.abort(restore.id()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        restore.wait().await.unwrap();

        let missing = manager.abort(uuid::Uuid::new_v4()).unwrap_err();
        assert!(matches!(missing, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_old_finished_jobs_are_evicted() {
        let manager = JobManager::with_retention(2);
        let mut ids = Vec::new();
        for i in 0..4 {
            let handle = manager.submit("backup", JobOptions::default(), move |_| async move { Ok(i) });
            ids.push(handle.id());
            handle.wait().await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let running = manager.submit("restore", JobOptions::default(), move |_| async move {
            let _ = rx.await;
            Ok(())
        });

        assert!(manager.get(ids[0]).is_none());
        assert!(manager.get(ids[1]).is_none());
        assert!(manager.get(ids[2]).is_some());
        assert!(manager.get(ids[3]).is_some());
        assert_eq!(manager.list().len(), 3);

        // unfinished jobs are never evicted
        let next = manager.submit("backup", JobOptions::default(), |_| async move { Ok(5) });
        assert!(manager.get(running.id()).is_some());
        next.wait().await.unwrap();
        tx.send(()).unwrap();
        running.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_cancels_running_job() {
        let manager = JobManager::new();
        let handle = manager.submit(
            "backup",
            JobOptions::locked("backup").abortable(),
            |job| async move {
                job.cancellation().cancelled().await;
                job.check_cancelled()?;
                Ok(())
            },
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.abort(handle.id()).unwrap();
        let job = handle.job().clone();
        assert!(matches!(handle.wait().await, Err(Error::Cancelled { .. })));
        assert_eq!(job.state(), JobState::Aborted);
    }
}
