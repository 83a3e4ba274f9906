//! Jobs Module
//!
//! Long-running operations (backup, restore) run as jobs with progress,
//! named locks and optional cancellation.

pub mod job;
pub mod manager;

pub use job::{Job, JobId, JobProgress, JobSnapshot, JobState};
pub use manager::{JobHandle, JobManager, JobOptions};
