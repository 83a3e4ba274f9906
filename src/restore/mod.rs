//! Restore Module
//!
//! Rollback of the applications dataset to a backup and reconstruction of
//! the releases on a fresh cluster.

pub mod orchestrator;
pub mod report;
pub mod volumes;

pub use orchestrator::{RestoreOrchestrator, RestorePorts};
pub use report::{ItemFailure, RestoreReport};
