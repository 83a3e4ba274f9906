//! Control Plane Module
//!
//! The orchestrator facade that runs backups, restores and cluster
//! operations as jobs, and the API that exposes it.

pub mod orchestrator;
pub mod api;

pub use orchestrator::*;
pub use api::*;
