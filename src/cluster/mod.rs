//! Cluster Module
//!
//! Status state machine, node taints and the start/stop lifecycle of the
//! applications cluster.

pub mod lifecycle;
pub mod status;
pub mod taints;

pub use lifecycle::{ClusterLifecycle, CONFIGURATION_FAILED_ALERT, START_FAILED_ALERT};
pub use status::{ClusterStatus, StatusEvent, StatusSnapshot};
