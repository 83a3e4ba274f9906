//! Storage Module
//!
//! Snapshot store and the dataset layout of the applications cluster.

pub mod layout;
pub mod snapshot;

pub use layout::*;
pub use snapshot::*;
