//! API Module
//!
//! REST API over the orchestrator facade.

pub mod server;
pub mod rest;

pub use server::*;
pub use rest::*;
