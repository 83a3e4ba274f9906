//! Node taint edits
//!
//! The cluster is held quiet with two `NoExecute` taints: one while it
//! starts, one while it stops. These helpers compute the taint list to write
//! back to the node; they never talk to the cluster themselves.

use crate::domain::ports::Taint;
use crate::error::{Error, Result};

/// Taint held while the cluster starts
pub const START_TAINT_KEY: &str = "ix-svc-start";

/// Taint added before the cluster stops
pub const STOP_TAINT_KEY: &str = "ix-svc-stop";

pub const NO_EXECUTE: &str = "NoExecute";

pub fn start_taint() -> Taint {
    Taint::new(START_TAINT_KEY, NO_EXECUTE)
}

pub fn stop_taint() -> Taint {
    Taint::new(STOP_TAINT_KEY, NO_EXECUTE)
}

/// Taints with `taint` added, or `None` if an equal one is already present.
///
/// Equality is on key and effect; a value mismatch replaces the old entry.
pub fn with_added(existing: &[Taint], taint: &Taint) -> Option<Vec<Taint>> {
    if existing.contains(taint) {
        return None;
    }
    let mut taints: Vec<Taint> = existing
        .iter()
        .filter(|t| !(t.key == taint.key && t.effect == taint.effect))
        .cloned()
        .collect();
    taints.push(taint.clone());
    Some(taints)
}

/// Taints without `key`; fails if no taint has that key
pub fn without_key(existing: &[Taint], key: &str) -> Result<Vec<Taint>> {
    if !existing.iter().any(|t| t.key == key) {
        return Err(Error::not_found("Taint", key));
    }
    Ok(without_keys(existing, &[key]))
}

/// Taints without any of `keys`
pub fn without_keys(existing: &[Taint], keys: &[&str]) -> Vec<Taint> {
    existing
        .iter()
        .filter(|t| !keys.contains(&t.key.as_str()))
        .cloned()
        .collect()
}
