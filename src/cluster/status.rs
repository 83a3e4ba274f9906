//! Cluster status state machine

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

/// Status of the applications cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClusterStatus {
    Pending,
    Running,
    Initializing,
    Stopping,
    Stopped,
    Unconfigured,
    Failed,
}

impl ClusterStatus {
    pub const ALL: [ClusterStatus; 7] = [
        ClusterStatus::Pending,
        ClusterStatus::Running,
        ClusterStatus::Initializing,
        ClusterStatus::Stopping,
        ClusterStatus::Stopped,
        ClusterStatus::Unconfigured,
        ClusterStatus::Failed,
    ];

    pub fn description(&self) -> &'static str {
        match self {
            ClusterStatus::Pending => "Application(s) state is to be determined yet",
            ClusterStatus::Running => "Application(s) are currently running",
            ClusterStatus::Initializing => "Application(s) are being initialized",
            ClusterStatus::Stopping => "Application(s) are being stopped",
            ClusterStatus::Stopped => "Application(s) have been stopped",
            ClusterStatus::Unconfigured => "Application(s) are not configured",
            ClusterStatus::Failed => "Application(s) have failed to start",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Pending => "PENDING",
            ClusterStatus::Running => "RUNNING",
            ClusterStatus::Initializing => "INITIALIZING",
            ClusterStatus::Stopping => "STOPPING",
            ClusterStatus::Stopped => "STOPPED",
            ClusterStatus::Unconfigured => "UNCONFIGURED",
            ClusterStatus::Failed => "FAILED",
        }
    }

    pub fn can_transition_to(&self, next: ClusterStatus) -> bool {
        use ClusterStatus::*;
        match (self, next) {
            (Pending, _) => true,
            (_, Failed) | (_, Unconfigured) => true,
            (Initializing, Running) | (Initializing, Stopping) => true,
            (Running, Stopping) | (Running, Initializing) => true,
            (Stopping, Stopped) => true,
            (Stopped, Initializing) | (Failed, Initializing) | (Unconfigured, Initializing) => true,
            (Failed, Stopping) | (Failed, Stopped) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status plus its human-readable description
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub status: ClusterStatus,
    pub description: String,
}

impl StatusSnapshot {
    fn new(status: ClusterStatus, extra: Option<&str>) -> Self {
        let description = match extra {
            Some(extra) => format!("{}:\n{}", status.description(), extra),
            None => status.description().to_string(),
        };
        Self {
            status,
            description,
        }
    }
}

/// Broadcast on every status change
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub previous: ClusterStatus,
    pub current: StatusSnapshot,
}

/// Current status and its change feed
pub struct StatusCell {
    state: RwLock<StatusSnapshot>,
    tx: broadcast::Sender<StatusEvent>,
}

impl Default for StatusCell {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self {
            state: RwLock::new(StatusSnapshot::new(ClusterStatus::Pending, None)),
            tx,
        }
    }
}

impl StatusCell {
    pub fn get(&self) -> StatusSnapshot {
        self.state.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Move to `status`, rejecting transitions the state machine forbids
    pub fn set(&self, status: ClusterStatus, extra: Option<&str>) -> Result<()> {
        let previous = {
            let mut state = self.state.write();
            let previous = state.status;
            if !previous.can_transition_to(status) {
                return Err(Error::InvalidTransition {
                    from: previous.to_string(),
                    to: status.to_string(),
                });
            }
            *state = StatusSnapshot::new(status, extra);
            previous
        };

        if previous != status {
            info!("Applications status: {} -> {}", previous, status);
        }
        // No subscribers is fine
        let _ = self.tx.send(StatusEvent {
            previous,
            current: self.get(),
        });
        Ok(())
    }
}
