//! Prometheus metrics
//!
//! Each [`Metrics`] owns its registry; the binary serves it on the metrics
//! listener.

use crate::cluster::ClusterStatus;
use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

pub struct Metrics {
    registry: Registry,
    /// Backups by result (`success`, `failure`)
    pub backups: IntCounterVec,
    /// Restores by result (`success`, `partial`, `failure`)
    pub restores: IntCounterVec,
    /// One gauge per status, 1 for the current one
    pub cluster_status: IntGaugeVec,
    /// Per-item restore failures by stage
    pub restore_item_failures: IntCounterVec,
}

fn registration(e: prometheus::Error) -> Error {
    Error::Internal(format!("metric registration failed: {e}"))
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let backups = IntCounterVec::new(
            Opts::new("apps_backups_total", "Backups created, by result"),
            &["result"],
        )
        .map_err(registration)?;
        let restores = IntCounterVec::new(
            Opts::new("apps_restores_total", "Backup restores, by result"),
            &["result"],
        )
        .map_err(registration)?;
        let cluster_status = IntGaugeVec::new(
            Opts::new("apps_cluster_status", "Current applications cluster status"),
            &["status"],
        )
        .map_err(registration)?;
        let restore_item_failures = IntCounterVec::new(
            Opts::new(
                "apps_restore_item_failures_total",
                "Release-level failures during restores, by stage",
            ),
            &["stage"],
        )
        .map_err(registration)?;

        registry.register(Box::new(backups.clone())).map_err(registration)?;
        registry.register(Box::new(restores.clone())).map_err(registration)?;
        registry
            .register(Box::new(cluster_status.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(restore_item_failures.clone()))
            .map_err(registration)?;

        Ok(Arc::new(Self {
            registry,
            backups,
            restores,
            cluster_status,
            restore_item_failures,
        }))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn observe_status(&self, status: ClusterStatus) {
        for candidate in ClusterStatus::ALL {
            self.cluster_status
                .with_label_values(&[candidate.as_str()])
                .set(i64::from(candidate == status));
        }
    }

    /// Text exposition of every metric
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metric encoding failed: {e}")))?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}
