//! Cluster Lifecycle
//!
//! Owns the cluster status and drives start, stop and reconfiguration of the
//! single-node cluster. Only one start sequence runs at a time; callers that
//! arrive while it is in flight share its outcome.

use super::status::{ClusterStatus, StatusCell, StatusEvent, StatusSnapshot};
use super::taints::{self, START_TAINT_KEY, STOP_TAINT_KEY};
use crate::best_effort::BestEffort;
use crate::config::{ClusterConfig, ConfigHandle, Settings};
use crate::domain::ports::{ClusterRuntimeRef, DatasetApiRef, HostServicesRef, Taint};
use crate::error::{Error, Result};
use crate::retry::{retry_until, Probe};
use crate::storage::layout::{cluster_datasets, required_datasets};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Raised when the cluster fails to start
pub const START_FAILED_ALERT: &str = "ApplicationsStartFailed";

/// Raised when applying a new cluster configuration fails
pub const CONFIGURATION_FAILED_ALERT: &str = "ApplicationsConfigurationFailed";

/// File under the dataset mountpoint holding the last applied config
pub const PERSISTED_CONFIG_FILE: &str = "config.json";

type StartRun = Shared<BoxFuture<'static, std::result::Result<(), Arc<Error>>>>;

/// Start/stop state machine of the applications cluster
pub struct ClusterLifecycle {
    config: ConfigHandle,
    settings: Settings,
    runtime: ClusterRuntimeRef,
    host: HostServicesRef,
    datasets: DatasetApiRef,
    status: StatusCell,
    inflight: Mutex<Option<StartRun>>,
}

impl ClusterLifecycle {
    pub fn new(
        config: ConfigHandle,
        settings: Settings,
        runtime: ClusterRuntimeRef,
        host: HostServicesRef,
        datasets: DatasetApiRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            settings,
            runtime,
            host,
            datasets,
            status: StatusCell::default(),
            inflight: Mutex::new(None),
        })
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn status(&self) -> StatusSnapshot {
        self.status.get()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    fn set_status(&self, status: ClusterStatus, extra: Option<&str>) -> Result<()> {
        self.status.set(status, extra)
    }

    /// Work out the status after process start
    pub async fn initialize_status(&self) -> Result<ClusterStatus> {
        let status = if !self.config.current().is_configured() {
            ClusterStatus::Unconfigured
        } else if self.host.service_started(&self.settings.service_name).await? {
            ClusterStatus::Running
        } else {
            ClusterStatus::Failed
        };
        self.set_status(status, None)?;
        Ok(status)
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Bring the cluster up.
    ///
    /// Concurrent calls join the run already in progress and receive its
    /// result as [`Error::Shared`].
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let run = {
            let mut inflight = self.inflight.lock();
            match inflight.as_ref() {
                Some(run) => {
                    debug!("Joining in-flight cluster start");
                    run.clone()
                }
                None => {
                    let this = Arc::clone(self);
                    let run = async move {
                        let result = this.start_once().await.map_err(Arc::new);
                        this.inflight.lock().take();
                        result
                    }
                    .boxed()
                    .shared();
                    *inflight = Some(run.clone());
                    run
                }
            }
        };
        run.await.map_err(Error::Shared)
    }

    async fn start_once(&self) -> Result<()> {
        let config = self.config.current();
        let dataset = match config.dataset() {
            Some(dataset) => dataset,
            None => {
                self.set_status(ClusterStatus::Unconfigured, None)?;
                return Err(Error::Configuration(
                    "applications pool is not configured".into(),
                ));
            }
        };

        let result = async {
            self.set_status(ClusterStatus::Initializing, None)?;
            info!("Starting applications cluster on {}", dataset);
            self.start_sequence(&config, &dataset).await
        }
        .await;

        match result {
            Ok(()) => {
                self.set_status(ClusterStatus::Running, None)?;
                BestEffort::run(
                    "Clearing start alert",
                    self.host.clear_alert(START_FAILED_ALERT),
                )
                .await
                .log();
                info!("Applications cluster is running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Applications cluster failed to start");
                if let Err(status_err) = self.set_status(ClusterStatus::Failed, Some(&e.to_string())) {
                    warn!(error = %status_err, "Could not record failed status");
                }
                BestEffort::run(
                    "Raising start alert",
                    self.host.raise_alert(START_FAILED_ALERT, &e.to_string()),
                )
                .await
                .log();
                Err(e)
            }
        }
    }

    async fn start_sequence(&self, config: &ClusterConfig, dataset: &str) -> Result<()> {
        self.validate_fs_setup(config, dataset).await?;
        self.host.run_migrations().await?;
        self.host.start_service(&self.settings.service_name).await?;
        self.wait_node_configured().await?;

        self.add_taint(taints::start_taint()).await?;
        self.runtime
            .setup_storage_classes(dataset)
            .await
            .map_err(|e| Error::Configuration(format!("Failed to configure PV/PVCs support: {e}")))?;
        self.host.run_app_migrations().await?;

        let node = self.runtime.node_config().await?;
        let remaining = taints::without_keys(&node.taints, &[START_TAINT_KEY, STOP_TAINT_KEY]);
        if remaining.len() != node.taints.len() {
            self.runtime.set_taints(remaining).await?;
        }

        self.wait_taints_cleared().await?;
        self.wait_pods_running().await?;
        Ok(())
    }

    /// Check the dataset tree before starting and create missing children
    async fn validate_fs_setup(&self, config: &ClusterConfig, dataset: &str) -> Result<()> {
        if let Some(pool) = &config.pool {
            if !self.datasets.exists(pool).await? {
                return Err(Error::not_found("Pool", pool.as_str()));
            }
        }

        let mut missing = Vec::new();
        for name in required_datasets(dataset) {
            if !self.datasets.exists(&name).await? {
                missing.push(name);
            }
        }
        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "Missing {} dataset(s) required for starting applications",
                missing.join(", ")
            )));
        }

        self.ensure_datasets(dataset).await?;

        let under = format!("{dataset}/");
        let locked: Vec<String> = self
            .datasets
            .locked()
            .await?
            .into_iter()
            .map(|d| d.id)
            .filter(|id| {
                id == dataset || id.starts_with(&under) || config.pool.as_deref() == Some(id.as_str())
            })
            .collect();
        if !locked.is_empty() {
            return Err(Error::LockedResource { datasets: locked });
        }
        Ok(())
    }

    /// Create any cluster dataset that does not exist yet
    pub async fn ensure_datasets(&self, dataset: &str) -> Result<()> {
        for spec in cluster_datasets(dataset) {
            if self.datasets.exists(&spec.name).await? {
                continue;
            }
            info!("Creating dataset {}", spec.name);
            self.datasets.create(&spec.name, &spec.properties).await?;
            if spec.mount {
                self.datasets.mount(&spec.name).await?;
            }
        }
        Ok(())
    }

    async fn wait_node_configured(&self) -> Result<()> {
        retry_until("node configuration", &self.settings.readiness.node_ready, || async {
            let node = self.runtime.node_config().await?;
            Ok(if node.configured {
                Probe::Ready(())
            } else {
                Probe::Pending(node.error.unwrap_or_else(|| "node is not configured".into()))
            })
        })
        .await
    }

    async fn wait_taints_cleared(&self) -> Result<()> {
        retry_until("taint removal", &self.settings.readiness.taints_cleared, || async {
            let node = self.runtime.node_config().await?;
            Ok(if node.taints.is_empty() {
                Probe::Ready(())
            } else {
                let keys: Vec<_> = node.taints.iter().map(|t| t.key.as_str()).collect();
                Probe::Pending(format!("'{}' taints", keys.join(", ")))
            })
        })
        .await
    }

    async fn wait_pods_running(&self) -> Result<()> {
        let running = retry_until("running pods", &self.settings.readiness.pods_running, || async {
            let running = self.runtime.running_pods().await?;
            Ok(if running > 0 {
                Probe::Ready(running)
            } else {
                Probe::Pending("no running pods".into())
            })
        })
        .await?;
        debug!("{} pod(s) running", running);
        Ok(())
    }

    /// Wait until the node is configured and carries no taints at all
    pub async fn wait_node_ready(&self) -> Result<()> {
        retry_until(
            "node readiness",
            &self.settings.readiness.restore_node_ready,
            || async {
                let node = self.runtime.node_config().await?;
                Ok(if !node.configured {
                    Probe::Pending(node.error.unwrap_or_else(|| "node is not configured".into()))
                } else if !node.taints.is_empty() {
                    Probe::Pending(format!("{} taint(s) on node", node.taints.len()))
                } else {
                    Probe::Ready(())
                })
            },
        )
        .await
    }

    // =========================================================================
    // Stop
    // =========================================================================

    /// Quiesce workloads and stop the cluster service
    pub async fn stop(&self) -> Result<()> {
        let current = self.status().status;
        if matches!(current, ClusterStatus::Stopped | ClusterStatus::Unconfigured) {
            debug!("Applications cluster already {}", current);
            return Ok(());
        }

        self.set_status(ClusterStatus::Stopping, None)?;
        BestEffort::run("Adding stop taint", self.add_taint(taints::stop_taint()))
            .await
            .log();

        if let Err(e) = self.host.stop_service(&self.settings.service_name).await {
            error!(error = %e, "Failed to stop applications cluster");
            self.set_status(ClusterStatus::Failed, Some(&e.to_string()))?;
            return Err(e);
        }
        self.set_status(ClusterStatus::Stopped, None)?;
        info!("Applications cluster stopped");
        Ok(())
    }

    // =========================================================================
    // Taints
    // =========================================================================

    /// Add a taint unless an equal one is present; returns whether it was added
    pub async fn add_taint(&self, taint: Taint) -> Result<bool> {
        let node = self.runtime.node_config().await?;
        match taints::with_added(&node.taints, &taint) {
            Some(updated) => {
                debug!("Adding taint {}", taint);
                self.runtime.set_taints(updated).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove every taint with `key`
    pub async fn remove_taint(&self, key: &str) -> Result<()> {
        let node = self.runtime.node_config().await?;
        let updated = taints::without_key(&node.taints, key)?;
        debug!("Removing taint {}", key);
        self.runtime.set_taints(updated).await
    }

    pub async fn taints(&self) -> Result<Vec<Taint>> {
        Ok(self.runtime.node_config().await?.taints)
    }

    // =========================================================================
    // Reconfiguration
    // =========================================================================

    fn persisted_config_path(&self, dataset: &str) -> PathBuf {
        self.settings.mountpoint(dataset).join(PERSISTED_CONFIG_FILE)
    }

    async fn persisted_config(&self, dataset: &str) -> Option<ClusterConfig> {
        let path = self.persisted_config_path(dataset);
        let raw = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str(&raw) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable {}", path.display());
                None
            }
        }
    }

    /// Apply a new cluster configuration and restart on it.
    ///
    /// Returns whether the dataset tree was wiped for a clean start.
    pub async fn reconfigure(self: &Arc<Self>, config: ClusterConfig) -> Result<bool> {
        if self.host.service_started(&self.settings.service_name).await? {
            self.stop().await?;
        }
        self.config.replace(config.clone());

        let dataset = match config.dataset() {
            Some(dataset) => dataset,
            None => {
                self.set_status(ClusterStatus::Unconfigured, None)?;
                info!("Applications pool unset, cluster left unconfigured");
                return Ok(false);
            }
        };

        let previous = self.persisted_config(&dataset).await;
        let clean_start = config.requires_clean_start(previous.as_ref());

        let result = async {
            if clean_start && self.datasets.exists(&dataset).await? {
                warn!("Network settings changed, removing {} for a clean start", dataset);
                self.datasets.delete(&dataset, true, true).await?;
            }
            self.ensure_datasets(&dataset).await?;
            self.start().await
        }
        .await;

        match result {
            Ok(()) => {
                let path = self.persisted_config_path(&dataset);
                let raw = serde_json::to_string_pretty(&config)?;
                tokio::fs::write(&path, raw).await?;
                BestEffort::run(
                    "Clearing configuration alert",
                    self.host.clear_alert(CONFIGURATION_FAILED_ALERT),
                )
                .await
                .log();
                Ok(clean_start)
            }
            Err(e) => {
                BestEffort::run(
                    "Raising configuration alert",
                    self.host.raise_alert(CONFIGURATION_FAILED_ALERT, &e.to_string()),
                )
                .await
                .log();
                if let Err(status_err) = self.set_status(ClusterStatus::Failed, Some(&e.to_string())) {
                    warn!(error = %status_err, "Could not record failed status");
                }
                Err(e)
            }
        }
    }
}
