//! Configuration
//!
//! [`ClusterConfig`] is what the user configures for the applications
//! cluster; [`Settings`] holds everything else the daemon needs (paths,
//! node name, middleware endpoint, polling policies). Both load from a YAML
//! file and fall back to defaults.

use crate::error::{Error, Result};
use crate::jobs::manager::DEFAULT_FINISHED_JOBS_TO_KEEP;
use crate::retry::PollPolicy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the applications dataset below the pool
pub const APPLICATIONS_DATASET: &str = "ix-applications";

// =============================================================================
// Cluster Configuration
// =============================================================================

/// User-facing configuration of the applications cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Storage pool hosting the cluster; `None` means unconfigured
    #[serde(default)]
    pub pool: Option<String>,
    /// Dataset override; defaults to `<pool>/ix-applications`
    #[serde(default)]
    pub dataset: Option<String>,
    pub cluster_cidr: String,
    pub service_cidr: String,
    pub cluster_dns_ip: String,
    #[serde(default)]
    pub passthrough_mode: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            pool: None,
            dataset: None,
            cluster_cidr: "172.16.0.0/16".to_string(),
            service_cidr: "172.17.0.0/16".to_string(),
            cluster_dns_ip: "172.17.0.10".to_string(),
            passthrough_mode: false,
        }
    }
}

impl ClusterConfig {
    /// The applications dataset, if a pool is configured
    pub fn dataset(&self) -> Option<String> {
        match (&self.dataset, &self.pool) {
            (Some(dataset), _) => Some(dataset.clone()),
            (None, Some(pool)) => Some(format!("{pool}/{APPLICATIONS_DATASET}")),
            (None, None) => None,
        }
    }

    /// The applications dataset, or a configuration error
    pub fn require_dataset(&self) -> Result<String> {
        self.dataset()
            .ok_or_else(|| Error::Configuration("applications pool is not configured".into()))
    }

    pub fn is_configured(&self) -> bool {
        self.pool.is_some()
    }

    /// Whether moving from `previous` to `self` needs a fresh cluster
    pub fn requires_clean_start(&self, previous: Option<&ClusterConfig>) -> bool {
        match previous {
            None => true,
            Some(previous) => {
                self.cluster_cidr != previous.cluster_cidr
                    || self.service_cidr != previous.service_cidr
                    || self.cluster_dns_ip != previous.cluster_dns_ip
                    || self.passthrough_mode != previous.passthrough_mode
            }
        }
    }
}

/// Shared, replaceable handle to the current cluster configuration.
///
/// Operations take a copy with [`ConfigHandle::current`] when they start so
/// one run never observes a half-applied reconfiguration.
#[derive(Debug, Clone, Default)]
pub struct ConfigHandle {
    inner: Arc<RwLock<ClusterConfig>>,
}

impl ConfigHandle {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn current(&self) -> ClusterConfig {
        self.inner.read().clone()
    }

    pub(crate) fn replace(&self, config: ClusterConfig) {
        *self.inner.write() = config;
    }
}

// =============================================================================
// Readiness Policies
// =============================================================================

/// Polling policies for each readiness wait
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadinessConfig {
    /// Node reports configured after the service starts
    pub node_ready: PollPolicy,
    /// Node taints cleared
    pub taints_cleared: PollPolicy,
    /// At least one pod running
    pub pods_running: PollPolicy,
    /// Node ready after a restore re-initializes the cluster
    pub restore_node_ready: PollPolicy,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            node_ready: PollPolicy::new(2, Some(60)),
            taints_cleared: PollPolicy::new(5, Some(600)),
            pods_running: PollPolicy::new(5, Some(600)),
            restore_node_ready: PollPolicy::new(5, None),
        }
    }
}

impl ReadinessConfig {
    fn policies(&self) -> [(&'static str, &PollPolicy); 4] {
        [
            ("nodeReady", &self.node_ready),
            ("taintsCleared", &self.taints_cleared),
            ("podsRunning", &self.pods_running),
            ("restoreNodeReady", &self.restore_node_ready),
        ]
    }

    /// Every policy must wait between probes
    pub fn validate(&self) -> Result<()> {
        for (name, policy) in self.policies() {
            if policy.interval_secs == 0 {
                return Err(Error::Configuration(format!(
                    "readiness.{name}.intervalSecs must be at least 1"
                )));
            }
            if policy.timeout_secs == Some(0) {
                return Err(Error::Configuration(format!(
                    "readiness.{name}.timeoutSecs must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Daemon settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub cluster: ClusterConfig,
    /// Where datasets are mounted
    pub mount_root: PathBuf,
    /// k3s configuration directory cleared on restore
    pub rancher_config_dir: PathBuf,
    /// Name of the single cluster node
    pub node_name: String,
    /// Service name known to the host service manager
    pub service_name: String,
    /// Host middleware RPC endpoint
    pub middleware_url: String,
    /// Update-triggered backups to keep
    pub update_backups_to_keep: usize,
    /// Finished jobs kept for status queries
    pub finished_jobs_to_keep: usize,
    pub readiness: ReadinessConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            mount_root: PathBuf::from("/mnt"),
            rancher_config_dir: PathBuf::from("/etc/rancher"),
            node_name: "ix-truenas".to_string(),
            service_name: "kubernetes".to_string(),
            middleware_url: "http://127.0.0.1:6000/_rpc".to_string(),
            update_backups_to_keep: 2,
            finished_jobs_to_keep: DEFAULT_FINISHED_JOBS_TO_KEEP,
            readiness: ReadinessConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Unable to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.update_backups_to_keep == 0 {
            return Err(Error::Configuration(
                "updateBackupsToKeep must be at least 1".into(),
            ));
        }
        if self.node_name.is_empty() {
            return Err(Error::Configuration("nodeName must not be empty".into()));
        }
        self.readiness.validate()
    }

    /// Mountpoint of a dataset
    pub fn mountpoint(&self, dataset: &str) -> PathBuf {
        self.mount_root.join(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_derivation() {
        let mut config = ClusterConfig::default();
        assert_eq!(config.dataset(), None);
        assert!(config.require_dataset().is_err());

        config.pool = Some("tank".into());
        assert_eq!(config.dataset().as_deref(), Some("tank/ix-applications"));

        config.dataset = Some("tank/apps".into());
        assert_eq!(config.dataset().as_deref(), Some("tank/apps"));
    }

    #[test]
    fn test_clean_start_detection() {
        let config = ClusterConfig {
            pool: Some("tank".into()),
            ..Default::default()
        };
        assert!(config.requires_clean_start(None));
        assert!(!config.requires_clean_start(Some(&config.clone())));

        let mut moved = config.clone();
        moved.pool = Some("other".into());
        assert!(!moved.requires_clean_start(Some(&config)));

        let mut renumbered = config.clone();
        renumbered.service_cidr = "10.0.0.0/16".into();
        assert!(renumbered.requires_clean_start(Some(&config)));
    }

    #[test]
    fn test_settings_from_yaml() {
        let raw = r#"
cluster:
  pool: tank
  clusterCidr: 10.10.0.0/16
  serviceCidr: 10.11.0.0/16
  clusterDnsIp: 10.11.0.10
mountRoot: /srv
readiness:
  podsRunning:
    intervalSecs: 1
    timeoutSecs: 30
"#;
        let settings = Settings::from_yaml(raw).unwrap();
        assert_eq!(settings.cluster.pool.as_deref(), Some("tank"));
        assert!(!settings.cluster.passthrough_mode);
        assert_eq!(settings.mount_root, PathBuf::from("/srv"));
        assert_eq!(settings.readiness.pods_running, PollPolicy::new(1, Some(30)));
        assert_eq!(settings.readiness.taints_cleared, PollPolicy::new(5, Some(600)));
        assert_eq!(settings.node_name, "ix-truenas");
    }

    #[test]
    fn test_settings_validation() {
        let raw = "updateBackupsToKeep: 0\n";
        assert!(matches!(Settings::from_yaml(raw), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let raw = "readiness:\n  taintsCleared:\n    intervalSecs: 0\n    timeoutSecs: 600\n";
        let err = Settings::from_yaml(raw).unwrap_err();
        assert!(matches!(&err, Error::Configuration(msg) if msg.contains("taintsCleared")));

        let mut settings = Settings::default();
        settings.readiness.restore_node_ready = PollPolicy::new(0, None);
        assert!(settings.validate().is_err());
        settings.readiness.restore_node_ready = PollPolicy::new(5, None);
        assert!(settings.validate().is_ok());
    }
}
