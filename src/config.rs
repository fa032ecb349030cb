//! Exporter Configuration
//!
//! Defaults match the NFS provisioner's conventions. A YAML file can override
//! any field; CLI flags override the file.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Namespace where backend claims live
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "openebs";

/// Backend claim name = prefix + front-end volume name
pub const DEFAULT_BACKEND_CLAIM_PREFIX: &str = "nfs-";

/// Provisioner owning front-end volumes
pub const DEFAULT_PROVISIONER: &str = "openebs.io/nfsrwx";

/// Finalizer the exporter holds on front-end volumes until deletion is exported
pub const DEFAULT_FINALIZER: &str = "nfs.events.openebs.io/volume-events-protection";

/// Configuration for the exporter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExporterConfig {
    /// Namespace of backend claims
    pub system_namespace: String,
    /// Prefix of backend claim names
    pub backend_claim_prefix: String,
    /// Provisioner name identifying front-end volumes
    pub provisioner: String,
    /// Steady-state reconciliation interval in seconds
    pub resync_interval_secs: u64,
    /// Requeue interval after transient errors in seconds
    pub error_requeue_interval_secs: u64,
    /// Read-decide-write attempts before a conflict is requeued
    pub max_conflict_retries: u32,
    /// Concurrent reconciliation workers
    pub workers: usize,
    /// Hold a finalizer on front-end volumes until the delete event is exported
    pub manage_finalizer: bool,
    /// Finalizer name
    pub finalizer: String,
    /// Optional HTTP endpoint receiving every export record
    pub callback_url: Option<String>,
    /// Timeout for event sink requests in seconds
    pub callback_timeout_secs: u64,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            backend_claim_prefix: DEFAULT_BACKEND_CLAIM_PREFIX.to_string(),
            provisioner: DEFAULT_PROVISIONER.to_string(),
            resync_interval_secs: 60,
            error_requeue_interval_secs: 10,
            max_conflict_retries: 5,
            workers: 4,
            manage_finalizer: true,
            finalizer: DEFAULT_FINALIZER.to_string(),
            callback_url: None,
            callback_timeout_secs: 30,
        }
    }
}

impl ExporterConfig {
    /// Load configuration from a YAML file. Missing fields take defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: ExporterConfig = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn error_requeue_interval(&self) -> Duration {
        Duration::from_secs(self.error_requeue_interval_secs)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }

    /// Reject configurations the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.system_namespace.is_empty() {
            return Err(Error::Configuration("system namespace must not be empty".into()));
        }
        if self.backend_claim_prefix.is_empty() {
            return Err(Error::Configuration(
                "backend claim prefix must not be empty".into(),
            ));
        }
        if self.provisioner.is_empty() {
            return Err(Error::Configuration("provisioner must not be empty".into()));
        }
        if self.resync_interval_secs == 0 || self.error_requeue_interval_secs == 0 {
            return Err(Error::Configuration("intervals must be at least 1s".into()));
        }
        if self.error_requeue_interval_secs > self.resync_interval_secs {
            return Err(Error::Configuration(format!(
                "error requeue interval ({}s) must not exceed resync interval ({}s)",
                self.error_requeue_interval_secs, self.resync_interval_secs
            )));
        }
        if self.max_conflict_retries == 0 {
            return Err(Error::Configuration("max conflict retries must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(Error::Configuration("workers must be at least 1".into()));
        }
        if self.manage_finalizer && self.finalizer.is_empty() {
            return Err(Error::Configuration(
                "finalizer name required when finalizer management is enabled".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ExporterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.resync_interval(), Duration::from_secs(60));
        assert_eq!(config.max_conflict_retries, 5);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ExporterConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ExporterConfig {
            error_requeue_interval_secs: 120,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ExporterConfig {
            backend_claim_prefix: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "systemNamespace: storage").unwrap();
        writeln!(file, "resyncIntervalSecs: 30").unwrap();
        writeln!(file, "callbackUrl: http://events.local/api").unwrap();

        let config = ExporterConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.system_namespace, "storage");
        assert_eq!(config.resync_interval_secs, 30);
        assert_eq!(config.callback_url.as_deref(), Some("http://events.local/api"));
        assert_eq!(config.backend_claim_prefix, DEFAULT_BACKEND_CLAIM_PREFIX);
    }

    #[test]
    fn test_load_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workers: [not, a, number]").unwrap();
        assert!(matches!(
            ExporterConfig::from_yaml_file(file.path()),
            Err(Error::YamlParse(_))
        ));
    }
}
