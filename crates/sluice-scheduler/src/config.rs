//! Scheduler and pool configuration.

use serde::{Deserialize, Serialize};
use sluice_core::agent::Zone;
use sluice_core::{Error, Result};
use std::path::Path;
use std::time::Duration;

/// Environment variables override file values, e.g.
/// `SLUICE__POOL__RECONCILE_INTERVAL_SECS=10`.
pub const ENV_PREFIX: &str = "SLUICE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Zone for nodes whose pipeline does not name one.
    #[serde(default = "default_zone")]
    pub default_zone: String,
    /// Capacity of the in-process event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_zone() -> String {
    "default".to_string()
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_zone: default_zone(),
            event_capacity: default_event_capacity(),
            pool: PoolConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Layer an optional config file (YAML, TOML or JSON by extension) under
    /// `SLUICE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// Agents silent for longer than this are taken offline.
    #[serde(default = "default_session_timeout")]
    pub agent_session_timeout_secs: u64,
    /// Agents offline for this much longer than the session timeout are
    /// dropped and their instances deleted.
    #[serde(default = "default_offline_grace")]
    pub agent_offline_grace_secs: u64,
    /// Stopped instances older than this are deleted by the cleanup pass.
    #[serde(default = "default_instance_max_alive")]
    pub instance_max_alive_secs: u64,
    /// Upper bound on a single provisioning call.
    #[serde(default = "default_provision_timeout")]
    pub provision_timeout_secs: u64,
    #[serde(default)]
    pub zones: Vec<Zone>,
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    600
}

fn default_session_timeout() -> u64 {
    600
}

fn default_offline_grace() -> u64 {
    600
}

fn default_instance_max_alive() -> u64 {
    6 * 3600
}

fn default_provision_timeout() -> u64 {
    300
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            agent_session_timeout_secs: default_session_timeout(),
            agent_offline_grace_secs: default_offline_grace(),
            instance_max_alive_secs: default_instance_max_alive(),
            provision_timeout_secs: default_provision_timeout(),
            zones: Vec::new(),
        }
    }
}

impl PoolConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_session_timeout_secs)
    }

    pub fn with_zone(mut self, zone: Zone) -> Self {
        self.zones.push(zone);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config: SchedulerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.default_zone, "default");
        assert_eq!(config.pool.agent_session_timeout_secs, 600);
        assert!(config.pool.zones.is_empty());
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
default_zone: eu
pool:
  reconcile_interval_secs: 5
  zones:
    - name: eu
      image: ami-123
      min_idle: 2
"#
        )
        .unwrap();

        let config = SchedulerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.default_zone, "eu");
        assert_eq!(config.pool.reconcile_interval_secs, 5);
        assert_eq!(config.pool.zones[0].min_idle, 2);
        assert_eq!(config.pool.zones[0].batch_size, 5);
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = SchedulerConfig::load(Some(Path::new("/nonexistent/sluice.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
