//! CLI configuration management.

use anyhow::{Context, anyhow, bail};
use serde::{Deserialize, Serialize};
use sluice_runner::ExecutorConfig;
use std::path::PathBuf;

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CliConfig {
    /// Output format for `graph`.
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Plugin directory used by `task` when none is given.
    #[serde(default)]
    pub plugin_dir: Option<PathBuf>,
    /// Settings for local task containers.
    #[serde(default)]
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

impl CliConfig {
    /// Load configuration from file.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Save configuration to file.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "sluice", "sluice")
            .ok_or_else(|| anyhow!("could not determine config directory"))?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "output_format" => {
                self.output_format = match value {
                    "table" => OutputFormat::Table,
                    "json" => OutputFormat::Json,
                    "yaml" => OutputFormat::Yaml,
                    _ => bail!("invalid output format: {value}"),
                };
            }
            "plugin_dir" => self.plugin_dir = Some(PathBuf::from(value)),
            "executor.default_image" => self.executor.default_image = value.to_string(),
            "executor.kill_grace_secs" => {
                self.executor.kill_grace_secs = value
                    .parse()
                    .with_context(|| format!("invalid number: {value}"))?;
            }
            "executor.server_url" => self.executor.server_url = value.to_string(),
            _ => bail!("unknown config key: {key}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_config() {
        let config = CliConfig::parse("output_format: json\nexecutor:\n  default_image: busybox\n").unwrap();
        assert_eq!(config.output_format, OutputFormat::Json);
        assert_eq!(config.executor.default_image, "busybox");
        assert_eq!(config.executor.kill_grace_secs, ExecutorConfig::default().kill_grace_secs);
        assert!(config.plugin_dir.is_none());
    }

    #[test]
    fn test_set_values() {
        let mut config = CliConfig::default();
        config.set("output_format", "yaml").unwrap();
        config.set("executor.kill_grace_secs", "3").unwrap();
        config.set("plugin_dir", "/opt/plugins").unwrap();

        assert_eq!(config.output_format, OutputFormat::Yaml);
        assert_eq!(config.executor.kill_grace_secs, 3);
        assert_eq!(config.plugin_dir, Some(PathBuf::from("/opt/plugins")));

        assert!(config.set("output_format", "xml").is_err());
        assert!(config.set("executor.kill_grace_secs", "soon").is_err());
        assert!(config.set("nope", "1").is_err());
    }
}
