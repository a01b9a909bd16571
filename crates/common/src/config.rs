//! Configuration management

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub executor: ExecutorConfig,
    pub sandbox: SandboxConfig,
    pub observability: ObservabilityConfig,
}

/// Relational store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Broker / queue configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    pub url: String,
    /// Delivery attempts before a message is dead-lettered
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Task-group executor configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    pub shared_fs_root: String,
    pub group_soft_timeout_secs: u64,
    pub group_hard_timeout_secs: u64,
}

impl ExecutorConfig {
    pub fn shared_fs_root(&self) -> &Path {
        Path::new(&self.shared_fs_root)
    }

    /// Root under which per-task WASM workspaces are created
    pub fn wasm_workspace_root(&self) -> PathBuf {
        Path::new(&self.shared_fs_root).join("wasm_workspaces")
    }

    pub fn group_soft_timeout(&self) -> Duration {
        Duration::from_secs(self.group_soft_timeout_secs)
    }

    pub fn group_hard_timeout(&self) -> Duration {
        Duration::from_secs(self.group_hard_timeout_secs)
    }
}

/// WASM sandbox limits, constant within a deployment
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct SandboxConfig {
    /// Initial fuel per invocation; roughly a few hundred ms of pure compute
    pub fuel: u64,
    pub wall_clock_secs: u64,
}

impl SandboxConfig {
    pub fn wall_clock(&self) -> Duration {
        Duration::from_secs(self.wall_clock_secs)
    }
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

/// Log format
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Config {
    /// Load configuration from defaults, an optional `config.toml`, and the
    /// environment. `AGENTFLOW__`-prefixed variables override nested keys;
    /// the conventional `DATABASE_URL`, `BROKER_URL`, `SHARED_FS_ROOT`, and
    /// `LOG_LEVEL` variables are honored unprefixed.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder()
            .set_default("database.url", "sqlite:agentflow.db")?
            .set_default("database.max_connections", 5)?
            .set_default("broker.url", "inproc://local")?
            .set_default("broker.max_attempts", 3)?
            .set_default("broker.base_delay_ms", 500)?
            .set_default("broker.max_delay_ms", 30_000)?
            .set_default("executor.shared_fs_root", "/var/lib/agentflow")?
            .set_default("executor.group_soft_timeout_secs", 3600)?
            .set_default("executor.group_hard_timeout_secs", 3700)?
            .set_default("sandbox.fuel", 100_000_000)?
            .set_default("sandbox.wall_clock_secs", 5)?
            .set_default("observability.log_level", "info")?
            .set_default("observability.log_format", "compact")?
            .set_default("observability.metrics_enabled", true)?
            .set_default("observability.metrics_port", 9090)?;

        if Path::new("config.toml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        builder = builder.add_source(
            Environment::with_prefix("AGENTFLOW")
                .separator("__")
                .try_parsing(true),
        );

        for (var, key) in [
            ("DATABASE_URL", "database.url"),
            ("BROKER_URL", "broker.url"),
            ("SHARED_FS_ROOT", "executor.shared_fs_root"),
            ("LOG_LEVEL", "observability.log_level"),
        ] {
            if let Ok(value) = std::env::var(var) {
                builder = builder.set_override(key, value)?;
            }
        }

        builder.build()?.try_deserialize()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.executor.group_hard_timeout_secs < self.executor.group_soft_timeout_secs {
            errors.push("Group hard timeout must not be below the soft timeout".to_string());
        }

        if self.sandbox.fuel == 0 {
            errors.push("Sandbox fuel must be greater than 0".to_string());
        }

        if self.sandbox.wall_clock_secs == 0 {
            errors.push("Sandbox wall clock limit must be greater than 0".to_string());
        }

        if self.broker.max_attempts == 0 {
            errors.push("Broker delivery attempts must be greater than 0".to_string());
        }

        if self.observability.metrics_enabled && self.observability.metrics_port == 0 {
            errors.push("Metrics port must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite:agentflow.db".to_string(),
                max_connections: 5,
            },
            broker: BrokerConfig {
                url: "inproc://local".to_string(),
                max_attempts: 3,
                base_delay_ms: 500,
                max_delay_ms: 30_000,
            },
            executor: ExecutorConfig {
                shared_fs_root: "/var/lib/agentflow".to_string(),
                group_soft_timeout_secs: 3600,
                group_hard_timeout_secs: 3700,
            },
            sandbox: SandboxConfig {
                fuel: 100_000_000,
                wall_clock_secs: 5,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                log_format: LogFormat::Compact,
                metrics_enabled: true,
                metrics_port: 9090,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_constants() {
        let config = Config::default();
        assert_eq!(config.sandbox.fuel, 100_000_000);
        assert_eq!(config.sandbox.wall_clock(), Duration::from_secs(5));
        assert_eq!(config.executor.group_soft_timeout(), Duration::from_secs(3600));
        assert_eq!(config.executor.group_hard_timeout(), Duration::from_secs(3700));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn hard_timeout_below_soft_is_rejected() {
        let mut config = Config::default();
        config.executor.group_hard_timeout_secs = 10;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn workspace_root_is_under_shared_fs() {
        let config = Config::default();
        assert_eq!(
            config.executor.wasm_workspace_root(),
            PathBuf::from("/var/lib/agentflow/wasm_workspaces")
        );
    }
}
