//! Configuration model and hierarchical loader.
//!
//! Precedence (lowest to highest): programmatic defaults,
//! `.foreman/config.yaml`, `.foreman/local.yaml`, then `FOREMAN_`-prefixed
//! environment variables (nested keys split on `__`). Configuration is
//! project-local so one machine can host several deployments.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid workers: {0}. Must be between 1 and 64")]
    InvalidWorkers(usize),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_retries: {0}. Cannot be 0")]
    InvalidMaxRetries(u32),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: ".foreman/foreman.db".to_string(),
            max_connections: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub sweep_interval_secs: u64,
    pub shutdown_grace_secs: u64,
    pub base_branch: String,
    pub enforce_capacity: bool,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 500,
            sweep_interval_secs: 10,
            shutdown_grace_secs: 30,
            base_branch: "main".to_string(),
            enforce_capacity: false,
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    pub worktrees_root: String,
    pub event_publish_url: String,
    pub task_complete_url: String,
    /// Agent runtime argv; empty disables process spawning.
    pub runtime_command: Vec<String>,
    pub terminate_grace_secs: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            worktrees_root: ".foreman/worktrees".to_string(),
            event_publish_url: "http://127.0.0.1:9440/events".to_string(),
            task_complete_url: "http://127.0.0.1:9440/tasks/complete".to_string(),
            runtime_command: Vec::new(),
            terminate_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsSection {
    pub channel_capacity: usize,
    pub persist: bool,
    /// Optional remote fanout endpoint; empty disables it.
    pub remote_endpoint: String,
    pub remote_queue_capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            persist: true,
            remote_endpoint: String::new(),
            remote_queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    pub level: String,
    pub format: String,
    /// Optional log directory; empty logs to stdout only.
    pub dir: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub orchestrator: OrchestratorSection,
    pub sandbox: SandboxSection,
    pub events: EventsSection,
    pub log: LogSection,
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".foreman/config.yaml"))
            .merge(Yaml::file(".foreman/local.yaml"))
            .merge(Env::prefixed("FOREMAN_").split("__"))
            .extract()
            .context("Failed to extract configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.orchestrator.workers == 0 || config.orchestrator.workers > 64 {
            return Err(ConfigError::InvalidWorkers(config.orchestrator.workers));
        }
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if !["trace", "debug", "info", "warn", "error"].contains(&config.log.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.log.level.clone()));
        }
        if config.orchestrator.max_retries == 0 {
            return Err(ConfigError::InvalidMaxRetries(config.orchestrator.max_retries));
        }
        if config.orchestrator.initial_backoff_ms >= config.orchestrator.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.orchestrator.initial_backoff_ms,
                config.orchestrator.max_backoff_ms,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_invalid_workers_rejected() {
        let mut config = Config::default();
        config.orchestrator.workers = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidWorkers(0))
        ));
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let mut config = Config::default();
        config.orchestrator.initial_backoff_ms = 5_000;
        config.orchestrator.max_backoff_ms = 1_000;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBackoff(5_000, 1_000))
        ));
    }

    #[test]
    fn test_env_override() {
        temp_env::with_var("FOREMAN_ORCHESTRATOR__WORKERS", Some("8"), || {
            let config: Config = Figment::new()
                .merge(Serialized::defaults(Config::default()))
                .merge(Env::prefixed("FOREMAN_").split("__"))
                .extract()
                .unwrap();
            assert_eq!(config.orchestrator.workers, 8);
        });
    }
}
