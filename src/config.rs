//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    /// Name of the environment variable holding the base64 vault key
    #[serde(default = "default_key_env_var")]
    pub key_env_var: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Total attempts per command for transient failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for quadratic backoff (delay = base * attempt^2)
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// How long to wait for on-chain confirmation before giving up
    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout_ms: u64,
    /// Interval between confirmation polls
    #[serde(default = "default_confirmation_poll_ms")]
    pub confirmation_poll_ms: u64,
    /// Rows stuck in `submitting` longer than this are reconciled to failed
    #[serde(default = "default_stuck_submitting_secs")]
    pub stuck_submitting_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Fallback mention poll interval when a bot does not set its own
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Attempts for delivering a reply before marking the mention failed
    #[serde(default = "default_reply_attempts")]
    pub reply_attempts: u32,
    #[serde(default = "default_reply_retry_base_ms")]
    pub reply_retry_base_ms: u64,
}

// Default value functions
fn default_db_path() -> String {
    std::env::var("CUSTOBOT_DB_PATH").unwrap_or_else(|_| "custobot.db".into())
}

fn default_max_connections() -> u32 {
    5
}

fn default_key_env_var() -> String {
    "CUSTOBOT_VAULT_KEY".into()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_confirmation_timeout_ms() -> u64 {
    60_000
}

fn default_confirmation_poll_ms() -> u64 {
    2000
}

fn default_stuck_submitting_secs() -> i64 {
    300
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_reply_attempts() -> u32 {
    3
}

fn default_reply_retry_base_ms() -> u64 {
    500
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            key_env_var: default_key_env_var(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            confirmation_timeout_ms: default_confirmation_timeout_ms(),
            confirmation_poll_ms: default_confirmation_poll_ms(),
            stuck_submitting_secs: default_stuck_submitting_secs(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            reply_attempts: default_reply_attempts(),
            reply_retry_base_ms: default_reply_retry_base_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            vault: VaultConfig::default(),
            engine: EngineConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix CUSTOBOT_)
            .add_source(
                config::Environment::with_prefix("CUSTOBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.engine.max_attempts == 0 {
            anyhow::bail!("engine.max_attempts must be at least 1");
        }

        if self.engine.confirmation_poll_ms == 0 {
            anyhow::bail!("engine.confirmation_poll_ms must be positive");
        }

        if self.engine.confirmation_timeout_ms < self.engine.confirmation_poll_ms {
            anyhow::bail!("engine.confirmation_timeout_ms must cover at least one poll");
        }

        if self.engine.stuck_submitting_secs <= 0 {
            anyhow::bail!("engine.stuck_submitting_secs must be positive");
        }

        if self.pipeline.reply_attempts == 0 {
            anyhow::bail!("pipeline.reply_attempts must be at least 1");
        }

        if self.store.max_connections == 0 {
            anyhow::bail!("store.max_connections must be at least 1");
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Store:
    db_path: {}
    max_connections: {}
  Vault:
    key_env_var: {} (key {})
  Engine:
    max_attempts: {}
    retry_base_delay: {}ms
    confirmation_timeout: {}ms
    stuck_submitting: {}s
  Pipeline:
    poll_interval: {}s
    reply_attempts: {}
"#,
            self.store.db_path,
            self.store.max_connections,
            self.vault.key_env_var,
            if std::env::var(&self.vault.key_env_var).is_ok() {
                "set"
            } else {
                "NOT SET"
            },
            self.engine.max_attempts,
            self.engine.retry_base_delay_ms,
            self.engine.confirmation_timeout_ms,
            self.engine.stuck_submitting_secs,
            self.pipeline.poll_interval_secs,
            self.pipeline.reply_attempts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.max_attempts, 3);
        assert_eq!(config.engine.retry_base_delay_ms, 1000);
        assert_eq!(config.pipeline.reply_attempts, 3);
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let mut config = Config::default();
        config.engine.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_masked_display_never_leaks_key() {
        let config = Config::default();
        let display = config.masked_display();
        // Only the env var name may appear, never its value
        assert!(display.contains("CUSTOBOT_VAULT_KEY"));
    }
}
