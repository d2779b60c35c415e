use std::time::Duration;

use anyhow::{Context, Result};
use migrator_core::MigratorError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TOPIC: &str = "inconsistent_interactive";

/// Tunables shared by validation runs, the event channel and the fixer consumer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MigratorConfig {
    pub batch_size: usize,
    pub publish_timeout_ms: u64,
    pub topic: String,
    pub fixer: FixerConfig,
    pub outbox: OutboxConfig,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            publish_timeout_ms: 1000,
            topic: DEFAULT_TOPIC.to_string(),
            fixer: FixerConfig::default(),
            outbox: OutboxConfig::default(),
        }
    }
}

impl MigratorConfig {
    /// # Errors
    /// Returns an error when the document does not parse or fails [`Self::validate`].
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("failed to parse migrator config")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`MigratorError::Config`] for values no run could work with.
    pub fn validate(&self) -> Result<(), MigratorError> {
        if self.batch_size == 0 {
            return Err(MigratorError::Config("batch_size must be greater than zero".to_string()));
        }
        if self.publish_timeout_ms == 0 {
            return Err(MigratorError::Config(
                "publish_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.topic.trim().is_empty() {
            return Err(MigratorError::Config("topic must not be empty".to_string()));
        }
        if self.fixer.max_backoff_ms < self.fixer.retry_backoff_ms {
            return Err(MigratorError::Config(
                "fixer.max_backoff_ms must not be smaller than fixer.retry_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FixerConfig {
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for FixerConfig {
    fn default() -> Self {
        Self { retry_backoff_ms: 200, max_backoff_ms: 30_000 }
    }
}

impl FixerConfig {
    /// Delay before redelivering an event that already failed `attempt` times.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct OutboxConfig {
    pub poll_interval_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 250 }
    }
}

impl OutboxConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
