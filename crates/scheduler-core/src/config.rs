//! Configuration (spec §6). A plain struct the caller constructs — the
//! core has no CLI and never reads `std::env` itself.

use crate::cipher::DecryptKey;
use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// ≥0; if 0, polling is disabled and only admin entry points trigger
    /// runs.
    pub tick_interval_ms: u64,
    pub inter_command_delay_ms: u64,
    pub lease_ttl_ms: u64,
    /// Must be `< lease_ttl_ms`.
    pub evaluator_budget_ms: u64,
    pub max_retries_default: u32,
    pub retry_backoff_default_ms: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            inter_command_delay_ms: 100,
            lease_ttl_ms: 10 * 60 * 1000,
            evaluator_budget_ms: 10 * 1000,
            max_retries_default: 3,
            retry_backoff_default_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
impl std::error::Error for ConfigError {}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.evaluator_budget_ms >= self.lease_ttl_ms {
            return Err(ConfigError(format!(
                "evaluator_budget_ms ({}) must be < lease_ttl_ms ({})",
                self.evaluator_budget_ms, self.lease_ttl_ms
            )));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn inter_command_delay(&self) -> Duration {
        Duration::from_millis(self.inter_command_delay_ms)
    }

    pub fn lease_ttl_chrono(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.lease_ttl_ms as i64)
    }

    pub fn evaluator_budget(&self) -> Duration {
        Duration::from_millis(self.evaluator_budget_ms)
    }

    pub fn retry_backoff_default(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.retry_backoff_default_ms)
    }
}

/// Startup-time wrapper requiring the 32-byte decrypt key; absent key is
/// a fatal startup error (spec §6), represented here by `Config`
/// requiring the caller to supply a `DecryptKey` alongside it rather
/// than defaulting one.
pub struct StartupConfig {
    pub config: Config,
    pub decrypt_key: DecryptKey,
}
