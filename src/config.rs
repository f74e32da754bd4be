//! Configuration management for sluice.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::ratelimit::rules::LimiterDefinition;
use crate::ratelimit::sweep::{SweepTrigger, DEFAULT_SWEEP_PROBABILITY};

/// Environment variable prefix for overrides, e.g. `SLUICE__DATABASE__URL`.
pub const ENV_PREFIX: &str = "SLUICE";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SluiceConfig {
    /// Limiter behaviour shared by every event type
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Event store connection
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Declared limiters
    #[serde(default)]
    pub limiters: Vec<LimiterDefinition>,
}

/// Limiter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Events older than this are evicted by the sweep
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Share of track() calls that sweep
    #[serde(default = "default_sweep_probability")]
    pub sweep_probability: f64,

    /// How long the built-in sleep handler waits
    #[serde(default = "default_sleep_interval_ms")]
    pub sleep_interval_ms: u64,

    /// Name of the cross-process lock
    #[serde(default = "default_lock_name")]
    pub lock_name: String,

    /// Use one lock per event type instead of one global lock
    #[serde(default)]
    pub lock_per_event_type: bool,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            sweep_probability: default_sweep_probability(),
            sleep_interval_ms: default_sleep_interval_ms(),
            lock_name: default_lock_name(),
            lock_per_event_type: false,
        }
    }
}

fn default_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_sweep_probability() -> f64 {
    DEFAULT_SWEEP_PROBABILITY
}

fn default_sleep_interval_ms() -> u64 {
    100
}

fn default_lock_name() -> String {
    "sluice".to_string()
}

impl LimiterSettings {
    pub fn retention(&self) -> chrono::Duration {
        i64::try_from(self.retention_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn sleep_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_interval_ms)
    }

    pub fn sweep_trigger(&self) -> SweepTrigger {
        SweepTrigger::Probability(self.sweep_probability)
    }

    /// Lock guarding the check-then-record section for `event_type`.
    pub fn lock_name_for(&self, event_type: &str) -> String {
        if self.lock_per_event_type {
            format!("{}:{}", self.lock_name, event_type)
        } else {
            self.lock_name.clone()
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL, e.g. `postgres://localhost/app`
    #[serde(default)]
    pub url: Option<String>,

    /// Pool size. The lock holds one connection while the body uses another.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

impl SluiceConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SluiceConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load defaults, then an optional file, then `SLUICE__*` environment
    /// overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Find a declared limiter by event type.
    pub fn limiter(&self, event_type: &str) -> Option<&LimiterDefinition> {
        self.limiters.iter().find(|def| def.event_type == event_type)
    }
}
