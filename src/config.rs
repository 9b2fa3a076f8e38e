//! Configuration for a switchboard coordinator.
//!
//! Loads from TOML with environment variable substitution. Every option has
//! a default, so `SwitchboardConfig::default()` is a working configuration
//! for a local Redis.
//!
//! # Example
//!
//! ```toml
//! [redis]
//! url = "${REDIS_URL}"
//!
//! [pool]
//! size = 10
//!
//! [ledger]
//! entry_timeout_ms = 5000
//!
//! [consumer]
//! pool_size = 10
//!
//! [dispatcher]
//! pool_size = 3
//! ```

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::SwitchboardError;

/// Root configuration structure.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

/// Redis connection parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Connection pool sizing.
#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// Connections reserved for senders.
    #[serde(default = "default_pool_size")]
    pub size: usize,

    /// Hard override for the total pool size. When unset the total is
    /// `size + 2 * consumer.pool_size + 2 * dispatcher.pool_size`.
    #[serde(default)]
    pub max_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            max_size: None,
        }
    }
}

fn default_pool_size() -> usize {
    10
}

/// Correlation ledger tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    /// Bounded wait for a reply, in milliseconds.
    #[serde(default = "default_entry_timeout_ms")]
    pub entry_timeout_ms: u64,

    /// Sweeper period, in milliseconds.
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            entry_timeout_ms: default_entry_timeout_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

impl LedgerConfig {
    pub fn entry_timeout(&self) -> Duration {
        Duration::from_millis(self.entry_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

fn default_entry_timeout_ms() -> u64 {
    5000
}

fn default_cleanup_interval_ms() -> u64 {
    1000
}

/// Worker pool tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    #[serde(default = "default_consumer_pool_size")]
    pub pool_size: usize,

    /// Tick interval, in milliseconds.
    #[serde(default = "default_execution_interval_ms")]
    pub execution_interval_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_consumer_pool_size(),
            execution_interval_ms: default_execution_interval_ms(),
        }
    }
}

impl ConsumerConfig {
    pub fn execution_interval(&self) -> Duration {
        Duration::from_millis(self.execution_interval_ms)
    }
}

fn default_consumer_pool_size() -> usize {
    10
}

fn default_execution_interval_ms() -> u64 {
    1
}

/// Dispatcher pool tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct DispatcherConfig {
    #[serde(default = "default_dispatcher_pool_size")]
    pub pool_size: usize,

    /// Tick interval, in milliseconds.
    #[serde(default = "default_execution_interval_ms")]
    pub execution_interval_ms: u64,

    /// Idle threshold before an entry is reclaimed from another consumer,
    /// in milliseconds.
    #[serde(default = "default_min_idle_ms")]
    pub min_idle_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_size: default_dispatcher_pool_size(),
            execution_interval_ms: default_execution_interval_ms(),
            min_idle_ms: default_min_idle_ms(),
        }
    }
}

impl DispatcherConfig {
    pub fn execution_interval(&self) -> Duration {
        Duration::from_millis(self.execution_interval_ms)
    }

    pub fn min_idle(&self) -> Duration {
        Duration::from_millis(self.min_idle_ms)
    }
}

fn default_dispatcher_pool_size() -> usize {
    3
}

fn default_min_idle_ms() -> u64 {
    10_000
}

impl SwitchboardConfig {
    /// Load configuration from the default path or the `SWITCHBOARD_CONFIG`
    /// env var. A missing file yields the defaults.
    pub fn load() -> Result<Self, SwitchboardError> {
        let config_path = env::var("SWITCHBOARD_CONFIG")
            .unwrap_or_else(|_| "config/switchboard.toml".to_string());
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, SwitchboardError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        info!(path = %path.display(), "loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);
        let config: SwitchboardConfig = toml::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    /// Total connection budget: the send-side pool plus two connections per
    /// worker and per dispatcher, unless explicitly overridden.
    pub fn total_pool_size(&self) -> usize {
        self.pool.max_size.unwrap_or(
            self.pool.size + 2 * self.consumer.pool_size + 2 * self.dispatcher.pool_size,
        )
    }

    pub fn validate(&self) -> Result<(), SwitchboardError> {
        if !self.redis.url.starts_with("redis://") && !self.redis.url.starts_with("rediss://") {
            return Err(SwitchboardError::Configuration(format!(
                "redis url must start with redis:// or rediss://, got '{}'",
                self.redis.url
            )));
        }
        if self.consumer.pool_size == 0 {
            return Err(SwitchboardError::Configuration(
                "consumer.pool_size must be at least 1".to_string(),
            ));
        }
        if self.dispatcher.pool_size == 0 {
            return Err(SwitchboardError::Configuration(
                "dispatcher.pool_size must be at least 1".to_string(),
            ));
        }
        if self.ledger.entry_timeout_ms == 0 {
            return Err(SwitchboardError::Configuration(
                "ledger.entry_timeout_ms must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid substitution pattern");

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}
