//! Hub configuration
//!
//! Loading flow:
//! 1. Start with [`HubConfig::default()`]
//! 2. If a JSON file is given, deep-merge its values over the defaults
//! 3. Apply `SWITCHYARD_*` environment overrides

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchyard_shared::defaults;
use thiserror::Error;
use tracing::{debug, warn};

/// Environment variable naming the JSON config file
pub const CONFIG_PATH_ENV: &str = "SWITCHYARD_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Exponential backoff policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): initial * 2^(attempt-1), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::DISPATCH_MAX_ATTEMPTS,
            initial_backoff_ms: defaults::DISPATCH_INITIAL_BACKOFF_MS,
            max_backoff_ms: defaults::DISPATCH_MAX_BACKOFF_MS,
        }
    }
}

/// Tunables supplied by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubConfig {
    /// TCP address agents and dashboards connect to
    pub listen_addr: String,
    pub heartbeat_timeout_ms: u64,
    pub default_time_limit_ms: u64,
    pub max_concurrent_per_agent: usize,
    pub batch_flush_interval_ms: u64,
    pub batch_max_size: usize,
    /// Default wait for natural completion after an interrupt
    pub interrupt_timeout_ms: u64,
    pub cancel_grace_ms: u64,
    pub dispatch_retry: RetryPolicy,
    pub persist_retry: RetryPolicy,
    pub outbound_buffer: usize,
    pub event_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            heartbeat_timeout_ms: defaults::HEARTBEAT_TIMEOUT_MS,
            default_time_limit_ms: defaults::DEFAULT_TIME_LIMIT_MS,
            max_concurrent_per_agent: defaults::MAX_CONCURRENT_PER_AGENT,
            batch_flush_interval_ms: defaults::BATCH_FLUSH_INTERVAL_MS,
            batch_max_size: defaults::BATCH_MAX_SIZE,
            interrupt_timeout_ms: defaults::INTERRUPT_TIMEOUT_MS,
            cancel_grace_ms: defaults::CANCEL_GRACE_MS,
            dispatch_retry: RetryPolicy::default(),
            persist_retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 100,
                max_backoff_ms: 2_000,
            },
            outbound_buffer: defaults::OUTBOUND_BUFFER,
            event_buffer: 1024,
        }
    }
}

impl HubConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn default_time_limit(&self) -> Duration {
        Duration::from_millis(self.default_time_limit_ms)
    }

    pub fn batch_flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch_flush_interval_ms.max(1))
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Load from the file named by `SWITCHYARD_CONFIG`, or defaults
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from_path(Path::new(&path)),
            Err(_) => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    /// Load from a JSON file merged over defaults, then apply env overrides
    ///
    /// A missing file yields defaults; invalid JSON is an error.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let defaults = serde_json::to_value(Self::default())?;

        let merged = if path.exists() {
            debug!(?path, "loading hub config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        } else {
            warn!(?path, "config file not found, using defaults");
            defaults
        };

        let mut config: Self = serde_json::from_value(merged)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SWITCHYARD_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(ms) = env_u64("SWITCHYARD_HEARTBEAT_TIMEOUT_MS") {
            self.heartbeat_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("SWITCHYARD_DEFAULT_TIME_LIMIT_MS") {
            self.default_time_limit_ms = ms;
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring non-numeric env override");
            None
        }
    }
}

/// Objects merge recursively; arrays and primitives are replaced; nulls are skipped
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}
