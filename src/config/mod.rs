//! # Configuration System
//!
//! Explicit, validated configuration for the execution core. Every knob
//! has a documented default so an empty file (or no file) yields a
//! runnable configuration; YAML files and environment overlays refine it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use agent_core::config::AgentCoreConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load configuration (environment auto-detected)
//! let config = AgentCoreConfig::load()?;
//!
//! let batch = config.executor.batch_size;
//! let window = config.rate_limits.default_policy.window_ms;
//! # Ok(())
//! # }
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{AgentCoreError, Result};

/// Root configuration for the execution core
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentCoreConfig {
    /// Admission control policies per endpoint class
    pub rate_limits: RateLimitsConfig,

    /// Idempotency record lifetimes
    pub idempotency: IdempotencyConfig,

    /// Poll-and-dispatch executor settings
    pub executor: ExecutorConfig,

    /// Append-only action ledger settings
    pub action_log: ActionLogConfig,

    /// In-memory trace retention and reaping
    pub trace: TraceConfig,

    /// Query API settings
    pub web: WebConfig,
}

/// One admission-control policy: a window length and a request ceiling
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitPolicy {
    pub window_ms: u64,
    pub max_requests: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 100,
        }
    }
}

impl RateLimitPolicy {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Admission-control configuration, fixed at startup
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    /// Fallback policy for endpoint classes without an explicit entry
    pub default_policy: RateLimitPolicy,

    /// Per-endpoint-class overrides
    pub endpoint_classes: HashMap<String, RateLimitPolicy>,

    /// Windows idle for longer than `idle_sweep_multiplier * window_ms`
    /// are dropped by the periodic sweep
    pub idle_sweep_multiplier: u32,

    /// How often the background sweep runs
    pub sweep_interval_seconds: u64,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            default_policy: RateLimitPolicy::default(),
            endpoint_classes: HashMap::new(),
            idle_sweep_multiplier: 4,
            sweep_interval_seconds: 300,
        }
    }
}

/// Idempotency manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Default TTL applied when the caller does not supply one
    pub default_ttl_seconds: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 86_400,
        }
    }
}

impl IdempotencyConfig {
    pub fn default_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.default_ttl_seconds as i64)
    }
}

/// Retry backoff settings for re-queued failures
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
        }
    }
}

impl BackoffConfig {
    /// Exponential delay for the given retry attempt (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> chrono::Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        chrono::Duration::milliseconds(delay as i64)
    }
}

/// Scheduler/executor configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Interval between poll cycles
    pub poll_interval_ms: u64,

    /// Maximum tasks claimed per cycle
    pub batch_size: u32,

    /// Retry ceiling; a task failing this many times stays failed
    pub max_retries: u32,

    /// Per-dispatch handler timeout so a hung handler cannot starve the
    /// poll cycle
    pub handler_timeout_ms: u64,

    /// Running tasks whose `started_at` is older than this are reclaimed
    /// and re-queued (crash recovery)
    pub stale_task_timeout_seconds: u64,

    pub backoff: BackoffConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 25,
            max_retries: 3,
            handler_timeout_ms: 30_000,
            stale_task_timeout_seconds: 600,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn stale_task_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_task_timeout_seconds as i64)
    }
}

/// Action ledger configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ActionLogConfig {
    /// Retained entry ceiling; oldest entries are evicted first
    pub max_entries: usize,
}

impl Default for ActionLogConfig {
    fn default() -> Self {
        Self { max_entries: 10_000 }
    }
}

/// Trace manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TraceConfig {
    /// How long a terminal trace stays resident in memory before eviction
    pub retention_seconds: u64,

    /// Running traces older than this are failed by the reaper
    pub stale_trace_timeout_seconds: u64,

    /// How often the reaper sweeps
    pub reaper_interval_seconds: u64,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            retention_seconds: 60,
            stale_trace_timeout_seconds: 3_600,
            reaper_interval_seconds: 60,
        }
    }
}

impl TraceConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }

    pub fn stale_trace_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_trace_timeout_seconds as i64)
    }
}

/// Query API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:8080".to_string(),
        }
    }
}

impl AgentCoreConfig {
    /// Policy for an endpoint class, falling back to the default policy
    pub fn rate_limit_policy(&self, endpoint_class: &str) -> &RateLimitPolicy {
        self.rate_limits
            .endpoint_classes
            .get(endpoint_class)
            .unwrap_or(&self.rate_limits.default_policy)
    }

    /// Reject configurations that cannot run
    pub fn validate(&self) -> Result<()> {
        if self.rate_limits.default_policy.window_ms == 0 {
            return Err(AgentCoreError::Configuration(
                "rate_limits.default_policy.window_ms must be positive".to_string(),
            ));
        }
        if self.rate_limits.default_policy.max_requests == 0 {
            return Err(AgentCoreError::Configuration(
                "rate_limits.default_policy.max_requests must be positive".to_string(),
            ));
        }
        for (class, policy) in &self.rate_limits.endpoint_classes {
            if policy.window_ms == 0 || policy.max_requests == 0 {
                return Err(AgentCoreError::Configuration(format!(
                    "rate_limits.endpoint_classes.{class} must have positive window and limit"
                )));
            }
        }
        if self.executor.batch_size == 0 {
            return Err(AgentCoreError::Configuration(
                "executor.batch_size must be positive".to_string(),
            ));
        }
        if self.executor.handler_timeout_ms == 0 {
            return Err(AgentCoreError::Configuration(
                "executor.handler_timeout_ms must be positive".to_string(),
            ));
        }
        if self.executor.backoff.base_delay_ms > self.executor.backoff.max_delay_ms {
            return Err(AgentCoreError::Configuration(
                "executor.backoff.base_delay_ms exceeds max_delay_ms".to_string(),
            ));
        }
        if self.action_log.max_entries == 0 {
            return Err(AgentCoreError::Configuration(
                "action_log.max_entries must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from the conventional file locations, applying
    /// environment overlays. See [`loader`] for discovery rules.
    pub fn load() -> Result<Self> {
        loader::load_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentCoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.executor.max_retries, 3);
        assert_eq!(config.idempotency.default_ttl_seconds, 86_400);
    }

    #[test]
    fn test_policy_fallback_for_unknown_class() {
        let mut config = AgentCoreConfig::default();
        config.rate_limits.endpoint_classes.insert(
            "messaging".to_string(),
            RateLimitPolicy {
                window_ms: 60_000,
                max_requests: 20,
            },
        );

        assert_eq!(config.rate_limit_policy("messaging").max_requests, 20);
        assert_eq!(
            config.rate_limit_policy("unknown").max_requests,
            config.rate_limits.default_policy.max_requests
        );
    }

    #[test]
    fn test_validation_rejects_zero_window() {
        let mut config = AgentCoreConfig::default();
        config.rate_limits.default_policy.window_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let backoff = BackoffConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
        };

        assert_eq!(backoff.delay_for_attempt(1).num_milliseconds(), 1_000);
        assert_eq!(backoff.delay_for_attempt(2).num_milliseconds(), 2_000);
        assert_eq!(backoff.delay_for_attempt(3).num_milliseconds(), 4_000);
        assert_eq!(backoff.delay_for_attempt(10).num_milliseconds(), 10_000);
    }
}
