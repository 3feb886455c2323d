//! Configuration object and the environment-variable overlay.
//!
//! DSN assembly from discrete `host`/`port`/`username`/... fields is an
//! external collaborator's job; this module only carries the opaque `dsn`
//! through, plus the sizing/retry/telemetry/probe knobs the core itself
//! consumes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_max_open() -> u32 {
    10
}
fn default_max_idle() -> u32 {
    2
}
fn default_conn_max_lifetime_secs() -> u64 {
    3600
}
fn default_conn_max_idle_time_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSizing {
    #[serde(default = "default_max_open")]
    pub max_open: u32,
    #[serde(default = "default_max_idle")]
    pub max_idle: u32,
    #[serde(default = "default_conn_max_lifetime_secs")]
    pub conn_max_lifetime_secs: u64,
    #[serde(default = "default_conn_max_idle_time_secs")]
    pub conn_max_idle_time_secs: u64,
}

impl Default for PoolSizing {
    fn default() -> Self {
        Self {
            max_open: default_max_open(),
            max_idle: default_max_idle(),
            conn_max_lifetime_secs: default_conn_max_lifetime_secs(),
            conn_max_idle_time_secs: default_conn_max_idle_time_secs(),
        }
    }
}

impl PoolSizing {
    pub fn conn_max_lifetime(&self) -> Option<Duration> {
        if self.conn_max_lifetime_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.conn_max_lifetime_secs))
        }
    }

    pub fn conn_max_idle_time(&self) -> Option<Duration> {
        if self.conn_max_idle_time_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.conn_max_idle_time_secs))
        }
    }

    /// `max_idle ≤ max_open` when both are non-zero, per the data-model
    /// invariant.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_open > 0 && self.max_idle > 0 && self.max_idle > self.max_open {
            return Err(format!(
                "pool.max_idle ({}) must not exceed pool.max_open ({})",
                self.max_idle, self.max_open
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_retry_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_retry_jitter")]
    pub jitter: bool,
    #[serde(default = "default_retry_max_elapsed_ms")]
    pub max_elapsed_ms: u64,
}

fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_base_backoff_ms() -> u64 {
    50
}
fn default_retry_max_backoff_ms() -> u64 {
    2_000
}
fn default_retry_multiplier() -> f64 {
    2.0
}
fn default_retry_jitter() -> bool {
    true
}
fn default_retry_max_elapsed_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_backoff_ms: default_retry_base_backoff_ms(),
            max_backoff_ms: default_retry_max_backoff_ms(),
            multiplier: default_retry_multiplier(),
            jitter: default_retry_jitter(),
            max_elapsed_ms: default_retry_max_elapsed_ms(),
        }
    }
}

impl From<&RetryConfig> for crate::retry::RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        crate::retry::RetryPolicy {
            max_attempts: c.max_attempts.max(1),
            base_backoff: Duration::from_millis(c.base_backoff_ms),
            max_backoff: Duration::from_millis(c.max_backoff_ms),
            multiplier: c.multiplier,
            jitter: c.jitter,
            max_elapsed: if c.max_elapsed_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(c.max_elapsed_ms))
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_service_version")]
    pub service_version: String,
}

fn default_service_name() -> String {
    "dbcore".into()
}
fn default_service_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: default_service_name(),
            service_version: default_service_version(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_probe_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_probe_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_probe_reconnect_enabled")]
    pub reconnect_enabled: bool,
    #[serde(default = "default_probe_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    #[serde(default = "default_probe_reconnect_initial_backoff_ms")]
    pub reconnect_initial_backoff_ms: u64,
    #[serde(default = "default_probe_reconnect_max_backoff_ms")]
    pub reconnect_max_backoff_ms: u64,
    #[serde(default = "default_probe_reconnect_multiplier")]
    pub reconnect_multiplier: f64,
    #[serde(default = "default_probe_reconnect_jitter")]
    pub reconnect_jitter: bool,
    #[serde(default = "default_probe_reconnect_max_elapsed_ms")]
    pub reconnect_max_elapsed_ms: u64,
}

fn default_probe_interval_ms() -> u64 {
    5_000
}
fn default_probe_timeout_ms() -> u64 {
    2_000
}
fn default_probe_failure_threshold() -> u32 {
    3
}
fn default_probe_success_threshold() -> u32 {
    1
}
fn default_probe_reconnect_enabled() -> bool {
    true
}
fn default_probe_reconnect_max_attempts() -> u32 {
    10
}
fn default_probe_reconnect_initial_backoff_ms() -> u64 {
    200
}
fn default_probe_reconnect_max_backoff_ms() -> u64 {
    30_000
}
fn default_probe_reconnect_multiplier() -> f64 {
    2.0
}
fn default_probe_reconnect_jitter() -> bool {
    true
}
fn default_probe_reconnect_max_elapsed_ms() -> u64 {
    300_000
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_probe_interval_ms(),
            timeout_ms: default_probe_timeout_ms(),
            failure_threshold: default_probe_failure_threshold(),
            success_threshold: default_probe_success_threshold(),
            reconnect_enabled: default_probe_reconnect_enabled(),
            reconnect_max_attempts: default_probe_reconnect_max_attempts(),
            reconnect_initial_backoff_ms: default_probe_reconnect_initial_backoff_ms(),
            reconnect_max_backoff_ms: default_probe_reconnect_max_backoff_ms(),
            reconnect_multiplier: default_probe_reconnect_multiplier(),
            reconnect_jitter: default_probe_reconnect_jitter(),
            reconnect_max_elapsed_ms: default_probe_reconnect_max_elapsed_ms(),
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_ms >= self.interval_ms {
            return Err(format!(
                "probe.timeout_ms ({}) must be less than probe.interval_ms ({})",
                self.timeout_ms, self.interval_ms
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Opaque connection string. The DSN-assembly helper (out of scope) is
    /// expected to have already folded `host`/`port`/`username`/... into
    /// this field; the core never parses host/port/username itself.
    pub dsn: String,
    #[serde(default)]
    pub pool: PoolSizing,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    /// Query duration beyond which a warn-level slow-query record and metric
    /// fire. Zero disables the check.
    #[serde(default)]
    pub slow_query_threshold_ms: u64,
    /// Statement cache capacity per connection handle. Zero disables caching.
    #[serde(default = "default_statement_cache_capacity")]
    pub statement_cache_capacity: usize,
}

fn default_statement_cache_capacity() -> usize {
    32
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.dsn.is_empty() {
            return Err("dsn must not be empty".into());
        }
        self.pool.validate()?;
        self.probe.validate()?;
        if self.retry.multiplier <= 1.0 {
            return Err("retry.multiplier must be > 1".into());
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err("retry.base_backoff_ms must be <= retry.max_backoff_ms".into());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be >= 1".into());
        }
        Ok(())
    }

    /// Overlays environment variables on top of the programmatic config.
    /// Each dotted option path is uppercased and joined with `_`
    /// (`pool.max_open` → `POOL_MAX_OPEN`), applied after the value already
    /// present on `self`. Unset or unparsable variables are left alone —
    /// this overlay never fails, it only fills in what it can.
    pub fn apply_env_overlay(mut self) -> Self {
        macro_rules! overlay {
            ($env_key:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env_key) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                    }
                }
            };
        }

        if let Ok(dsn) = std::env::var("DSN") {
            self.dsn = dsn;
        }
        overlay!("POOL_MAX_OPEN", self.pool.max_open);
        overlay!("POOL_MAX_IDLE", self.pool.max_idle);
        overlay!("POOL_CONN_MAX_LIFETIME", self.pool.conn_max_lifetime_secs);
        overlay!("POOL_CONN_MAX_IDLE_TIME", self.pool.conn_max_idle_time_secs);
        overlay!("RETRY_MAX_ATTEMPTS", self.retry.max_attempts);
        overlay!("RETRY_BASE_BACKOFF", self.retry.base_backoff_ms);
        overlay!("RETRY_MAX_BACKOFF", self.retry.max_backoff_ms);
        overlay!("RETRY_MULTIPLIER", self.retry.multiplier);
        overlay!("RETRY_JITTER", self.retry.jitter);
        overlay!("RETRY_MAX_ELAPSED", self.retry.max_elapsed_ms);
        overlay!("TELEMETRY_ENABLED", self.telemetry.enabled);
        overlay!("TELEMETRY_SERVICE_NAME", self.telemetry.service_name);
        overlay!("TELEMETRY_SERVICE_VERSION", self.telemetry.service_version);
        overlay!("SLOW_QUERY_THRESHOLD", self.slow_query_threshold_ms);
        overlay!("STATEMENT_CACHE_CAPACITY", self.statement_cache_capacity);
        overlay!("PROBE_ENABLED", self.probe.enabled);
        overlay!("PROBE_INTERVAL", self.probe.interval_ms);
        overlay!("PROBE_TIMEOUT", self.probe.timeout_ms);
        overlay!("PROBE_FAILURE_THRESHOLD", self.probe.failure_threshold);
        overlay!("PROBE_SUCCESS_THRESHOLD", self.probe.success_threshold);
        overlay!("PROBE_RECONNECT_ENABLED", self.probe.reconnect_enabled);
        overlay!("PROBE_RECONNECT_MAX_ATTEMPTS", self.probe.reconnect_max_attempts);
        overlay!("PROBE_RECONNECT_INITIAL_BACKOFF", self.probe.reconnect_initial_backoff_ms);
        overlay!("PROBE_RECONNECT_MAX_BACKOFF", self.probe.reconnect_max_backoff_ms);
        overlay!("PROBE_RECONNECT_MULTIPLIER", self.probe.reconnect_multiplier);
        overlay!("PROBE_RECONNECT_JITTER", self.probe.reconnect_jitter);
        overlay!("PROBE_RECONNECT_MAX_ELAPSED", self.probe.reconnect_max_elapsed_ms);

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_max_idle_greater_than_max_open() {
        let sizing = PoolSizing {
            max_open: 2,
            max_idle: 5,
            ..PoolSizing::default()
        };
        assert!(sizing.validate().is_err());
    }

    #[test]
    fn zero_max_open_disables_the_idle_check() {
        let sizing = PoolSizing {
            max_open: 0,
            max_idle: 5,
            ..PoolSizing::default()
        };
        assert!(sizing.validate().is_ok());
    }

    #[test]
    fn probe_requires_timeout_shorter_than_interval() {
        let probe = ProbeConfig {
            interval_ms: 100,
            timeout_ms: 100,
            ..ProbeConfig::default()
        };
        assert!(probe.validate().is_err());
    }

    #[test]
    fn env_overlay_applies_after_programmatic_value() {
        std::env::set_var("POOL_MAX_OPEN", "42");
        let cfg = Config {
            dsn: "mysql://localhost/test".into(),
            ..Config::default()
        }
        .apply_env_overlay();
        assert_eq!(cfg.pool.max_open, 42);
        std::env::remove_var("POOL_MAX_OPEN");
    }
}
