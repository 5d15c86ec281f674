//! Environment configuration.
//!
//! # Required variables
//!
//! - `HERALD_SERVICE_NAME`: written into every outbox row as `source_service`
//! - `HERALD_DATABASE_URL`: Postgres connection string
//!
//! # Optional variables
//!
//! | variable | default |
//! |----------|---------|
//! | `HERALD_REDIS_URL` | unset (in-memory broker) |
//! | `HERALD_DB_MAX_CONNECTIONS` | 10 |
//! | `HERALD_OUTBOX_BATCH_SIZE` | 100 |
//! | `HERALD_OUTBOX_POLL_INTERVAL_MS` | 1000 |
//! | `HERALD_OUTBOX_MAX_RETRIES` | 3 |
//! | `HERALD_RETRY_BASE_DELAY_MS` | 1000 |
//! | `HERALD_RETRY_MULTIPLIER` | 2.0 |
//! | `HERALD_RETRY_MAX_DELAY_MS` | 300000 |
//! | `HERALD_CLEANUP_INTERVAL_SECS` | 3600 |
//! | `HERALD_PROCESSED_RETENTION_HOURS` | 168 |
//! | `HERALD_FAILED_RETENTION_HOURS` | 720 |
//! | `HERALD_PROCESSING_TIMEOUT_SECS` | 300 |
//! | `HERALD_PUBLISH_TIMEOUT_MS` | 10000 |
//! | `HERALD_EXCHANGE` | `herald.events` |
//! | `HERALD_PREFETCH_COUNT` | 10 |
//! | `HERALD_BREAKER_ERROR_PERCENTAGE` | 50 |
//! | `HERALD_BREAKER_REQUEST_VOLUME` | 10 |
//! | `HERALD_BREAKER_RECOVERY_TIMEOUT_SECS` | 30 |
//! | `HERALD_BREAKER_SUCCESS_THRESHOLD` | 3 |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use herald_core::Backoff;
use herald_events::{CircuitBreakerConfig, EventBusConfig};

use crate::outbox::OutboxConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration: {var}")]
    MissingRequired { var: String },

    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Process-level settings, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub service_name: String,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub db_max_connections: u32,

    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_multiplier: f64,
    pub retry_max_delay: Duration,
    pub cleanup_interval: Duration,
    pub processed_retention: Duration,
    pub failed_retention: Duration,
    pub processing_timeout: Duration,
    pub publish_timeout: Duration,

    pub exchange: String,
    pub prefetch_count: u16,

    pub breaker_error_percentage: f64,
    pub breaker_request_volume: u32,
    pub breaker_recovery_timeout: Duration,
    pub breaker_success_threshold: u32,
}

/// Reads variables through a lookup function so tests need not touch the
/// process environment.
struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn required(&self, var: &str) -> Result<String> {
        match (self.lookup)(var) {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(ConfigError::MissingRequired {
                var: var.to_string(),
            }),
        }
    }

    fn optional(&self, var: &str) -> Option<String> {
        (self.lookup)(var).filter(|value| !value.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, var: &str, default: T) -> Result<T> {
        match self.optional(var) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: var.to_string(),
                value,
            }),
        }
    }

    fn millis(&self, var: &str, default: u64) -> Result<Duration> {
        self.parse(var, default).map(Duration::from_millis)
    }

    fn secs(&self, var: &str, default: u64) -> Result<Duration> {
        self.parse(var, default).map(Duration::from_secs)
    }

    fn hours(&self, var: &str, default: u64) -> Result<Duration> {
        self.parse::<u64>(var, default)
            .map(|hours| Duration::from_secs(hours.saturating_mul(3600)))
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars { lookup };
        let settings = Self {
            service_name: vars.required("HERALD_SERVICE_NAME")?,
            database_url: vars.required("HERALD_DATABASE_URL")?,
            redis_url: vars.optional("HERALD_REDIS_URL"),
            db_max_connections: vars.parse("HERALD_DB_MAX_CONNECTIONS", 10)?,

            batch_size: vars.parse("HERALD_OUTBOX_BATCH_SIZE", 100)?,
            poll_interval: vars.millis("HERALD_OUTBOX_POLL_INTERVAL_MS", 1000)?,
            max_retries: vars.parse("HERALD_OUTBOX_MAX_RETRIES", 3)?,
            retry_base_delay: vars.millis("HERALD_RETRY_BASE_DELAY_MS", 1000)?,
            retry_multiplier: vars.parse("HERALD_RETRY_MULTIPLIER", 2.0)?,
            retry_max_delay: vars.millis("HERALD_RETRY_MAX_DELAY_MS", 300_000)?,
            cleanup_interval: vars.secs("HERALD_CLEANUP_INTERVAL_SECS", 3600)?,
            processed_retention: vars.hours("HERALD_PROCESSED_RETENTION_HOURS", 7 * 24)?,
            failed_retention: vars.hours("HERALD_FAILED_RETENTION_HOURS", 30 * 24)?,
            processing_timeout: vars.secs("HERALD_PROCESSING_TIMEOUT_SECS", 300)?,
            publish_timeout: vars.millis("HERALD_PUBLISH_TIMEOUT_MS", 10_000)?,

            exchange: vars
                .optional("HERALD_EXCHANGE")
                .unwrap_or_else(|| "herald.events".to_string()),
            prefetch_count: vars.parse("HERALD_PREFETCH_COUNT", 10)?,

            breaker_error_percentage: vars.parse("HERALD_BREAKER_ERROR_PERCENTAGE", 50.0)?,
            breaker_request_volume: vars.parse("HERALD_BREAKER_REQUEST_VOLUME", 10)?,
            breaker_recovery_timeout: vars.secs("HERALD_BREAKER_RECOVERY_TIMEOUT_SECS", 30)?,
            breaker_success_threshold: vars.parse("HERALD_BREAKER_SUCCESS_THRESHOLD", 3)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(ConfigError::Validation(msg.to_string()));

        if self.batch_size == 0 {
            return fail("outbox batch size must be at least 1");
        }
        if self.poll_interval.is_zero() || self.cleanup_interval.is_zero() {
            return fail("poll and cleanup intervals must be non-zero");
        }
        if self.publish_timeout.is_zero() {
            return fail("publish timeout must be non-zero");
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            return fail("retry multiplier must be >= 1.0");
        }
        if self.retry_base_delay > self.retry_max_delay {
            return fail("retry base delay must not exceed the max delay");
        }
        if self.failed_retention < self.processed_retention {
            return fail("failed retention must be at least the processed retention");
        }
        if self.prefetch_count == 0 {
            return fail("prefetch count must be at least 1");
        }
        if !(self.breaker_error_percentage > 0.0 && self.breaker_error_percentage <= 100.0) {
            return fail("breaker error percentage must be in (0, 100]");
        }
        if self.breaker_request_volume == 0 || self.breaker_success_threshold == 0 {
            return fail("breaker request volume and success threshold must be at least 1");
        }
        self.circuit_breaker_config()
            .validate()
            .map_err(|err| ConfigError::Validation(format!("breaker: {err}")))?;
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.retry_base_delay, self.retry_multiplier, self.retry_max_delay)
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_error_percentage(self.breaker_error_percentage)
            .with_test_request_volume(self.breaker_request_volume)
            .with_recovery_timeout(self.breaker_recovery_timeout)
            .with_success_threshold(self.breaker_success_threshold)
    }

    pub fn event_bus_config(&self) -> EventBusConfig {
        EventBusConfig::default()
            .with_default_exchange(&self.exchange)
            .with_prefetch_count(self.prefetch_count)
            .with_retry_backoff(self.backoff())
            .with_circuit_breaker(self.circuit_breaker_config())
    }

    pub fn outbox_config(&self) -> OutboxConfig {
        OutboxConfig::default()
            .with_source_service(&self.service_name)
            .with_batch_size(self.batch_size)
            .with_poll_interval(self.poll_interval)
            .with_backoff(self.backoff())
            .with_default_max_retries(self.max_retries)
            .with_cleanup_interval(self.cleanup_interval)
            .with_retention(self.processed_retention, self.failed_retention)
            .with_processing_timeout(self.processing_timeout)
            .with_publish_timeout(self.publish_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("HERALD_SERVICE_NAME", "orders"),
        ("HERALD_DATABASE_URL", "postgres://localhost/orders"),
    ];

    #[test]
    fn defaults_apply_when_only_required_vars_are_set() {
        let settings = Settings::from_lookup(lookup(&REQUIRED)).unwrap();

        assert_eq!(settings.service_name, "orders");
        assert_eq!(settings.redis_url, None);
        assert_eq!(settings.batch_size, 100);
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.processed_retention, Duration::from_secs(7 * 24 * 3600));

        let outbox = settings.outbox_config();
        assert_eq!(outbox.source_service, "orders");
        assert_eq!(outbox.default_max_retries, 3);
        assert_eq!(outbox.publish_timeout, Duration::from_secs(10));

        let bus = settings.event_bus_config();
        assert_eq!(bus.default_exchange, "herald.events");
        assert_eq!(bus.circuit_breaker.test_request_volume, 10);
    }

    #[test]
    fn missing_required_var_is_named() {
        let err = Settings::from_lookup(lookup(&[("HERALD_SERVICE_NAME", "orders")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingRequired {
                var: "HERALD_DATABASE_URL".to_string()
            }
        );
    }

    #[test]
    fn unparsable_value_is_reported() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("HERALD_OUTBOX_BATCH_SIZE", "lots"));
        let err = Settings::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var, value }
            if var == "HERALD_OUTBOX_BATCH_SIZE" && value == "lots"));
    }

    #[test]
    fn inconsistent_values_fail_validation() {
        for (var, value) in [
            ("HERALD_OUTBOX_BATCH_SIZE", "0"),
            ("HERALD_RETRY_MULTIPLIER", "0.5"),
            ("HERALD_RETRY_BASE_DELAY_MS", "900000"),
            ("HERALD_BREAKER_ERROR_PERCENTAGE", "150"),
            ("HERALD_FAILED_RETENTION_HOURS", "1"),
            ("HERALD_BREAKER_SUCCESS_THRESHOLD", "11"),
            ("HERALD_PUBLISH_TIMEOUT_MS", "0"),
        ] {
            let mut pairs = REQUIRED.to_vec();
            pairs.push((var, value));
            let result = Settings::from_lookup(lookup(&pairs));
            assert!(matches!(result, Err(ConfigError::Validation(_))), "{var}={value}");
        }
    }

    #[test]
    fn success_threshold_may_not_exceed_request_volume() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("HERALD_BREAKER_REQUEST_VOLUME", "2"),
            ("HERALD_BREAKER_SUCCESS_THRESHOLD", "3"),
        ]);
        let err = Settings::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(&err, ConfigError::Validation(msg) if msg.contains("success threshold")));

        pairs.push(("HERALD_BREAKER_REQUEST_VOLUME", "3"));
        assert!(Settings::from_lookup(lookup(&pairs)).is_ok());
    }

    #[test]
    fn overrides_flow_into_component_configs() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("HERALD_REDIS_URL", "redis://cache:6379"),
            ("HERALD_RETRY_BASE_DELAY_MS", "250"),
            ("HERALD_RETRY_MAX_DELAY_MS", "1000"),
            ("HERALD_BREAKER_SUCCESS_THRESHOLD", "5"),
            ("HERALD_PREFETCH_COUNT", "32"),
        ]);
        let settings = Settings::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(settings.redis_url.as_deref(), Some("redis://cache:6379"));
        let backoff = settings.outbox_config().backoff;
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_millis(1000));

        let bus = settings.event_bus_config();
        assert_eq!(bus.prefetch_count, 32);
        assert_eq!(bus.circuit_breaker.success_threshold, 5);
    }
}
