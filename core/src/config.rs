//! Aggregate configuration
//!
//! serde covers the syntax, [`ResilienceConfig::validate`] the semantics. Validation
//! reports every problem at once instead of stopping at the first.
//!
//! ```toml
//! [breaker]
//! failure_threshold = 5
//! reset_timeout_ms = 30000
//!
//! [rate_limit]
//! max_requests = 1200
//! window_ms = 60000
//! weights = { place_order = 1, order_book = 10 }
//!
//! [connection]
//! max_reconnect_attempts = 20
//! ```

use crate::{
    circuit::Config,
    connection::ConnectionConfig,
    errors::ConfigError,
    rate_limiter::RateLimiterConfig,
    registry::{BreakerRegistry, LimiterRegistry},
    retry::RetryConfig,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub breaker: Config,
    pub rate_limit: RateLimiterConfig,
    pub retry: RetryConfig,
    pub connection: ConnectionConfig,
}

impl ResilienceConfig {
    /// Parse and validate. Missing sections and keys take their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: ResilienceConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        check_breaker(&self.breaker, &mut errors);
        check_rate_limit(&self.rate_limit, &mut errors);
        check_retry(&self.retry, &mut errors);
        check_connection(&self.connection, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    pub fn breaker_registry(&self) -> BreakerRegistry {
        BreakerRegistry::new(self.breaker.clone())
    }

    pub fn limiter_registry(&self) -> LimiterRegistry {
        LimiterRegistry::new(self.rate_limit.clone())
    }
}

fn check_breaker(config: &Config, errors: &mut Vec<String>) {
    if config.failure_threshold.is_none() && config.error_threshold_percentage.is_none() {
        errors.push("breaker: failure_threshold and error_threshold_percentage are both disabled".into());
    }
    if config.failure_threshold == Some(0) {
        errors.push("breaker.failure_threshold must be at least 1".into());
    }
    if let Some(percentage) = config.error_threshold_percentage {
        if !(percentage > 0.0 && percentage <= 100.0) {
            errors.push(format!(
                "breaker.error_threshold_percentage must be in (0, 100], got {percentage}"
            ));
        }
    }
    if config.success_threshold == 0 {
        errors.push("breaker.success_threshold must be at least 1".into());
    }
    if config.time_window_ms == 0 {
        errors.push("breaker.time_window_ms must be greater than 0".into());
    }
    if config.half_open_max_probes == 0 {
        errors.push("breaker.half_open_max_probes must be at least 1".into());
    }
    if !(0.0..=1.0).contains(&config.jitter_factor) {
        errors.push(format!(
            "breaker.jitter_factor must be in [0, 1], got {}",
            config.jitter_factor
        ));
    }
}

fn check_rate_limit(config: &RateLimiterConfig, errors: &mut Vec<String>) {
    if config.max_requests == 0 {
        errors.push("rate_limit.max_requests must be greater than 0".into());
    }
    if config.window_ms == 0 {
        errors.push("rate_limit.window_ms must be greater than 0".into());
    }
    let mut oversized: Vec<_> = config
        .weights
        .iter()
        .filter(|(_, weight)| *weight == 0 || *weight > config.max_requests)
        .map(|(operation, weight)| format!("rate_limit.weights.{operation} = {weight} is outside 1..={}", config.max_requests))
        .collect();
    oversized.sort();
    errors.extend(oversized);
}

fn check_retry(config: &RetryConfig, errors: &mut Vec<String>) {
    if config.max_attempts == 0 {
        errors.push("retry.max_attempts must be at least 1".into());
    }
    if config.max_delay_ms < config.base_delay_ms {
        errors.push(format!(
            "retry.max_delay_ms ({}) is below base_delay_ms ({})",
            config.max_delay_ms, config.base_delay_ms
        ));
    }
    if config.multiplier < 1.0 {
        errors.push(format!("retry.multiplier must be at least 1, got {}", config.multiplier));
    }
    if !(0.0..=1.0).contains(&config.jitter_factor) {
        errors.push(format!(
            "retry.jitter_factor must be in [0, 1], got {}",
            config.jitter_factor
        ));
    }
}

fn check_connection(config: &ConnectionConfig, errors: &mut Vec<String>) {
    if config.connect_timeout_ms == 0 {
        errors.push("connection.connect_timeout_ms must be greater than 0".into());
    }
    if config.max_reconnect_delay_ms < config.reconnect_delay_ms {
        errors.push(format!(
            "connection.max_reconnect_delay_ms ({}) is below reconnect_delay_ms ({})",
            config.max_reconnect_delay_ms, config.reconnect_delay_ms
        ));
    }
    if config.queue_capacity == 0 {
        errors.push("connection.queue_capacity must be greater than 0".into());
    }
}
