//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use fulfillment::FulfillmentPolicy;
use resilience::{CircuitBreakerConfig, RetryPolicy};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} has an invalid value: {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("{0} must be set when SHIPMENT_API_URL is set")]
    Missing(&'static str),
}

/// Credentials for the HTTP shipment provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipmentApiConfig {
    pub base_url: String,
    pub email: String,
    pub password: String,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `DATABASE_URL`: PostgreSQL store; in-memory when unset
/// - `RESERVATION_TTL_MINUTES`, `SHIPMENT_LOCK_TTL_SECS`, `PAYMENT_MAX_ATTEMPTS`
/// - `RETRY_BASE_DELAY_MS`, `RETRY_MAX_DELAY_MS`, `RETRY_MULTIPLIER`
/// - `BREAKER_FAILURE_THRESHOLD`, `BREAKER_RECOVERY_SECS`
/// - `MAINTENANCE_INTERVAL_SECS`
/// - `SHIPMENT_API_URL`, `SHIPMENT_API_EMAIL`, `SHIPMENT_API_PASSWORD`:
///   HTTP shipment provider; in-memory when unset
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub reservation_ttl_minutes: i64,
    pub shipment_lock_ttl_secs: i64,
    pub payment_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_multiplier: f64,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_secs: u64,
    pub maintenance_interval_secs: u64,
    pub shipment_api: Option<ShipmentApiConfig>,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let shipment_api = match lookup("SHIPMENT_API_URL") {
            Some(base_url) => Some(ShipmentApiConfig {
                base_url,
                email: lookup("SHIPMENT_API_EMAIL").ok_or(ConfigError::Missing("SHIPMENT_API_EMAIL"))?,
                password: lookup("SHIPMENT_API_PASSWORD")
                    .ok_or(ConfigError::Missing("SHIPMENT_API_PASSWORD"))?,
            }),
            None => None,
        };

        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parsed(&lookup, "PORT", defaults.port)?,
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: lookup("DATABASE_URL"),
            reservation_ttl_minutes: parsed(
                &lookup,
                "RESERVATION_TTL_MINUTES",
                defaults.reservation_ttl_minutes,
            )?,
            shipment_lock_ttl_secs: parsed(
                &lookup,
                "SHIPMENT_LOCK_TTL_SECS",
                defaults.shipment_lock_ttl_secs,
            )?,
            payment_max_attempts: parsed(
                &lookup,
                "PAYMENT_MAX_ATTEMPTS",
                defaults.payment_max_attempts,
            )?,
            retry_base_delay_ms: parsed(&lookup, "RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms)?,
            retry_max_delay_ms: parsed(&lookup, "RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms)?,
            retry_multiplier: parsed(&lookup, "RETRY_MULTIPLIER", defaults.retry_multiplier)?,
            breaker_failure_threshold: parsed(
                &lookup,
                "BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold,
            )?,
            breaker_recovery_secs: parsed(
                &lookup,
                "BREAKER_RECOVERY_SECS",
                defaults.breaker_recovery_secs,
            )?,
            maintenance_interval_secs: parsed(
                &lookup,
                "MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval_secs,
            )?,
            shipment_api,
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: RetryPolicy::default().max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_multiplier: self.retry_multiplier,
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            recovery_timeout: Duration::from_secs(self.breaker_recovery_secs),
        }
    }

    pub fn policy(&self) -> FulfillmentPolicy {
        FulfillmentPolicy {
            reservation_ttl: chrono::Duration::minutes(self.reservation_ttl_minutes),
            shipment_lock_ttl: chrono::Duration::seconds(self.shipment_lock_ttl_secs),
            payment_max_attempts: self.payment_max_attempts,
            retry: self.retry_policy(),
        }
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            reservation_ttl_minutes: 15,
            shipment_lock_ttl_secs: 180,
            payment_max_attempts: 3,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 5000,
            retry_multiplier: 2.0,
            breaker_failure_threshold: 5,
            breaker_recovery_secs: 30,
            maintenance_interval_secs: 60,
            shipment_api: None,
        }
    }
}

fn parsed<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}
