//! Shared configuration for the payment and annotation services.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::validate::DAILY_TRANSFER_CEILING;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway_base_url: String,
    pub record_store_base_url: String,
    pub poll_interval_ms: u64,
    pub max_poll_duration_ms: u64,
    pub refresh_interval_ms: u64,
    pub daily_ceiling: f64,
    pub comment_cache_cap: usize,
    pub transaction_fetch_limit: usize,
    pub request_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway_base_url: "http://localhost:5000/api".into(),
            record_store_base_url: "http://localhost:5000/api".into(),
            poll_interval_ms: 5_000,
            max_poll_duration_ms: 30 * 60 * 1_000,
            refresh_interval_ms: 5_000,
            daily_ceiling: DAILY_TRANSFER_CEILING,
            comment_cache_cap: 50,
            transaction_fetch_limit: 10,
            request_timeout_ms: 5_000,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

impl Config {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `MKOPO_GATEWAY_URL`, `MKOPO_RECORD_STORE_URL`: service base URLs
    /// - `MKOPO_POLL_INTERVAL_MS`: status poll cadence (default: 5000)
    /// - `MKOPO_MAX_POLL_DURATION_MS`: give up polling after this long (default: 30 min)
    /// - `MKOPO_REFRESH_INTERVAL_MS`: transaction list refresh cadence (default: 5000)
    /// - `MKOPO_DAILY_CEILING`: maximum single collection (default: 496500)
    /// - `MKOPO_COMMENT_CACHE_CAP`: local annotation entries kept per customer (default: 50)
    /// - `MKOPO_TRANSACTION_FETCH_LIMIT`: transactions fetched per refresh (default: 10)
    /// - `MKOPO_REQUEST_TIMEOUT_MS`: per-request HTTP timeout (default: 5000)
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            gateway_base_url: env_or("MKOPO_GATEWAY_URL", d.gateway_base_url),
            record_store_base_url: env_or("MKOPO_RECORD_STORE_URL", d.record_store_base_url),
            poll_interval_ms: env_or("MKOPO_POLL_INTERVAL_MS", d.poll_interval_ms),
            max_poll_duration_ms: env_or("MKOPO_MAX_POLL_DURATION_MS", d.max_poll_duration_ms),
            refresh_interval_ms: env_or("MKOPO_REFRESH_INTERVAL_MS", d.refresh_interval_ms),
            daily_ceiling: env_or("MKOPO_DAILY_CEILING", d.daily_ceiling),
            comment_cache_cap: env_or("MKOPO_COMMENT_CACHE_CAP", d.comment_cache_cap),
            transaction_fetch_limit: env_or(
                "MKOPO_TRANSACTION_FETCH_LIMIT",
                d.transaction_fetch_limit,
            ),
            request_timeout_ms: env_or("MKOPO_REQUEST_TIMEOUT_MS", d.request_timeout_ms),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, url) in [
            ("gateway_base_url", &self.gateway_base_url),
            ("record_store_base_url", &self.record_store_base_url),
        ] {
            if url.trim().is_empty() {
                return Err(invalid(field, "must not be empty"));
            }
        }
        for (field, ms) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("max_poll_duration_ms", self.max_poll_duration_ms),
            ("refresh_interval_ms", self.refresh_interval_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ] {
            if ms == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self.poll_interval_ms > self.max_poll_duration_ms {
            return Err(invalid(
                "poll_interval_ms",
                "must not exceed max_poll_duration_ms",
            ));
        }
        if !(self.daily_ceiling.is_finite() && self.daily_ceiling > 0.0) {
            return Err(invalid("daily_ceiling", "must be a positive number"));
        }
        if self.comment_cache_cap == 0 {
            return Err(invalid("comment_cache_cap", "must be greater than zero"));
        }
        if self.transaction_fetch_limit == 0 {
            return Err(invalid("transaction_fetch_limit", "must be greater than zero"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_duration(&self) -> Duration {
        Duration::from_millis(self.max_poll_duration_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}
