//! Retry configuration.
//!
//! Values come from a serialized document (durations in milliseconds, every
//! field optional) or from the environment:
//! - `VOLDRIVER_RETRY_INITIAL_MS`: wait after the first failure. Defaults to `500`.
//! - `VOLDRIVER_RETRY_MULTIPLIER`: growth factor, at least `1.0`. Defaults to `1.5`.
//! - `VOLDRIVER_RETRY_MAX_INTERVAL_MS`: cap on a single wait. Defaults to `10000`.
//! - `VOLDRIVER_RETRY_MAX_ELAPSED_MS`: budget for the whole loop. Defaults to `30000`.
//!
//! A malformed variable keeps the default for that field.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backoff::BackoffPolicy;

pub const ENV_INITIAL_MS: &str = "VOLDRIVER_RETRY_INITIAL_MS";
pub const ENV_MULTIPLIER: &str = "VOLDRIVER_RETRY_MULTIPLIER";
pub const ENV_MAX_INTERVAL_MS: &str = "VOLDRIVER_RETRY_MAX_INTERVAL_MS";
pub const ENV_MAX_ELAPSED_MS: &str = "VOLDRIVER_RETRY_MAX_ELAPSED_MS";

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(with = "millis")]
    pub initial_interval: Duration,
    pub multiplier: f64,
    #[serde(with = "millis")]
    pub max_interval: Duration,
    #[serde(with = "millis")]
    pub max_elapsed: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        BackoffPolicy::default().into()
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            initial_interval: read_millis(&lookup, ENV_INITIAL_MS)
                .unwrap_or(defaults.initial_interval),
            multiplier: read(&lookup, ENV_MULTIPLIER, |v| {
                v.parse::<f64>().ok().filter(|m| m.is_finite() && *m >= 1.0)
            })
            .unwrap_or(defaults.multiplier),
            max_interval: read_millis(&lookup, ENV_MAX_INTERVAL_MS)
                .unwrap_or(defaults.max_interval),
            max_elapsed: read_millis(&lookup, ENV_MAX_ELAPSED_MS).unwrap_or(defaults.max_elapsed),
        }
    }
}

fn read<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = lookup(key)?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        warn!(key, value = %raw, "ignoring invalid retry setting, using default");
    }
    parsed
}

fn read_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    read(lookup, key, |v| v.parse::<u64>().ok().map(Duration::from_millis))
}

impl From<RetryConfig> for BackoffPolicy {
    fn from(cfg: RetryConfig) -> Self {
        Self {
            initial_interval: cfg.initial_interval,
            multiplier: cfg.multiplier,
            max_interval: cfg.max_interval,
            max_elapsed: cfg.max_elapsed,
        }
    }
}

impl From<BackoffPolicy> for RetryConfig {
    fn from(policy: BackoffPolicy) -> Self {
        Self {
            initial_interval: policy.initial_interval,
            multiplier: policy.multiplier,
            max_interval: policy.max_interval,
            max_elapsed: policy.max_elapsed,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
