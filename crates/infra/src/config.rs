//! Configuration loading from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_URL` | unset (in-memory datastore) |
//! | `PAYRAIL_BACKOFF_BASE_SECS` | 300 |
//! | `PAYRAIL_BACKOFF_CAP_SECS` | 43200 |
//! | `PAYRAIL_TASK_MAX_AGE_SECS` | 86400 |
//! | `PAYRAIL_POLL_INTERVAL_MS` | 1000 |
//! | `PAYRAIL_DISPATCH_BATCH` | 100 |
//! | `PAYRAIL_DISPATCH_WORKERS` | 4 |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::tasks::{BackoffPolicy, DispatcherConfig};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Process configuration for the task engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayrailConfig {
    pub database_url: Option<String>,
    pub backoff: BackoffPolicy,
    pub poll_interval: Duration,
    pub dispatch_batch: usize,
    pub dispatch_workers: usize,
}

impl Default for PayrailConfig {
    fn default() -> Self {
        let dispatcher = DispatcherConfig::default();
        Self {
            database_url: None,
            backoff: BackoffPolicy::default(),
            poll_interval: dispatcher.poll_interval,
            dispatch_batch: dispatcher.batch_size,
            dispatch_workers: dispatcher.workers,
        }
    }
}

impl PayrailConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        if database_url.is_none() {
            warn!("DATABASE_URL not set; using in-memory datastore");
        }

        let base = parse_or(&lookup, "PAYRAIL_BACKOFF_BASE_SECS", defaults.backoff.base.as_secs())?;
        let cap = parse_or(&lookup, "PAYRAIL_BACKOFF_CAP_SECS", defaults.backoff.cap.as_secs())?;
        let max_age = parse_or(&lookup, "PAYRAIL_TASK_MAX_AGE_SECS", defaults.backoff.max_age.as_secs())?;
        if cap < base {
            return Err(ConfigError::Invalid {
                var: "PAYRAIL_BACKOFF_CAP_SECS",
                value: cap.to_string(),
                reason: format!("must be at least PAYRAIL_BACKOFF_BASE_SECS ({base})"),
            });
        }

        let poll_ms = parse_or(
            &lookup,
            "PAYRAIL_POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
        )?;
        let dispatch_batch = positive(
            parse_or(&lookup, "PAYRAIL_DISPATCH_BATCH", defaults.dispatch_batch)?,
            "PAYRAIL_DISPATCH_BATCH",
        )?;
        let dispatch_workers = positive(
            parse_or(&lookup, "PAYRAIL_DISPATCH_WORKERS", defaults.dispatch_workers)?,
            "PAYRAIL_DISPATCH_WORKERS",
        )?;

        Ok(Self {
            database_url,
            backoff: BackoffPolicy::new(
                Duration::from_secs(base),
                Duration::from_secs(cap),
                Duration::from_secs(max_age),
            ),
            poll_interval: Duration::from_millis(poll_ms),
            dispatch_batch,
            dispatch_workers,
        })
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: self.poll_interval,
            batch_size: self.dispatch_batch,
            workers: self.dispatch_workers,
            ..DispatcherConfig::default()
        }
    }
}

fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => {
            warn!(var, default = %default, "environment variable not set; using default");
            Ok(default)
        }
    }
}

fn positive(value: usize, var: &'static str) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var: &str| vars.get(var).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = PayrailConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PayrailConfig::default());
        assert_eq!(config.backoff.base, Duration::from_secs(300));
        assert_eq!(config.dispatcher().workers, 4);
    }

    #[test]
    fn reads_overrides() {
        let config = PayrailConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/payrail"),
            ("PAYRAIL_BACKOFF_BASE_SECS", "10"),
            ("PAYRAIL_BACKOFF_CAP_SECS", "60"),
            ("PAYRAIL_DISPATCH_WORKERS", " 8 "),
            ("PAYRAIL_POLL_INTERVAL_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/payrail"));
        assert_eq!(config.backoff.next_delay(10), Duration::from_secs(60));
        assert_eq!(config.dispatch_workers, 8);
        assert_eq!(config.dispatcher().poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn rejects_invalid_values() {
        match PayrailConfig::from_lookup(lookup(&[("PAYRAIL_DISPATCH_BATCH", "lots")])).unwrap_err() {
            ConfigError::Invalid { var: "PAYRAIL_DISPATCH_BATCH", .. } => {}
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(PayrailConfig::from_lookup(lookup(&[("PAYRAIL_DISPATCH_WORKERS", "0")])).is_err());
        assert!(
            PayrailConfig::from_lookup(lookup(&[
                ("PAYRAIL_BACKOFF_BASE_SECS", "600"),
                ("PAYRAIL_BACKOFF_CAP_SECS", "60"),
            ]))
            .is_err()
        );
    }
}
