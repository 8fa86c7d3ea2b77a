//! Runtime configuration loaded from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `AEON_PORT` | `3000` |
//! | `AEON_EXPIRATION_TIME_MS` | `15000` |
//! | `AEON_MISSED_DOMAIN_EVENT_RECOVERY_INTERVAL_MS` | `30000` |
//! | `AEON_HEARTBEAT_INTERVAL_MS` | `90000` |
//! | `AEON_QUEUE_POLL_INTERVAL_MS` | `500` |
//! | `AEON_USE_PERSISTENT_STORES` | `false` |
//! | `DATABASE_URL` | required when persistent |
//! | `AEON_FLOWS` | `{}` (JSON: flow name → event patterns) |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::flows::{FlowError, FlowRegistry};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set when AEON_USE_PERSISTENT_STORES=true")]
    Missing(&'static str),

    #[error("invalid AEON_FLOWS: {0}")]
    Flows(#[from] FlowError),
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub port: u16,
    /// Lease lifetime of a queue item (`priorityQueueStoreOptions.expirationTime`).
    pub expiration_time: Duration,
    pub missed_domain_event_recovery_interval: Duration,
    pub heartbeat_interval: Duration,
    pub queue_poll_interval: Duration,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub flows: FlowRegistry,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            expiration_time: Duration::from_millis(15_000),
            missed_domain_event_recovery_interval: Duration::from_millis(30_000),
            heartbeat_interval: Duration::from_millis(90_000),
            queue_poll_interval: Duration::from_millis(500),
            use_persistent_stores: false,
            database_url: None,
            flows: FlowRegistry::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map instead of the environment).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = parse_or(&lookup, "AEON_PORT", defaults.port)?;
        let expiration_time = millis_or(&lookup, "AEON_EXPIRATION_TIME_MS", defaults.expiration_time)?;
        let missed_domain_event_recovery_interval = millis_or(
            &lookup,
            "AEON_MISSED_DOMAIN_EVENT_RECOVERY_INTERVAL_MS",
            defaults.missed_domain_event_recovery_interval,
        )?;
        let heartbeat_interval =
            millis_or(&lookup, "AEON_HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval)?;
        let queue_poll_interval =
            millis_or(&lookup, "AEON_QUEUE_POLL_INTERVAL_MS", defaults.queue_poll_interval)?;
        let use_persistent_stores = parse_or(
            &lookup,
            "AEON_USE_PERSISTENT_STORES",
            defaults.use_persistent_stores,
        )?;

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let flows = match lookup("AEON_FLOWS") {
            Some(raw) if !raw.trim().is_empty() => FlowRegistry::from_json(&raw)?,
            _ => defaults.flows,
        };

        Ok(Self {
            port,
            expiration_time,
            missed_domain_event_recovery_interval,
            heartbeat_interval,
            queue_poll_interval,
            use_persistent_stores,
            database_url,
            flows,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn millis_or<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let millis = parse_or(lookup, key, default.as_millis() as u64)?;
    if millis == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: millis.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(millis))
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
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.expiration_time, Duration::from_millis(15_000));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(90_000));
        assert!(!config.use_persistent_stores);
        assert!(config.flows.is_empty());
    }

    #[test]
    fn reads_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("AEON_PORT", "4000"),
            ("AEON_EXPIRATION_TIME_MS", "250"),
            ("AEON_FLOWS", r#"{"sampleFlow":["sampleContext.*.*"]}"#),
        ]))
        .unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.expiration_time, Duration::from_millis(250));
        assert_eq!(config.flows.discriminators().collect::<Vec<_>>(), vec!["sampleFlow"]);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            RuntimeConfig::from_lookup(lookup(&[("AEON_PORT", "not-a-port")])),
            Err(ConfigError::Invalid { key: "AEON_PORT", .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_lookup(lookup(&[("AEON_HEARTBEAT_INTERVAL_MS", "0")])),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_lookup(lookup(&[("AEON_FLOWS", "nope")])),
            Err(ConfigError::Flows(_))
        ));
    }

    #[test]
    fn persistent_stores_need_database_url() {
        assert!(matches!(
            RuntimeConfig::from_lookup(lookup(&[("AEON_USE_PERSISTENT_STORES", "true")])),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
    }
}
