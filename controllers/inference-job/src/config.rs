//! Controller configuration.
//!
//! Loaded from environment variables at startup:
//! - `WATCH_NAMESPACE`: namespace to watch (all namespaces when unset)
//! - `WORKER_THREADS`: number of concurrent workers (default 2)
//! - `MAX_CONFLICT_RETRIES`: consecutive ownership-conflict retries before a key drops to the slowest retry rate (default 15)
//! - `QUEUE_BASE_DELAY_MS`: first retry delay of a failing key (default 5)
//! - `QUEUE_MAX_DELAY_SECS`: retry delay ceiling (default 1000)
//! - `QUEUE_QPS`: sustained retries per second across all keys (default 10)
//! - `QUEUE_BURST`: retries allowed at once before `QUEUE_QPS` applies (default 100)

use crate::backoff::{DEFAULT_BASE_DELAY, DEFAULT_BURST, DEFAULT_MAX_DELAY, DEFAULT_QPS};
use crate::error::ControllerError;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace to watch, `None` for all namespaces
    pub namespace: Option<String>,
    /// Number of concurrent workers
    pub workers: usize,
    /// Consecutive ownership-conflict retries at the per-key backoff before
    /// the key is only retried at `max_delay`
    pub max_conflict_retries: u32,
    /// First retry delay of a failing key
    pub base_delay: Duration,
    /// Retry delay ceiling
    pub max_delay: Duration,
    /// Sustained retries per second across all keys
    pub qps: u32,
    /// Retries allowed at once across all keys
    pub burst: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 2,
            max_conflict_retries: 15,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            qps: DEFAULT_QPS,
            burst: DEFAULT_BURST,
        }
    }
}

fn parse<T: FromStr>(name: &str, value: Option<String>) -> Result<Option<T>, ControllerError> {
    value
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| {
                ControllerError::InvalidConfig(format!("{name} must be a number, got {raw:?}"))
            })
        })
        .transpose()
}

impl ControllerConfig {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads the configuration from `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.trim().is_empty());
        let workers = parse::<usize>("WORKER_THREADS", lookup("WORKER_THREADS"))?
            .unwrap_or(defaults.workers);
        if workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "WORKER_THREADS must be at least 1".to_string(),
            ));
        }
        let max_conflict_retries = parse::<u32>("MAX_CONFLICT_RETRIES", lookup("MAX_CONFLICT_RETRIES"))?
            .unwrap_or(defaults.max_conflict_retries);
        let base_delay = parse::<u64>("QUEUE_BASE_DELAY_MS", lookup("QUEUE_BASE_DELAY_MS"))?
            .map_or(defaults.base_delay, Duration::from_millis);
        let max_delay = parse::<u64>("QUEUE_MAX_DELAY_SECS", lookup("QUEUE_MAX_DELAY_SECS"))?
            .map_or(defaults.max_delay, Duration::from_secs);
        if base_delay > max_delay {
            return Err(ControllerError::InvalidConfig(format!(
                "QUEUE_BASE_DELAY_MS ({base_delay:?}) exceeds QUEUE_MAX_DELAY_SECS ({max_delay:?})"
            )));
        }

        let qps = parse::<u32>("QUEUE_QPS", lookup("QUEUE_QPS"))?.unwrap_or(defaults.qps);
        if qps == 0 {
            return Err(ControllerError::InvalidConfig(
                "QUEUE_QPS must be at least 1".to_string(),
            ));
        }
        let burst = parse::<u32>("QUEUE_BURST", lookup("QUEUE_BURST"))?.unwrap_or(defaults.burst);

        Ok(Self {
            namespace,
            workers,
            max_conflict_retries,
            base_delay,
            max_delay,
            qps,
            burst,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ControllerConfig, ControllerError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ControllerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.workers, 2);
        assert_eq!(config.namespace, None);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("WATCH_NAMESPACE", "ml"),
            ("WORKER_THREADS", "8"),
            ("MAX_CONFLICT_RETRIES", "3"),
            ("QUEUE_BASE_DELAY_MS", "100"),
            ("QUEUE_MAX_DELAY_SECS", "60"),
            ("QUEUE_QPS", "50"),
            ("QUEUE_BURST", "500"),
        ])
        .unwrap();

        assert_eq!(config.namespace.as_deref(), Some("ml"));
        assert_eq!(config.workers, 8);
        assert_eq!(config.max_conflict_retries, 3);
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert_eq!(config.qps, 50);
        assert_eq!(config.burst, 500);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            load(&[("WORKER_THREADS", "two")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            load(&[("WORKER_THREADS", "0")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            load(&[("QUEUE_QPS", "0")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            load(&[("QUEUE_BASE_DELAY_MS", "120000"), ("QUEUE_MAX_DELAY_SECS", "1")]),
            Err(ControllerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_blank_namespace_means_all() {
        let config = load(&[("WATCH_NAMESPACE", "  ")]).unwrap();
        assert_eq!(config.namespace, None);
    }
}
