//! Environment configuration recognized by the core

use std::time::Duration;

use tracing::warn;

/// Environment keys the core recognizes
const RECOGNIZED_KEYS: &[&str] = &[
    "WORKER_CAPACITY",
    "WORKER_TIMEOUT_SECONDS",
    "WORKER_MAX_RETRIES",
    "WORKER_RETRY_BACKOFF_SECONDS",
    "WORKER_HEARTBEAT_INTERVAL_SECONDS",
    "WORKER_DEAD_TIMEOUT_SECONDS",
    "TASK_DEFAULT_PRIORITY",
    "SCHEDULER_POLL_INTERVAL",
    "DLQ_ENABLED",
    "BREAKER_FAILURE_THRESHOLD",
    "BREAKER_RECOVERY_TIMEOUT",
];

/// Prefixes scanned for unknown-key warnings
const SCANNED_PREFIXES: &[&str] = &["WORKER_", "TASK_", "SCHEDULER_", "DLQ_", "BREAKER_"];

/// Core configuration with environment-variable defaults
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Default capacity for new workers
    pub worker_capacity: u32,

    /// Default per-attempt execution timeout
    pub worker_timeout: Duration,

    /// Default retry ceiling
    pub max_retries: u32,

    /// Base delay for exponential/linear backoff
    pub retry_backoff: Duration,

    /// Expected heartbeat cadence
    pub heartbeat_interval: Duration,

    /// Heartbeat age after which a worker is considered dead
    pub dead_timeout: Duration,

    /// Priority assigned when the submitter omits or exceeds the range
    pub default_priority: i32,

    /// Scheduler sweep interval
    pub scheduler_poll_interval: Duration,

    /// Route terminal failures to the dead-letter queue
    pub dlq_enabled: bool,

    /// Default breaker failure threshold
    pub breaker_failure_threshold: u32,

    /// Default breaker recovery timeout
    pub breaker_recovery_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            worker_capacity: 5,
            worker_timeout: Duration::from_secs(300),
            max_retries: 5,
            retry_backoff: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            dead_timeout: Duration::from_secs(30),
            default_priority: 5,
            scheduler_poll_interval: Duration::from_secs(60),
            dlq_enabled: true,
            breaker_failure_threshold: 5,
            breaker_recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CoreConfig {
    /// Load configuration from the environment, falling back to defaults
    ///
    /// Unrecognized keys under the scanned prefixes produce a warning and are
    /// otherwise ignored.
    pub fn from_env() -> Self {
        warn_unknown_keys();

        let defaults = Self::default();
        Self {
            worker_capacity: env_parse("WORKER_CAPACITY", defaults.worker_capacity).max(1),
            worker_timeout: Duration::from_secs(env_parse(
                "WORKER_TIMEOUT_SECONDS",
                defaults.worker_timeout.as_secs(),
            )),
            max_retries: env_parse("WORKER_MAX_RETRIES", defaults.max_retries),
            retry_backoff: Duration::from_secs(env_parse(
                "WORKER_RETRY_BACKOFF_SECONDS",
                defaults.retry_backoff.as_secs(),
            )),
            heartbeat_interval: Duration::from_secs(env_parse(
                "WORKER_HEARTBEAT_INTERVAL_SECONDS",
                defaults.heartbeat_interval.as_secs(),
            )),
            dead_timeout: Duration::from_secs(env_parse(
                "WORKER_DEAD_TIMEOUT_SECONDS",
                defaults.dead_timeout.as_secs(),
            )),
            default_priority: env_parse("TASK_DEFAULT_PRIORITY", defaults.default_priority)
                .clamp(1, 10),
            scheduler_poll_interval: Duration::from_secs(env_parse(
                "SCHEDULER_POLL_INTERVAL",
                defaults.scheduler_poll_interval.as_secs(),
            )),
            dlq_enabled: env_parse("DLQ_ENABLED", defaults.dlq_enabled),
            breaker_failure_threshold: env_parse(
                "BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold,
            ),
            breaker_recovery_timeout: Duration::from_secs(env_parse(
                "BREAKER_RECOVERY_TIMEOUT",
                defaults.breaker_recovery_timeout.as_secs(),
            )),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(%key, value = %raw, "unparseable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn warn_unknown_keys() {
    for (key, _) in std::env::vars() {
        if SCANNED_PREFIXES.iter().any(|p| key.starts_with(p))
            && !RECOGNIZED_KEYS.contains(&key.as_str())
        {
            warn!(%key, "unrecognized configuration key ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.worker_capacity, 5);
        assert_eq!(config.worker_timeout, Duration::from_secs(300));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_backoff, Duration::from_secs(2));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.dead_timeout, Duration::from_secs(30));
        assert_eq!(config.default_priority, 5);
        assert_eq!(config.scheduler_poll_interval, Duration::from_secs(60));
        assert!(config.dlq_enabled);
        assert_eq!(config.breaker_failure_threshold, 5);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("WORKER_CAPACITY", "12");
        std::env::set_var("TASK_DEFAULT_PRIORITY", "8");
        std::env::set_var("DLQ_ENABLED", "false");

        let config = CoreConfig::from_env();
        assert_eq!(config.worker_capacity, 12);
        assert_eq!(config.default_priority, 8);
        assert!(!config.dlq_enabled);

        std::env::remove_var("WORKER_CAPACITY");
        std::env::remove_var("TASK_DEFAULT_PRIORITY");
        std::env::remove_var("DLQ_ENABLED");
    }

    #[test]
    fn test_unparseable_falls_back() {
        std::env::set_var("WORKER_MAX_RETRIES", "not-a-number");
        let config = CoreConfig::from_env();
        assert_eq!(config.max_retries, 5);
        std::env::remove_var("WORKER_MAX_RETRIES");
    }
}
