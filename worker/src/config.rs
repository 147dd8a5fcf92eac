use crate::health_monitor::HealthSettings;
use crate::worker_pool::WorkerSettings;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("environment variable {key} has an invalid value: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{key} must be greater than {than}")]
    NotGreater { key: &'static str, than: &'static str },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub instance_id: String,
    pub num_workers: usize,
    pub default_processor_url: String,
    pub fallback_processor_url: String,
    pub probe_interval: Duration,
    pub lease_ttl: Duration,
    pub cache_ttl: Duration,
    pub health_timeout: Duration,
    pub request_timeout: Duration,
    pub latency_threshold_ms: u64,
    pub dequeue_batch: usize,
    pub dequeue_block: Duration,
    pub reclaim_interval: Duration,
    pub reclaim_min_idle: Duration,
    pub reclaim_batch: usize,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Unset keys take their defaults;
    /// set but unparseable keys are an error, as is a zero count or duration.
    /// The shared health entry must outlive one probe interval.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let instance_id = lookup("INSTANCE_ID")
            .or_else(|| lookup("HOSTNAME"))
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("proc-{}", std::process::id()));

        let config = Self {
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379/".to_string()),
            instance_id,
            num_workers: nonzero(&lookup, "NUM_WORKERS", 4)?,
            default_processor_url: lookup("DEFAULT_PROCESSOR_URL")
                .unwrap_or_else(|| "http://localhost:8001".to_string()),
            fallback_processor_url: lookup("FALLBACK_PROCESSOR_URL")
                .unwrap_or_else(|| "http://localhost:8082".to_string()),
            probe_interval: millis(&lookup, "HEALTH_PROBE_INTERVAL_MS", 6_000)?,
            lease_ttl: millis(&lookup, "HEALTH_LEASE_TTL_MS", 5_000)?,
            cache_ttl: millis(&lookup, "HEALTH_CACHE_TTL_MS", 10_000)?,
            health_timeout: millis(&lookup, "HEALTH_TIMEOUT_MS", 2_000)?,
            request_timeout: millis(&lookup, "REQUEST_TIMEOUT_MS", 5_000)?,
            latency_threshold_ms: parse(&lookup, "LATENCY_THRESHOLD_MS", 1_000)?,
            dequeue_batch: nonzero(&lookup, "DEQUEUE_BATCH", 10)?,
            dequeue_block: millis(&lookup, "DEQUEUE_BLOCK_MS", 2_000)?,
            reclaim_interval: millis(&lookup, "RECLAIM_INTERVAL_MS", 5_000)?,
            reclaim_min_idle: millis(&lookup, "RECLAIM_MIN_IDLE_MS", 10_000)?,
            reclaim_batch: nonzero(&lookup, "RECLAIM_BATCH", 10)?,
        };

        if config.cache_ttl <= config.probe_interval {
            return Err(ConfigError::NotGreater {
                key: "HEALTH_CACHE_TTL_MS",
                than: "HEALTH_PROBE_INTERVAL_MS",
            });
        }
        Ok(config)
    }

    pub fn health_settings(&self) -> HealthSettings {
        HealthSettings {
            probe_interval: self.probe_interval,
            lease_ttl: self.lease_ttl,
            cache_ttl: self.cache_ttl,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            num_workers: self.num_workers,
            latency_threshold_ms: self.latency_threshold_ms,
            reclaim_interval: self.reclaim_interval,
            reclaim_min_idle: self.reclaim_min_idle,
            reclaim_batch: self.reclaim_batch,
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn nonzero<T: FromStr + Default + PartialEq>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<T>() {
            Ok(parsed) if parsed != T::default() => Ok(parsed),
            _ => Err(ConfigError::Invalid { key, value }),
        },
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    nonzero(lookup, key, default).map(Duration::from_millis)
}
