//! Runtime configuration of a [`crate::Scheduler`].
use std::{str::FromStr, time::Duration};

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::{
    backoff::BackoffStrategy,
    job::JobPolicy,
    JobwardenError,
};

/// Scheduler tuning knobs.
///
/// Every field has a default, so a partial document deserializes:
///
/// ```
/// # use jobwarden::prelude::*;
/// let config: SchedulerConfig = serde_json::from_str(r#"{ "concurrency": 2 }"#).unwrap();
/// assert_eq!(config.concurrency, 2);
/// assert_eq!(config.poll_interval_ms, 1_000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of attempts running at the same time.
    pub concurrency: usize,
    /// Cadence of the admission cycle.
    pub poll_interval_ms: u64,
    /// Cadence of the timeout sweep.
    pub timeout_sweep_interval_ms: u64,
    /// Number of log entries kept per job.
    pub log_capacity: usize,
    /// How long [`crate::Scheduler::stop`] waits for in-flight attempts.
    pub shutdown_grace_period_ms: u64,
    /// Upper bound on the retry backoff.
    pub max_retry_delay_ms: Option<u64>,
    /// Relative jitter applied to each retry backoff, between `0.0` and `1.0`.
    pub retry_jitter: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval_ms: 1_000,
            timeout_sweep_interval_ms: 1_000,
            log_capacity: 100,
            shutdown_grace_period_ms: 10_000,
            max_retry_delay_ms: None,
            retry_jitter: 0.0,
        }
    }
}

impl SchedulerConfig {
    pub const ENV_PREFIX: &'static str = "JOBWARDEN_";

    /// Read overrides from `JOBWARDEN_*` environment variables, e.g. `JOBWARDEN_CONCURRENCY=10`.
    ///
    /// Unset variables keep their default.
    pub fn from_env() -> Result<Self, JobwardenError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, JobwardenError> {
        let var = |name: &str| lookup(&format!("{}{name}", Self::ENV_PREFIX));
        let mut config = Self::default();

        if let Some(value) = var("CONCURRENCY") {
            config.concurrency = parse("CONCURRENCY", &value)?;
        }
        if let Some(value) = var("POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse("POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = var("TIMEOUT_SWEEP_INTERVAL_MS") {
            config.timeout_sweep_interval_ms = parse("TIMEOUT_SWEEP_INTERVAL_MS", &value)?;
        }
        if let Some(value) = var("LOG_CAPACITY") {
            config.log_capacity = parse("LOG_CAPACITY", &value)?;
        }
        if let Some(value) = var("SHUTDOWN_GRACE_PERIOD_MS") {
            config.shutdown_grace_period_ms = parse("SHUTDOWN_GRACE_PERIOD_MS", &value)?;
        }
        if let Some(value) = var("MAX_RETRY_DELAY_MS") {
            config.max_retry_delay_ms = Some(parse("MAX_RETRY_DELAY_MS", &value)?);
        }
        if let Some(value) = var("RETRY_JITTER") {
            config.retry_jitter = parse("RETRY_JITTER", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), JobwardenError> {
        if self.concurrency == 0 {
            return Err(JobwardenError::Config("concurrency must be at least 1".to_owned()));
        }
        if self.poll_interval_ms == 0 || self.timeout_sweep_interval_ms == 0 {
            return Err(JobwardenError::Config("intervals must be greater than zero".to_owned()));
        }
        if self.log_capacity == 0 {
            return Err(JobwardenError::Config("log_capacity must be at least 1".to_owned()));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(JobwardenError::Config(format!(
                "retry_jitter must be between 0 and 1, got {}",
                self.retry_jitter
            )));
        }
        if self
            .max_retry_delay_ms
            .is_some_and(|max| i64::try_from(max).is_err())
        {
            return Err(JobwardenError::Config("max_retry_delay_ms is out of range".to_owned()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_sweep_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    /// The backoff used for a job with `policy`.
    pub(crate) fn backoff(&self, policy: &JobPolicy) -> BackoffStrategy {
        let mut strategy = BackoffStrategy::exponential(policy.retry_base_delay);
        if let Some(max) = self
            .max_retry_delay_ms
            .and_then(|max| i64::try_from(max).ok())
            .and_then(TimeDelta::try_milliseconds)
        {
            strategy = strategy.with_max(max);
        }
        if self.retry_jitter > 0.0 {
            strategy = strategy.with_jitter(self.retry_jitter);
        }
        strategy
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T, JobwardenError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|error| {
        JobwardenError::Config(format!("invalid {}{name} {value:?}: {error}", SchedulerConfig::ENV_PREFIX))
    })
}
