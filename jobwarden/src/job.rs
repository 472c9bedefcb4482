//! The job record and its state machine.
//!
//! A [`Job`] is the persisted unit of work tracked by the [`crate::Scheduler`]. Jobs only move
//! along the following transitions:
//!
//! ```text
//! pending ──admit──▶ running ──success──────────────────────▶ completed
//!    ▲                  ├──retryable failure, attempts left──▶ pending
//!    │                  ├──otherwise─────────────────────────▶ failed
//!    │                  └──cancel────────────────────────────▶ cancelled
//!    ├──cancel──▶ cancelled
//!    └──expired─▶ failed ──retry──▶ pending
//! ```
//!
//! The transition methods live on [`Job`] and are only reachable from within the crate, so
//! executors can never change the status of a job directly.
use std::{cmp::Ordering, collections::VecDeque, fmt::Display, str::FromStr};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backoff::BackoffStrategy;

pub mod builder;
pub mod query;
pub(crate) mod runner;

/// Globally unique identifier of a job.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// The lifecycle status of a job.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// All the possible statuses.
    pub const ALL: [JobStatus; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Whether no further automatic transition happens from this status.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// Named priority bands accepted at submission.
///
/// Priorities are stored as plain integers so callers can also use
/// [`builder::JobBuilder::with_raw_priority`] for finer grained ordering.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub const fn value(self) -> i32 {
        match self {
            Self::Low => 1,
            Self::Medium => 5,
            Self::High => 10,
        }
    }
}

impl From<Priority> for i32 {
    fn from(value: Priority) -> Self {
        value.value()
    }
}

/// Progress reported by an executor for the current attempt.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    pub message: Option<String>,
}

impl Progress {
    /// Apply a report, clamping `current` into `[0, total]` and never moving backwards.
    pub(crate) fn advance(&mut self, current: u64, total: u64, message: Option<String>) {
        let current = current.min(total);
        self.current = current.max(self.current.min(total));
        self.total = total;
        if message.is_some() {
            self.message = message;
        }
    }
}

/// Retry and timeout policy of a job, fixed at submission.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobPolicy {
    pub max_retries: u16,
    #[serde(with = "millis")]
    pub retry_base_delay: TimeDelta,
    #[serde(with = "millis")]
    pub timeout: TimeDelta,
}

impl JobPolicy {
    pub const DEFAULT_MAX_RETRIES: u16 = 3;
    pub const DEFAULT_RETRY_BASE_DELAY: TimeDelta = TimeDelta::milliseconds(5_000);
    pub const DEFAULT_TIMEOUT: TimeDelta = TimeDelta::milliseconds(300_000);

    /// The largest number of attempts a job with this policy can make.
    pub const fn max_attempts(&self) -> u16 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            retry_base_delay: Self::DEFAULT_RETRY_BASE_DELAY,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The executor returned an error or panicked.
    ExecutionError,
    /// The attempt ran longer than the job's timeout.
    Timeout,
    /// The job was still pending when its expiry passed.
    Expired,
    /// No executor is registered for the job's task type.
    UnknownTaskType,
    #[serde(untagged)]
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ExecutionError => "ExecutionError",
            Self::Timeout => "Timeout",
            Self::Expired => "Expired",
            Self::UnknownTaskType => "UnknownTaskType",
            Self::Other(code) => code,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a job's error history, recorded per failed attempt.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub attempt: u16,
    pub code: ErrorCode,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// The failure of a single attempt, before it is recorded on the job.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct AttemptFailure {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

/// What happened to a job after a failed attempt was recorded.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum FailureOutcome {
    Rescheduled { not_before: DateTime<Utc> },
    Failed,
}

/// A persisted unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_ref: String,
    pub task_type: String,
    pub status: JobStatus,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub progress: Progress,
    pub policy: JobPolicy,
    pub attempt: u16,
    pub errors: Vec<JobError>,
    pub logs: VecDeque<LogEntry>,
    pub dependencies: Vec<JobId>,
    pub parent_id: Option<JobId>,
    pub child_ids: Vec<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_not_before: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether the job may be admitted at `now` as far as its schedule is concerned.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_not_before
            .map_or(true, |not_before| not_before <= now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Whether the current attempt has exceeded the job's timeout at `now`.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && self
                .attempted_at
                .is_some_and(|attempted_at| now - attempted_at > self.policy.timeout)
    }

    /// Whether [`crate::Scheduler::retry`] would accept this job.
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.attempt <= self.policy.max_retries
    }

    /// Wall clock time between the first attempt and completion.
    pub fn duration(&self) -> Option<TimeDelta> {
        Some(self.completed_at? - self.started_at?)
    }

    /// Admission order: highest priority first, then oldest first.
    pub fn admission_order(a: &Self, b: &Self) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    }

    pub(crate) fn push_log(
        &mut self,
        level: LogLevel,
        message: impl Into<String>,
        now: DateTime<Utc>,
        capacity: usize,
    ) {
        self.logs.push_back(LogEntry {
            level,
            message: message.into(),
            occurred_at: now,
        });
        while self.logs.len() > capacity {
            self.logs.pop_front();
        }
        self.updated_at = now;
    }

    pub(crate) fn mark_running(&mut self, now: DateTime<Utc>) {
        debug_assert_eq!(self.status, JobStatus::Pending);
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.started_at.get_or_insert(now);
        self.attempted_at = Some(now);
        self.scheduled_not_before = None;
        self.progress = Progress {
            total: self.progress.total,
            ..Default::default()
        };
        self.updated_at = now;
    }

    pub(crate) fn mark_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.completed_at.get_or_insert(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_cancelled(
        &mut self,
        reason: impl Display,
        now: DateTime<Utc>,
        log_capacity: usize,
    ) {
        self.push_log(
            LogLevel::Warn,
            format!("Cancelled: {reason}"),
            now,
            log_capacity,
        );
        self.status = JobStatus::Cancelled;
        self.completed_at.get_or_insert(now);
        self.updated_at = now;
    }

    /// Record a failed attempt and either reschedule the job or fail it permanently.
    ///
    /// A job is rescheduled only when the failure is retryable and `attempt ≤ max_retries`.
    pub(crate) fn record_failure(
        &mut self,
        failure: AttemptFailure,
        backoff: &BackoffStrategy,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        let retryable = failure.retryable;
        self.errors.push(JobError {
            attempt: self.attempt,
            code: failure.code,
            message: failure.message,
            occurred_at: now,
            retryable,
        });
        self.updated_at = now;

        if retryable && self.attempt <= self.policy.max_retries {
            let not_before = now
                .checked_add_signed(backoff.backoff(self.attempt))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.status = JobStatus::Pending;
            self.scheduled_not_before = Some(not_before);
            FailureOutcome::Rescheduled { not_before }
        } else {
            self.status = JobStatus::Failed;
            self.completed_at.get_or_insert(now);
            FailureOutcome::Failed
        }
    }

    /// Put a failed job back in the queue on request.
    ///
    /// `completed_at` keeps the time of the first terminal transition.
    pub(crate) fn mark_retried(&mut self, now: DateTime<Utc>, log_capacity: usize) {
        self.push_log(LogLevel::Info, "Retry requested", now, log_capacity);
        self.status = JobStatus::Pending;
        self.scheduled_not_before = None;
        if self.is_expired(now) {
            self.expires_at = None;
        }
    }

    /// Reset a job whose attempt was interrupted by a shutdown or the process going away.
    ///
    /// The interrupted attempt produced no outcome so it is not counted.
    pub(crate) fn mark_interrupted(&mut self, now: DateTime<Utc>, log_capacity: usize) {
        self.push_log(
            LogLevel::Warn,
            format!("Attempt {} was interrupted", self.attempt),
            now,
            log_capacity,
        );
        self.status = JobStatus::Pending;
        self.attempt = self.attempt.saturating_sub(1);
        self.attempted_at = None;
        if self.attempt == 0 {
            self.started_at = None;
        }
        self.scheduled_not_before = None;
    }

    pub(crate) fn add_child(&mut self, child: JobId, now: DateTime<Utc>) {
        if !self.child_ids.contains(&child) {
            self.child_ids.push(child);
            self.updated_at = now;
        }
    }
}

/// (De)serialize a [`TimeDelta`] as a whole number of milliseconds.
pub(crate) mod millis {
    use chrono::TimeDelta;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(value: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_milliseconds())
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeDelta, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        TimeDelta::try_milliseconds(millis)
            .ok_or_else(|| D::Error::custom(format!("duration out of range: {millis}ms")))
    }
}
