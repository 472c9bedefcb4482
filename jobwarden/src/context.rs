//! The handle an executor receives for the duration of one attempt.
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    job::{JobId, LogLevel},
    JobwardenError,
};

/// Where an attempt's progress and logs are sent.
///
/// Every call carries the attempt number so reports from an attempt that has since been timed out
/// or cancelled are dropped instead of touching a newer attempt.
#[async_trait]
pub(crate) trait AttemptReporter: Send + Sync {
    async fn report_progress(
        &self,
        id: JobId,
        attempt: u16,
        current: u64,
        total: u64,
        message: Option<String>,
    ) -> Result<bool, JobwardenError>;

    async fn append_log(
        &self,
        id: JobId,
        attempt: u16,
        level: LogLevel,
        message: String,
    ) -> Result<bool, JobwardenError>;
}

/// Passed to [`crate::Executor::execute`].
///
/// Cancellation is cooperative: when the job is cancelled, times out or the scheduler stops, the
/// context is signalled and the executor is expected to return promptly, typically by racing its
/// work against [`JobContext::cancelled`].
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    attempt: u16,
    cancellation_token: CancellationToken,
    reporter: Arc<dyn AttemptReporter>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl JobContext {
    #[cfg(test)]
    pub(crate) fn new(job_id: JobId, attempt: u16, reporter: Arc<dyn AttemptReporter>) -> Self {
        Self::with_token(job_id, attempt, CancellationToken::new(), reporter)
    }

    pub(crate) fn with_token(
        job_id: JobId,
        attempt: u16,
        cancellation_token: CancellationToken,
        reporter: Arc<dyn AttemptReporter>,
    ) -> Self {
        Self {
            job_id,
            attempt,
            cancellation_token,
            reporter,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// The attempt number, starting at 1.
    pub fn attempt(&self) -> u16 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Resolves once the attempt should stop.
    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }

    /// A child token, for handing to code that already understands [`CancellationToken`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.child_token()
    }

    /// Report progress for this attempt.
    ///
    /// `current` is clamped into `[0, total]` and never moves backwards within an attempt. Returns
    /// `false` when the report was dropped because this attempt is no longer the job's live
    /// attempt.
    pub async fn report_progress(&self, current: u64, total: u64, message: impl Into<String>) -> bool {
        let job_id = self.job_id;
        self.reporter
            .report_progress(job_id, self.attempt, current, total, Some(message.into()))
            .await
            .inspect_err(|error| {
                tracing::error!(?error, %job_id, "Failed to record progress for {job_id}")
            })
            .unwrap_or(false)
    }

    /// Append an entry to the job's bounded log.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> bool {
        let job_id = self.job_id;
        self.reporter
            .append_log(job_id, self.attempt, level, message.into())
            .await
            .inspect_err(|error| {
                tracing::error!(?error, %job_id, "Failed to append log for {job_id}")
            })
            .unwrap_or(false)
    }
}
