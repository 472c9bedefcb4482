//! Admission, completion and timeout handling.
//!
//! Every transition follows the same path: compute the new job from a copy of the cached one,
//! write it to the store with the previous status as the expected value, and only then update the
//! working set and notify the event sink.
use std::{
    panic::AssertUnwindSafe,
    sync::{atomic::Ordering, Arc},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    context::{AttemptReporter, JobContext},
    events::{EventKind, JobEvent},
    job::{
        runner::{run_attempt, AttemptOutcome},
        AttemptFailure, ErrorCode, FailureOutcome, Job, JobId, JobStatus, LogLevel,
    },
    registry::RegisteredExecutor,
    store::{JobStore, StoreError},
    JobwardenError,
};

use super::{
    working_set::{ActiveAttempt, WorkingSet},
    Inner,
};

/// Treat a lost compare and set as a skipped transition rather than a fault.
pub(crate) fn tolerate_conflict(result: Result<(), JobwardenError>) -> Result<bool, JobwardenError> {
    match result {
        Ok(()) => Ok(true),
        Err(JobwardenError::Store(StoreError::Conflict { .. })) => Ok(false),
        Err(error) => Err(error),
    }
}

impl<S> Inner<S>
where
    S: JobStore,
{
    pub(crate) fn emit(&self, kind: EventKind, job: &Job) {
        let event = JobEvent::new(kind, job);
        let job_id = job.id;
        if std::panic::catch_unwind(AssertUnwindSafe(|| self.sink.notify(event))).is_err() {
            tracing::error!(%job_id, ?kind, "Event sink panicked handling {kind:?} for {job_id}");
        }
    }

    /// The cached copy of a job, falling back to the store for jobs outside the working set.
    pub(crate) async fn load(
        &self,
        state: &WorkingSet,
        id: JobId,
    ) -> Result<Option<Job>, JobwardenError> {
        match state.jobs.get(&id) {
            Some(job) => Ok(Some(job.clone())),
            None => Ok(self.store.get(id).await?),
        }
    }

    /// Persist `job` provided its stored status is still `expected`, then cache and announce it.
    ///
    /// Terminal jobs leave the working set. On a conflict the cached copy is replaced by the
    /// stored one.
    pub(crate) async fn commit(
        &self,
        state: &mut WorkingSet,
        job: Job,
        expected: JobStatus,
        event: Option<EventKind>,
    ) -> Result<(), JobwardenError> {
        match self.store.update(&job, expected).await {
            Ok(()) => {
                if let Some(kind) = event {
                    self.emit(kind, &job);
                }
                if job.status.is_terminal() {
                    state.jobs.remove(&job.id);
                } else {
                    state.jobs.insert(job.id, job);
                }
                Ok(())
            }
            Err(error @ StoreError::Conflict { .. }) => {
                let job_id = job.id;
                tracing::warn!(%job_id, ?error, "Job {job_id} changed in the store, reloading it");
                self.reload(state, job_id).await;
                Err(error.into())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn reload(&self, state: &mut WorkingSet, id: JobId) {
        match self.store.get(id).await {
            Ok(Some(job)) if !job.status.is_terminal() => {
                let stale = state.active.get(&id).is_some_and(|active| {
                    job.status != JobStatus::Running || job.attempt != active.attempt
                });
                if stale {
                    state.cancel_attempt(id);
                }
                state.jobs.insert(id, job);
            }
            Ok(_) => {
                state.cancel_attempt(id);
                state.jobs.remove(&id);
            }
            Err(error) => {
                tracing::error!(?error, %id, "Failed to reload job {id}");
            }
        }
    }

    fn record_failure(&self, job: &mut Job, failure: AttemptFailure, now: DateTime<Utc>) {
        let job_id = job.id;
        let attempt = job.attempt;
        let code = failure.code.clone();
        let message = failure.message.clone();
        let backoff = self.config.backoff(&job.policy);

        match job.record_failure(failure, &backoff, now) {
            FailureOutcome::Rescheduled { not_before } => tracing::warn!(
                %job_id,
                %code,
                attempt,
                "Job {job_id} failed and will be retried at {not_before}: {message}"
            ),
            FailureOutcome::Failed => tracing::error!(
                %job_id,
                %code,
                attempt,
                "Job {job_id} failed and will not be retried: {message}"
            ),
        }
    }

    /// Seed the working set from the store.
    ///
    /// Jobs left `running` by a previous process go back to `pending` without their interrupted
    /// attempt being counted.
    pub(crate) async fn recover(&self) -> Result<usize, JobwardenError> {
        let jobs = self.store.unfinished().await?;
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut recovered = 0;

        for mut job in jobs {
            if state.active.contains_key(&job.id) {
                // Still executing from before a stop in this process.
                continue;
            }
            if job.status == JobStatus::Running {
                let job_id = job.id;
                tracing::warn!(
                    %job_id,
                    attempt = job.attempt,
                    "Job {job_id} was running when the scheduler went away, returning it to the queue"
                );
                job.mark_interrupted(now, self.config.log_capacity);
                let event = Some(EventKind::StatusChanged);
                if !tolerate_conflict(self.commit(&mut state, job, JobStatus::Running, event).await)? {
                    continue;
                }
            } else {
                state.jobs.insert(job.id, job);
            }
            recovered += 1;
        }

        tracing::info!(recovered, "Recovered {recovered} unfinished jobs");
        Ok(recovered)
    }

    /// Fail expired jobs, then dispatch as many due jobs as there are free slots.
    pub(crate) async fn run_admission_cycle(self: &Arc<Self>) -> Result<usize, JobwardenError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        for id in state.expired(now) {
            let Some(mut job) = state.jobs.get(&id).cloned() else {
                continue;
            };
            let failure = AttemptFailure {
                code: ErrorCode::Expired,
                message: "job expired before it could run".to_owned(),
                retryable: false,
            };
            self.record_failure(&mut job, failure, now);
            let event = Some(EventKind::StatusChanged);
            tolerate_conflict(self.commit(&mut state, job, JobStatus::Pending, event).await)?;
        }

        let slots = self.config.concurrency.saturating_sub(state.active.len());
        if slots == 0 {
            return Ok(0);
        }

        let mut admitted = 0;
        for id in state.admissible(now, slots) {
            let Some(mut job) = state.jobs.get(&id).cloned() else {
                continue;
            };
            let event = Some(EventKind::StatusChanged);

            let Some(executor) = self.registry.get(&job.task_type) else {
                let failure = AttemptFailure {
                    code: ErrorCode::UnknownTaskType,
                    message: format!("no executor registered for task type {}", job.task_type),
                    retryable: false,
                };
                self.record_failure(&mut job, failure, now);
                tolerate_conflict(self.commit(&mut state, job, JobStatus::Pending, event).await)?;
                continue;
            };

            job.mark_running(now);
            let attempt = job.attempt;
            let payload = job.payload.clone();
            if !tolerate_conflict(self.commit(&mut state, job, JobStatus::Pending, event).await)? {
                continue;
            }

            let token = CancellationToken::new();
            state.active.insert(
                id,
                ActiveAttempt {
                    attempt,
                    token: token.clone(),
                },
            );
            self.dispatch(id, attempt, executor, payload, token);
            admitted += 1;
        }

        if admitted > 0 {
            tracing::debug!(admitted, active = state.active.len(), "Admitted {admitted} jobs");
        }
        Ok(admitted)
    }

    fn dispatch(
        self: &Arc<Self>,
        id: JobId,
        attempt: u16,
        executor: Arc<dyn RegisteredExecutor>,
        payload: serde_json::Value,
        token: CancellationToken,
    ) {
        let reporter: Arc<dyn AttemptReporter> = self.clone();
        let context = JobContext::with_token(id, attempt, token, reporter);
        let inner = self.clone();

        self.tracker.spawn(async move {
            let outcome = run_attempt(executor, payload, context).await;
            let _ = inner
                .complete_attempt(id, attempt, outcome)
                .await
                .inspect_err(|error| {
                    tracing::error!(
                        ?error,
                        %id,
                        "Failed to record the outcome of attempt {attempt} for {id}"
                    )
                });
        });
    }

    /// Apply the outcome of an attempt, unless a newer decision has already been made about it.
    #[instrument(skip(self, outcome))]
    pub(crate) async fn complete_attempt(
        &self,
        id: JobId,
        attempt: u16,
        outcome: AttemptOutcome,
    ) -> Result<(), JobwardenError> {
        let mut state = self.state.lock().await;
        if !state.is_live(id, attempt) {
            tracing::debug!(%id, attempt, "Dropping the outcome of stale attempt {attempt} for {id}");
            return Ok(());
        }
        state.active.remove(&id);
        let Some(mut job) = state.jobs.get(&id).cloned() else {
            return Ok(());
        };
        let now = Utc::now();

        match outcome {
            AttemptOutcome::Completed(result) => {
                tracing::debug!(%id, attempt, "Job {id} complete");
                job.mark_completed(result, now);
            }
            AttemptOutcome::Cancelled(reason) if self.stopping.load(Ordering::Acquire) => {
                tracing::info!(%id, attempt, "Attempt {attempt} for {id} stopped by shutdown: {reason}");
                job.mark_interrupted(now, self.config.log_capacity);
            }
            AttemptOutcome::Cancelled(reason) => {
                tracing::info!(%id, attempt, "Job {id} cancelled by its executor: {reason}");
                job.mark_cancelled(reason, now, self.config.log_capacity);
            }
            AttemptOutcome::Failed(failure) => self.record_failure(&mut job, failure, now),
        }

        let event = Some(EventKind::StatusChanged);
        let result = tolerate_conflict(self.commit(&mut state, job, JobStatus::Running, event).await);
        self.wake.notify_one();
        result.map(|_| ())
    }

    /// Fail every running attempt that has exceeded its job's timeout.
    ///
    /// The executor is signalled but not awaited; whatever it reports later is dropped.
    pub(crate) async fn run_timeout_sweep(&self) -> Result<usize, JobwardenError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut timed_out = 0;

        for id in state.timed_out(now) {
            let Some(mut job) = state.jobs.get(&id).cloned() else {
                continue;
            };
            state.cancel_attempt(id);
            let failure = AttemptFailure {
                code: ErrorCode::Timeout,
                message: format!(
                    "attempt {} exceeded the timeout of {}ms",
                    job.attempt,
                    job.policy.timeout.num_milliseconds()
                ),
                retryable: true,
            };
            self.record_failure(&mut job, failure, now);
            let event = Some(EventKind::StatusChanged);
            if tolerate_conflict(self.commit(&mut state, job, JobStatus::Running, event).await)? {
                timed_out += 1;
            }
        }

        Ok(timed_out)
    }

    pub(crate) async fn update_progress(
        &self,
        id: JobId,
        attempt: u16,
        current: u64,
        total: u64,
        message: Option<String>,
    ) -> Result<bool, JobwardenError> {
        let mut state = self.state.lock().await;
        if !state.is_live(id, attempt) {
            return Ok(false);
        }
        let Some(mut job) = state.jobs.get(&id).cloned() else {
            return Ok(false);
        };
        job.progress.advance(current, total, message);
        job.updated_at = Utc::now();

        let event = Some(EventKind::ProgressUpdated);
        tolerate_conflict(self.commit(&mut state, job, JobStatus::Running, event).await)
    }

    pub(crate) async fn append_log(
        &self,
        id: JobId,
        attempt: u16,
        level: LogLevel,
        message: String,
    ) -> Result<bool, JobwardenError> {
        let mut state = self.state.lock().await;
        if !state.is_live(id, attempt) {
            return Ok(false);
        }
        let Some(mut job) = state.jobs.get(&id).cloned() else {
            return Ok(false);
        };
        job.push_log(level, message, Utc::now(), self.config.log_capacity);

        tolerate_conflict(self.commit(&mut state, job, JobStatus::Running, None).await)
    }
}

#[async_trait]
impl<S> AttemptReporter for Inner<S>
where
    S: JobStore,
{
    async fn report_progress(
        &self,
        id: JobId,
        attempt: u16,
        current: u64,
        total: u64,
        message: Option<String>,
    ) -> Result<bool, JobwardenError> {
        self.update_progress(id, attempt, current, total, message)
            .await
    }

    async fn append_log(
        &self,
        id: JobId,
        attempt: u16,
        level: LogLevel,
        message: String,
    ) -> Result<bool, JobwardenError> {
        Inner::append_log(self, id, attempt, level, message).await
    }
}
