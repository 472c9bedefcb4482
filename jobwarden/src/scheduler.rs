//! The scheduler: admission loop, timeout sweep and the public job operations.
//!
//! All transitions are serialized by a single lock over the [`WorkingSet`]. The lock is held
//! across the store write, so the store, the cache and the emitted events always agree on the
//! order in which transitions happened.
use std::{
    collections::BTreeMap,
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{TimeDelta, Utc};
use serde::Serialize;
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::SchedulerConfig,
    events::{EventKind, EventSink, NoopSink},
    executor::Executor,
    job::{builder::NewJob, query::JobQuery, Job, JobId, JobStatus, LogLevel, Progress},
    pruner::{JobPruner, PrunerConfig},
    registry::Registry,
    store::JobStore,
    JobwardenError,
};

mod dispatch;
mod working_set;

use dispatch::tolerate_conflict;
use working_set::WorkingSet;

/// Runs jobs held in a [`JobStore`] with the executors registered for their task types.
///
/// Cloning a scheduler is cheap and every clone drives the same working set.
///
/// # Example
///
/// ```
/// # use jobwarden::prelude::*;
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let scheduler = Scheduler::builder(InMemoryStore::new())
///     .with_config(SchedulerConfig {
///         concurrency: 2,
///         ..Default::default()
///     })
///     .build()
///     .unwrap();
///
/// scheduler.start().await.unwrap();
/// scheduler.stop().await.unwrap();
/// # });
/// ```
pub struct Scheduler<S: JobStore> {
    inner: Arc<Inner<S>>,
}

impl<S: JobStore> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct Inner<S: JobStore> {
    store: Arc<S>,
    registry: Registry,
    config: SchedulerConfig,
    sink: Arc<dyn EventSink>,
    pruner: Option<PrunerConfig>,
    state: Mutex<WorkingSet>,
    tracker: TaskTracker,
    stopping: AtomicBool,
    wake: Notify,
    lifecycle: Mutex<Option<Lifecycle>>,
}

struct Lifecycle {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Configures a [`Scheduler`] before it is built.
pub struct SchedulerBuilder<S: JobStore> {
    store: S,
    registry: Registry,
    config: SchedulerConfig,
    sink: Arc<dyn EventSink>,
    pruner: Option<PrunerConfig>,
}

impl<S> SchedulerBuilder<S>
where
    S: JobStore,
{
    pub fn with_config(self, config: SchedulerConfig) -> Self {
        Self { config, ..self }
    }

    /// Register `executor` for [`Executor::NAME`], replacing any executor with the same name.
    pub fn with_executor<E: Executor>(mut self, executor: E) -> Self {
        self.registry.register(executor);
        self
    }

    pub fn with_event_sink(self, sink: impl EventSink + 'static) -> Self {
        self.with_shared_event_sink(Arc::new(sink))
    }

    pub fn with_shared_event_sink(self, sink: Arc<dyn EventSink>) -> Self {
        Self { sink, ..self }
    }

    /// Prune finished jobs on the schedule of `config` while the scheduler is running.
    pub fn with_job_pruner(self, config: PrunerConfig) -> Self {
        Self {
            pruner: Some(config),
            ..self
        }
    }

    pub fn build(self) -> Result<Scheduler<S>, JobwardenError> {
        self.config.validate()?;
        Ok(Scheduler {
            inner: Arc::new(Inner {
                store: Arc::new(self.store),
                registry: self.registry,
                config: self.config,
                sink: self.sink,
                pruner: self.pruner,
                state: Default::default(),
                tracker: TaskTracker::new(),
                stopping: AtomicBool::new(false),
                wake: Notify::new(),
                lifecycle: Default::default(),
            }),
        })
    }
}

/// A snapshot of the scheduler and the jobs in its store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub by_status: BTreeMap<JobStatus, u64>,
    pub by_task_type: BTreeMap<String, u64>,
    pub mean_duration_ms: Option<f64>,
    pub failed_attempts: u64,
    pub retried_jobs: u64,
    /// Share of finished jobs that failed.
    pub failure_rate: Option<f64>,
    /// Share of all jobs that needed more than one attempt.
    pub retry_rate: Option<f64>,
    /// Unfinished jobs held in memory.
    pub working_set: usize,
    pub queue_depth: usize,
    pub active_attempts: usize,
}

impl<S> Scheduler<S>
where
    S: JobStore,
{
    pub fn builder(store: S) -> SchedulerBuilder<S> {
        SchedulerBuilder {
            store,
            registry: Registry::default(),
            config: SchedulerConfig::default(),
            sink: Arc::new(NoopSink),
            pruner: None,
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// The task types with a registered executor.
    pub fn task_types(&self) -> Vec<&'static str> {
        let mut task_types: Vec<_> = self.inner.registry.task_types().collect();
        task_types.sort_unstable();
        task_types
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lifecycle.lock().await.is_some()
    }

    /// Recover unfinished jobs from the store and start the admission loop and timeout sweep.
    ///
    /// Returns the number of jobs recovered.
    pub async fn start(&self) -> Result<usize, JobwardenError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(JobwardenError::AlreadyStarted);
        }
        self.inner.stopping.store(false, Ordering::Release);
        let recovered = self.inner.recover().await?;

        let token = CancellationToken::new();
        let mut handles = vec![self.spawn_loop(token.clone())];
        if let Some(config) = self.inner.pruner.clone() {
            handles.push(JobPruner::new(self.inner.store.clone(), config).spawn(token.child_token()));
        }

        tracing::info!(
            concurrency = self.inner.config.concurrency,
            task_types = ?self.task_types(),
            "Scheduler started"
        );
        *lifecycle = Some(Lifecycle { token, handles });
        Ok(recovered)
    }

    fn spawn_loop(&self, token: CancellationToken) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut admission = tokio::time::interval(inner.config.poll_interval());
            admission.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sweep = tokio::time::interval(inner.config.timeout_sweep_interval());
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = admission.tick() => {}
                    _ = inner.wake.notified() => {}
                    _ = sweep.tick() => {
                        let _ = inner
                            .run_timeout_sweep()
                            .await
                            .inspect_err(|error| tracing::error!(?error, "Timeout sweep failed: {error}"));
                        continue;
                    }
                    _ = token.cancelled() => break,
                }
                let _ = inner
                    .run_admission_cycle()
                    .await
                    .inspect_err(|error| tracing::error!(?error, "Admission cycle failed: {error}"));
            }
            tracing::debug!("Shutting down the admission loop");
        })
    }

    /// Stop admitting jobs, signal running attempts and wait up to the grace period for them.
    ///
    /// Attempts that stop because of the shutdown go back to `pending` without being counted.
    /// Stopping a scheduler that is not running is a no-op.
    pub async fn stop(&self) -> Result<(), JobwardenError> {
        let Some(lifecycle) = self.inner.lifecycle.lock().await.take() else {
            return Ok(());
        };
        tracing::debug!("Shutting down the scheduler");
        self.inner.stopping.store(true, Ordering::Release);
        lifecycle.token.cancel();
        for handle in lifecycle.handles {
            handle
                .await
                .map_err(|_| JobwardenError::GracefulShutdownFailed)?;
        }

        let tokens: Vec<_> = {
            let state = self.inner.state.lock().await;
            state
                .active
                .values()
                .map(|active| active.token.clone())
                .collect()
        };
        tokens.iter().for_each(CancellationToken::cancel);

        self.inner.tracker.close();
        let grace_period = self.inner.config.shutdown_grace_period();
        if tokio::time::timeout(grace_period, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.inner.tracker.len(),
                "{} attempts did not stop within {grace_period:?}",
                self.inner.tracker.len()
            );
        }
        self.inner.tracker.reopen();
        tracing::info!("Scheduler stopped");
        Ok(())
    }

    /// Validate and persist a new `pending` job.
    pub async fn submit(&self, new_job: NewJob) -> Result<Job, JobwardenError> {
        self.inner
            .registry
            .validate(&new_job.task_type, &new_job.payload)?;
        validate_policy(&new_job)?;

        let mut state = self.inner.state.lock().await;
        let parent = match new_job.parent_id {
            Some(parent_id) => Some(
                self.inner
                    .load(&state, parent_id)
                    .await?
                    .ok_or(JobwardenError::JobNotFound(parent_id))?,
            ),
            None => None,
        };

        let now = Utc::now();
        let created_at = state.next_created_at(now);
        let job = Job {
            id: JobId::new(),
            owner_ref: new_job.owner_ref,
            task_type: new_job.task_type,
            status: JobStatus::Pending,
            priority: new_job.priority,
            payload: new_job.payload,
            result: None,
            progress: Progress::default(),
            policy: new_job.policy,
            attempt: 0,
            errors: vec![],
            logs: Default::default(),
            dependencies: new_job.dependencies,
            parent_id: new_job.parent_id,
            child_ids: vec![],
            created_at,
            updated_at: created_at,
            started_at: None,
            attempted_at: None,
            completed_at: None,
            scheduled_not_before: new_job.scheduled_at,
            expires_at: new_job.expires_at,
        };

        self.inner.store.insert(&job).await?;
        state.jobs.insert(job.id, job.clone());
        self.inner.emit(EventKind::Created, &job);
        tracing::debug!(job_id = %job.id, task_type = %job.task_type, "Job {} submitted", job.id);

        let linkable = |parent: &Job| {
            !matches!(parent.status, JobStatus::Completed | JobStatus::Cancelled)
        };
        if let Some(mut parent) = parent.filter(linkable) {
            let expected = parent.status;
            parent.add_child(job.id, now);
            let _ = self
                .inner
                .commit(&mut state, parent, expected, None)
                .await
                .inspect_err(|error| {
                    tracing::warn!(?error, job_id = %job.id, "Failed to link job {} to its parent", job.id)
                });
        }

        self.inner.wake.notify_one();
        Ok(job)
    }

    /// Cancel a job that has not finished yet.
    ///
    /// Returns `false` when the job had already reached a terminal status. A running attempt is
    /// signalled and whatever it reports afterwards is ignored.
    pub async fn cancel(&self, id: JobId, reason: impl Display) -> Result<bool, JobwardenError> {
        let mut state = self.inner.state.lock().await;
        let mut job = self
            .inner
            .load(&state, id)
            .await?
            .ok_or(JobwardenError::JobNotFound(id))?;
        if job.status.is_terminal() {
            return Ok(false);
        }

        let expected = job.status;
        job.mark_cancelled(&reason, Utc::now(), self.inner.config.log_capacity);
        self.inner
            .commit(&mut state, job, expected, Some(EventKind::StatusChanged))
            .await?;
        state.cancel_attempt(id);
        tracing::info!(%id, "Job {id} cancelled: {reason}");
        Ok(true)
    }

    /// Put a failed job with attempts left back in the queue.
    pub async fn retry(&self, id: JobId) -> Result<bool, JobwardenError> {
        let mut state = self.inner.state.lock().await;
        let mut job = self
            .inner
            .load(&state, id)
            .await?
            .ok_or(JobwardenError::JobNotFound(id))?;
        if !job.can_retry() {
            return Ok(false);
        }

        job.mark_retried(Utc::now(), self.inner.config.log_capacity);
        let retried = tolerate_conflict(
            self.inner
                .commit(&mut state, job, JobStatus::Failed, Some(EventKind::StatusChanged))
                .await,
        )?;
        if retried {
            self.inner.wake.notify_one();
        }
        Ok(retried)
    }

    /// Record progress for the live attempt `attempt` of `id`.
    ///
    /// Returns `false` without changing anything when `attempt` is no longer live.
    pub async fn update_progress(
        &self,
        id: JobId,
        attempt: u16,
        current: u64,
        total: u64,
        message: Option<String>,
    ) -> Result<bool, JobwardenError> {
        self.inner
            .update_progress(id, attempt, current, total, message)
            .await
    }

    /// Append to the log of `id` on behalf of its live attempt `attempt`.
    pub async fn append_log(
        &self,
        id: JobId,
        attempt: u16,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Result<bool, JobwardenError> {
        self.inner
            .append_log(id, attempt, level, message.into())
            .await
    }

    pub async fn job(&self, id: JobId) -> Result<Option<Job>, JobwardenError> {
        let state = self.inner.state.lock().await;
        self.inner.load(&state, id).await
    }

    pub async fn list(&self, query: &JobQuery) -> Result<Vec<Job>, JobwardenError> {
        Ok(self.inner.store.list(query).await?)
    }

    pub async fn stats(&self) -> Result<SchedulerStats, JobwardenError> {
        let statistics = self.inner.store.statistics().await?;
        let state = self.inner.state.lock().await;

        let finished: u64 = JobStatus::ALL
            .into_iter()
            .filter(|status| status.is_terminal())
            .map(|status| statistics.count(status))
            .sum();
        let total = statistics.total();
        let ratio = |part: u64, whole: u64| (whole > 0).then(|| part as f64 / whole as f64);

        Ok(SchedulerStats {
            failure_rate: ratio(statistics.count(JobStatus::Failed), finished),
            retry_rate: ratio(statistics.retried_jobs, total),
            working_set: state.jobs.len(),
            queue_depth: state.queue_depth(),
            active_attempts: state.active.len(),
            by_status: statistics.by_status,
            by_task_type: statistics.by_task_type,
            mean_duration_ms: statistics.mean_duration_ms,
            failed_attempts: statistics.failed_attempts,
            retried_jobs: statistics.retried_jobs,
        })
    }

    /// Run one admission cycle now, returning the number of jobs dispatched.
    ///
    /// The running scheduler does this every poll interval; calling it directly is mostly useful
    /// in tests that do not start the loop.
    pub async fn run_admission_cycle(&self) -> Result<usize, JobwardenError> {
        self.inner.run_admission_cycle().await
    }

    /// Run one timeout sweep now, returning the number of attempts timed out.
    pub async fn run_timeout_sweep(&self) -> Result<usize, JobwardenError> {
        self.inner.run_timeout_sweep().await
    }

    /// Load unfinished jobs from the store without starting the loops.
    pub async fn recover(&self) -> Result<usize, JobwardenError> {
        self.inner.recover().await
    }
}

fn validate_policy(new_job: &NewJob) -> Result<(), JobwardenError> {
    let invalid = |reason: &str| JobwardenError::Validation {
        task_type: new_job.task_type.clone(),
        reason: reason.to_owned(),
    };
    if new_job.policy.timeout <= TimeDelta::zero() {
        return Err(invalid("timeout must be positive"));
    }
    if new_job.policy.retry_base_delay < TimeDelta::zero() {
        return Err(invalid("retry base delay must not be negative"));
    }
    Ok(())
}
