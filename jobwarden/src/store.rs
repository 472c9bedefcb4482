//! The persistence contract for jobs.
//!
//! The store is the single source of truth. The scheduler keeps a cache of unfinished jobs in
//! memory, but every transition is written through [`JobStore::update`] before it is reported to
//! anyone, and the cache is rebuilt from [`JobStore::unfinished`] on start.
use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    job::{query::JobQuery, Job, JobId, JobStatus},
    pruner::PruneSpec,
};

pub mod memory;
pub(crate) mod queryable;
#[doc(hidden)]
pub mod testing;

/// Durable storage for [`Job`] records.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new job. Fails with [`StoreError::AlreadyExists`] if the id is taken.
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Replace the stored job, provided its stored status is still `expected`.
    ///
    /// This compare and set is what makes transitions atomic: if another writer moved the job
    /// first the update fails with [`StoreError::Conflict`] and nothing is written.
    async fn update(&self, job: &Job, expected: JobStatus) -> Result<(), StoreError>;

    async fn list(&self, query: &JobQuery) -> Result<Vec<Job>, StoreError>;

    /// All jobs that are `pending` or `running`.
    async fn unfinished(&self) -> Result<Vec<Job>, StoreError>;

    async fn statistics(&self) -> Result<StoreStatistics, StoreError>;

    /// Delete terminal jobs matching `spec`, returning how many were removed.
    async fn prune(&self, spec: &PruneSpec) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        self.as_ref().insert(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.as_ref().get(id).await
    }

    async fn update(&self, job: &Job, expected: JobStatus) -> Result<(), StoreError> {
        self.as_ref().update(job, expected).await
    }

    async fn list(&self, query: &JobQuery) -> Result<Vec<Job>, StoreError> {
        self.as_ref().list(query).await
    }

    async fn unfinished(&self) -> Result<Vec<Job>, StoreError> {
        self.as_ref().unfinished().await
    }

    async fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        self.as_ref().statistics().await
    }

    async fn prune(&self, spec: &PruneSpec) -> Result<u64, StoreError> {
        self.as_ref().prune(spec).await
    }
}

/// Aggregates over every job in the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub by_status: BTreeMap<JobStatus, u64>,
    pub by_task_type: BTreeMap<String, u64>,
    /// Mean time from first attempt to completion over completed jobs.
    pub mean_duration_ms: Option<f64>,
    /// Total number of failed attempts recorded across all jobs.
    pub failed_attempts: u64,
    /// Jobs that needed more than one attempt.
    pub retried_jobs: u64,
}

impl StoreStatistics {
    pub fn total(&self) -> u64 {
        self.by_status.values().sum()
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or_default()
    }

    /// Fold the statistics of a sequence of jobs, for stores that aggregate in memory.
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut statistics = Self::default();
        let mut total_duration_ms = 0_f64;
        let mut completed = 0_u64;

        for job in jobs {
            *statistics.by_status.entry(job.status).or_default() += 1;
            *statistics
                .by_task_type
                .entry(job.task_type.clone())
                .or_default() += 1;
            statistics.failed_attempts += job.errors.len() as u64;
            if job.attempt > 1 {
                statistics.retried_jobs += 1;
            }
            if job.status == JobStatus::Completed {
                if let Some(duration) = job.duration() {
                    total_duration_ms += duration.num_milliseconds() as f64;
                    completed += 1;
                }
            }
        }

        statistics.mean_duration_ms = (completed > 0).then(|| total_duration_ms / completed as f64);
        statistics
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("System in bad state")]
    BadState,
    #[error("Job not found {0}")]
    JobNotFound(JobId),
    #[error("Job already exists {0}")]
    AlreadyExists(JobId),
    #[error("Job {id} was expected to be {expected} but is {actual}")]
    Conflict {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("Store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}
