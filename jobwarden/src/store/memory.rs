//! Provides an in memory implementation of [`JobStore`].
//!
//! Nothing survives the process, so this is mainly intended for tests, demos and schedulers whose
//! jobs are disposable. It favours being obviously correct over being fast.
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use fxhash::FxHashMap;

use crate::{
    job::{query::JobQuery, Job, JobId, JobStatus},
    pruner::{PruneBy, PruneSpec},
};

use super::{queryable::Queryable, JobStore, StoreError, StoreStatistics};

/// An in memory implementation of [`JobStore`].
///
/// Clones share the same underlying jobs, so a clone can be handed to the scheduler while the
/// original is kept for assertions.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<FxHashMap<JobId, Job>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs held, in any status.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.jobs.read().map_err(|_| StoreError::BadState)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        self.len().map(|len| len == 0)
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .get(&id)
            .cloned())
    }

    async fn update(&self, job: &Job, expected: JobStatus) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        match jobs.get_mut(&job.id) {
            None => Err(StoreError::JobNotFound(job.id)),
            Some(stored) if stored.status != expected => Err(StoreError::Conflict {
                id: job.id,
                expected,
                actual: stored.status,
            }),
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
        }
    }

    async fn list(&self, query: &JobQuery) -> Result<Vec<Job>, StoreError> {
        Ok(query.apply(self.jobs.read().map_err(|_| StoreError::BadState)?.values()))
    }

    async fn unfinished(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .values()
            .filter(|job| !job.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        Ok(StoreStatistics::from_jobs(
            self.jobs.read().map_err(|_| StoreError::BadState)?.values(),
        ))
    }

    async fn prune(&self, prune_spec: &PruneSpec) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut matching: Vec<&Job> = jobs.values().filter(|job| prune_spec.matches(job)).collect();

        let to_remove: Vec<JobId> = match prune_spec.prune_by {
            PruneBy::MaxAge(age) => {
                let cutoff = Utc::now() - age;
                matching
                    .into_iter()
                    .filter(|job| job.completed_at.unwrap_or(job.updated_at) < cutoff)
                    .map(|job| job.id)
                    .collect()
            }
            PruneBy::MaxLength(length) => {
                // Most recently finished first, everything past `length` goes.
                matching.sort_by(|a, b| {
                    b.completed_at
                        .unwrap_or(b.updated_at)
                        .cmp(&a.completed_at.unwrap_or(a.updated_at))
                        .then(b.id.cmp(&a.id))
                });
                matching
                    .into_iter()
                    .skip(length as usize)
                    .map(|job| job.id)
                    .collect()
            }
        };

        for id in &to_remove {
            jobs.remove(id);
        }
        Ok(to_remove.len() as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store_test_suite;

    store_test_suite!(for: InMemoryStore::new());

    #[tokio::test]
    async fn clones_share_jobs() {
        let store = InMemoryStore::new();
        let clone = store.clone();
        clone.insert(&Job::raw_job()).await.unwrap();

        assert_eq!(store.len().unwrap(), 1);
        assert!(!store.is_empty().unwrap());
    }
}
