use std::{ops::Sub, time::Duration};

use chrono::{TimeDelta, Utc};
use futures::{future, stream::FuturesUnordered, FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::store::JobStore;

use super::PrunerConfig;

/// Runs a [`PrunerConfig`] against a store on its cron schedule.
pub struct JobPruner<S: JobStore> {
    config: PrunerConfig,
    store: S,
}

impl<S> JobPruner<S>
where
    S: JobStore,
{
    pub fn new(store: S, config: PrunerConfig) -> Self {
        Self { store, config }
    }

    /// Run on the schedule until `cancellation_token` is cancelled.
    pub fn spawn(self, cancellation_token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                    tracing::warn!("Pruner schedule has no upcoming run, stopping the job pruner");
                    break;
                };
                let delay = next
                    .sub(Utc::now())
                    .sub(TimeDelta::milliseconds(10))
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        self.prune().await;
                        if let Ok(delay) = (next - Utc::now()).to_std() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the job pruner");
                        break;
                    },
                }
            }
        })
    }

    /// Apply every configured pruner once, returning the number of jobs removed.
    ///
    /// At most `max_concurrency` pruners run at the same time.
    pub async fn prune(&self) -> u64 {
        let batch = self
            .config
            .max_concurrency
            .unwrap_or(self.config.pruners.len())
            .max(1);
        let mut total = 0;
        for pruners in self.config.pruners.chunks(batch) {
            total += pruners
                .iter()
                .map(|prune_spec| {
                    self.store.prune(prune_spec).map(move |result| {
                        result
                            .inspect(|&removed| {
                                tracing::debug!(?prune_spec, removed, "Pruned {removed} jobs")
                            })
                            .inspect_err(|err| {
                                tracing::error!(?err, "Failed to clean up jobs with error {err}")
                            })
                            .unwrap_or_default()
                    })
                })
                .collect::<FuturesUnordered<_>>()
                .fold(0, |sum, removed| future::ready(sum + removed))
                .await;
        }
        total
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;
    use crate::{
        job::{Job, JobStatus},
        pruner::Pruner,
        store::memory::InMemoryStore,
    };

    fn finished(status: JobStatus, age: TimeDelta) -> Job {
        let mut job = Job::raw_job().with_status(status);
        job.completed_at = Some(Utc::now() - age);
        job
    }

    #[tokio::test]
    async fn prune_applies_every_pruner() {
        let store = InMemoryStore::new();
        for job in [
            finished(JobStatus::Completed, TimeDelta::days(40)),
            finished(JobStatus::Completed, TimeDelta::days(1)),
            finished(JobStatus::Cancelled, TimeDelta::days(3)),
            finished(JobStatus::Cancelled, TimeDelta::days(2)),
            Job::raw_job(),
        ] {
            store.insert(&job).await.unwrap();
        }

        let config = PrunerConfig::new(cron::Schedule::from_str("0 0 * * * *").unwrap())
            .with_max_concurrency(Some(1))
            .with_pruner(Pruner::max_age(TimeDelta::days(30), JobStatus::Completed))
            .with_pruner(Pruner::max_length(1, JobStatus::Cancelled));

        let removed = JobPruner::new(store.clone(), config).prune().await;

        assert_eq!(removed, 2);
        let statistics = store.statistics().await.unwrap();
        assert_eq!(statistics.count(JobStatus::Completed), 1);
        assert_eq!(statistics.count(JobStatus::Cancelled), 1);
        assert_eq!(statistics.count(JobStatus::Pending), 1);
    }

    #[tokio::test]
    async fn prune_runs_on_a_spawned_task_without_a_concurrency_limit() {
        let store = InMemoryStore::new();
        for age in [5, 4, 3, 2, 1] {
            store
                .insert(&finished(JobStatus::Failed, TimeDelta::days(age)))
                .await
                .unwrap();
        }

        let config = PrunerConfig::new(cron::Schedule::from_str("0 0 * * * *").unwrap())
            .with_max_concurrency(None)
            .with_pruner(Pruner::max_age(TimeDelta::days(4) - TimeDelta::hours(1), JobStatus::Failed))
            .with_pruner(Pruner::max_length(3, JobStatus::Failed))
            .with_pruner(Pruner::max_age(TimeDelta::days(1), JobStatus::Completed));
        let pruner = JobPruner::new(store.clone(), config);

        let removed = tokio::spawn(async move { pruner.prune().await })
            .await
            .unwrap();

        assert!(removed >= 2);
        assert!(store.statistics().await.unwrap().count(JobStatus::Failed) <= 3);
    }

    #[tokio::test]
    async fn spawned_pruner_stops_on_cancellation() {
        let config = PrunerConfig::new(cron::Schedule::from_str("0 0 0 1 1 *").unwrap());
        let token = CancellationToken::new();
        let handle = JobPruner::new(InMemoryStore::new(), config).spawn(token.clone());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
