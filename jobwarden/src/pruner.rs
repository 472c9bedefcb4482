//! Retention for finished jobs.
//!
//! The scheduler never deletes jobs. Once a job is completed, failed or cancelled it stays in the
//! store until a pruner removes it, which makes the retention policy an explicit decision of the
//! process that owns the store.
//!
//! [`PrunerConfig`] pairs a [`cron::Schedule`] with any number of [`Pruner`]s, each one removing
//! jobs of a single terminal status either by age or by keeping only the most recent ones. For
//! example:
//!
//! - keep only the last 10 completed report jobs,
//! - remove completed jobs of every task type after a month,
//! - keep failed jobs indefinitely for inspection.
//!
//! Pruners only ever touch terminal jobs; a pruner configured with `pending` or `running` matches
//! nothing.
//!
//! # Example
//!
//! ```
//! # use jobwarden::prelude::*;
//! # use std::str::FromStr;
//! # use chrono::TimeDelta;
//! # struct GenerateReport;
//! # #[async_trait::async_trait]
//! # impl Executor for GenerateReport {
//! #     type Data = ();
//! #     type Output = ();
//! #     const NAME: &'static str = "generate_report";
//! #     async fn execute(&self, _data: (), _context: JobContext) -> ExecutionResult<()> {
//! #         ExecutionResult::Done(())
//! #     }
//! # }
//! let config = PrunerConfig::new(cron::Schedule::from_str("0 0 * * * *").unwrap())
//!     .with_max_concurrency(Some(2))
//!     .with_pruner(Pruner::max_length(10, JobStatus::Completed).only::<GenerateReport>())
//!     .with_pruner(
//!         Pruner::max_age(TimeDelta::days(31), JobStatus::Completed).except::<GenerateReport>(),
//!     );
//! ```
use chrono::TimeDelta;

pub(crate) mod runner;

pub use runner::JobPruner;

use crate::{executor::Executor, job::JobStatus};

/// When and how finished jobs are removed.
#[derive(Debug, Clone)]
pub struct PrunerConfig {
    schedule: cron::Schedule,
    max_concurrency: Option<usize>,
    pruners: Vec<PruneSpec>,
}

impl PrunerConfig {
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            max_concurrency: Some(10),
            pruners: Default::default(),
        }
    }

    /// Limit how many pruners hit the store at the same time. `None` is unbounded.
    pub fn with_max_concurrency(mut self, limit: Option<usize>) -> Self {
        self.max_concurrency = limit;
        self
    }

    #[allow(private_bounds)]
    pub fn with_pruner<T>(mut self, pruner: Pruner<T>) -> Self
    where
        T: IntoSpec,
    {
        self.pruners.push(pruner.into());
        self
    }

    #[allow(private_bounds)]
    pub fn with_pruners<T>(mut self, pruners: impl IntoIterator<Item = Pruner<T>>) -> Self
    where
        T: IntoSpec,
    {
        self.pruners.extend(pruners.into_iter().map(Into::into));
        self
    }

    pub fn pruners(&self) -> &[PruneSpec] {
        &self.pruners
    }
}

/// A single pruner as handed to [`crate::store::JobStore::prune`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneSpec {
    pub status: JobStatus,
    pub prune_by: PruneBy,
    pub task_types: Spec,
}

impl<T> From<Pruner<T>> for PruneSpec
where
    T: IntoSpec,
{
    fn from(value: Pruner<T>) -> Self {
        Self {
            status: value.status,
            prune_by: value.prune_by,
            task_types: value.task_types.into_spec(),
        }
    }
}

/// Configuration for a single pruner.
///
/// A pruner applies to every task type unless narrowed with [`Pruner::only`] or widened from an
/// exclusion list with [`Pruner::except`], each followed by any number of [`Pruner::and`] calls.
#[allow(private_bounds)]
pub struct Pruner<T>
where
    T: IntoSpec,
{
    status: JobStatus,
    prune_by: PruneBy,
    task_types: T,
}

impl Pruner<All> {
    /// Remove jobs that finished more than `age` ago.
    pub const fn max_age(age: TimeDelta, status: JobStatus) -> Self {
        Self {
            status,
            prune_by: PruneBy::MaxAge(age),
            task_types: All,
        }
    }

    /// Keep only the `length` most recently finished jobs.
    pub const fn max_length(length: u32, status: JobStatus) -> Self {
        Self {
            status,
            prune_by: PruneBy::MaxLength(length),
            task_types: All,
        }
    }

    pub fn only<E: Executor>(self) -> Pruner<Only> {
        Pruner {
            status: self.status,
            prune_by: self.prune_by,
            task_types: Only(vec![E::NAME]),
        }
    }

    pub fn except<E: Executor>(self) -> Pruner<Except> {
        Pruner {
            status: self.status,
            prune_by: self.prune_by,
            task_types: Except(vec![E::NAME]),
        }
    }
}

impl Pruner<Only> {
    pub fn and<E: Executor>(mut self) -> Self {
        self.task_types.0.push(E::NAME);
        self
    }
}

impl Pruner<Except> {
    pub fn and<E: Executor>(mut self) -> Self {
        self.task_types.0.push(E::NAME);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneBy {
    /// Remove every matching job that finished before `now - age`.
    MaxAge(TimeDelta),
    /// Remove the oldest matching jobs until at most this many remain.
    MaxLength(u32),
}

/// Which task types a pruner applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Spec {
    Except(Vec<&'static str>),
    Only(Vec<&'static str>),
}

trait IntoSpec {
    fn into_spec(self) -> Spec;
}

#[doc(hidden)]
pub struct All;

impl IntoSpec for All {
    fn into_spec(self) -> Spec {
        Spec::Except(Vec::new())
    }
}

#[doc(hidden)]
pub struct Except(Vec<&'static str>);

impl IntoSpec for Except {
    fn into_spec(self) -> Spec {
        Spec::Except(self.0)
    }
}

#[doc(hidden)]
pub struct Only(Vec<&'static str>);

impl IntoSpec for Only {
    fn into_spec(self) -> Spec {
        Spec::Only(self.0)
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use crate::executor::test::{MockReturnExecutor, SimpleExecutor};

    use super::*;

    #[test]
    fn config() {
        let config = PrunerConfig::new(cron::Schedule::from_str("0 0 * * * *").unwrap())
            .with_pruner(
                Pruner::max_age(TimeDelta::days(31), JobStatus::Completed)
                    .only::<SimpleExecutor>()
                    .and::<MockReturnExecutor>(),
            )
            .with_pruner(
                Pruner::max_length(200, JobStatus::Failed)
                    .except::<SimpleExecutor>()
                    .and::<MockReturnExecutor>(),
            );

        assert_eq!(
            config.pruners(),
            &[
                PruneSpec {
                    status: JobStatus::Completed,
                    prune_by: PruneBy::MaxAge(TimeDelta::days(31)),
                    task_types: Spec::Only(vec!["simple_executor", "basic_executor"]),
                },
                PruneSpec {
                    status: JobStatus::Failed,
                    prune_by: PruneBy::MaxLength(200),
                    task_types: Spec::Except(vec!["simple_executor", "basic_executor"]),
                },
            ]
        );
    }

    #[test]
    fn into_spec_all() {
        let spec = IntoSpec::into_spec(All);
        assert_eq!(spec, Spec::Except(Vec::new()));
    }
}
