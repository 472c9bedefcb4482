//! A Postgres implementation of [`JobStore`] built on `sqlx`.
//!
//! ```no_run
//! # use jobwarden::prelude::*;
//! # use jobwarden_sqlx::PgJobStore;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = sqlx::PgPool::connect("postgres://localhost/jobwarden").await?;
//! let store = PgJobStore::from(pool);
//! store.migrate().await?;
//!
//! let scheduler = Scheduler::builder(store).build()?;
//! scheduler.start().await?;
//! # Ok(())
//! # }
//! ```
use std::{collections::BTreeMap, ops::Deref};

use async_trait::async_trait;
use jobwarden::{
    job::{query::JobQuery, Job, JobId, JobStatus},
    pruner::PruneSpec,
    store::{JobStore, StoreError, StoreStatistics},
};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

mod query;
mod types;

use query::{ToQuery, COLUMNS};

#[derive(Clone, Debug)]
pub struct PgJobStore {
    pool: PgPool,
}

impl Deref for PgJobStore {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl From<PgPool> for PgJobStore {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl From<&PgPool> for PgJobStore {
    fn from(value: &PgPool) -> Self {
        Self {
            pool: value.to_owned(),
        }
    }
}

impl PgJobStore {
    /// Connect to `database_url` with the default pool options.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        PgPool::connect(database_url)
            .await
            .map(Self::from)
            .map_err(backend)
    }

    /// Create or update the `jobwarden_jobs` table.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(backend)
    }

    async fn status_of(&self, id: JobId) -> Result<Option<JobStatus>, StoreError> {
        let status: Option<types::JobStatus> =
            sqlx::query_scalar("SELECT status FROM jobwarden_jobs WHERE id = $1")
                .bind(Uuid::from(id))
                .fetch_optional(self.deref())
                .await
                .map_err(backend)?;
        Ok(status.map(From::from))
    }

    async fn fetch_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, StoreError> {
        let mut builder = query.query();
        builder
            .build_query_as::<types::Job>()
            .fetch_all(self.deref())
            .await
            .map_err(backend)?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }
}

fn backend(error: impl std::error::Error + Send + Sync + 'static) -> StoreError {
    tracing::error!(?error, "Postgres job store error: {error}");
    StoreError::Backend(Box::new(error))
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let row = types::Job::from(job);
        let result = sqlx::query(&format!(
            "INSERT INTO jobwarden_jobs ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, \
            $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22) \
            ON CONFLICT (id) DO NOTHING"
        ))
        .bind(row.id)
        .bind(row.owner_ref)
        .bind(row.task_type)
        .bind(row.status)
        .bind(row.priority)
        .bind(row.payload)
        .bind(row.result)
        .bind(row.progress)
        .bind(row.policy)
        .bind(row.attempt)
        .bind(row.errors)
        .bind(row.logs)
        .bind(row.dependencies)
        .bind(row.parent_id)
        .bind(row.child_ids)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.started_at)
        .bind(row.attempted_at)
        .bind(row.completed_at)
        .bind(row.scheduled_not_before)
        .bind(row.expires_at)
        .execute(self.deref())
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(job.id));
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        sqlx::query_as::<_, types::Job>(&format!(
            "SELECT {COLUMNS} FROM jobwarden_jobs WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(self.deref())
        .await
        .map_err(backend)?
        .map(Job::try_from)
        .transpose()
    }

    #[instrument(skip_all, fields(job_id = %job.id, %expected))]
    async fn update(&self, job: &Job, expected: JobStatus) -> Result<(), StoreError> {
        let row = types::Job::from(job);
        let result = sqlx::query(
            "UPDATE jobwarden_jobs SET
                status = $3,
                priority = $4,
                payload = $5,
                result = $6,
                progress = $7,
                policy = $8,
                attempt = $9,
                errors = $10,
                logs = $11,
                dependencies = $12,
                parent_id = $13,
                child_ids = $14,
                updated_at = $15,
                started_at = $16,
                attempted_at = $17,
                completed_at = $18,
                scheduled_not_before = $19,
                expires_at = $20
            WHERE id = $1 AND status = $2",
        )
        .bind(row.id)
        .bind(types::JobStatus::from(expected))
        .bind(row.status)
        .bind(row.priority)
        .bind(row.payload)
        .bind(row.result)
        .bind(row.progress)
        .bind(row.policy)
        .bind(row.attempt)
        .bind(row.errors)
        .bind(row.logs)
        .bind(row.dependencies)
        .bind(row.parent_id)
        .bind(row.child_ids)
        .bind(row.updated_at)
        .bind(row.started_at)
        .bind(row.attempted_at)
        .bind(row.completed_at)
        .bind(row.scheduled_not_before)
        .bind(row.expires_at)
        .execute(self.deref())
        .await
        .map_err(backend)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.status_of(job.id).await? {
            None => Err(StoreError::JobNotFound(job.id)),
            Some(actual) => Err(StoreError::Conflict {
                id: job.id,
                expected,
                actual,
            }),
        }
    }

    async fn list(&self, query: &JobQuery) -> Result<Vec<Job>, StoreError> {
        self.fetch_jobs(query).await
    }

    async fn unfinished(&self) -> Result<Vec<Job>, StoreError> {
        self.fetch_jobs(
            &JobQuery::all()
                .with_status(JobStatus::Pending)
                .with_status(JobStatus::Running),
        )
        .await
    }

    async fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        let by_status: Vec<types::StatusCount> = sqlx::query_as(
            "SELECT status, COUNT(*) AS count FROM jobwarden_jobs GROUP BY status",
        )
        .fetch_all(self.deref())
        .await
        .map_err(backend)?;

        let by_task_type: Vec<types::TaskTypeCount> = sqlx::query_as(
            "SELECT task_type, COUNT(*) AS count FROM jobwarden_jobs GROUP BY task_type",
        )
        .fetch_all(self.deref())
        .await
        .map_err(backend)?;

        let totals: types::Totals = sqlx::query_as(
            "SELECT
                (AVG(EXTRACT(EPOCH FROM completed_at - started_at) * 1000)
                    FILTER (WHERE status = 'completed' AND started_at IS NOT NULL))::float8
                    AS mean_duration_ms,
                SUM(jsonb_array_length(errors))::int8 AS failed_attempts,
                (COUNT(*) FILTER (WHERE attempt > 1))::int8 AS retried_jobs
            FROM jobwarden_jobs",
        )
        .fetch_one(self.deref())
        .await
        .map_err(backend)?;

        let count = |count: i64| u64::try_from(count).unwrap_or_default();
        Ok(StoreStatistics {
            by_status: by_status
                .into_iter()
                .map(|row| (row.status.into(), count(row.count)))
                .collect::<BTreeMap<_, _>>(),
            by_task_type: by_task_type
                .into_iter()
                .map(|row| (row.task_type, count(row.count)))
                .collect(),
            mean_duration_ms: totals.mean_duration_ms,
            failed_attempts: totals.failed_attempts.map(count).unwrap_or_default(),
            retried_jobs: totals.retried_jobs.map(count).unwrap_or_default(),
        })
    }

    #[instrument(skip(self))]
    async fn prune(&self, spec: &PruneSpec) -> Result<u64, StoreError> {
        if !spec.status.is_terminal() {
            return Ok(0);
        }
        let mut builder = spec.query();
        Ok(builder
            .build()
            .execute(self.deref())
            .await
            .map_err(backend)?
            .rows_affected())
    }
}

#[cfg(all(test, feature = "postgres-tests"))]
mod test {
    use super::*;
    use jobwarden::store_test_suite;

    store_test_suite!(
        attr: sqlx::test(migrations = "./migrations"),
        args: (pool: PgPool),
        store: PgJobStore::from(pool)
    );
}
