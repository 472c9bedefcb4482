use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use jobwarden::{
    job::{JobError, JobPolicy, LogEntry, Progress},
    store::StoreError,
};
use sqlx::{
    postgres::{PgHasArrayType, PgTypeInfo},
    prelude::FromRow,
    types::Json,
};
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "jobwarden_job_status", rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PgHasArrayType for JobStatus {
    fn array_type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("_jobwarden_job_status")
    }
}

impl From<JobStatus> for jobwarden::job::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Pending => Self::Pending,
            JobStatus::Running => Self::Running,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
            JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl From<jobwarden::job::JobStatus> for JobStatus {
    fn from(value: jobwarden::job::JobStatus) -> Self {
        match value {
            jobwarden::job::JobStatus::Pending => Self::Pending,
            jobwarden::job::JobStatus::Running => Self::Running,
            jobwarden::job::JobStatus::Completed => Self::Completed,
            jobwarden::job::JobStatus::Failed => Self::Failed,
            jobwarden::job::JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

/// A row of `jobwarden_jobs`.
///
/// The nested records of a job are stored as `jsonb` columns.
#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub id: Uuid,
    pub owner_ref: String,
    pub task_type: String,
    pub status: JobStatus,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub progress: Json<Progress>,
    pub policy: Json<JobPolicy>,
    pub attempt: i32,
    pub errors: Json<Vec<JobError>>,
    pub logs: Json<VecDeque<LogEntry>>,
    pub dependencies: Vec<Uuid>,
    pub parent_id: Option<Uuid>,
    pub child_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_not_before: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<Job> for jobwarden::job::Job {
    type Error = StoreError;

    fn try_from(value: Job) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            owner_ref: value.owner_ref,
            task_type: value.task_type,
            status: value.status.into(),
            priority: value.priority,
            payload: value.payload,
            result: value.result,
            progress: value.progress.0,
            policy: value.policy.0,
            attempt: u16::try_from(value.attempt).map_err(|_| StoreError::BadState)?,
            errors: value.errors.0,
            logs: value.logs.0,
            dependencies: value.dependencies.into_iter().map(From::from).collect(),
            parent_id: value.parent_id.map(From::from),
            child_ids: value.child_ids.into_iter().map(From::from).collect(),
            created_at: value.created_at,
            updated_at: value.updated_at,
            started_at: value.started_at,
            attempted_at: value.attempted_at,
            completed_at: value.completed_at,
            scheduled_not_before: value.scheduled_not_before,
            expires_at: value.expires_at,
        })
    }
}

impl From<&jobwarden::job::Job> for Job {
    fn from(value: &jobwarden::job::Job) -> Self {
        Self {
            id: value.id.into(),
            owner_ref: value.owner_ref.clone(),
            task_type: value.task_type.clone(),
            status: value.status.into(),
            priority: value.priority,
            payload: value.payload.clone(),
            result: value.result.clone(),
            progress: Json(value.progress.clone()),
            policy: Json(value.policy),
            attempt: value.attempt.into(),
            errors: Json(value.errors.clone()),
            logs: Json(value.logs.clone()),
            dependencies: value.dependencies.iter().copied().map(Uuid::from).collect(),
            parent_id: value.parent_id.map(Uuid::from),
            child_ids: value.child_ids.iter().copied().map(Uuid::from).collect(),
            created_at: value.created_at,
            updated_at: value.updated_at,
            started_at: value.started_at,
            attempted_at: value.attempted_at,
            completed_at: value.completed_at,
            scheduled_not_before: value.scheduled_not_before,
            expires_at: value.expires_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct StatusCount {
    pub status: JobStatus,
    pub count: i64,
}

#[derive(Debug, FromRow)]
pub(crate) struct TaskTypeCount {
    pub task_type: String,
    pub count: i64,
}

#[derive(Debug, FromRow)]
pub(crate) struct Totals {
    pub mean_duration_ms: Option<f64>,
    pub failed_attempts: Option<i64>,
    pub retried_jobs: Option<i64>,
}
