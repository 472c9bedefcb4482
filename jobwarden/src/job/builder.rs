use std::borrow::Cow;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::{store::JobStore, JobwardenError, Scheduler};

use super::{Job, JobId, JobPolicy, Priority};

/// A job ready to be submitted, after the payload has been encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub owner_ref: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub policy: JobPolicy,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub parent_id: Option<JobId>,
    pub dependencies: Vec<JobId>,
}

/// Builder for submitting a job.
///
/// Usually obtained through [`crate::Executor::builder`] so the payload type is checked at compile
/// time, but [`JobBuilder::new`] accepts any task type name with a raw JSON payload.
///
/// # Example
///
/// ```
/// # use jobwarden::prelude::*;
/// # use chrono::TimeDelta;
/// let job = JobBuilder::new("generate_report")
///     .owned_by("session-42")
///     .with_data(serde_json::json!({ "year": 2024 }))
///     .with_priority(Priority::High)
///     .with_max_retries(0)
///     .with_timeout(TimeDelta::seconds(30))
///     .into_new_job()
///     .unwrap();
///
/// assert_eq!(job.priority, 10);
/// assert_eq!(job.policy.max_retries, 0);
/// ```
#[derive(Debug, Clone)]
pub struct JobBuilder<D = serde_json::Value> {
    task_type: Cow<'static, str>,
    owner_ref: String,
    data: Option<D>,
    priority: i32,
    policy: JobPolicy,
    scheduled_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    parent_id: Option<JobId>,
    dependencies: Vec<JobId>,
}

impl<D> JobBuilder<D> {
    pub fn new(task_type: impl Into<Cow<'static, str>>) -> Self {
        Self {
            task_type: task_type.into(),
            owner_ref: String::new(),
            data: None,
            priority: Priority::default().value(),
            policy: JobPolicy::default(),
            scheduled_at: None,
            expires_at: None,
            parent_id: None,
            dependencies: vec![],
        }
    }

    pub fn owned_by(self, owner_ref: impl Into<String>) -> Self {
        Self {
            owner_ref: owner_ref.into(),
            ..self
        }
    }

    pub fn with_data(self, data: D) -> Self {
        Self {
            data: Some(data),
            ..self
        }
    }

    pub fn with_priority(self, priority: Priority) -> Self {
        self.with_raw_priority(priority.value())
    }

    /// Use an arbitrary priority value; higher runs first.
    pub fn with_raw_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    pub fn with_max_retries(mut self, max_retries: u16) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: TimeDelta) -> Self {
        self.policy.timeout = timeout;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: TimeDelta) -> Self {
        self.policy.retry_base_delay = delay;
        self
    }

    pub fn with_policy(self, policy: JobPolicy) -> Self {
        Self { policy, ..self }
    }

    /// Do not admit the job before `scheduled_at`.
    pub fn schedule_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(scheduled_at),
            ..self
        }
    }

    pub fn schedule_in(self, delay: TimeDelta) -> Self {
        self.schedule_at(Utc::now() + delay)
    }

    /// Fail the job with [`super::ErrorCode::Expired`] if it is still pending at `expires_at`.
    pub fn expires_at(self, expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at: Some(expires_at),
            ..self
        }
    }

    pub fn expires_in(self, delay: TimeDelta) -> Self {
        self.expires_at(Utc::now() + delay)
    }

    pub fn with_parent(self, parent_id: JobId) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..self
        }
    }

    /// Record the jobs this one depends on. Dependencies are informational and do not delay
    /// admission.
    pub fn with_dependencies(self, dependencies: impl IntoIterator<Item = JobId>) -> Self {
        Self {
            dependencies: dependencies.into_iter().collect(),
            ..self
        }
    }
}

impl<D> JobBuilder<D>
where
    D: Serialize,
{
    pub fn into_new_job(self) -> Result<NewJob, serde_json::Error> {
        let payload = match self.data {
            Some(data) => serde_json::to_value(data)?,
            None => serde_json::Value::Null,
        };

        Ok(NewJob {
            owner_ref: self.owner_ref,
            task_type: self.task_type.into_owned(),
            payload,
            priority: self.priority,
            policy: self.policy,
            scheduled_at: self.scheduled_at,
            expires_at: self.expires_at,
            parent_id: self.parent_id,
            dependencies: self.dependencies,
        })
    }

    pub async fn submit<S: JobStore>(self, scheduler: &Scheduler<S>) -> Result<Job, JobwardenError> {
        let job = self.into_new_job()?;
        scheduler.submit(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{test::SimpleExecutor, Executor};

    #[test]
    fn defaults() {
        let job = JobBuilder::<()>::new("cleanup").into_new_job().unwrap();

        assert_eq!(job.task_type, "cleanup");
        assert_eq!(job.payload, serde_json::Value::Null);
        assert_eq!(job.priority, Priority::Medium.value());
        assert_eq!(job.policy, JobPolicy::default());
        assert!(job.scheduled_at.is_none());
        assert!(job.dependencies.is_empty());
    }

    #[test]
    fn executor_builder_uses_executor_name() {
        let parent = JobId::new();
        let dependency = JobId::new();
        let job = SimpleExecutor::builder()
            .owned_by("session")
            .with_data("hello".to_owned())
            .with_priority(Priority::Low)
            .with_parent(parent)
            .with_dependencies([dependency])
            .into_new_job()
            .unwrap();

        assert_eq!(job.task_type, SimpleExecutor::NAME);
        assert_eq!(job.owner_ref, "session");
        assert_eq!(job.payload, serde_json::json!("hello"));
        assert_eq!(job.priority, 1);
        assert_eq!(job.parent_id, Some(parent));
        assert_eq!(job.dependencies, vec![dependency]);
    }

    #[test]
    fn schedule_and_expiry() {
        let at = Utc::now() + TimeDelta::minutes(5);
        let job = JobBuilder::<()>::new("cleanup")
            .schedule_at(at)
            .expires_in(TimeDelta::hours(1))
            .with_retry_base_delay(TimeDelta::seconds(1))
            .into_new_job()
            .unwrap();

        assert_eq!(job.scheduled_at, Some(at));
        assert!(job.expires_at.unwrap() > at);
        assert_eq!(job.policy.retry_base_delay, TimeDelta::seconds(1));
    }
}
