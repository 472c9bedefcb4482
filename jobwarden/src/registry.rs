//! Type erasure between typed [`Executor`]s and the JSON payloads stored on jobs.
use std::sync::Arc;

use async_trait::async_trait;
use fxhash::FxHashMap;
use serde::Deserialize;

use crate::{
    context::JobContext,
    executor::{ExecutionResult, Executor},
    job::{runner::AttemptOutcome, AttemptFailure, ErrorCode},
    JobwardenError,
};

#[async_trait]
pub(crate) trait RegisteredExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    fn blocking(&self) -> bool;

    fn validate(&self, payload: &serde_json::Value) -> Result<(), String>;

    async fn execute(&self, payload: serde_json::Value, context: JobContext) -> AttemptOutcome;
}

struct Erased<E>(E);

#[async_trait]
impl<E> RegisteredExecutor for Erased<E>
where
    E: Executor,
{
    fn name(&self) -> &'static str {
        E::NAME
    }

    fn blocking(&self) -> bool {
        E::BLOCKING
    }

    fn validate(&self, payload: &serde_json::Value) -> Result<(), String> {
        let data = E::Data::deserialize(payload).map_err(|error| error.to_string())?;
        self.0.validate(&data)
    }

    async fn execute(&self, payload: serde_json::Value, context: JobContext) -> AttemptOutcome {
        let data = match serde_json::from_value::<E::Data>(payload) {
            Ok(data) => data,
            Err(error) => {
                return AttemptOutcome::Failed(fatal(format!("failed to decode payload: {error}")))
            }
        };

        match self.0.execute(data, context).await {
            ExecutionResult::Done(output) => match serde_json::to_value(output) {
                Ok(result) => AttemptOutcome::Completed(result),
                Err(error) => AttemptOutcome::Failed(fatal(format!("failed to encode result: {error}"))),
            },
            ExecutionResult::Cancelled { reason } => AttemptOutcome::Cancelled(reason.to_string()),
            ExecutionResult::Error { error } => AttemptOutcome::Failed(AttemptFailure {
                code: error.error_code(),
                message: error.to_string(),
                retryable: error.retryable(),
            }),
        }
    }
}

fn fatal(message: String) -> AttemptFailure {
    AttemptFailure {
        code: ErrorCode::ExecutionError,
        message,
        retryable: false,
    }
}

/// Task type name to executor, fixed once the scheduler is built.
#[derive(Default, Clone)]
pub(crate) struct Registry {
    executors: FxHashMap<&'static str, Arc<dyn RegisteredExecutor>>,
}

impl Registry {
    pub(crate) fn register<E: Executor>(&mut self, executor: E) {
        if self
            .executors
            .insert(E::NAME, Arc::new(Erased(executor)))
            .is_some()
        {
            tracing::warn!(task_type = E::NAME, "Executor for {} registered twice, keeping the last one", E::NAME);
        }
    }

    pub(crate) fn get(&self, task_type: &str) -> Option<Arc<dyn RegisteredExecutor>> {
        self.executors.get(task_type).cloned()
    }

    /// Check that `task_type` is known and `payload` decodes into its data type.
    pub(crate) fn validate(
        &self,
        task_type: &str,
        payload: &serde_json::Value,
    ) -> Result<(), JobwardenError> {
        let executor = self
            .executors
            .get(task_type)
            .ok_or_else(|| JobwardenError::UnknownTaskType(task_type.to_owned()))?;

        executor
            .validate(payload)
            .map_err(|reason| JobwardenError::Validation {
                task_type: task_type.to_owned(),
                reason,
            })
    }

    pub(crate) fn task_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.executors.keys().copied()
    }
}
