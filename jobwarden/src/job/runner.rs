use std::sync::Arc;

use tokio::task::JoinError;
use tracing::{instrument, Instrument};

use crate::{context::JobContext, registry::RegisteredExecutor};

use super::{AttemptFailure, ErrorCode};

/// What a single attempt produced, as seen from the dispatch boundary.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AttemptOutcome {
    Completed(serde_json::Value),
    Cancelled(String),
    Failed(AttemptFailure),
}

/// Run one attempt on its own task so a panicking executor cannot take the scheduler down.
#[instrument(skip_all, fields(job_id = %context.job_id(), attempt = context.attempt(), task_type = executor.name()))]
pub(crate) async fn run_attempt(
    executor: Arc<dyn RegisteredExecutor>,
    payload: serde_json::Value,
    context: JobContext,
) -> AttemptOutcome {
    let job_id = context.job_id();
    let blocking = executor.blocking();
    let fut = async move { executor.execute(payload, context).await }.in_current_span();

    let handle = if blocking {
        tracing::debug!(%job_id, "Executing blocking attempt for {job_id}");
        tokio::task::spawn_blocking(|| futures::executor::block_on(fut))
    } else {
        tracing::debug!(%job_id, "Executing attempt for {job_id}");
        tokio::spawn(fut)
    };

    match handle.await {
        Ok(outcome) => outcome,
        Err(error) => {
            let failure = AttemptFailure::from(error);
            tracing::error!(%job_id, message = %failure.message, "Attempt for {job_id} aborted");
            AttemptOutcome::Failed(failure)
        }
    }
}

impl From<JoinError> for AttemptFailure {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .map(|reason| format!("executor panicked: {reason}"))
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            code: ErrorCode::ExecutionError,
            message,
            retryable: true,
        }
    }
}
