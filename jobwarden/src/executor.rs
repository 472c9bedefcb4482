//! The extension point: each task type is an [`Executor`].
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::{error::Error, fmt::Display};

use crate::{context::JobContext, job::builder::JobBuilder, job::ErrorCode};

/// The handler for one task type.
///
/// Executors are registered with [`crate::SchedulerBuilder::with_executor`] and invoked once per
/// attempt. They receive the decoded payload and a [`JobContext`] through which they report
/// progress, write job logs and observe cancellation.
///
/// # Example
///
/// ```
/// # use jobwarden::prelude::*;
/// struct SendNotification;
///
/// #[async_trait::async_trait]
/// impl Executor for SendNotification {
///     type Data = String;
///     type Output = ();
///     const NAME: &'static str = "send_notification";
///
///     async fn execute(&self, recipient: String, context: JobContext) -> ExecutionResult<()> {
///         context.log(LogLevel::Info, format!("notifying {recipient}")).await;
///         ExecutionResult::Done(())
///     }
/// }
/// ```
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// The type the job payload is decoded into.
    ///
    /// If this is not needed it can be set to unit `()`.
    type Data: DeserializeOwned + Send;
    /// The type of the result stored on the job when an attempt succeeds.
    type Output: Serialize + Send;
    /// The task type name.
    ///
    /// This is used to associate the jobs stored in the job store with this particular executor,
    /// so it should stay stable when the rust type is renamed.
    const NAME: &'static str;
    /// This flag should be set to true if the job is computationally expensive.
    ///
    /// Under the covers this results in the attempt being ran via
    /// [`tokio::task::spawn_blocking`]. See it's docs for more details about blocking futures.
    const BLOCKING: bool = false;

    async fn execute(&self, data: Self::Data, context: JobContext) -> ExecutionResult<Self::Output>;

    /// Additional checks on a decoded payload, run at submission.
    ///
    /// Returning an error rejects the submission without creating a job.
    fn validate(&self, _data: &Self::Data) -> Result<(), String> {
        Ok(())
    }

    fn builder() -> JobBuilder<Self::Data>
    where
        Self: Sized,
    {
        JobBuilder::new(Self::NAME)
    }
}

/// The outcome of one attempt as reported by the executor.
pub enum ExecutionResult<T> {
    Done(T),
    /// The executor gave up deliberately, for example after observing
    /// [`JobContext::cancelled`]. The job is marked cancelled.
    Cancelled {
        reason: Box<dyn CancellationReason>,
    },
    Error {
        error: Box<dyn ExecutionError>,
    },
}

impl<T> ExecutionResult<T> {
    pub fn error(error: impl ExecutionError + 'static) -> Self {
        Self::Error {
            error: Box::new(error),
        }
    }

    pub fn cancelled(reason: impl CancellationReason + 'static) -> Self {
        Self::Cancelled {
            reason: Box::new(reason),
        }
    }
}

impl<T, E> From<Result<T, E>> for ExecutionResult<T>
where
    E: ExecutionError + 'static,
{
    fn from(value: Result<T, E>) -> Self {
        match value {
            Ok(output) => Self::Done(output),
            Err(error) => Self::error(error),
        }
    }
}

/// An error returned by an executor.
///
/// Errors are retryable by default; return `false` from [`ExecutionError::retryable`] for
/// failures that will not go away on their own.
pub trait ExecutionError: Error + Send {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::ExecutionError
    }

    fn retryable(&self) -> bool {
        true
    }
}

pub trait CancellationReason: Display + Send {}

impl<T> CancellationReason for T where T: Display + Send {}

/// A ready made [`ExecutionError`] for executors without their own error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TaskFailure {
    message: String,
    retryable: bool,
}

impl TaskFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl ExecutionError for TaskFailure {
    fn retryable(&self) -> bool {
        self.retryable
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::job::LogLevel;

    pub(crate) struct SimpleExecutor;

    #[async_trait]
    impl Executor for SimpleExecutor {
        type Data = String;
        type Output = String;
        const NAME: &'static str = "simple_executor";

        async fn execute(&self, data: Self::Data, _context: JobContext) -> ExecutionResult<String> {
            ExecutionResult::Done(data.to_uppercase())
        }

        fn validate(&self, data: &Self::Data) -> Result<(), String> {
            if data.is_empty() {
                Err("data must not be empty".to_owned())
            } else {
                Ok(())
            }
        }
    }

    pub(crate) struct MockReturnExecutor;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) enum MockExecutionResult {
        Done,
        Panic,
        Error { retryable: bool },
        Cancelled { reason: String },
        Sleep { millis: u64 },
        WaitForCancellation,
        Progress { steps: u64 },
    }

    #[async_trait]
    impl Executor for MockReturnExecutor {
        type Data = MockExecutionResult;
        type Output = serde_json::Value;
        const NAME: &'static str = "basic_executor";

        async fn execute(
            &self,
            data: Self::Data,
            context: JobContext,
        ) -> ExecutionResult<serde_json::Value> {
            match data {
                MockExecutionResult::Done => ExecutionResult::Done(serde_json::json!("done")),
                MockExecutionResult::Panic => panic!("job panicked"),
                MockExecutionResult::Error { retryable: true } => {
                    ExecutionResult::error(TaskFailure::retryable("transient"))
                }
                MockExecutionResult::Error { retryable: false } => {
                    ExecutionResult::error(TaskFailure::fatal("permanent"))
                }
                MockExecutionResult::Cancelled { reason } => ExecutionResult::cancelled(reason),
                MockExecutionResult::Sleep { millis } => {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    ExecutionResult::Done(serde_json::json!("slept"))
                }
                MockExecutionResult::WaitForCancellation => {
                    context.cancelled().await;
                    ExecutionResult::cancelled("observed cancellation")
                }
                MockExecutionResult::Progress { steps } => {
                    for step in 1..=steps {
                        context.report_progress(step, steps, format!("step {step}")).await;
                        context.log(LogLevel::Debug, format!("finished step {step}")).await;
                    }
                    ExecutionResult::Done(serde_json::json!({ "steps": steps }))
                }
            }
        }
    }

    #[test]
    fn task_failure_retryability() {
        assert!(TaskFailure::retryable("x").retryable());
        assert!(!TaskFailure::fatal("x").retryable());
        assert_eq!(
            TaskFailure::fatal("x").error_code(),
            ErrorCode::ExecutionError
        );
    }

    #[test]
    fn execution_result_from_result() {
        let done: ExecutionResult<u8> = Ok::<_, TaskFailure>(3).into();
        assert!(matches!(done, ExecutionResult::Done(3)));

        let error: ExecutionResult<u8> = Err(TaskFailure::fatal("no")).into();
        assert!(matches!(error, ExecutionResult::Error { error } if !error.retryable()));
    }
}
