//! A background job scheduler.
//!
//! Jobs are submitted for a task type, persisted through a [`store::JobStore`], and executed by
//! the [`Executor`] registered for that task type under a fixed concurrency ceiling. Failed
//! attempts are retried with exponential backoff, overrunning attempts are timed out, and every
//! transition is reported to an [`events::EventSink`].
//!
//! ```
//! use jobwarden::prelude::*;
//!
//! struct Shout;
//!
//! #[async_trait::async_trait]
//! impl Executor for Shout {
//!     type Data = String;
//!     type Output = String;
//!     const NAME: &'static str = "shout";
//!
//!     async fn execute(&self, data: String, _context: JobContext) -> ExecutionResult<String> {
//!         ExecutionResult::Done(data.to_uppercase())
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let scheduler = Scheduler::builder(InMemoryStore::new())
//!     .with_executor(Shout)
//!     .build()
//!     .unwrap();
//!
//! let job = Shout::builder()
//!     .with_data("hello".to_owned())
//!     .submit(&scheduler)
//!     .await
//!     .unwrap();
//! assert_eq!(job.status, JobStatus::Pending);
//! # });
//! ```
pub mod backoff;
pub mod config;
pub mod context;
pub mod events;
pub mod executor;
pub mod job;
pub mod prelude;
pub mod pruner;
mod registry;
mod scheduler;
pub mod store;
pub mod testing;

use job::JobId;
use store::StoreError;
use thiserror::Error;

pub use config::SchedulerConfig;
pub use context::JobContext;
pub use executor::{ExecutionError, ExecutionResult, Executor};
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerStats};

#[derive(Debug, Error)]
pub enum JobwardenError {
    #[error("No executor registered for task type {0}")]
    UnknownTaskType(String),
    #[error("Invalid job for {task_type}: {reason}")]
    Validation { task_type: String, reason: String },
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Error communicating with the store")]
    Store(#[from] StoreError),
    #[error("Error encoding or decoding value")]
    EncodeError(#[from] serde_json::Error),
    #[error("The scheduler is already running")]
    AlreadyStarted,
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Invalid configuration: {0}")]
    Config(String),
}
