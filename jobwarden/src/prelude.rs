//! The purpose of this module is to alleviate the need to import many of the `[jobwarden]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use jobwarden::prelude::*;
//! ```
pub use crate::backoff::BackoffStrategy;
pub use crate::events::{BroadcastSink, EventKind, EventSink, JobEvent, NoopSink};
pub use crate::executor::{ExecutionError, ExecutionResult, Executor, TaskFailure};
pub use crate::job::builder::{JobBuilder, NewJob};
pub use crate::job::query::{JobQuery, SortDirection, SortKey};
pub use crate::job::{ErrorCode, Job, JobId, JobPolicy, JobStatus, LogLevel, Priority};
pub use crate::pruner::{Pruner, PrunerConfig};
pub use crate::store::{memory::InMemoryStore, JobStore};
pub use crate::{JobContext, JobwardenError, Scheduler, SchedulerConfig};
