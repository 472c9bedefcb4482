//! Helpers for testing code that submits jobs.
use std::time::Duration;

use crate::{
    job::{Job, JobId, JobStatus},
    store::JobStore,
    JobwardenError, Scheduler,
};

/// Poll `scheduler` until job `id` satisfies `predicate`, for at most `timeout`.
///
/// Returns `None` if the job never satisfied `predicate`, or does not exist.
pub async fn wait_for<S, F>(
    scheduler: &Scheduler<S>,
    id: JobId,
    timeout: Duration,
    predicate: F,
) -> Result<Option<Job>, JobwardenError>
where
    S: JobStore,
    F: Fn(&Job) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(job) = scheduler.job(id).await? {
            if predicate(&job) {
                return Ok(Some(job));
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll `scheduler` until job `id` reaches `status`, for at most `timeout`.
pub async fn wait_for_status<S: JobStore>(
    scheduler: &Scheduler<S>,
    id: JobId,
    status: JobStatus,
    timeout: Duration,
) -> Result<Option<Job>, JobwardenError> {
    wait_for(scheduler, id, timeout, |job| job.status == status).await
}

/// A macro for making assertions about the jobs held by a scheduler's store.
///
/// Assertions can be based on status, owner, task type, parent and payload.
///
/// # Example
///
/// ```
/// # use jobwarden::prelude::*;
/// # use jobwarden::testing::assert_jobs;
/// # struct SimpleExecutor;
/// #
/// # #[async_trait::async_trait]
/// # impl Executor for SimpleExecutor {
/// #     type Data = String;
/// #     type Output = ();
/// #     const NAME: &'static str = "simple_executor";
/// #     async fn execute(&self, _data: String, _context: JobContext) -> ExecutionResult<()> {
/// #         ExecutionResult::Done(())
/// #     }
/// # }
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let scheduler = Scheduler::builder(InMemoryStore::new())
///     .with_executor(SimpleExecutor)
///     .build()
///     .unwrap();
///
/// SimpleExecutor::builder()
///     .owned_by("session-1")
///     .with_data("data".to_owned())
///     .submit(&scheduler)
///     .await
///     .unwrap();
///
/// assert_jobs!(
///     in: scheduler,
///     with_data: "data".to_owned(),
///     for_executor: SimpleExecutor
/// );
///
/// assert_jobs!(
///     1 job,
///     in: scheduler,
///     with_status: JobStatus::Pending,
///     owned_by: "session-1",
/// );
///
/// assert_jobs!(
///     0 jobs,
///     in: scheduler,
///     with_status: JobStatus::Completed,
///     for_executor: "simple_executor"
/// );
/// # });
/// ```
#[macro_export]
macro_rules! assert_jobs {
    (1 job, in: $scheduler:ident, $($tail:tt)*) => {
        $crate::assert_jobs!(@internal 1 in: $scheduler, $($tail)*);
    };
    ($n:literal jobs, in: $scheduler:ident, $($tail:tt)*) => {
        $crate::assert_jobs!(@internal $n in: $scheduler, $($tail)*);
    };
    (in: $scheduler:ident, $($tail:tt)*) => {
        $crate::assert_jobs!(@internal 1 in: $scheduler, $($tail)*);
    };
    (@internal $n:literal in: $scheduler:ident, $($tail:tt)*) => {{
        #[allow(unused_mut)]
        let mut query = $crate::job::query::JobQuery::all();
        #[allow(unused_mut)]
        let mut data: Option<serde_json::Value> = None;
        $crate::assert_jobs!(@query query, data; $($tail)*);
        let jobs: Vec<_> = $scheduler
            .list(&query)
            .await
            .unwrap()
            .into_iter()
            .filter(|job| data.as_ref().map_or(true, |data| &job.payload == data))
            .collect();
        let all_jobs = $scheduler
            .list(&$crate::job::query::JobQuery::all())
            .await
            .unwrap();
        assert!(
            jobs.len() == $n,
            "Unexpected number of jobs matching {},\n\n\
            Expected {} jobs, found {} matching jobs:\n\n\
            Matching jobs:\n\
            {jobs:#?}\n\n\
            All jobs:\n\
            {all_jobs:#?}",
            stringify!($($tail)*),
            $n,
            jobs.len(),
        );
    }};
    (@query $query:ident, $data:ident;) => {};
    (@query $query:ident, $data:ident; with_data: $value:expr $(, $($tail:tt)*)?) => {
        $data = Some(serde_json::to_value($value).unwrap());
        $($crate::assert_jobs!(@query $query, $data; $($tail)*);)?
    };
    (@query $query:ident, $data:ident; with_status: $status:expr $(, $($tail:tt)*)?) => {
        $query = $query.with_status($status);
        $($crate::assert_jobs!(@query $query, $data; $($tail)*);)?
    };
    (@query $query:ident, $data:ident; owned_by: $owner:expr $(, $($tail:tt)*)?) => {
        $query.owner_ref = Some(String::from($owner));
        $($crate::assert_jobs!(@query $query, $data; $($tail)*);)?
    };
    (@query $query:ident, $data:ident; with_parent: $parent:expr $(, $($tail:tt)*)?) => {
        $query = $query.with_parent($parent);
        $($crate::assert_jobs!(@query $query, $data; $($tail)*);)?
    };
    (@query $query:ident, $data:ident; for_executor: $executor:literal $(, $($tail:tt)*)?) => {
        $query = $query.with_task_type($executor);
        $($crate::assert_jobs!(@query $query, $data; $($tail)*);)?
    };
    (@query $query:ident, $data:ident; for_executor: $executor:path $(, $($tail:tt)*)?) => {{
        use $executor as base;
        $query = $query.with_task_type(<base as $crate::Executor>::NAME);
        $($crate::assert_jobs!(@query $query, $data; $($tail)*);)?
    }};
}

pub use assert_jobs;

#[cfg(test)]
mod test {
    use chrono::TimeDelta;

    use super::*;
    use crate::{
        executor::{
            test::{MockExecutionResult, MockReturnExecutor, SimpleExecutor},
            Executor,
        },
        store::memory::InMemoryStore,
    };

    #[tokio::test]
    async fn assert_jobs() {
        let scheduler = Scheduler::builder(InMemoryStore::new())
            .with_executor(SimpleExecutor)
            .build()
            .unwrap();

        let parent = SimpleExecutor::builder()
            .owned_by("owner")
            .with_data("data".to_owned())
            .schedule_in(TimeDelta::minutes(5))
            .submit(&scheduler)
            .await
            .unwrap();
        SimpleExecutor::builder()
            .with_data("child".to_owned())
            .with_parent(parent.id)
            .submit(&scheduler)
            .await
            .unwrap();

        assert_jobs!(
            1 job,
            in: scheduler,
            with_data: "data".to_owned(),
            for_executor: SimpleExecutor
        );
        assert_jobs!(
            in: scheduler,
            with_data: "data".to_owned(),
            for_executor: "simple_executor",
        );
        assert_jobs!(in: scheduler, owned_by: "owner", with_status: JobStatus::Pending);
        assert_jobs!(in: scheduler, with_parent: parent.id);
        assert_jobs!(2 jobs, in: scheduler, with_status: JobStatus::Pending,);
        assert_jobs!(
            0 jobs,
            in: scheduler,
            with_data: "data2".to_owned(),
            for_executor: SimpleExecutor
        );
    }

    #[tokio::test]
    async fn wait_for_status_times_out() {
        let scheduler = Scheduler::builder(InMemoryStore::new())
            .with_executor(MockReturnExecutor)
            .build()
            .unwrap();
        let job = MockReturnExecutor::builder()
            .with_data(MockExecutionResult::Done)
            .submit(&scheduler)
            .await
            .unwrap();

        let waited =
            wait_for_status(&scheduler, job.id, JobStatus::Completed, Duration::from_millis(20))
                .await
                .unwrap();
        assert!(waited.is_none());

        scheduler.run_admission_cycle().await.unwrap();
        let completed =
            wait_for_status(&scheduler, job.id, JobStatus::Completed, Duration::from_secs(1))
                .await
                .unwrap()
                .unwrap();
        assert_eq!(completed.result, Some(serde_json::json!("done")));
    }
}
