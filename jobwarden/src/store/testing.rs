//! Test suite for ensuring a correct implementation of a [`JobStore`].
use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    job::{
        query::{JobQuery, SortDirection, SortKey},
        ErrorCode, Job, JobError, JobId, JobPolicy, JobStatus, LogEntry, LogLevel, Progress,
    },
    pruner::{PruneBy, PruneSpec, Spec},
};

use super::{JobStore, StoreError};

const DEFAULT_TASK_TYPE: &str = "task";

/// A fully populated pending job, usable as a fixture by store implementations.
pub fn mock_job() -> Job {
    let now = Utc::now();
    Job {
        id: JobId::new(),
        owner_ref: "owner".to_owned(),
        task_type: DEFAULT_TASK_TYPE.to_owned(),
        status: JobStatus::Pending,
        priority: 5,
        payload: serde_json::json!({ "data": [1, 2, 3] }),
        result: None,
        progress: Progress::default(),
        policy: JobPolicy::default(),
        attempt: 0,
        errors: vec![],
        logs: VecDeque::new(),
        dependencies: vec![],
        parent_id: None,
        child_ids: vec![],
        created_at: now,
        updated_at: now,
        started_at: None,
        attempted_at: None,
        completed_at: None,
        scheduled_not_before: None,
        expires_at: None,
    }
}

fn finished(status: JobStatus, completed_at: DateTime<Utc>) -> Job {
    let mut job = mock_job();
    job.status = status;
    job.attempt = 1;
    job.started_at = Some(completed_at - TimeDelta::seconds(1));
    job.attempted_at = job.started_at;
    job.completed_at = Some(completed_at);
    job
}

/// Create test suite for a [`JobStore`] implementation.
///
/// Store implementors should include this as part of their test suites.
///
/// # Example
///
/// ```
/// use jobwarden::store::memory::InMemoryStore;
/// use jobwarden::store_test_suite;
/// store_test_suite!(for: InMemoryStore::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead. For example when using `sqlx::test` you could do the following:
///
/// ```ignore
/// use jobwarden::store_test_suite;
/// store_test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     store: PgJobStore::from(pool)
/// );
/// ```
#[macro_export]
macro_rules! store_test_suite {
    (for: $store:expr) => {
        $crate::store_test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        #[$attr]
        async fn insert_and_get $args {
            let store = $store;
            $crate::store::testing::insert_and_get(store).await;
        }
        #[$attr]
        async fn insert_duplicate_is_rejected $args {
            let store = $store;
            $crate::store::testing::insert_duplicate_is_rejected(store).await;
        }
        #[$attr]
        async fn get_unknown_job $args {
            let store = $store;
            $crate::store::testing::get_unknown_job(store).await;
        }
        #[$attr]
        async fn update_job $args {
            let store = $store;
            $crate::store::testing::update_job(store).await;
        }
        #[$attr]
        async fn update_job_conflict $args {
            let store = $store;
            $crate::store::testing::update_job_conflict(store).await;
        }
        #[$attr]
        async fn update_job_not_found $args {
            let store = $store;
            $crate::store::testing::update_job_not_found(store).await;
        }
        #[$attr]
        async fn list_filters $args {
            let store = $store;
            $crate::store::testing::list_filters(store).await;
        }
        #[$attr]
        async fn list_sorts_and_paginates $args {
            let store = $store;
            $crate::store::testing::list_sorts_and_paginates(store).await;
        }
        #[$attr]
        async fn unfinished_jobs $args {
            let store = $store;
            $crate::store::testing::unfinished_jobs(store).await;
        }
        #[$attr]
        async fn statistics $args {
            let store = $store;
            $crate::store::testing::statistics(store).await;
        }
        #[$attr]
        async fn prune_by_max_age $args {
            let store = $store;
            $crate::store::testing::prune_by_max_age(store).await;
        }
        #[$attr]
        async fn prune_by_max_length $args {
            let store = $store;
            $crate::store::testing::prune_by_max_length(store).await;
        }
        #[$attr]
        async fn prune_respects_task_types $args {
            let store = $store;
            $crate::store::testing::prune_respects_task_types(store).await;
        }
        #[$attr]
        async fn prune_never_removes_unfinished_jobs $args {
            let store = $store;
            $crate::store::testing::prune_never_removes_unfinished_jobs(store).await;
        }
    };
}

#[doc(hidden)]
pub async fn insert_and_get(store: impl JobStore) {
    let mut job = mock_job();
    job.logs.push_back(LogEntry {
        level: LogLevel::Info,
        message: "queued".to_owned(),
        occurred_at: job.created_at,
    });
    job.dependencies.push(JobId::new());
    store.insert(&job).await.unwrap();

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.id, job.id);
    assert_eq!(stored.payload, job.payload);
    assert_eq!(stored.logs.len(), 1);
    assert_eq!(stored.dependencies, job.dependencies);
    assert_eq!(stored.policy, job.policy);
}

#[doc(hidden)]
pub async fn insert_duplicate_is_rejected(store: impl JobStore) {
    let job = mock_job();
    store.insert(&job).await.unwrap();

    let result = store.insert(&job).await;
    assert!(matches!(result, Err(StoreError::AlreadyExists(id)) if id == job.id));
}

#[doc(hidden)]
pub async fn get_unknown_job(store: impl JobStore) {
    assert!(store.get(JobId::new()).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn update_job(store: impl JobStore) {
    let mut job = mock_job();
    store.insert(&job).await.unwrap();

    job.status = JobStatus::Running;
    job.attempt = 1;
    job.progress = Progress {
        current: 2,
        total: 4,
        message: Some("halfway".to_owned()),
    };
    job.errors.push(JobError {
        attempt: 1,
        code: ErrorCode::Timeout,
        message: "too slow".to_owned(),
        occurred_at: job.created_at,
        retryable: true,
    });
    store.update(&job, JobStatus::Pending).await.unwrap();

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.attempt, 1);
    assert_eq!(stored.progress, job.progress);
    assert_eq!(stored.errors.len(), 1);
    assert_eq!(stored.errors[0].code, ErrorCode::Timeout);
}

#[doc(hidden)]
pub async fn update_job_conflict(store: impl JobStore) {
    let mut job = mock_job();
    store.insert(&job).await.unwrap();

    job.status = JobStatus::Completed;
    let result = store.update(&job, JobStatus::Running).await;
    assert!(matches!(
        result,
        Err(StoreError::Conflict {
            expected: JobStatus::Running,
            actual: JobStatus::Pending,
            ..
        })
    ));
    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
}

#[doc(hidden)]
pub async fn update_job_not_found(store: impl JobStore) {
    let job = mock_job();
    let result = store.update(&job, JobStatus::Pending).await;
    assert!(matches!(result, Err(StoreError::JobNotFound(id)) if id == job.id));
}

#[doc(hidden)]
pub async fn list_filters(store: impl JobStore) {
    let parent = mock_job();
    let mut child = mock_job();
    child.owner_ref = "other".to_owned();
    child.parent_id = Some(parent.id);
    let mut failed = mock_job();
    failed.status = JobStatus::Failed;
    failed.task_type = "another_task".to_owned();
    for job in [&parent, &child, &failed] {
        store.insert(job).await.unwrap();
    }

    let ids = |jobs: Vec<Job>| {
        let mut ids: Vec<JobId> = jobs.into_iter().map(|job| job.id).collect();
        ids.sort();
        ids
    };
    let sorted = |mut expected: Vec<JobId>| {
        expected.sort();
        expected
    };

    let owned = store.list(&JobQuery::for_owner("owner")).await.unwrap();
    assert_eq!(ids(owned), sorted(vec![parent.id, failed.id]));

    let failed_only = store
        .list(&JobQuery::all().with_status(JobStatus::Failed))
        .await
        .unwrap();
    assert_eq!(ids(failed_only), vec![failed.id]);

    let by_task_type = store
        .list(&JobQuery::all().with_task_type(DEFAULT_TASK_TYPE))
        .await
        .unwrap();
    assert_eq!(ids(by_task_type), sorted(vec![parent.id, child.id]));

    let children = store
        .list(&JobQuery::all().with_parent(parent.id))
        .await
        .unwrap();
    assert_eq!(ids(children), vec![child.id]);

    let none = store
        .list(&JobQuery::for_owner("owner").with_status(JobStatus::Running))
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[doc(hidden)]
pub async fn list_sorts_and_paginates(store: impl JobStore) {
    let now = Utc::now();
    let mut jobs = vec![];
    for i in 0..5 {
        let mut job = mock_job();
        job.created_at = now + TimeDelta::seconds(i);
        job.priority = [1, 10, 5, 10, 1][i as usize];
        store.insert(&job).await.unwrap();
        jobs.push(job);
    }

    let ids = |listed: Vec<Job>| listed.into_iter().map(|job| job.id).collect::<Vec<_>>();

    let newest_first = store.list(&JobQuery::all()).await.unwrap();
    assert_eq!(
        ids(newest_first),
        jobs.iter().rev().map(|job| job.id).collect::<Vec<_>>()
    );

    let page = store
        .list(
            &JobQuery::all()
                .sort_by(SortKey::CreatedAt, SortDirection::Ascending)
                .skip(1)
                .limit(3),
        )
        .await
        .unwrap();
    assert_eq!(ids(page), vec![jobs[1].id, jobs[2].id, jobs[3].id]);

    let by_priority = store
        .list(&JobQuery::all().sort_by(SortKey::Priority, SortDirection::Descending))
        .await
        .unwrap();
    let priorities: Vec<i32> = by_priority.iter().map(|job| job.priority).collect();
    assert_eq!(priorities, vec![10, 10, 5, 1, 1]);
}

#[doc(hidden)]
pub async fn unfinished_jobs(store: impl JobStore) {
    let pending = mock_job();
    let mut running = mock_job();
    running.status = JobStatus::Running;
    let completed = finished(JobStatus::Completed, Utc::now());
    let cancelled = finished(JobStatus::Cancelled, Utc::now());
    for job in [&pending, &running, &completed, &cancelled] {
        store.insert(job).await.unwrap();
    }

    let mut unfinished: Vec<JobId> = store
        .unfinished()
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    unfinished.sort();
    let mut expected = vec![pending.id, running.id];
    expected.sort();
    assert_eq!(unfinished, expected);
}

#[doc(hidden)]
pub async fn statistics(store: impl JobStore) {
    let now = Utc::now();
    let mut slow = finished(JobStatus::Completed, now);
    slow.started_at = Some(now - TimeDelta::milliseconds(3_000));
    slow.attempt = 2;
    let fast = finished(JobStatus::Completed, now);
    let mut failed = finished(JobStatus::Failed, now);
    failed.task_type = "another_task".to_owned();
    failed.errors.push(JobError {
        attempt: 1,
        code: ErrorCode::ExecutionError,
        message: "boom".to_owned(),
        occurred_at: now,
        retryable: false,
    });
    for job in [&slow, &fast, &failed, &mock_job()] {
        store.insert(job).await.unwrap();
    }

    let statistics = store.statistics().await.unwrap();
    assert_eq!(statistics.total(), 4);
    assert_eq!(statistics.count(JobStatus::Completed), 2);
    assert_eq!(statistics.count(JobStatus::Failed), 1);
    assert_eq!(statistics.count(JobStatus::Pending), 1);
    assert_eq!(statistics.by_task_type.get(DEFAULT_TASK_TYPE), Some(&3));
    assert_eq!(statistics.by_task_type.get("another_task"), Some(&1));
    assert_eq!(statistics.failed_attempts, 1);
    assert_eq!(statistics.retried_jobs, 1);
    let mean = statistics.mean_duration_ms.unwrap();
    assert!((mean - 2_000.0).abs() < 1.0, "mean duration was {mean}");
}

#[doc(hidden)]
pub async fn prune_by_max_age(store: impl JobStore) {
    let now = Utc::now();
    let old = finished(JobStatus::Completed, now - TimeDelta::days(10));
    let recent = finished(JobStatus::Completed, now - TimeDelta::hours(1));
    let old_failed = finished(JobStatus::Failed, now - TimeDelta::days(10));
    for job in [&old, &recent, &old_failed] {
        store.insert(job).await.unwrap();
    }

    let removed = store
        .prune(&PruneSpec {
            status: JobStatus::Completed,
            prune_by: PruneBy::MaxAge(TimeDelta::days(1)),
            task_types: Spec::Except(vec![]),
        })
        .await
        .unwrap();

    assert_eq!(removed, 1);
    assert!(store.get(old.id).await.unwrap().is_none());
    assert!(store.get(recent.id).await.unwrap().is_some());
    assert!(store.get(old_failed.id).await.unwrap().is_some());
}

#[doc(hidden)]
pub async fn prune_by_max_length(store: impl JobStore) {
    let now = Utc::now();
    let jobs: Vec<Job> = (0..4)
        .map(|i| finished(JobStatus::Cancelled, now - TimeDelta::minutes(i)))
        .collect();
    for job in &jobs {
        store.insert(job).await.unwrap();
    }

    let removed = store
        .prune(&PruneSpec {
            status: JobStatus::Cancelled,
            prune_by: PruneBy::MaxLength(2),
            task_types: Spec::Except(vec![]),
        })
        .await
        .unwrap();

    assert_eq!(removed, 2);
    // The most recently finished jobs are kept.
    assert!(store.get(jobs[0].id).await.unwrap().is_some());
    assert!(store.get(jobs[1].id).await.unwrap().is_some());
    assert!(store.get(jobs[2].id).await.unwrap().is_none());
    assert!(store.get(jobs[3].id).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn prune_respects_task_types(store: impl JobStore) {
    let old = Utc::now() - TimeDelta::days(10);
    let default_task = finished(JobStatus::Completed, old);
    let mut another_task = finished(JobStatus::Completed, old);
    another_task.task_type = "another_task".to_owned();
    for job in [&default_task, &another_task] {
        store.insert(job).await.unwrap();
    }

    let removed = store
        .prune(&PruneSpec {
            status: JobStatus::Completed,
            prune_by: PruneBy::MaxAge(TimeDelta::days(1)),
            task_types: Spec::Only(vec!["another_task"]),
        })
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(store.get(another_task.id).await.unwrap().is_none());

    let removed = store
        .prune(&PruneSpec {
            status: JobStatus::Completed,
            prune_by: PruneBy::MaxAge(TimeDelta::days(1)),
            task_types: Spec::Except(vec![DEFAULT_TASK_TYPE]),
        })
        .await
        .unwrap();
    assert_eq!(removed, 0);
    assert!(store.get(default_task.id).await.unwrap().is_some());
}

#[doc(hidden)]
pub async fn prune_never_removes_unfinished_jobs(store: impl JobStore) {
    let mut pending = mock_job();
    pending.updated_at = Utc::now() - TimeDelta::days(10);
    store.insert(&pending).await.unwrap();

    let removed = store
        .prune(&PruneSpec {
            status: JobStatus::Pending,
            prune_by: PruneBy::MaxLength(0),
            task_types: Spec::Except(vec![]),
        })
        .await
        .unwrap();

    assert_eq!(removed, 0);
    assert!(store.get(pending.id).await.unwrap().is_some());
}
