use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use assert_matches::assert_matches;
use chrono::TimeDelta;
use jobwarden::{
    prelude::*,
    testing::{wait_for, wait_for_status},
};
use tokio::sync::{mpsc, Semaphore};

const WAIT: Duration = Duration::from_secs(5);

struct AlwaysFails;

#[async_trait::async_trait]
impl Executor for AlwaysFails {
    type Data = ();
    type Output = ();
    const NAME: &'static str = "always_fails";

    async fn execute(&self, _data: (), _context: JobContext) -> ExecutionResult<()> {
        ExecutionResult::error(TaskFailure::retryable("executor threw"))
    }
}

/// Blocks every attempt until the test hands out a permit.
struct Gated {
    gate: Arc<Semaphore>,
}

#[async_trait::async_trait]
impl Executor for Gated {
    type Data = u32;
    type Output = u32;
    const NAME: &'static str = "gated";

    async fn execute(&self, data: u32, context: JobContext) -> ExecutionResult<u32> {
        tokio::select! {
            permit = self.gate.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    ExecutionResult::Done(data)
                }
                Err(_) => ExecutionResult::error(TaskFailure::fatal("gate closed")),
            },
            _ = context.cancelled() => ExecutionResult::cancelled("stopped while gated"),
        }
    }
}

/// Records the payload of every attempt in the order the attempts ran.
struct Recorder {
    ran: mpsc::UnboundedSender<String>,
}

#[async_trait::async_trait]
impl Executor for Recorder {
    type Data = String;
    type Output = ();
    const NAME: &'static str = "recorder";

    async fn execute(&self, data: String, _context: JobContext) -> ExecutionResult<()> {
        let _ = self.ran.send(data);
        ExecutionResult::Done(())
    }
}

/// Sleeps for the given number of milliseconds without looking at cancellation.
struct Sleeper;

#[async_trait::async_trait]
impl Executor for Sleeper {
    type Data = u64;
    type Output = ();
    const NAME: &'static str = "sleeper";

    async fn execute(&self, millis: u64, _context: JobContext) -> ExecutionResult<()> {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        ExecutionResult::Done(())
    }
}

/// Tracks how many attempts run at the same time.
#[derive(Default)]
struct Counting {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Executor for Counting {
    type Data = ();
    type Output = ();
    const NAME: &'static str = "counting";

    async fn execute(&self, _data: (), _context: JobContext) -> ExecutionResult<()> {
        let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(15)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        ExecutionResult::Done(())
    }
}

struct Steps;

#[async_trait::async_trait]
impl Executor for Steps {
    type Data = u64;
    type Output = u64;
    const NAME: &'static str = "steps";

    async fn execute(&self, steps: u64, context: JobContext) -> ExecutionResult<u64> {
        for step in 1..=steps {
            context
                .report_progress(step, steps, format!("step {step}"))
                .await;
        }
        context.log(LogLevel::Info, "all steps done").await;
        ExecutionResult::Done(steps)
    }
}

fn fast_config(concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        concurrency,
        poll_interval_ms: 10,
        timeout_sweep_interval_ms: 20,
        shutdown_grace_period_ms: 1_000,
        ..Default::default()
    }
}

#[tokio::test]
async fn failing_job_without_retries_fails_after_one_cycle() {
    let scheduler = Scheduler::builder(InMemoryStore::new())
        .with_executor(AlwaysFails)
        .build()
        .unwrap();
    let job = AlwaysFails::builder()
        .with_data(())
        .with_priority(Priority::High)
        .with_max_retries(0)
        .submit(&scheduler)
        .await
        .unwrap();

    assert_eq!(scheduler.run_admission_cycle().await.unwrap(), 1);
    let job = wait_for_status(&scheduler, job.id, JobStatus::Failed, WAIT)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(job.errors.len(), 1);
    assert_eq!(job.errors[0].code, ErrorCode::ExecutionError);
    assert_eq!(job.errors[0].message, "executor threw");
    assert_eq!(job.attempt, 1);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn admission_respects_the_concurrency_ceiling_in_creation_order() {
    let gate = Arc::new(Semaphore::new(0));
    let scheduler = Scheduler::builder(InMemoryStore::new())
        .with_config(fast_config(5))
        .with_executor(Gated { gate: gate.clone() })
        .build()
        .unwrap();

    let mut jobs = vec![];
    for i in 0..10 {
        jobs.push(
            Gated::builder()
                .with_data(i)
                .submit(&scheduler)
                .await
                .unwrap(),
        );
    }

    assert_eq!(scheduler.run_admission_cycle().await.unwrap(), 5);
    assert_eq!(scheduler.run_admission_cycle().await.unwrap(), 0);
    let running = scheduler
        .list(&JobQuery::all().with_status(JobStatus::Running))
        .await
        .unwrap();
    let mut running_ids: Vec<_> = running.iter().map(|job| job.id).collect();
    running_ids.sort();
    let mut first_five: Vec<_> = jobs[..5].iter().map(|job| job.id).collect();
    first_five.sort();
    assert_eq!(running_ids, first_five);

    gate.add_permits(5);
    for job in &jobs[..5] {
        wait_for(&scheduler, job.id, WAIT, |job| job.status != JobStatus::Running)
            .await
            .unwrap()
            .unwrap();
    }
    let stats = scheduler.stats().await.unwrap();
    assert_eq!(stats.active_attempts, 0);
    assert_eq!(stats.queue_depth, 5);

    gate.add_permits(5);
    scheduler.start().await.unwrap();
    for job in &jobs {
        let job = wait_for_status(&scheduler, job.id, JobStatus::Completed, WAIT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.attempt, 1);
    }
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn concurrency_ceiling_holds_under_load() {
    let executor = Counting::default();
    let peak = executor.peak.clone();
    let scheduler = Scheduler::builder(InMemoryStore::new())
        .with_config(fast_config(3))
        .with_executor(executor)
        .build()
        .unwrap();

    let mut ids = vec![];
    for _ in 0..12 {
        ids.push(
            Counting::builder()
                .with_data(())
                .submit(&scheduler)
                .await
                .unwrap()
                .id,
        );
    }
    scheduler.start().await.unwrap();
    for id in ids {
        wait_for_status(&scheduler, id, JobStatus::Completed, WAIT)
            .await
            .unwrap()
            .unwrap();
    }
    scheduler.stop().await.unwrap();

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "{peak} attempts ran at once");
    assert!(peak >= 1);
}

#[tokio::test]
async fn higher_priority_runs_first_then_creation_order() {
    let (ran, mut order) = mpsc::unbounded_channel();
    let scheduler = Scheduler::builder(InMemoryStore::new())
        .with_config(fast_config(1))
        .with_executor(Recorder { ran })
        .build()
        .unwrap();

    for (name, priority) in [
        ("low", Priority::Low),
        ("medium-1", Priority::Medium),
        ("high-1", Priority::High),
        ("medium-2", Priority::Medium),
        ("high-2", Priority::High),
    ] {
        Recorder::builder()
            .with_data(name.to_owned())
            .with_priority(priority)
            .submit(&scheduler)
            .await
            .unwrap();
    }
    scheduler.start().await.unwrap();

    let mut ran = vec![];
    while ran.len() < 5 {
        let name = tokio::time::timeout(WAIT, order.recv())
            .await
            .unwrap()
            .unwrap();
        ran.push(name);
    }
    scheduler.stop().await.unwrap();

    assert_eq!(ran, ["high-1", "high-2", "medium-1", "medium-2", "low"]);
}

#[tokio::test]
async fn retries_stop_after_max_retries_plus_one_attempts() {
    let scheduler = Scheduler::builder(InMemoryStore::new())
        .with_config(fast_config(2))
        .with_executor(AlwaysFails)
        .build()
        .unwrap();
    let job = AlwaysFails::builder()
        .with_data(())
        .with_max_retries(2)
        .with_retry_base_delay(TimeDelta::milliseconds(5))
        .submit(&scheduler)
        .await
        .unwrap();

    scheduler.start().await.unwrap();
    let job = wait_for_status(&scheduler, job.id, JobStatus::Failed, WAIT)
        .await
        .unwrap()
        .unwrap();
    scheduler.stop().await.unwrap();

    assert_eq!(job.attempt, 3);
    assert_eq!(job.errors.len(), 3);
    assert!(job.errors.iter().all(|error| error.retryable));
    assert_eq!(
        job.errors.iter().map(|error| error.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(!scheduler.retry(job.id).await.unwrap());
}

#[tokio::test]
async fn overrunning_attempt_is_timed_out_by_the_sweep() {
    let scheduler = Scheduler::builder(InMemoryStore::new())
        .with_config(fast_config(1))
        .with_executor(Sleeper)
        .build()
        .unwrap();
    let job = Sleeper::builder()
        .with_data(10_000)
        .with_timeout(TimeDelta::milliseconds(100))
        .with_max_retries(0)
        .submit(&scheduler)
        .await
        .unwrap();

    scheduler.start().await.unwrap();
    let job = wait_for_status(&scheduler, job.id, JobStatus::Failed, WAIT)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(job.errors.len(), 1);
    assert_eq!(job.errors[0].code, ErrorCode::Timeout);
    assert!(job.errors[0].retryable);
    let elapsed = job.completed_at.unwrap() - job.attempted_at.unwrap();
    assert!(elapsed >= TimeDelta::milliseconds(100));
    assert_eq!(scheduler.stats().await.unwrap().active_attempts, 0);
}

#[tokio::test]
async fn cancelled_before_admission_never_runs() {
    let (ran, mut order) = mpsc::unbounded_channel();
    let scheduler = Scheduler::builder(InMemoryStore::new())
        .with_executor(Recorder { ran })
        .build()
        .unwrap();
    let job = Recorder::builder()
        .with_data("never".to_owned())
        .submit(&scheduler)
        .await
        .unwrap();

    assert!(scheduler.cancel(job.id, "changed my mind").await.unwrap());
    assert!(!scheduler.cancel(job.id, "changed my mind").await.unwrap());
    assert_eq!(scheduler.run_admission_cycle().await.unwrap(), 0);

    let job = scheduler.job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.attempt, 0);
    assert!(job.started_at.is_none());
    assert_matches!(order.try_recv(), Err(mpsc::error::TryRecvError::Empty));
}

#[tokio::test]
async fn running_job_survives_a_restart() {
    let store = InMemoryStore::new();
    let stuck = Scheduler::builder(store.clone())
        .with_executor(Gated {
            gate: Arc::new(Semaphore::new(0)),
        })
        .build()
        .unwrap();
    let job = Gated::builder()
        .with_data(7)
        .submit(&stuck)
        .await
        .unwrap();
    stuck.run_admission_cycle().await.unwrap();
    let persisted = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(persisted.status, JobStatus::Running);
    assert_eq!(persisted.attempt, 1);

    let restarted = Scheduler::builder(store.clone())
        .with_config(fast_config(1))
        .with_executor(Gated {
            gate: Arc::new(Semaphore::new(1)),
        })
        .build()
        .unwrap();
    assert_eq!(restarted.start().await.unwrap(), 1);

    let job = wait_for_status(&restarted, job.id, JobStatus::Completed, WAIT)
        .await
        .unwrap()
        .unwrap();
    restarted.stop().await.unwrap();

    assert_eq!(job.attempt, 1);
    assert_eq!(job.result, Some(serde_json::json!(7)));
    assert!(job
        .logs
        .iter()
        .any(|log| log.message == "Attempt 1 was interrupted"));
}

#[tokio::test]
async fn stop_interrupts_attempts_without_counting_them() {
    let scheduler = Scheduler::builder(InMemoryStore::new())
        .with_config(fast_config(1))
        .with_executor(Gated {
            gate: Arc::new(Semaphore::new(0)),
        })
        .build()
        .unwrap();
    let job = Gated::builder()
        .with_data(1)
        .submit(&scheduler)
        .await
        .unwrap();

    scheduler.start().await.unwrap();
    wait_for_status(&scheduler, job.id, JobStatus::Running, WAIT)
        .await
        .unwrap()
        .unwrap();
    scheduler.stop().await.unwrap();

    let job = scheduler.job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt, 0);
    assert!(job.errors.is_empty());
}

#[tokio::test]
async fn events_follow_the_job_lifecycle() {
    let (sink, mut events) = mpsc::unbounded_channel();
    let scheduler = Scheduler::builder(InMemoryStore::new())
        .with_executor(Steps)
        .with_event_sink(sink)
        .build()
        .unwrap();
    let job = Steps::builder()
        .owned_by("session-7")
        .with_data(3)
        .submit(&scheduler)
        .await
        .unwrap();

    scheduler.run_admission_cycle().await.unwrap();
    let job = wait_for_status(&scheduler, job.id, JobStatus::Completed, WAIT)
        .await
        .unwrap()
        .unwrap();

    let mut seen = vec![];
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.job_id, job.id);
        assert_eq!(event.owner_ref, "session-7");
        seen.push((event.kind, event.status, event.progress.current));
    }
    assert_eq!(
        seen,
        vec![
            (EventKind::Created, JobStatus::Pending, 0),
            (EventKind::StatusChanged, JobStatus::Running, 0),
            (EventKind::ProgressUpdated, JobStatus::Running, 1),
            (EventKind::ProgressUpdated, JobStatus::Running, 2),
            (EventKind::ProgressUpdated, JobStatus::Running, 3),
            (EventKind::StatusChanged, JobStatus::Completed, 3),
        ]
    );
    assert_eq!(job.result, Some(serde_json::json!(3)));
    assert_eq!(job.logs.back().unwrap().message, "all steps done");
}

#[tokio::test]
async fn failed_job_can_be_retried_by_hand() {
    let scheduler = Scheduler::builder(InMemoryStore::new())
        .with_executor(Sleeper)
        .build()
        .unwrap();
    let job = Sleeper::builder()
        .with_data(0)
        .expires_in(TimeDelta::milliseconds(-1))
        .submit(&scheduler)
        .await
        .unwrap();

    scheduler.run_admission_cycle().await.unwrap();
    let failed = scheduler.job(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.errors[0].code, ErrorCode::Expired);

    assert!(scheduler.retry(job.id).await.unwrap());
    let retried = scheduler.job(job.id).await.unwrap().unwrap();
    assert_eq!(retried.status, JobStatus::Pending);
    assert!(failed.completed_at.is_some());
    assert_eq!(retried.completed_at, failed.completed_at);

    scheduler.run_admission_cycle().await.unwrap();
    let job = wait_for_status(&scheduler, job.id, JobStatus::Completed, WAIT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.attempt, 1);
    assert_eq!(job.errors.len(), 1);
    assert_eq!(job.completed_at, failed.completed_at);
}
