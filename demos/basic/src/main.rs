use std::{str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::TimeDelta;
use futures::StreamExt;
use jobwarden::{prelude::*, testing::wait_for_status};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() -> Result<(), JobwardenError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let events = Arc::new(BroadcastSink::default());
    let mut stream = Box::pin(events.subscribe());
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            tracing::info!(
                job_id = %event.job_id,
                task_type = %event.task_type,
                kind = ?event.kind,
                status = %event.status,
                "Progress {}/{}",
                event.progress.current,
                event.progress.total,
            );
        }
    });

    let schedule = cron::Schedule::from_str("0 * * * * *")
        .map_err(|error| JobwardenError::Config(error.to_string()))?;
    let scheduler = Scheduler::builder(InMemoryStore::new())
        .with_config(SchedulerConfig::from_env()?)
        .with_executor(GenerateReport)
        .with_executor(SendNotification::default())
        .with_shared_event_sink(events)
        .with_job_pruner(
            PrunerConfig::new(schedule)
                .with_pruner(Pruner::max_age(TimeDelta::minutes(5), JobStatus::Completed))
                .with_pruner(Pruner::max_length(100, JobStatus::Failed)),
        )
        .build()?;
    scheduler.start().await?;

    let report = GenerateReport::builder()
        .owned_by("demo")
        .with_data(ReportRequest {
            year: 2024,
            sections: 4,
        })
        .with_priority(Priority::High)
        .submit(&scheduler)
        .await?;

    let notification = SendNotification::builder()
        .owned_by("demo")
        .with_data("ops@example.com".to_owned())
        .with_retry_base_delay(TimeDelta::milliseconds(200))
        .with_parent(report.id)
        .submit(&scheduler)
        .await?;

    let finished = async {
        for id in [report.id, notification.id] {
            match wait_for_status(&scheduler, id, JobStatus::Completed, Duration::from_secs(10)).await? {
                Some(job) => tracing::info!(
                    job_id = %job.id,
                    attempts = job.attempt,
                    result = ?job.result,
                    "Job finished"
                ),
                None => tracing::warn!(job_id = %id, "Job did not finish in time"),
            }
        }
        Ok::<_, JobwardenError>(())
    };
    tokio::select! {
        result = finished => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, shutting down"),
    }

    let stats = scheduler.stats().await?;
    tracing::info!(?stats, "Scheduler statistics");

    scheduler.stop().await
}

#[derive(Debug, Serialize, Deserialize)]
struct ReportRequest {
    year: u16,
    sections: u64,
}

struct GenerateReport;

#[async_trait]
impl Executor for GenerateReport {
    type Data = ReportRequest;
    type Output = String;
    const NAME: &'static str = "generate_report";

    async fn execute(&self, request: ReportRequest, context: JobContext) -> ExecutionResult<String> {
        for section in 1..=request.sections {
            if context.is_cancelled() {
                return ExecutionResult::cancelled("report no longer needed");
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
            context
                .report_progress(section, request.sections, format!("section {section} written"))
                .await;
        }
        ExecutionResult::Done(format!("report-{}.pdf", request.year))
    }

    fn validate(&self, request: &ReportRequest) -> Result<(), String> {
        if request.sections == 0 {
            return Err("a report needs at least one section".to_owned());
        }
        Ok(())
    }
}

/// Fails the first attempt to show retries.
#[derive(Default)]
struct SendNotification {
    attempts: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl Executor for SendNotification {
    type Data = String;
    type Output = ();
    const NAME: &'static str = "send_notification";

    async fn execute(&self, recipient: String, context: JobContext) -> ExecutionResult<()> {
        let attempt = self
            .attempts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if attempt == 0 {
            return ExecutionResult::error(TaskFailure::retryable("mail server unavailable"));
        }
        context
            .log(LogLevel::Info, format!("notified {recipient}"))
            .await;
        ExecutionResult::Done(())
    }
}
