//! Lifecycle notifications for external subscribers.
//!
//! Delivery is best effort and at most once per observed state change. A subscriber that misses
//! an event recovers by querying the scheduler.
use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::job::{Job, JobId, JobStatus, Progress};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    StatusChanged,
    ProgressUpdated,
}

/// A snapshot of a job at the moment a change was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub owner_ref: String,
    pub task_type: String,
    pub kind: EventKind,
    pub status: JobStatus,
    pub progress: Progress,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub(crate) fn new(kind: EventKind, job: &Job) -> Self {
        Self {
            job_id: job.id,
            owner_ref: job.owner_ref.clone(),
            task_type: job.task_type.clone(),
            kind,
            status: job.status,
            progress: job.progress.clone(),
            timestamp: job.updated_at,
        }
    }
}

/// Receives job lifecycle events.
///
/// Implementations must not block: `notify` is called while the scheduler is processing a
/// transition. A panicking sink is contained and logged.
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    fn notify(&self, event: JobEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn notify(&self, _event: JobEvent) {}
}

impl EventSink for mpsc::UnboundedSender<JobEvent> {
    fn notify(&self, event: JobEvent) {
        if let Err(err) = self.send(event) {
            tracing::debug!(job_id = %err.0.job_id, "Event receiver dropped, discarding event");
        }
    }
}

/// Fans events out to any number of subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<JobEvent>,
}

impl BroadcastSink {
    /// `capacity` events are buffered per subscriber; slower subscribers skip ahead.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> impl Stream<Item = JobEvent> {
        let mut receiver = self.sender.subscribe();
        stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event subscriber lagging, {skipped} events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Only the events for one owner.
    pub fn subscribe_owner(&self, owner_ref: impl Into<String>) -> impl Stream<Item = JobEvent> {
        let owner_ref = owner_ref.into();
        let events = self.subscribe();
        stream! {
            for await event in events {
                if event.owner_ref == owner_ref {
                    yield event;
                }
            }
        }
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastSink {
    fn notify(&self, event: JobEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}
