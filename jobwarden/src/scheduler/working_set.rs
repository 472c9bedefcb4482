use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use fxhash::FxHashMap;
use tokio_util::sync::CancellationToken;

use crate::job::{Job, JobId, JobStatus};

/// The handle of an attempt that has been dispatched and not yet reported back.
#[derive(Debug, Clone)]
pub(crate) struct ActiveAttempt {
    pub(crate) attempt: u16,
    pub(crate) token: CancellationToken,
}

/// The scheduler's cache of unfinished jobs, plus the attempts currently executing.
#[derive(Debug, Default)]
pub(crate) struct WorkingSet {
    pub(crate) jobs: FxHashMap<JobId, Job>,
    pub(crate) active: FxHashMap<JobId, ActiveAttempt>,
    last_created_at: Option<DateTime<Utc>>,
}

impl WorkingSet {
    /// A creation timestamp strictly greater than any handed out before.
    ///
    /// Timestamps are truncated to microseconds so the ordering survives stores with microsecond
    /// precision.
    pub(crate) fn next_created_at(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let now = now.trunc_subsecs(6);
        let created_at = match self.last_created_at {
            Some(last) if now <= last => last + TimeDelta::microseconds(1),
            _ => now,
        };
        self.last_created_at = Some(created_at);
        created_at
    }

    /// Whether the live attempt of `id` is `attempt`.
    pub(crate) fn is_live(&self, id: JobId, attempt: u16) -> bool {
        self.active
            .get(&id)
            .is_some_and(|active| active.attempt == attempt)
            && self
                .jobs
                .get(&id)
                .is_some_and(|job| job.status == JobStatus::Running && job.attempt == attempt)
    }

    /// Drop the attempt handle of `id`, signalling its executor to stop.
    pub(crate) fn cancel_attempt(&mut self, id: JobId) -> Option<ActiveAttempt> {
        let active = self.active.remove(&id)?;
        active.token.cancel();
        Some(active)
    }

    /// Up to `slots` pending jobs that are due at `now`, in admission order.
    pub(crate) fn admissible(&self, now: DateTime<Utc>, slots: usize) -> Vec<JobId> {
        let mut candidates: Vec<&Job> = self
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Pending
                    && job.is_due(now)
                    && !job.is_expired(now)
                    && !self.active.contains_key(&job.id)
            })
            .collect();
        candidates.sort_by(|a, b| Job::admission_order(a, b));
        candidates.into_iter().take(slots).map(|job| job.id).collect()
    }

    pub(crate) fn expired(&self, now: DateTime<Utc>) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.is_expired(now))
            .map(|job| job.id)
            .collect()
    }

    pub(crate) fn timed_out(&self, now: DateTime<Utc>) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|job| job.is_timed_out(now))
            .map(|job| job.id)
            .collect()
    }

    pub(crate) fn queue_depth(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .count()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::JobPolicy;

    fn working_set(jobs: impl IntoIterator<Item = Job>) -> WorkingSet {
        WorkingSet {
            jobs: jobs.into_iter().map(|job| (job.id, job)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn created_at_is_strictly_increasing() {
        let mut working_set = WorkingSet::default();
        let now = Utc::now();

        let first = working_set.next_created_at(now);
        let second = working_set.next_created_at(now);
        let third = working_set.next_created_at(now - TimeDelta::seconds(1));

        assert!(first < second);
        assert!(second < third);
        assert_eq!(first.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn admissible_orders_by_priority_then_creation() {
        let now = Utc::now();
        let low = Job::raw_job().with_priority(1).with_created_at(now);
        let high_new = Job::raw_job()
            .with_priority(10)
            .with_created_at(now + TimeDelta::seconds(2));
        let high_old = Job::raw_job()
            .with_priority(10)
            .with_created_at(now + TimeDelta::seconds(1));
        let running = Job::raw_job()
            .with_priority(100)
            .with_status(JobStatus::Running);
        let mut later = Job::raw_job().with_priority(100);
        later.scheduled_not_before = Some(now + TimeDelta::hours(1));

        let working_set = working_set([
            low.clone(),
            high_new.clone(),
            high_old.clone(),
            running,
            later,
        ]);

        assert_eq!(
            working_set.admissible(now, 10),
            vec![high_old.id, high_new.id, low.id]
        );
        assert_eq!(working_set.admissible(now, 1), vec![high_old.id]);
        assert!(working_set.admissible(now, 0).is_empty());
        assert_eq!(working_set.queue_depth(), 4);
    }

    #[test]
    fn expired_jobs_are_not_admissible() {
        let now = Utc::now();
        let mut expired = Job::raw_job();
        expired.expires_at = Some(now - TimeDelta::seconds(1));
        let working_set = working_set([expired.clone()]);

        assert!(working_set.admissible(now, 5).is_empty());
        assert_eq!(working_set.expired(now), vec![expired.id]);
    }

    #[test]
    fn timed_out_uses_latest_attempt() {
        let now = Utc::now();
        let policy = JobPolicy {
            timeout: TimeDelta::milliseconds(100),
            ..Default::default()
        };
        let mut slow = Job::raw_job().with_policy(policy);
        slow.mark_running(now - TimeDelta::seconds(1));
        let mut fresh = Job::raw_job().with_policy(policy);
        fresh.mark_running(now);
        fresh.started_at = Some(now - TimeDelta::hours(1));

        let working_set = working_set([slow.clone(), fresh]);
        assert_eq!(working_set.timed_out(now), vec![slow.id]);
    }

    #[test]
    fn liveness_tracks_attempt_generation() {
        let mut job = Job::raw_job();
        job.mark_running(Utc::now());
        let id = job.id;
        let mut working_set = working_set([job]);
        let token = CancellationToken::new();
        working_set.active.insert(
            id,
            ActiveAttempt {
                attempt: 1,
                token: token.clone(),
            },
        );

        assert!(working_set.is_live(id, 1));
        assert!(!working_set.is_live(id, 2));

        working_set.cancel_attempt(id);
        assert!(token.is_cancelled());
        assert!(!working_set.is_live(id, 1));
    }
}
