use std::cmp::Ordering;

use crate::{
    job::{
        query::{JobQuery, SortDirection, SortKey},
        Job,
    },
    pruner::{PruneSpec, Spec},
};

pub(crate) trait Queryable {
    fn matches(&self, job: &Job) -> bool;
}

impl Queryable for JobQuery {
    fn matches(&self, job: &Job) -> bool {
        self.owner_ref
            .as_ref()
            .map_or(true, |owner_ref| &job.owner_ref == owner_ref)
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && (self.task_types.is_empty() || self.task_types.iter().any(|t| *t == job.task_type))
            && self
                .parent_id
                .map_or(true, |parent_id| job.parent_id == Some(parent_id))
    }
}

impl Queryable for PruneSpec {
    fn matches(&self, job: &Job) -> bool {
        self.status.is_terminal() && job.status == self.status && self.task_types.matches(job)
    }
}

impl Queryable for Spec {
    fn matches(&self, job: &Job) -> bool {
        match self {
            Spec::Except(task_types) => task_types.iter().all(|&t| t != job.task_type),
            Spec::Only(task_types) => task_types.iter().any(|&t| t == job.task_type),
        }
    }
}

impl JobQuery {
    pub(crate) fn compare(&self, a: &Job, b: &Job) -> Ordering {
        let ordering = match self.sort {
            SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
            SortKey::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortKey::Priority => a.priority.cmp(&b.priority),
            SortKey::CompletedAt => a.completed_at.cmp(&b.completed_at),
        }
        .then_with(|| a.id.cmp(&b.id));

        match self.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    }

    /// Filter, sort and paginate `jobs` in memory.
    pub(crate) fn apply<'a>(&self, jobs: impl IntoIterator<Item = &'a Job>) -> Vec<Job> {
        let mut matching: Vec<&Job> = jobs.into_iter().filter(|job| self.matches(job)).collect();
        matching.sort_by(|a, b| self.compare(a, b));
        matching
            .into_iter()
            .skip(self.skip)
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}
