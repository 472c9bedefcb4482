//! Filters, sorting and pagination for listing jobs.
use super::{JobId, JobStatus};

/// The field jobs are sorted on when listed.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum SortKey {
    #[default]
    CreatedAt,
    UpdatedAt,
    Priority,
    CompletedAt,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum SortDirection {
    Ascending,
    #[default]
    Descending,
}

/// A listing request understood by every [`crate::store::JobStore`].
///
/// Empty filter lists match everything. Results are sorted by [`SortKey::CreatedAt`] descending
/// unless configured otherwise, with the job id as the final tie break.
///
/// # Example
///
/// ```
/// # use jobwarden::prelude::*;
/// let query = JobQuery::for_owner("session-42")
///     .with_status(JobStatus::Failed)
///     .with_task_type("tax_calculation")
///     .sort_by(SortKey::CompletedAt, SortDirection::Ascending)
///     .limit(20)
///     .skip(40);
///
/// assert_eq!(query.limit, Some(20));
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct JobQuery {
    pub owner_ref: Option<String>,
    pub statuses: Vec<JobStatus>,
    pub task_types: Vec<String>,
    pub parent_id: Option<JobId>,
    pub limit: Option<usize>,
    pub skip: usize,
    pub sort: SortKey,
    pub direction: SortDirection,
}

impl JobQuery {
    /// Every job in the store, newest first.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_owner(owner_ref: impl Into<String>) -> Self {
        Self {
            owner_ref: Some(owner_ref.into()),
            ..Self::default()
        }
    }

    /// Add a status to the accepted set.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        if !self.statuses.contains(&status) {
            self.statuses.push(status);
        }
        self
    }

    /// Add a task type to the accepted set.
    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_types.push(task_type.into());
        self
    }

    pub fn with_parent(self, parent_id: JobId) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..self
        }
    }

    pub fn limit(self, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..self
        }
    }

    pub fn skip(self, skip: usize) -> Self {
        Self { skip, ..self }
    }

    pub fn sort_by(self, sort: SortKey, direction: SortDirection) -> Self {
        Self {
            sort,
            direction,
            ..self
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn query_builder_api() {
        let query = JobQuery::all()
            .with_status(JobStatus::Pending)
            .with_status(JobStatus::Pending)
            .with_status(JobStatus::Running);

        assert_eq!(query.statuses, vec![JobStatus::Pending, JobStatus::Running]);
        assert_eq!(query.sort, SortKey::CreatedAt);
        assert_eq!(query.direction, SortDirection::Descending);
        assert_eq!(query.limit, None);
        assert_eq!(query.owner_ref, None);
    }
}
