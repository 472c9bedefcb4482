use chrono::Utc;
use jobwarden::{
    job::query::{JobQuery, SortDirection, SortKey},
    pruner::{PruneBy, PruneSpec, Spec},
};
use sqlx::{Postgres, QueryBuilder};

use crate::types::JobStatus;

pub(crate) const COLUMNS: &str = "id, owner_ref, task_type, status, priority, payload, result, \
    progress, policy, attempt, errors, logs, dependencies, parent_id, child_ids, created_at, \
    updated_at, started_at, attempted_at, completed_at, scheduled_not_before, expires_at";

pub(crate) trait ToQuery {
    fn query(&self) -> QueryBuilder<'_, Postgres>;
}

impl ToQuery for PruneSpec {
    fn query(&self) -> QueryBuilder<'_, Postgres> {
        let status: JobStatus = self.status.into();
        let mut builder = QueryBuilder::new("DELETE FROM jobwarden_jobs WHERE id IN (");
        builder.push("SELECT id FROM jobwarden_jobs WHERE status = ");
        builder.push_bind(status);
        match &self.task_types {
            Spec::Except(task_types) => {
                builder.push(" AND task_type != ALL(");
                builder.push_bind(task_types);
            }
            Spec::Only(task_types) => {
                builder.push(" AND task_type = ANY(");
                builder.push_bind(task_types);
            }
        }
        builder.push(")");
        match self.prune_by {
            PruneBy::MaxAge(age) => {
                builder.push(" AND COALESCE(completed_at, updated_at) < ");
                builder.push_bind(Utc::now() - age);
            }
            PruneBy::MaxLength(count) => {
                builder.push(" ORDER BY COALESCE(completed_at, updated_at) DESC, id DESC OFFSET ");
                builder.push_bind(i64::from(count));
            }
        }
        builder.push(")");

        builder
    }
}

impl ToQuery for JobQuery {
    fn query(&self) -> QueryBuilder<'_, Postgres> {
        let mut builder = QueryBuilder::new("SELECT ");
        builder.push(COLUMNS);
        builder.push(" FROM jobwarden_jobs WHERE TRUE");

        if let Some(owner_ref) = &self.owner_ref {
            builder.push(" AND owner_ref = ");
            builder.push_bind(owner_ref);
        }
        if !self.statuses.is_empty() {
            let statuses: Vec<JobStatus> = self.statuses.iter().copied().map(From::from).collect();
            builder.push(" AND status = ANY(");
            builder.push_bind(statuses);
            builder.push(")");
        }
        if !self.task_types.is_empty() {
            builder.push(" AND task_type = ANY(");
            builder.push_bind(&self.task_types);
            builder.push(")");
        }
        if let Some(parent_id) = self.parent_id {
            builder.push(" AND parent_id = ");
            builder.push_bind(uuid::Uuid::from(parent_id));
        }

        let column = match self.sort {
            SortKey::CreatedAt => "created_at",
            SortKey::UpdatedAt => "updated_at",
            SortKey::Priority => "priority",
            SortKey::CompletedAt => "completed_at",
        };
        let direction = match self.direction {
            SortDirection::Ascending => "ASC NULLS FIRST",
            SortDirection::Descending => "DESC NULLS LAST",
        };
        builder.push(format!(" ORDER BY {column} {direction}, id {direction}"));

        if let Some(limit) = self.limit {
            builder.push(" LIMIT ");
            builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        if self.skip > 0 {
            builder.push(" OFFSET ");
            builder.push_bind(i64::try_from(self.skip).unwrap_or(i64::MAX));
        }
        builder
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeDelta;
    use jobwarden::job::{JobId, JobStatus as Status};

    #[test]
    fn to_query_for_prune_spec() {
        let spec = PruneSpec {
            status: Status::Completed,
            prune_by: PruneBy::MaxAge(TimeDelta::hours(2)),
            task_types: Spec::Only(vec!["generate_report"]),
        };

        assert_eq!(
            spec.query().into_sql(),
            "DELETE FROM jobwarden_jobs WHERE id IN (SELECT id FROM jobwarden_jobs \
            WHERE status = $1 AND task_type = ANY($2) AND COALESCE(completed_at, updated_at) < $3)"
        );

        let spec = PruneSpec {
            status: Status::Failed,
            prune_by: PruneBy::MaxLength(10),
            task_types: Spec::Except(vec!["generate_report"]),
        };

        assert_eq!(
            spec.query().into_sql(),
            "DELETE FROM jobwarden_jobs WHERE id IN (SELECT id FROM jobwarden_jobs \
            WHERE status = $1 AND task_type != ALL($2) \
            ORDER BY COALESCE(completed_at, updated_at) DESC, id DESC OFFSET $3)"
        );
    }

    #[test]
    fn to_query_for_job_query() {
        assert_eq!(
            JobQuery::all().query().into_sql(),
            format!(
                "SELECT {COLUMNS} FROM jobwarden_jobs WHERE TRUE \
                ORDER BY created_at DESC NULLS LAST, id DESC NULLS LAST"
            )
        );

        let query = JobQuery::for_owner("session-1")
            .with_status(Status::Pending)
            .with_status(Status::Running)
            .with_task_type("send_notification")
            .with_parent(JobId::new())
            .sort_by(SortKey::Priority, SortDirection::Ascending)
            .skip(20)
            .limit(10);

        assert_eq!(
            query.query().into_sql(),
            format!(
                "SELECT {COLUMNS} FROM jobwarden_jobs WHERE TRUE \
                AND owner_ref = $1 AND status = ANY($2) AND task_type = ANY($3) \
                AND parent_id = $4 \
                ORDER BY priority ASC NULLS FIRST, id ASC NULLS FIRST LIMIT $5 OFFSET $6"
            )
        );
    }
}
