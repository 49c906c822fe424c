//! Postgres-backed job store (`ai_jobs` table).
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so any number of workers may claim the same
//! job type concurrently without ever receiving the same row. A claim sets `run_after`
//! to the end of its lease; `processing` rows past that point are claimed again.
//!
//! Enqueue is a single statement that inserts only when no `pending` / `processing` /
//! `retry` row exists for `(organization_id, entity_type, entity_id, job_type)`. If the
//! schema also carries a partial unique index over those columns, the race between two
//! such statements surfaces as `23505` and is reported as already queued.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use crmflow_core::{JobType, OrganizationScope};

use super::store::{JobStore, JobStoreError};
use super::types::{EnqueueOutcome, Job, JobId, JobStatus, NewJob, StageCounters};
use crate::db::{describe_sqlx_error, is_unique_violation};

const JOB_COLUMNS: &str = "id, organization_id, job_type, entity_type, entity_id, priority, \
     status, payload, attempts, last_error, run_after, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn find_in_flight(&self, new: &NewJob) -> Result<Option<JobId>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id FROM ai_jobs
            WHERE organization_id = $1
              AND job_type = $2
              AND entity_type = $3
              AND entity_id = $4
              AND status IN ('pending', 'processing', 'retry')
            LIMIT 1
            "#,
        )
        .bind(new.organization_id.as_uuid())
        .bind(new.job_type.as_str())
        .bind(new.entity_type.as_str())
        .bind(new.entity_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_in_flight", e))?;

        row.map(|r| r.try_get::<Uuid, _>("id").map(JobId::from_uuid))
            .transpose()
            .map_err(|e| map_sqlx_error("find_in_flight", e))
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self, new),
        fields(
            organization_id = %new.organization_id,
            job_type = %new.job_type,
            entity_id = %new.entity_id
        ),
        err
    )]
    async fn enqueue(&self, new: NewJob) -> Result<EnqueueOutcome, JobStoreError> {
        let result = sqlx::query(
            r#"
            WITH existing AS (
                SELECT id FROM ai_jobs
                WHERE organization_id = $2
                  AND job_type = $3
                  AND entity_type = $4
                  AND entity_id = $5
                  AND status IN ('pending', 'processing', 'retry')
                LIMIT 1
            ),
            inserted AS (
                INSERT INTO ai_jobs (
                    id, organization_id, job_type, entity_type, entity_id, priority,
                    status, payload, attempts, run_after, created_at, updated_at
                )
                SELECT $1, $2, $3, $4, $5, $6, 'pending', $7, 0, now(), now(), now()
                WHERE NOT EXISTS (SELECT 1 FROM existing)
                RETURNING id
            )
            SELECT id, TRUE AS inserted FROM inserted
            UNION ALL
            SELECT id, FALSE AS inserted FROM existing
            LIMIT 1
            "#,
        )
        .bind(JobId::new().0)
        .bind(new.organization_id.as_uuid())
        .bind(new.job_type.as_str())
        .bind(new.entity_type.as_str())
        .bind(new.entity_id)
        .bind(new.priority)
        .bind(&new.payload)
        .fetch_one(&*self.pool)
        .await;

        match result {
            Ok(row) => {
                let id: Uuid = row.try_get("id").map_err(|e| map_sqlx_error("enqueue", e))?;
                let inserted: bool = row
                    .try_get("inserted")
                    .map_err(|e| map_sqlx_error("enqueue", e))?;
                let id = JobId::from_uuid(id);
                Ok(if inserted {
                    EnqueueOutcome::Enqueued(id)
                } else {
                    EnqueueOutcome::AlreadyQueued(id)
                })
            }
            Err(e) if is_unique_violation(&e) => match self.find_in_flight(&new).await? {
                Some(id) => Ok(EnqueueOutcome::AlreadyQueued(id)),
                None => Err(map_sqlx_error("enqueue", e)),
            },
            Err(e) => Err(map_sqlx_error("enqueue", e)),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM ai_jobs WHERE id = $1"))
            .bind(job_id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(claimed = tracing::field::Empty), err)]
    async fn claim_batch(
        &self,
        job_type: JobType,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            WITH next AS (
                SELECT id FROM ai_jobs
                WHERE job_type = $1
                  AND status IN ('pending', 'retry', 'processing')
                  AND run_after <= now()
                ORDER BY priority ASC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE ai_jobs AS j
            SET status = 'processing',
                attempts = j.attempts + 1,
                run_after = now() + make_interval(secs => $3),
                updated_at = now()
            FROM next
            WHERE j.id = next.id
            RETURNING {}
            "#,
            qualified_columns("j")
        ))
        .bind(job_type.as_str())
        .bind(i64::from(limit))
        .bind(lease.as_secs_f64())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut jobs = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the CTE order.
        jobs.sort_by_key(|j| (j.priority, j.created_at, j.id.0));

        tracing::Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ai_jobs
            SET status = $2,
                attempts = $3,
                last_error = $4,
                run_after = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(job.last_error.as_deref())
        .bind(job.run_after)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job.id));
        }
        Ok(())
    }

    #[instrument(skip(self, statuses), err)]
    async fn count_by_status(
        &self,
        scope: OrganizationScope,
        statuses: &[JobStatus],
    ) -> Result<i64, JobStoreError> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM ai_jobs
            WHERE status = ANY($1)
              AND ($2::uuid IS NULL OR organization_id = $2)
            "#,
        )
        .bind(&statuses)
        .bind(scope.organization_id().map(|o| *o.as_uuid()))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_by_status", e))?;

        row.try_get("n").map_err(|e| map_sqlx_error("count_by_status", e))
    }

    /// Unscoped reads come from the `pipeline_stats` view; an organization scope
    /// aggregates `ai_jobs` directly into the same shape.
    #[instrument(skip(self), err)]
    async fn stage_counters(
        &self,
        scope: OrganizationScope,
    ) -> Result<Vec<StageCounters>, JobStoreError> {
        let rows = match scope.organization_id() {
            None => sqlx::query(
                r#"
                SELECT stage, pending, processing, retry, failed, done
                FROM pipeline_stats
                ORDER BY stage
                "#,
            )
            .fetch_all(&*self.pool)
            .await,
            Some(org) => sqlx::query(
                r#"
                SELECT
                    CASE job_type
                        WHEN 'normalize_message' THEN 'normalize'
                        WHEN 'embed_message' THEN 'embed'
                        WHEN 'annotate_message' THEN 'annotate'
                        ELSE job_type
                    END AS stage,
                    COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                    COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                    COUNT(*) FILTER (WHERE status = 'retry') AS retry,
                    COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                    COUNT(*) FILTER (WHERE status = 'done') AS done
                FROM ai_jobs
                WHERE organization_id = $1
                GROUP BY 1
                ORDER BY 1
                "#,
            )
            .bind(org.as_uuid())
            .fetch_all(&*self.pool)
            .await,
        }
        .map_err(|e| map_sqlx_error("stage_counters", e))?;

        rows.iter()
            .map(|row| {
                Ok(StageCounters {
                    stage: row.try_get("stage")?,
                    pending: row.try_get("pending")?,
                    processing: row.try_get("processing")?,
                    retry: row.try_get("retry")?,
                    failed: row.try_get("failed")?,
                    done: row.try_get("done")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| map_sqlx_error("stage_counters", e))
    }

    #[instrument(skip(self), err)]
    async fn requeue_failed(
        &self,
        scope: OrganizationScope,
        limit: u32,
    ) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            WITH failed AS (
                SELECT id FROM ai_jobs
                WHERE status = 'failed'
                  AND ($1::uuid IS NULL OR organization_id = $1)
                ORDER BY updated_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE ai_jobs AS j
            SET status = 'pending',
                attempts = 0,
                last_error = NULL,
                run_after = now(),
                updated_at = now()
            FROM failed
            WHERE j.id = failed.id
            "#,
        )
        .bind(scope.organization_id().map(|o| *o.as_uuid()))
        .bind(i64::from(limit))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_failed", e))?;

        Ok(result.rows_affected())
    }
}

fn qualified_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Decode(e.to_string());

    let job_type: String = row.try_get("job_type").map_err(decode)?;
    let entity_type: String = row.try_get("entity_type").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;
    let organization_id: Uuid = row.try_get("organization_id").map_err(decode)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(decode)?),
        organization_id: organization_id.into(),
        job_type: job_type
            .parse()
            .map_err(|e: crmflow_core::DomainError| JobStoreError::Decode(e.to_string()))?,
        entity_type: entity_type
            .parse()
            .map_err(|e: crmflow_core::DomainError| JobStoreError::Decode(e.to_string()))?,
        entity_id: row.try_get("entity_id").map_err(decode)?,
        priority: row.try_get("priority").map_err(decode)?,
        status: status
            .parse()
            .map_err(|e: crmflow_core::DomainError| JobStoreError::Decode(e.to_string()))?,
        payload: row.try_get("payload").map_err(decode)?,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error").map_err(decode)?,
        run_after: row.try_get::<DateTime<Utc>, _>("run_after").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(describe_sqlx_error(operation, &err))
}
