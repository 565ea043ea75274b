//! Postgres-backed job store.
//!
//! The claim is a single conditional `UPDATE ... WHERE status IN (idle states)`
//! so the database serializes competing instances: only one UPDATE matches
//! the row, every other one affects zero rows and reads back a conflict.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use tracing::instrument;
use uuid::Uuid;

use folio_core::{InstanceId, JobRunId};

use crate::db::{DbFailure, PgDatabase, map_sqlx_error};

use super::store::{JobStore, JobStoreError, STALE_CLAIM_ERROR};
use super::types::{Claim, ClaimOutcome, ClaimRequest, FinishedRun, JobRunRecord, JobStatus};

const SELECT_COLUMNS: &str = "id, job_name, status, claimed_by, claimed_at, claim_token, next_due_at, \
     last_started_at, last_finished_at, last_error, run_count";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    db: PgDatabase,
}

impl PostgresJobStore {
    pub fn new(db: PgDatabase) -> Self {
        Self { db }
    }

    async fn fetch(&self, job_name: &str) -> Result<Option<JobRunRecord>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM job_runs WHERE job_name = $1"))
            .bind(job_name)
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| store_error("get", e))?;
        row.map(|r| record_from_row(&r)).transpose()
    }

    async fn claim(&self, request: &ClaimRequest<'_>) -> Result<ClaimOutcome, JobStoreError> {
        let token = Uuid::new_v4();
        let claimed = sqlx::query(
            r#"
            UPDATE job_runs
               SET status = 'claimed', claimed_by = $2, claimed_at = $3, claim_token = $4
             WHERE job_name = $1
               AND status IN ('pending', 'succeeded', 'failed')
               AND ($5 OR next_due_at <= $3)
            RETURNING id
            "#,
        )
        .bind(request.job_name)
        .bind(request.instance.as_str())
        .bind(request.now)
        .bind(token)
        .bind(request.ignore_schedule)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| store_error("try_claim", e))?;

        if let Some(row) = claimed {
            let id: Uuid = row.try_get("id").map_err(|e| store_error("try_claim", e))?;
            return Ok(ClaimOutcome::Claimed(Claim {
                record_id: JobRunId::from_uuid(id),
                job_name: request.job_name.to_string(),
                instance: request.instance.clone(),
                claimed_at: request.now,
                token,
            }));
        }

        // Lost or not due: read back to tell the caller which.
        Ok(match self.fetch(request.job_name).await? {
            None => ClaimOutcome::Missing,
            Some(record) if record.status.is_held() => ClaimOutcome::Conflict {
                held_by: record.claimed_by,
            },
            Some(record) => ClaimOutcome::NotDue {
                next_due_at: record.next_due_at,
            },
        })
    }

    /// A fenced update that matched no row means the claim token is gone.
    fn fenced(&self, claim: &Claim, rows_affected: u64) -> Result<(), JobStoreError> {
        if rows_affected == 1 {
            Ok(())
        } else {
            Err(JobStoreError::ClaimLost(claim.job_name.clone()))
        }
    }
}

impl JobStore for PostgresJobStore {
    fn get(&self, job_name: &str) -> Result<Option<JobRunRecord>, JobStoreError> {
        self.db.block_on(self.fetch(job_name))
    }

    fn list(&self) -> Result<Vec<JobRunRecord>, JobStoreError> {
        self.db.block_on(async {
            let rows = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM job_runs ORDER BY job_name"))
                .fetch_all(self.db.pool())
                .await
                .map_err(|e| store_error("list", e))?;
            rows.iter().map(record_from_row).collect()
        })
    }

    #[instrument(skip(self), err)]
    fn ensure(&self, job_name: &str, next_due_at: DateTime<Utc>) -> Result<bool, JobStoreError> {
        self.db.block_on(async {
            let result = sqlx::query(
                r#"
                INSERT INTO job_runs (id, job_name, status, next_due_at, run_count)
                VALUES ($1, $2, 'pending', $3, 0)
                ON CONFLICT (job_name) DO NOTHING
                "#,
            )
            .bind(*JobRunId::new().as_uuid())
            .bind(job_name)
            .bind(next_due_at)
            .execute(self.db.pool())
            .await
            .map_err(|e| store_error("ensure", e))?;
            Ok(result.rows_affected() == 1)
        })
    }

    #[instrument(skip(self, request), fields(job = request.job_name, instance = %request.instance), err)]
    fn try_claim(&self, request: &ClaimRequest<'_>) -> Result<ClaimOutcome, JobStoreError> {
        self.db.block_on(self.claim(request))
    }

    fn mark_running(&self, claim: &Claim, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let affected = self.db.block_on(async {
            sqlx::query(
                r#"
                UPDATE job_runs SET status = 'running', last_started_at = $3
                 WHERE job_name = $1 AND claim_token = $2 AND status IN ('claimed', 'running')
                "#,
            )
            .bind(&claim.job_name)
            .bind(claim.token)
            .bind(now)
            .execute(self.db.pool())
            .await
            .map_err(|e| store_error("mark_running", e))
        })?;
        self.fenced(claim, affected.rows_affected())
    }

    fn finish(&self, claim: &Claim, run: &FinishedRun) -> Result<(), JobStoreError> {
        let affected = self.db.block_on(async {
            sqlx::query(
                r#"
                UPDATE job_runs
                   SET status = $3, claimed_by = NULL, claimed_at = NULL, claim_token = NULL,
                       next_due_at = $4, last_finished_at = $5, last_error = $6,
                       run_count = run_count + 1
                 WHERE job_name = $1 AND claim_token = $2 AND status IN ('claimed', 'running')
                "#,
            )
            .bind(&claim.job_name)
            .bind(claim.token)
            .bind(run.status.as_str())
            .bind(run.next_due_at)
            .bind(run.finished_at)
            .bind(run.error.as_deref())
            .execute(self.db.pool())
            .await
            .map_err(|e| store_error("finish", e))
        })?;
        self.fenced(claim, affected.rows_affected())
    }

    fn record_timeout(&self, claim: &Claim, error: &str) -> Result<(), JobStoreError> {
        let affected = self.db.block_on(async {
            sqlx::query(
                r#"
                UPDATE job_runs SET last_error = $3
                 WHERE job_name = $1 AND claim_token = $2 AND status IN ('claimed', 'running')
                "#,
            )
            .bind(&claim.job_name)
            .bind(claim.token)
            .bind(error)
            .execute(self.db.pool())
            .await
            .map_err(|e| store_error("record_timeout", e))
        })?;
        self.fenced(claim, affected.rows_affected())
    }

    #[instrument(skip(self), err)]
    fn reclaim_stale(
        &self,
        job_name: &str,
        cutoff: DateTime<Utc>,
        next_due_at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let affected = self.db.block_on(async {
            sqlx::query(
                r#"
                UPDATE job_runs
                   SET status = 'pending', claimed_by = NULL, claimed_at = NULL, claim_token = NULL,
                       next_due_at = $3,
                       last_error = CASE WHEN last_error IS NULL THEN $4
                                         ELSE $4 || ' (' || last_error || ')' END
                 WHERE job_name = $1 AND status IN ('claimed', 'running') AND claimed_at < $2
                "#,
            )
            .bind(job_name)
            .bind(cutoff)
            .bind(next_due_at)
            .bind(STALE_CLAIM_ERROR)
            .execute(self.db.pool())
            .await
            .map_err(|e| store_error("reclaim_stale", e))
        })?;
        Ok(affected.rows_affected() == 1)
    }
}

fn store_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match map_sqlx_error(operation, err) {
        DbFailure::Unavailable(msg) => JobStoreError::Unavailable(msg),
        DbFailure::Duplicate(msg) | DbFailure::Data(msg) => JobStoreError::Corrupt(msg),
    }
}

fn record_from_row(row: &PgRow) -> Result<JobRunRecord, JobStoreError> {
    let get_err = |e: sqlx::Error| store_error("decode job_runs row", e);

    let status: String = row.try_get("status").map_err(get_err)?;
    let status: JobStatus = status.parse().map_err(JobStoreError::Corrupt)?;
    let claimed_by: Option<String> = row.try_get("claimed_by").map_err(get_err)?;
    let claimed_by = claimed_by
        .map(InstanceId::new)
        .transpose()
        .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
    let run_count: i64 = row.try_get("run_count").map_err(get_err)?;

    Ok(JobRunRecord {
        id: JobRunId::from_uuid(row.try_get("id").map_err(get_err)?),
        job_name: row.try_get("job_name").map_err(get_err)?,
        status,
        claimed_by,
        claimed_at: row.try_get("claimed_at").map_err(get_err)?,
        claim_token: row.try_get("claim_token").map_err(get_err)?,
        next_due_at: row.try_get("next_due_at").map_err(get_err)?,
        last_started_at: row.try_get("last_started_at").map_err(get_err)?,
        last_finished_at: row.try_get("last_finished_at").map_err(get_err)?,
        last_error: row.try_get("last_error").map_err(get_err)?,
        run_count: u64::try_from(run_count)
            .map_err(|_| JobStoreError::Corrupt(format!("negative run_count {run_count}")))?,
    })
}
