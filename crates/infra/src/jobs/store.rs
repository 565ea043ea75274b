//! Job run record storage and the claim protocol.
//!
//! Every mutation of a held record is fenced by the claim token issued at
//! claim time, so an instance that lost its claim (for example after a
//! staleness reclaim) cannot overwrite the new holder's state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::types::{Claim, ClaimOutcome, ClaimRequest, FinishedRun, JobRunRecord, JobStatus};

/// Persistence for job run records.
///
/// Implementations must make `try_claim` atomic: of any number of concurrent
/// callers for the same idle record, exactly one observes `Claimed`.
pub trait JobStore: Send + Sync {
    fn get(&self, job_name: &str) -> Result<Option<JobRunRecord>, JobStoreError>;

    /// All records, ordered by job name.
    fn list(&self) -> Result<Vec<JobRunRecord>, JobStoreError>;

    /// Create a pending record if none exists. Returns `true` if one was created.
    fn ensure(&self, job_name: &str, next_due_at: DateTime<Utc>) -> Result<bool, JobStoreError>;

    /// Conditionally move an idle record to `claimed`.
    fn try_claim(&self, request: &ClaimRequest<'_>) -> Result<ClaimOutcome, JobStoreError>;

    /// `claimed` -> `running`.
    fn mark_running(&self, claim: &Claim, now: DateTime<Utc>) -> Result<(), JobStoreError>;

    /// Release the claim with a terminal status and the next due time.
    fn finish(&self, claim: &Claim, run: &FinishedRun) -> Result<(), JobStoreError>;

    /// Note a handler timeout without releasing the claim.
    fn record_timeout(&self, claim: &Claim, error: &str) -> Result<(), JobStoreError>;

    /// Release a claim taken before `cutoff` back to `pending`, noting the
    /// abandoned run in `last_error`.
    /// Returns `true` if the record was stale and has been released.
    fn reclaim_stale(
        &self,
        job_name: &str,
        cutoff: DateTime<Utc>,
        next_due_at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job record not found: {0}")]
    NotFound(String),
    /// The caller's claim token no longer matches the record.
    #[error("claim on job '{0}' is no longer held")]
    ClaimLost(String),
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

/// Message recorded on a run released by staleness reclaim.
pub const STALE_CLAIM_ERROR: &str = "claim expired before the run finished";

/// In-memory job store for tests/dev and single-instance deployments.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    records: RwLock<HashMap<String, JobRunRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, JobRunRecord>>, JobStoreError> {
        self.records
            .read()
            .map_err(|_| JobStoreError::Unavailable("job store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, JobRunRecord>>, JobStoreError> {
        self.records
            .write()
            .map_err(|_| JobStoreError::Unavailable("job store lock poisoned".into()))
    }

    fn held_mut<'a>(
        records: &'a mut HashMap<String, JobRunRecord>,
        claim: &Claim,
    ) -> Result<&'a mut JobRunRecord, JobStoreError> {
        let record = records
            .get_mut(&claim.job_name)
            .ok_or_else(|| JobStoreError::NotFound(claim.job_name.clone()))?;
        if !record.holds(claim) {
            return Err(JobStoreError::ClaimLost(claim.job_name.clone()));
        }
        Ok(record)
    }
}

impl JobStore for InMemoryJobStore {
    fn get(&self, job_name: &str) -> Result<Option<JobRunRecord>, JobStoreError> {
        Ok(self.read()?.get(job_name).cloned())
    }

    fn list(&self) -> Result<Vec<JobRunRecord>, JobStoreError> {
        let mut records: Vec<_> = self.read()?.values().cloned().collect();
        records.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        Ok(records)
    }

    fn ensure(&self, job_name: &str, next_due_at: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let mut records = self.write()?;
        if records.contains_key(job_name) {
            return Ok(false);
        }
        records.insert(job_name.to_string(), JobRunRecord::new(job_name, next_due_at));
        Ok(true)
    }

    fn try_claim(&self, request: &ClaimRequest<'_>) -> Result<ClaimOutcome, JobStoreError> {
        let mut records = self.write()?;
        let Some(record) = records.get_mut(request.job_name) else {
            return Ok(ClaimOutcome::Missing);
        };

        if record.status.is_held() {
            return Ok(ClaimOutcome::Conflict {
                held_by: record.claimed_by.clone(),
            });
        }
        if !request.ignore_schedule && record.next_due_at > request.now {
            return Ok(ClaimOutcome::NotDue {
                next_due_at: record.next_due_at,
            });
        }

        let token = Uuid::new_v4();
        record.status = JobStatus::Claimed;
        record.claimed_by = Some(request.instance.clone());
        record.claimed_at = Some(request.now);
        record.claim_token = Some(token);

        Ok(ClaimOutcome::Claimed(Claim {
            record_id: record.id,
            job_name: record.job_name.clone(),
            instance: request.instance.clone(),
            claimed_at: request.now,
            token,
        }))
    }

    fn mark_running(&self, claim: &Claim, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut records = self.write()?;
        let record = Self::held_mut(&mut records, claim)?;
        record.status = JobStatus::Running;
        record.last_started_at = Some(now);
        Ok(())
    }

    fn finish(&self, claim: &Claim, run: &FinishedRun) -> Result<(), JobStoreError> {
        let mut records = self.write()?;
        let record = Self::held_mut(&mut records, claim)?;
        record.status = run.status;
        record.claimed_by = None;
        record.claimed_at = None;
        record.claim_token = None;
        record.next_due_at = run.next_due_at;
        record.last_finished_at = Some(run.finished_at);
        record.last_error = run.error.clone();
        record.run_count += 1;
        Ok(())
    }

    fn record_timeout(&self, claim: &Claim, error: &str) -> Result<(), JobStoreError> {
        let mut records = self.write()?;
        let record = Self::held_mut(&mut records, claim)?;
        record.last_error = Some(error.to_string());
        Ok(())
    }

    fn reclaim_stale(
        &self,
        job_name: &str,
        cutoff: DateTime<Utc>,
        next_due_at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut records = self.write()?;
        let Some(record) = records.get_mut(job_name) else {
            return Ok(false);
        };
        if !record.is_stale(cutoff) {
            return Ok(false);
        }

        let previous = record.last_error.take();
        record.status = JobStatus::Pending;
        record.claimed_by = None;
        record.claimed_at = None;
        record.claim_token = None;
        record.next_due_at = next_due_at;
        record.last_error = Some(match previous {
            Some(prev) => format!("{STALE_CLAIM_ERROR} ({prev})"),
            None => STALE_CLAIM_ERROR.to_string(),
        });
        Ok(true)
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn get(&self, job_name: &str) -> Result<Option<JobRunRecord>, JobStoreError> {
        (**self).get(job_name)
    }

    fn list(&self) -> Result<Vec<JobRunRecord>, JobStoreError> {
        (**self).list()
    }

    fn ensure(&self, job_name: &str, next_due_at: DateTime<Utc>) -> Result<bool, JobStoreError> {
        (**self).ensure(job_name, next_due_at)
    }

    fn try_claim(&self, request: &ClaimRequest<'_>) -> Result<ClaimOutcome, JobStoreError> {
        (**self).try_claim(request)
    }

    fn mark_running(&self, claim: &Claim, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        (**self).mark_running(claim, now)
    }

    fn finish(&self, claim: &Claim, run: &FinishedRun) -> Result<(), JobStoreError> {
        (**self).finish(claim, run)
    }

    fn record_timeout(&self, claim: &Claim, error: &str) -> Result<(), JobStoreError> {
        (**self).record_timeout(claim, error)
    }

    fn reclaim_stale(
        &self,
        job_name: &str,
        cutoff: DateTime<Utc>,
        next_due_at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        (**self).reclaim_stale(job_name, cutoff, next_due_at)
    }
}
