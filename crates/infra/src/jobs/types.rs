//! Core job types: schedules, run records, claims and outcomes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use folio_core::{InstanceId, JobRunId};

/// When a job becomes due.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Due again `interval` after the previous run was claimed.
    Interval(Duration),
    /// Due at each occurrence of a cron expression (UTC).
    Cron(CronSchedule),
}

/// Parsed cron expression together with its source text.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn expr(&self) -> &str {
        &self.expr
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("interval must be greater than zero")]
    ZeroInterval,
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
}

impl Schedule {
    pub fn every(interval: Duration) -> Result<Self, ScheduleError> {
        if interval.is_zero() {
            return Err(ScheduleError::ZeroInterval);
        }
        Ok(Schedule::Interval(interval))
    }

    pub fn cron(expr: &str) -> Result<Self, ScheduleError> {
        let schedule = cron::Schedule::from_str(expr).map_err(|e| ScheduleError::InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Schedule::Cron(CronSchedule {
            expr: expr.to_string(),
            schedule,
        }))
    }

    /// Next due instant strictly after `after`.
    ///
    /// `None` means the schedule has no further occurrences.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval(interval) => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                after.checked_add_signed(step)
            }
            Schedule::Cron(cron) => cron.schedule.after(&after).next(),
        }
    }

    /// Due instant for a job that has never run.
    ///
    /// Interval jobs run on the first tick; cron jobs wait for their first slot.
    pub fn first_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval(_) => Some(now),
            Schedule::Cron(_) => self.next_after(now),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Interval(interval) => write!(f, "every {}s", interval.as_secs()),
            Schedule::Cron(cron) => write!(f, "cron '{}'", cron.expr),
        }
    }
}

/// Lifecycle state of a job's run record.
///
/// `Pending`, `Succeeded` and `Failed` are idle: the record may be claimed
/// once it is due. `Claimed` and `Running` mean an instance holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn is_held(&self) -> bool {
        !self.is_idle()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "claimed" => Ok(JobStatus::Claimed),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Durable scheduling state for one registered job.
///
/// There is exactly one record per job name, created lazily the first time a
/// dispatcher sees the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRunRecord {
    pub id: JobRunId,
    pub job_name: String,
    pub status: JobStatus,
    pub claimed_by: Option<InstanceId>,
    pub claimed_at: Option<DateTime<Utc>>,

    /// Fencing token of the current claim. Writes from a holder whose token no
    /// longer matches are rejected.
    pub claim_token: Option<Uuid>,

    pub next_due_at: DateTime<Utc>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
}

impl JobRunRecord {
    pub fn new(job_name: impl Into<String>, next_due_at: DateTime<Utc>) -> Self {
        Self {
            id: JobRunId::new(),
            job_name: job_name.into(),
            status: JobStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            claim_token: None,
            next_due_at,
            last_started_at: None,
            last_finished_at: None,
            last_error: None,
            run_count: 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_idle() && self.next_due_at <= now
    }

    /// A held record whose claim is older than `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status.is_held() && self.claimed_at.is_some_and(|at| at < cutoff)
    }

    pub fn holds(&self, claim: &Claim) -> bool {
        self.status.is_held() && self.claim_token == Some(claim.token)
    }
}

/// Proof that an instance won the claim on a job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub record_id: JobRunId,
    pub job_name: String,
    pub instance: InstanceId,
    pub claimed_at: DateTime<Utc>,
    pub token: Uuid,
}

/// Parameters of a claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimRequest<'a> {
    pub job_name: &'a str,
    pub instance: &'a InstanceId,
    pub now: DateTime<Utc>,
    /// Manual runs claim an idle record regardless of `next_due_at`.
    pub ignore_schedule: bool,
}

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(Claim),
    /// Another instance holds the record.
    Conflict { held_by: Option<InstanceId> },
    /// The record is idle but not due yet.
    NotDue { next_due_at: DateTime<Utc> },
    /// No record exists for the job.
    Missing,
}

/// Result reported by a job handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    /// Number of items the job touched (rows deleted, pages published, ...).
    pub affected: u64,
    pub detail: Option<String>,
}

impl JobOutput {
    pub fn affected(affected: u64) -> Self {
        Self {
            affected,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// How a single dispatch of a job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded { output: JobOutput },
    Failed { error: String },
    /// The handler exceeded its timeout. Its thread was abandoned and the
    /// record stays held until the staleness window releases it.
    TimedOut { after_secs: u64 },
    /// The claim was lost or the store failed mid-run; nothing was recorded.
    Abandoned { reason: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded { .. })
    }
}

/// Terminal write for a run that completed (successfully or not).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedRun {
    pub status: JobStatus,
    pub finished_at: DateTime<Utc>,
    pub next_due_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn interval_schedule_is_due_immediately_then_every_interval() {
        let schedule = Schedule::every(Duration::from_secs(60)).unwrap();
        let now = at("2026-01-01T00:00:00Z");

        assert_eq!(schedule.first_due(now), Some(now));
        assert_eq!(schedule.next_after(now), Some(at("2026-01-01T00:01:00Z")));
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert_eq!(
            Schedule::every(Duration::ZERO).unwrap_err(),
            ScheduleError::ZeroInterval
        );
    }

    #[test]
    fn cron_schedule_waits_for_first_slot() {
        let schedule = Schedule::cron("0 */15 * * * *").unwrap();
        let now = at("2026-01-01T00:07:30Z");

        assert_eq!(schedule.first_due(now), Some(at("2026-01-01T00:15:00Z")));
        assert_eq!(
            schedule.next_after(at("2026-01-01T00:15:00Z")),
            Some(at("2026-01-01T00:30:00Z"))
        );
    }

    #[test]
    fn invalid_cron_is_reported_with_expression() {
        let err = Schedule::cron("every tuesday").unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidCron { ref expr, .. } if expr == "every tuesday"));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::Claimed,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn finished_records_are_idle_and_claimable_when_due() {
        let now = at("2026-01-01T00:00:00Z");
        let mut record = JobRunRecord::new("publish-pages", now);
        record.status = JobStatus::Failed;

        assert!(record.is_due(now));
        record.status = JobStatus::Running;
        assert!(!record.is_due(now));
    }

    #[test]
    fn staleness_is_measured_from_claim_time() {
        let claimed = at("2026-01-01T00:00:00Z");
        let mut record = JobRunRecord::new("publish-pages", claimed);
        record.status = JobStatus::Running;
        record.claimed_at = Some(claimed);

        assert!(!record.is_stale(claimed));
        assert!(record.is_stale(claimed + chrono::Duration::seconds(1)));
    }
}
