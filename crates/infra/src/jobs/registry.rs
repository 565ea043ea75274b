//! Immutable table of the jobs this process knows how to run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use folio_core::InstanceId;

use super::types::{JobOutput, Schedule};

/// Maximum length of a job name.
pub const MAX_JOB_NAME_LEN: usize = 64;

/// Handler invoked when a job is dispatched.
///
/// Errors are recorded on the job's run record; panics are caught and treated
/// the same way.
pub type JobHandler = Arc<dyn Fn(&JobContext) -> anyhow::Result<JobOutput> + Send + Sync>;

/// Registered job definition.
#[derive(Clone)]
pub struct JobDescriptor {
    name: String,
    schedule: Schedule,
    handler: JobHandler,
    idempotent: bool,
    enabled: bool,
}

impl JobDescriptor {
    pub fn new<F>(name: impl Into<String>, schedule: Schedule, handler: F) -> Self
    where
        F: Fn(&JobContext) -> anyhow::Result<JobOutput> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            schedule,
            handler: Arc::new(handler),
            idempotent: true,
            enabled: true,
        }
    }

    /// Whether a run interrupted by a crash may be repeated as soon as its
    /// claim goes stale. Non-idempotent jobs wait for their next slot instead.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn handler(&self) -> JobHandler {
        Arc::clone(&self.handler)
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("idempotent", &self.idempotent)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Why a dispatch happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Manual,
}

/// Per-run context handed to a job handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_name: String,
    pub instance: InstanceId,
    /// Instant the run was claimed at. Handlers should use this rather than
    /// reading a clock of their own.
    pub now: DateTime<Utc>,
    pub trigger: Trigger,
    cancellation: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("job run cancelled")]
pub struct JobCancelled;

impl JobContext {
    pub fn new(
        job_name: impl Into<String>,
        instance: InstanceId,
        now: DateTime<Utc>,
        trigger: Trigger,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            instance,
            now,
            trigger,
            cancellation,
        }
    }

    /// Set when the process is shutting down or the run exceeded its timeout.
    /// Long handlers should poll this between units of work.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<(), JobCancelled> {
        if self.is_cancelled() {
            Err(JobCancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("job already registered: {0}")]
    Duplicate(String),
    #[error("invalid job name '{0}': use 1-64 lowercase letters, digits or '-'")]
    InvalidName(String),
}

/// Job registry, built once at startup and shared read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct JobRegistry {
    jobs: BTreeMap<String, JobDescriptor>,
}

impl JobRegistry {
    pub fn builder() -> JobRegistryBuilder {
        JobRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&JobDescriptor> {
        self.jobs.get(name)
    }

    /// All jobs in name order.
    pub fn iter(&self) -> impl Iterator<Item = &JobDescriptor> {
        self.jobs.values()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &JobDescriptor> {
        self.jobs.values().filter(|job| job.is_enabled())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct JobRegistryBuilder {
    jobs: BTreeMap<String, JobDescriptor>,
}

impl JobRegistryBuilder {
    pub fn register(mut self, job: JobDescriptor) -> Result<Self, RegistryError> {
        if !is_valid_job_name(job.name()) {
            return Err(RegistryError::InvalidName(job.name().to_string()));
        }
        if self.jobs.contains_key(job.name()) {
            return Err(RegistryError::Duplicate(job.name().to_string()));
        }
        self.jobs.insert(job.name().to_string(), job);
        Ok(self)
    }

    pub fn register_all(
        self,
        jobs: impl IntoIterator<Item = JobDescriptor>,
    ) -> Result<Self, RegistryError> {
        jobs.into_iter().try_fold(self, |builder, job| builder.register(job))
    }

    pub fn build(self) -> JobRegistry {
        JobRegistry { jobs: self.jobs }
    }
}

fn is_valid_job_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_JOB_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
