//! Cross-instance job scheduling.
//!
//! ## Design
//!
//! - Jobs are registered once at boot and never persisted
//! - Each job has one durable run record; claiming it is a compare-and-set
//! - Every instance runs its own interval trigger; there is no leader
//! - A claim held past the staleness window is released by any instance
//!
//! ## Components
//!
//! - `JobRegistry`: job name → handler, schedule, idempotency hint
//! - `JobStore`: run records and the claim primitive (in-memory or Postgres)
//! - `IntervalTrigger`: per-instance tick source
//! - `Dispatcher`: claims due jobs and runs them with a timeout
//! - `standard`: the built-in CMS maintenance jobs

pub mod content;
pub mod dispatcher;
pub mod postgres;
pub mod registry;
pub mod standard;
pub mod store;
pub mod trigger;
pub mod types;

pub use content::{
    ContentStoreError, InMemoryPagePublisher, InMemoryPreviewStore, PagePublisher,
    PostgresPagePublisher, PostgresPreviewStore, PreviewStore, PublishedPage,
};
pub use dispatcher::{
    DispatchError, Dispatcher, DispatcherConfig, DispatcherHandle, RunReport, TickReport,
};
pub use postgres::PostgresJobStore;
pub use registry::{
    JobCancelled, JobContext, JobDescriptor, JobHandler, JobRegistry, JobRegistryBuilder,
    RegistryError, Trigger,
};
pub use standard::{JobSettings, StandardJobDeps, StandardJobSettings, standard_jobs};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use trigger::{IntervalTrigger, TriggerError, TriggerHandle};
pub use types::{
    Claim, ClaimOutcome, ClaimRequest, FinishedRun, JobOutput, JobRunRecord, JobStatus,
    RunOutcome, Schedule, ScheduleError,
};
