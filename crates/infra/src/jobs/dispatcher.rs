//! Dispatcher: on every tick, claims due jobs and runs them.
//!
//! ## Flow per tick
//!
//! 1. For each enabled job: create its record if missing, release a stale
//!    claim, and decide whether it is due.
//! 2. Claim every due job through the store's compare-and-set.
//! 3. Run the claimed handlers concurrently, each on its own thread with a
//!    timeout, and record the outcome.
//!
//! A handler that exceeds its timeout is abandoned, not stopped: its thread
//! keeps running detached, the run is reported as timed out and the record
//! stays held until the staleness window elapses.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use folio_core::{Clock, InstanceId};

use super::registry::{JobContext, JobDescriptor, JobRegistry, Trigger};
use super::store::{JobStore, JobStoreError};
use super::trigger::{IntervalTrigger, TriggerError, TriggerHandle};
use super::types::{Claim, ClaimOutcome, ClaimRequest, FinishedRun, JobStatus, RunOutcome};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often the trigger fires `tick`.
    pub search_interval: Duration,
    /// Longest a handler may run before it is abandoned.
    pub handler_timeout: Duration,
    /// Age after which a held claim is presumed dead. Must exceed the timeout.
    pub staleness_window: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            search_interval: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(300),
            staleness_window: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error("job '{0}' is disabled")]
    Disabled(String),
    #[error("job '{job}' is already running on {held_by}")]
    ClaimConflict { job: String, held_by: String },
    #[error("job '{0}' has no further scheduled occurrence")]
    Exhausted(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Result of dispatching one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub job_name: String,
    pub instance: InstanceId,
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: RunOutcome,
    /// `None` when the outcome was not recorded (timeout or lost claim).
    pub next_due_at: Option<DateTime<Utc>>,
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub runs: Vec<RunReport>,
    /// Jobs that were due but held by another instance.
    pub conflicts: Vec<String>,
    /// Jobs whose stale claim this tick released.
    pub reclaimed: Vec<String>,
    /// Jobs skipped because the store could not be reached.
    pub deferred: Vec<String>,
}

impl TickReport {
    pub fn succeeded(&self) -> usize {
        self.runs.iter().filter(|r| r.outcome.is_success()).count()
    }
}

enum Readiness {
    Due,
    Idle,
    Held,
}

enum HandlerResult {
    Finished(anyhow::Result<super::types::JobOutput>),
    Panicked(String),
    TimedOut,
}

/// Claims and runs due jobs for one instance.
pub struct Dispatcher<S> {
    instance: InstanceId,
    registry: Arc<JobRegistry>,
    store: S,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    shutdown: CancellationToken,
}

impl<S> Dispatcher<S>
where
    S: JobStore,
{
    pub fn new(
        instance: InstanceId,
        registry: Arc<JobRegistry>,
        store: S,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            instance,
            registry,
            store,
            clock,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Cancelled when the dispatcher shuts down; handlers observe it through
    /// their context.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run one scheduling pass.
    #[instrument(skip(self), fields(instance = %self.instance))]
    pub fn tick(&self) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport::default();

        let mut due = Vec::new();
        for job in self.registry.enabled() {
            match self.readiness(job, now, &mut report) {
                Ok(Readiness::Due) => due.push(job),
                Ok(Readiness::Held) => report.conflicts.push(job.name().to_string()),
                Ok(Readiness::Idle) => {}
                Err(err) => {
                    warn!(job = job.name(), error = %err, "job deferred: store unavailable");
                    report.deferred.push(job.name().to_string());
                }
            }
        }

        if self.shutdown.is_cancelled() {
            return report;
        }

        let mut claimed = Vec::new();
        for job in due {
            let request = ClaimRequest {
                job_name: job.name(),
                instance: &self.instance,
                now,
                ignore_schedule: false,
            };
            match self.store.try_claim(&request) {
                Ok(ClaimOutcome::Claimed(claim)) => claimed.push((job, claim)),
                Ok(ClaimOutcome::Conflict { held_by }) => {
                    debug!(job = job.name(), held_by = ?held_by, "claim lost to another instance");
                    report.conflicts.push(job.name().to_string());
                }
                Ok(ClaimOutcome::NotDue { .. }) | Ok(ClaimOutcome::Missing) => {}
                Err(err) => {
                    warn!(job = job.name(), error = %err, "job deferred: claim failed");
                    report.deferred.push(job.name().to_string());
                }
            }
        }

        report.runs = thread::scope(|scope| {
            let running: Vec<_> = claimed
                .into_iter()
                .map(|(job, claim)| scope.spawn(move || self.execute(job, claim, Trigger::Scheduled)))
                .collect();
            running
                .into_iter()
                .filter_map(|handle| match handle.join() {
                    Ok(run) => Some(run),
                    Err(_) => {
                        error!("job supervisor thread panicked");
                        None
                    }
                })
                .collect()
        });

        if !report.runs.is_empty() || !report.conflicts.is_empty() {
            info!(
                ran = report.runs.len(),
                succeeded = report.succeeded(),
                conflicts = report.conflicts.len(),
                "tick complete"
            );
        }
        report
    }

    /// Run a job now regardless of its schedule (manual trigger).
    #[instrument(skip(self), fields(instance = %self.instance))]
    pub fn run_once(&self, job_name: &str) -> Result<RunReport, DispatchError> {
        let job = self
            .registry
            .get(job_name)
            .ok_or_else(|| DispatchError::UnknownJob(job_name.to_string()))?;
        if !job.is_enabled() {
            return Err(DispatchError::Disabled(job_name.to_string()));
        }

        let now = self.clock.now();
        let mut scratch = TickReport::default();
        self.readiness(job, now, &mut scratch)?;

        let request = ClaimRequest {
            job_name,
            instance: &self.instance,
            now,
            ignore_schedule: true,
        };
        match self.store.try_claim(&request)? {
            ClaimOutcome::Claimed(claim) => Ok(self.execute(job, claim, Trigger::Manual)),
            ClaimOutcome::Conflict { held_by } => Err(DispatchError::ClaimConflict {
                job: job_name.to_string(),
                held_by: held_by.map(|i| i.to_string()).unwrap_or_else(|| "unknown".into()),
            }),
            ClaimOutcome::Missing | ClaimOutcome::NotDue { .. } => {
                Err(JobStoreError::NotFound(job_name.to_string()).into())
            }
        }
    }

    /// Make sure the record exists, release a stale claim, and report whether
    /// the job should be claimed this tick.
    fn readiness(
        &self,
        job: &JobDescriptor,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<Readiness, DispatchError> {
        let name = job.name();
        let record = match self.store.get(name)? {
            Some(record) => record,
            None => {
                let first_due = job
                    .schedule()
                    .first_due(now)
                    .ok_or_else(|| DispatchError::Exhausted(name.to_string()))?;
                if self.store.ensure(name, first_due)? {
                    debug!(job = name, next_due_at = %first_due, "created job record");
                }
                self.store
                    .get(name)?
                    .ok_or_else(|| JobStoreError::NotFound(name.to_string()))?
            }
        };

        if record.status.is_held() {
            let cutoff = now
                .checked_sub_signed(to_chrono(self.config.staleness_window))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            if !record.is_stale(cutoff) {
                return Ok(Readiness::Held);
            }

            let next_due_at = if job.is_idempotent() {
                now
            } else {
                job.schedule().next_after(now).unwrap_or(DateTime::<Utc>::MAX_UTC)
            };
            if self.store.reclaim_stale(name, cutoff, next_due_at)? {
                warn!(
                    job = name,
                    previous_holder = ?record.claimed_by,
                    claimed_at = ?record.claimed_at,
                    "released stale claim"
                );
                report.reclaimed.push(name.to_string());
            }
            return Ok(if next_due_at <= now { Readiness::Due } else { Readiness::Idle });
        }

        Ok(if record.next_due_at <= now {
            Readiness::Due
        } else {
            Readiness::Idle
        })
    }

    fn execute(&self, job: &JobDescriptor, claim: Claim, trigger: Trigger) -> RunReport {
        let started_at = self.clock.now();
        let report = |outcome: RunOutcome, next_due_at: Option<DateTime<Utc>>| RunReport {
            job_name: claim.job_name.clone(),
            instance: self.instance.clone(),
            started_at,
            outcome,
            next_due_at,
        };

        if let Err(err) = self.store.mark_running(&claim, started_at) {
            warn!(job = job.name(), error = %err, "could not mark job running; abandoning run");
            return report(RunOutcome::Abandoned { reason: err.to_string() }, None);
        }

        let cancellation = self.shutdown.child_token();
        let ctx = JobContext::new(
            job.name(),
            self.instance.clone(),
            claim.claimed_at,
            trigger,
            cancellation.clone(),
        );
        debug!(job = job.name(), ?trigger, "running job");

        let (status, error, outcome) = match run_handler(job, ctx, self.config.handler_timeout) {
            HandlerResult::Finished(Ok(output)) => {
                info!(job = job.name(), affected = output.affected, "job succeeded");
                (JobStatus::Succeeded, None, RunOutcome::Succeeded { output })
            }
            HandlerResult::Finished(Err(err)) => {
                let error = format!("{err:#}");
                warn!(job = job.name(), error = %error, "job failed");
                (JobStatus::Failed, Some(error.clone()), RunOutcome::Failed { error })
            }
            HandlerResult::Panicked(message) => {
                let error = format!("handler panicked: {message}");
                error!(job = job.name(), error = %error, "job panicked");
                (JobStatus::Failed, Some(error.clone()), RunOutcome::Failed { error })
            }
            HandlerResult::TimedOut => {
                cancellation.cancel();
                let after_secs = self.config.handler_timeout.as_secs();
                let message = format!("handler exceeded timeout of {after_secs}s");
                error!(job = job.name(), timeout_secs = after_secs, "job timed out; abandoning handler");
                if let Err(err) = self.store.record_timeout(&claim, &message) {
                    warn!(job = job.name(), error = %err, "could not record timeout");
                }
                return report(RunOutcome::TimedOut { after_secs }, None);
            }
        };

        let finished_at = self.clock.now();
        let next_due_at = job
            .schedule()
            .next_after(claim.claimed_at)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let finished = FinishedRun {
            status,
            finished_at,
            next_due_at,
            error,
        };

        match self.store.finish(&claim, &finished) {
            Ok(()) => report(outcome, Some(next_due_at)),
            Err(err) => {
                warn!(job = job.name(), error = %err, "could not record job outcome");
                report(RunOutcome::Abandoned { reason: err.to_string() }, None)
            }
        }
    }
}

impl<S> Dispatcher<S>
where
    S: JobStore + 'static,
{
    /// Start ticking every `search_interval` on a background thread.
    pub fn spawn(self: Arc<Self>) -> Result<DispatcherHandle, TriggerError> {
        let shutdown = self.shutdown.clone();
        let dispatcher = Arc::clone(&self);
        let trigger = IntervalTrigger::start(
            &format!("dispatcher-{}", self.instance),
            self.config.search_interval,
            move || {
                if dispatcher.shutdown.is_cancelled() {
                    return;
                }
                if panic::catch_unwind(AssertUnwindSafe(|| dispatcher.tick())).is_err() {
                    error!("dispatcher tick panicked");
                }
            },
        )?;
        info!(
            instance = %self.instance,
            jobs = self.registry.len(),
            interval_secs = self.config.search_interval.as_secs(),
            "dispatcher started"
        );
        Ok(DispatcherHandle { trigger, shutdown })
    }
}

/// Handle to a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    trigger: TriggerHandle,
    shutdown: CancellationToken,
}

impl DispatcherHandle {
    /// Signal running handlers to cancel, stop the trigger and wait for the
    /// in-flight tick to return.
    pub fn stop(self) {
        self.shutdown.cancel();
        self.trigger.stop();
        info!("dispatcher stopped");
    }

    pub fn ticks(&self) -> u64 {
        self.trigger.fired()
    }
}

fn run_handler(job: &JobDescriptor, ctx: JobContext, timeout: Duration) -> HandlerResult {
    let handler = job.handler();
    let (tx, rx) = mpsc::sync_channel(1);

    let spawned = thread::Builder::new()
        .name(format!("job-{}", job.name()))
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&ctx)));
            let _ = tx.send(result.map_err(panic_message));
        });
    if let Err(err) = spawned {
        return HandlerResult::Finished(Err(anyhow::anyhow!("failed to spawn handler thread: {err}")));
    }

    match rx.recv_timeout(timeout) {
        Ok(Ok(result)) => HandlerResult::Finished(result),
        Ok(Err(message)) => HandlerResult::Panicked(message),
        Err(RecvTimeoutError::Timeout) => HandlerResult::TimedOut,
        Err(RecvTimeoutError::Disconnected) => {
            HandlerResult::Panicked("handler thread exited without a result".into())
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use folio_core::ManualClock;

    use super::*;
    use crate::jobs::registry::JobRegistry;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobOutput, Schedule};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn counting_job(name: &str, counter: Arc<AtomicUsize>) -> JobDescriptor {
        JobDescriptor::new(name, Schedule::every(Duration::from_secs(60)).unwrap(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(JobOutput::affected(1))
        })
    }

    fn dispatcher(
        name: &str,
        registry: Arc<JobRegistry>,
        store: Arc<InMemoryJobStore>,
        clock: &ManualClock,
        config: DispatcherConfig,
    ) -> Dispatcher<Arc<InMemoryJobStore>> {
        Dispatcher::new(
            InstanceId::new(name).unwrap(),
            registry,
            store,
            Arc::new(clock.clone()),
            config,
        )
    }

    #[test]
    fn interval_job_runs_on_first_tick_then_waits_for_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(
            JobRegistry::builder()
                .register(counting_job("publish-pages", Arc::clone(&counter)))
                .unwrap()
                .build(),
        );
        let clock = ManualClock::new(t0());
        let d = dispatcher("a", registry, InMemoryJobStore::arc(), &clock, DispatcherConfig::default());

        assert_eq!(d.tick().succeeded(), 1);
        clock.advance(Duration::from_secs(30));
        assert!(d.tick().runs.is_empty());
        clock.advance(Duration::from_secs(31));
        assert_eq!(d.tick().succeeded(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn two_instances_ticking_together_run_each_due_job_once() {
        let names = ["clean-expired-previews", "clean-expired-tokens", "publish-pages"];
        let counters: Vec<_> = names.iter().map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let mut builder = JobRegistry::builder();
        for (name, counter) in names.iter().zip(&counters) {
            builder = builder.register(counting_job(name, Arc::clone(counter))).unwrap();
        }
        let registry = Arc::new(builder.build());
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::new(t0());
        for name in names {
            store.ensure(name, t0() + chrono::Duration::seconds(60)).unwrap();
        }
        let a = dispatcher("a", Arc::clone(&registry), Arc::clone(&store), &clock, DispatcherConfig::default());
        let b = dispatcher("b", registry, Arc::clone(&store), &clock, DispatcherConfig::default());
        let invocations = || counters.iter().map(|c| c.load(Ordering::SeqCst)).sum::<usize>();
        let tick_both = || {
            thread::scope(|scope| {
                let ha = scope.spawn(|| a.tick());
                let hb = scope.spawn(|| b.tick());
                (ha.join().unwrap(), hb.join().unwrap())
            })
        };

        tick_both();
        assert_eq!(invocations(), 0);

        clock.advance(Duration::from_secs(61));
        let (ra, rb) = tick_both();

        assert_eq!(invocations(), 3);
        assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));
        assert_eq!(ra.succeeded() + rb.succeeded(), 3);
        for name in names {
            let record = store.get(name).unwrap().unwrap();
            assert_eq!(record.status, JobStatus::Succeeded);
            assert_eq!(record.run_count, 1);
        }

        tick_both();
        assert_eq!(invocations(), 3);
    }

    #[test]
    fn failing_handler_is_recorded_and_retried_next_slot() {
        let registry = Arc::new(
            JobRegistry::builder()
                .register(JobDescriptor::new(
                    "clean-expired-previews",
                    Schedule::every(Duration::from_secs(60)).unwrap(),
                    |_| Err(anyhow::anyhow!("previews table missing")),
                ))
                .unwrap()
                .build(),
        );
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::new(t0());
        let d = dispatcher("a", registry, Arc::clone(&store), &clock, DispatcherConfig::default());

        let report = d.tick();
        assert!(matches!(&report.runs[0].outcome, RunOutcome::Failed { error } if error.contains("previews table missing")));

        let record = store.get("clean-expired-previews").unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.next_due_at, t0() + chrono::Duration::seconds(60));
    }

    #[test]
    fn panicking_handler_is_contained() {
        let registry = Arc::new(
            JobRegistry::builder()
                .register(JobDescriptor::new(
                    "publish-pages",
                    Schedule::every(Duration::from_secs(60)).unwrap(),
                    |_| panic!("boom"),
                ))
                .unwrap()
                .build(),
        );
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::new(t0());
        let d = dispatcher("a", registry, Arc::clone(&store), &clock, DispatcherConfig::default());

        let report = d.tick();
        assert!(matches!(&report.runs[0].outcome, RunOutcome::Failed { error } if error.contains("boom")));
        assert!(store.get("publish-pages").unwrap().unwrap().status.is_idle());
    }

    #[test]
    fn timed_out_handler_keeps_claim_until_stale() {
        let registry = Arc::new(
            JobRegistry::builder()
                .register(JobDescriptor::new(
                    "publish-pages",
                    Schedule::every(Duration::from_secs(60)).unwrap(),
                    |ctx| {
                        while !ctx.is_cancelled() {
                            thread::sleep(Duration::from_millis(5));
                        }
                        Ok(JobOutput::default())
                    },
                ))
                .unwrap()
                .build(),
        );
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::new(t0());
        let config = DispatcherConfig {
            handler_timeout: Duration::from_millis(50),
            staleness_window: Duration::from_secs(900),
            ..DispatcherConfig::default()
        };
        let d = dispatcher("a", registry, Arc::clone(&store), &clock, config);

        let report = d.tick();
        assert!(matches!(report.runs[0].outcome, RunOutcome::TimedOut { .. }));
        let record = store.get("publish-pages").unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert!(record.last_error.unwrap().contains("timeout"));

        clock.advance(Duration::from_secs(900));
        assert_eq!(d.tick().conflicts, vec!["publish-pages".to_string()]);

        clock.advance(Duration::from_secs(1));
        let report = d.tick();
        assert_eq!(report.reclaimed, vec!["publish-pages".to_string()]);
    }

    #[test]
    fn non_idempotent_job_waits_for_next_slot_after_reclaim() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(
            JobRegistry::builder()
                .register(counting_job("publish-pages", Arc::clone(&counter)).idempotent(false))
                .unwrap()
                .build(),
        );
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::new(t0());
        store.ensure("publish-pages", t0()).unwrap();
        let crashed = InstanceId::new("crashed").unwrap();
        store
            .try_claim(&ClaimRequest {
                job_name: "publish-pages",
                instance: &crashed,
                now: t0(),
                ignore_schedule: false,
            })
            .unwrap();

        let d = dispatcher("a", registry, Arc::clone(&store), &clock, DispatcherConfig::default());
        clock.advance(Duration::from_secs(901));

        let report = d.tick();
        assert_eq!(report.reclaimed.len(), 1);
        assert!(report.runs.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_secs(60));
        assert_eq!(d.tick().succeeded(), 1);
    }

    #[test]
    fn run_once_ignores_schedule_and_reports_disabled_and_unknown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(
            JobRegistry::builder()
                .register(counting_job("publish-pages", Arc::clone(&counter)))
                .unwrap()
                .register(counting_job("clean-expired-previews", Arc::clone(&counter)).enabled(false))
                .unwrap()
                .build(),
        );
        let clock = ManualClock::new(t0());
        let d = dispatcher("a", registry, InMemoryJobStore::arc(), &clock, DispatcherConfig::default());

        d.tick();
        let report = d.run_once("publish-pages").unwrap();
        assert!(report.outcome.is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        assert_eq!(
            d.run_once("clean-expired-previews"),
            Err(DispatchError::Disabled("clean-expired-previews".into()))
        );
        assert_eq!(d.run_once("nope"), Err(DispatchError::UnknownJob("nope".into())));
    }

    #[test]
    fn run_once_conflicts_with_held_claim() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(
            JobRegistry::builder()
                .register(counting_job("publish-pages", counter))
                .unwrap()
                .build(),
        );
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::new(t0());
        store.ensure("publish-pages", t0()).unwrap();
        let other = InstanceId::new("other").unwrap();
        store
            .try_claim(&ClaimRequest {
                job_name: "publish-pages",
                instance: &other,
                now: t0(),
                ignore_schedule: false,
            })
            .unwrap();

        let d = dispatcher("a", registry, store, &clock, DispatcherConfig::default());
        assert_eq!(
            d.run_once("publish-pages"),
            Err(DispatchError::ClaimConflict {
                job: "publish-pages".into(),
                held_by: "other".into()
            })
        );
    }

    #[test]
    fn handler_sees_claim_time_and_manual_trigger() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let sink = Arc::clone(&seen);
        let registry = Arc::new(
            JobRegistry::builder()
                .register(JobDescriptor::new(
                    "publish-pages",
                    Schedule::every(Duration::from_secs(60)).unwrap(),
                    move |ctx| {
                        *sink.lock().unwrap() = Some((ctx.now, ctx.trigger));
                        Ok(JobOutput::default())
                    },
                ))
                .unwrap()
                .build(),
        );
        let clock = ManualClock::new(t0());
        let d = dispatcher("a", registry, InMemoryJobStore::arc(), &clock, DispatcherConfig::default());

        d.run_once("publish-pages").unwrap();
        assert_eq!(*seen.lock().unwrap(), Some((t0(), Trigger::Manual)));
    }
}
