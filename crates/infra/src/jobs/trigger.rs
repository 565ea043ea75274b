//! Interval trigger: fires a callback on a dedicated thread at a fixed cadence.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("trigger interval must be greater than zero")]
    ZeroInterval,
    #[error("failed to spawn trigger thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Handle to a running trigger.
///
/// Dropping the handle also stops the trigger, but without waiting for it.
#[derive(Debug)]
pub struct TriggerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    fired: Arc<AtomicU64>,
}

impl TriggerHandle {
    /// Stop firing and wait for an in-flight callback to return.
    pub fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("trigger thread panicked");
            }
        }
    }

    /// Number of times the callback has run.
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }
}

pub struct IntervalTrigger;

impl IntervalTrigger {
    /// Fire `callback` every `interval`, starting one interval from now.
    ///
    /// Fire times are anchored to the start instant. If a callback overruns
    /// one or more fire times, those fires are skipped rather than queued, so
    /// the callback never runs back to back to catch up.
    pub fn start<F>(name: &str, interval: Duration, mut callback: F) -> Result<TriggerHandle, TriggerError>
    where
        F: FnMut() + Send + 'static,
    {
        if interval.is_zero() {
            return Err(TriggerError::ZeroInterval);
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fired);
        let thread_name = name.to_string();

        let join = thread::Builder::new().name(name.to_string()).spawn(move || {
            info!(trigger = %thread_name, interval_ms = interval.as_millis() as u64, "trigger started");
            let mut next_fire = Instant::now() + interval;

            loop {
                let wait = next_fire.saturating_duration_since(Instant::now());
                match shutdown_rx.recv_timeout(wait) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }

                callback();
                counter.fetch_add(1, Ordering::Relaxed);

                next_fire += interval;
                let now = Instant::now();
                if next_fire <= now {
                    let skipped = missed_fires(now - next_fire, interval) + 1;
                    next_fire = match interval.checked_mul(skipped) {
                        Some(step) => next_fire + step,
                        None => now + interval,
                    };
                    debug!(trigger = %thread_name, skipped, "callback overran; skipping missed fires");
                }
            }

            info!(trigger = %thread_name, "trigger stopped");
        })?;

        Ok(TriggerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            fired,
        })
    }
}

/// Whole intervals contained in `behind`.
fn missed_fires(behind: Duration, interval: Duration) -> u32 {
    let missed = behind.as_nanos() / interval.as_nanos();
    u32::try_from(missed).unwrap_or(u32::MAX - 1)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn zero_interval_is_rejected() {
        assert!(matches!(
            IntervalTrigger::start("t", Duration::ZERO, || {}),
            Err(TriggerError::ZeroInterval)
        ));
    }

    #[test]
    fn fires_repeatedly_until_stopped() {
        let handle = IntervalTrigger::start("t", Duration::from_millis(10), || {}).unwrap();
        thread::sleep(Duration::from_millis(100));
        handle_stop_and_check(handle, |fired| assert!(fired >= 3, "fired {fired} times"));
    }

    #[test]
    fn stop_waits_for_in_flight_callback() {
        let finished = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&finished);
        let handle = IntervalTrigger::start("t", Duration::from_millis(5), move || {
            thread::sleep(Duration::from_millis(50));
            *flag.lock().unwrap() = true;
        })
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        handle.stop();
        assert!(*finished.lock().unwrap());
    }

    #[test]
    fn overrun_skips_missed_fires() {
        assert_eq!(missed_fires(Duration::from_millis(35), Duration::from_millis(10)), 3);
        assert_eq!(missed_fires(Duration::ZERO, Duration::from_millis(10)), 0);
    }

    fn handle_stop_and_check(handle: TriggerHandle, check: impl FnOnce(u64)) {
        let fired = handle.fired();
        handle.stop();
        check(fired);
    }
}
