//! Wake-up plumbing for the reconciliation loop.
//!
//! The manager runs on a single driver thread. Between periodic ticks it
//! sleeps on a channel; external events (a goal edit, a job reaching a
//! terminal state, a forced update) push a reason into the channel through
//! a [`WakeUpCallback`] and the next reconciliation starts early. Because
//! one thread owns the manager, `run()` is never re-entered.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::jobs::{Job, JobStatusListener};
use crate::manager::ReflectionManager;

/// Handle external event sources use to wake the manager before its next
/// periodic tick. Cheap to clone; waking never blocks and never fails.
#[derive(Clone)]
pub struct WakeUpCallback {
    sender: Arc<Mutex<Option<Sender<String>>>>,
}

impl Default for WakeUpCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeUpCallback {
    /// A callback not yet attached to a scheduler. Wake-ups are dropped
    /// until a scheduler connects, which is fine: the periodic tick covers
    /// anything missed.
    pub fn new() -> Self {
        Self {
            sender: Arc::new(Mutex::new(None)),
        }
    }

    /// Request a reconciliation sooner than the next periodic tick.
    pub fn wakeup(&self, reason: &str) {
        let sender = self.sender.lock();
        match &*sender {
            Some(tx) => {
                trace!("waking up the reflection manager: {}", reason);
                // a send error means the scheduler stopped; the wakeup is
                // moot
                let _ = tx.send(reason.to_string());
            }
            None => trace!("no scheduler attached, dropping wakeup: {}", reason),
        }
    }

    pub(crate) fn connect(&self, tx: Sender<String>) {
        *self.sender.lock() = Some(tx);
    }

    pub(crate) fn disconnect(&self) {
        *self.sender.lock() = None;
    }
}

/// Job listener that wakes the manager when the job reaches a terminal
/// state, so the outcome is processed on the next reconciliation rather
/// than after a full period.
pub fn wake_on_job_done(callback: &WakeUpCallback, what: &str) -> JobStatusListener {
    let callback = callback.clone();
    let what = what.to_string();
    Arc::new(move |job: &Job| {
        callback.wakeup(&format!("{} {} done", what, job.id));
    })
}

/// Drop guard that logs a warning when the guarded section ran longer
/// than its threshold.
pub struct WarningTimer {
    name: &'static str,
    threshold: Duration,
    start: Instant,
}

impl WarningTimer {
    pub fn new(name: &'static str, threshold: Duration) -> Self {
        Self {
            name,
            threshold,
            start: Instant::now(),
        }
    }
}

impl Drop for WarningTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        if elapsed > self.threshold {
            warn!("{} took {:?} (threshold {:?})", self.name, elapsed, self.threshold);
        }
    }
}

/// Drives a [`ReflectionManager`] on a dedicated thread: one run at
/// startup to reconcile whatever was in flight when the previous process
/// stopped, then one run per periodic tick or wakeup.
pub struct WakeupScheduler {
    callback: WakeUpCallback,
    stop_tx: Sender<String>,
    handle: JoinHandle<ReflectionManager>,
}

impl WakeupScheduler {
    /// Take ownership of the manager and start the driver thread.
    pub fn start(
        mut manager: ReflectionManager,
        callback: &WakeUpCallback,
        period: Duration,
    ) -> Self {
        let (tx, rx): (Sender<String>, Receiver<String>) = mpsc::channel();
        callback.connect(tx.clone());

        let handle = thread::Builder::new()
            .name("reflection-manager".to_string())
            .spawn(move || {
                debug!("reflection manager driver started");
                manager.run();
                loop {
                    let reason = match rx.recv_timeout(period) {
                        Ok(reason) => reason,
                        Err(RecvTimeoutError::Timeout) => "periodic refresh".to_string(),
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    if reason == STOP_REASON {
                        break;
                    }
                    // coalesce whatever queued up while we were running or
                    // sleeping; one reconciliation covers them all
                    let mut stopping = false;
                    while let Ok(extra) = rx.try_recv() {
                        if extra == STOP_REASON {
                            stopping = true;
                            break;
                        }
                    }
                    if stopping {
                        break;
                    }
                    trace!("reflection manager woken up: {}", reason);
                    manager.run();
                }
                debug!("reflection manager driver stopped");
                manager
            })
            .expect("failed to spawn the reflection manager driver thread");

        Self {
            callback: callback.clone(),
            stop_tx: tx,
            handle,
        }
    }

    /// Stop the driver thread and hand the manager back. In-flight jobs
    /// keep running; their stored ids are polled on the next start.
    pub fn stop(self) -> ReflectionManager {
        self.callback.disconnect();
        let _ = self.stop_tx.send(STOP_REASON.to_string());
        match self.handle.join() {
            Ok(manager) => manager,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

const STOP_REASON: &str = "\u{0}stop";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unattached_wakeup_is_dropped() {
        let callback = WakeUpCallback::new();
        // nothing to observe beyond "does not panic or block"
        callback.wakeup("goal created");
    }

    #[test]
    fn test_connected_wakeup_delivers_reason() {
        let callback = WakeUpCallback::new();
        let (tx, rx) = mpsc::channel();
        callback.connect(tx);

        callback.wakeup("job done");
        assert_eq!(rx.recv().unwrap(), "job done");

        callback.disconnect();
        callback.wakeup("ignored");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_warning_timer_is_quiet_under_threshold() {
        let timer = WarningTimer::new("test section", Duration::from_secs(5));
        drop(timer);
    }
}
