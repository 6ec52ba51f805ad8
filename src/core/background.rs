//! Shared plumbing for background passes: enable/disable/run-now
//! notifications, the jittered interval launcher, and shutdown-aware
//! sleeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rand::Rng;

pub(crate) enum BgAction {
    Pass,
    Enable,
    Disable,
}

pub(crate) struct BgNotification {
    pub action: BgAction,
    pub done_tx: Sender<()>,
}

/// Send a notification and wait for the launcher to acknowledge it.
pub(crate) fn notify(tx: &Sender<BgNotification>, action: BgAction) {
    let (done_tx, done_rx) = bounded(1);
    if tx.send(BgNotification { action, done_tx }).is_ok() {
        let _ = done_rx.recv();
    }
}

/// The interval with ±10% Gaussian jitter applied, so replicas drift apart
/// instead of thundering together.
pub(crate) fn jittered(interval: Duration) -> Duration {
    let mut rng = rand::rng();
    let u1: f64 = rng.random_range(f64::EPSILON..1.0);
    let u2: f64 = rng.random_range(0.0..1.0);
    let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
    let scaled = interval.as_secs_f64() * (1.0 + 0.1 * z);
    Duration::from_secs_f64(scaled.clamp(0.0, interval.as_secs_f64() * 2.0))
}

/// Run `pass` every jittered `interval` while enabled, waking early for
/// notifications. Disable sets `abort` so a pass in flight winds down at
/// its next checkpoint; an explicit Pass notification clears it and runs a
/// full pass regardless of the enabled state.
pub(crate) fn launcher_loop(
    shutdown: Arc<AtomicBool>,
    notify_rx: Receiver<BgNotification>,
    interval: Duration,
    abort: Arc<AtomicBool>,
    mut pass: impl FnMut(),
) {
    let mut enabled = false;
    let mut next_run = Instant::now() + jittered(interval);
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let timeout = next_run.saturating_duration_since(Instant::now());
        let notification = match notify_rx.recv_timeout(timeout.min(Duration::from_secs(1))) {
            Ok(notification) => Some(notification),
            Err(RecvTimeoutError::Timeout) => {
                if Instant::now() < next_run {
                    continue;
                }
                None
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };
        next_run = Instant::now() + jittered(interval);
        match notification {
            Some(notification) => {
                match notification.action {
                    BgAction::Enable => enabled = true,
                    BgAction::Disable => {
                        abort.store(true, Ordering::Release);
                        enabled = false;
                    }
                    BgAction::Pass => {
                        abort.store(false, Ordering::Release);
                        pass();
                    }
                }
                let _ = notification.done_tx.send(());
            }
            None => {
                if enabled {
                    abort.store(false, Ordering::Release);
                    pass();
                }
            }
        }
    }
}

/// Sleep in shutdown-checking slices.
pub(crate) fn sleep_with_shutdown(shutdown: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::Acquire) {
            return false;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return true;
        }
        std::thread::sleep(left.min(Duration::from_millis(250)));
    }
}
