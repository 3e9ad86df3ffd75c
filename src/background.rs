//! Background-pass supervision.
//!
//! Every background activity (compaction, audit, replication passes, the
//! flusher, tombstone discard) is a launcher thread with a one-slot mailbox.
//! A [`BgNotification`] asks it to run one pass now (`Pass`, preempting any
//! pass in flight) or to stop (`Disable`). A preempted pass hands the pending
//! notification back to the launcher so nothing is lost. Launchers sleep a
//! jittered interval between passes so replicas don't fire in lockstep.

use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BgAction {
    /// Run one pass now.
    Pass,
    /// Stop the launcher.
    Disable,
}

pub struct BgNotification {
    pub action: BgAction,
    pub done: Sender<()>,
}

/// Per-component launcher handle guarding enable/disable/trigger against
/// concurrent toggling.
pub struct BgState {
    notify: Mutex<Option<Sender<BgNotification>>>,
}

impl BgState {
    pub fn new() -> Self {
        Self {
            notify: Mutex::new(None),
        }
    }

    /// Starts the launcher if it is not running. `spawn` receives the mailbox
    /// and must hand it to the launcher thread.
    pub fn enable(&self, spawn: impl FnOnce(Receiver<BgNotification>)) {
        let mut guard = self.notify.lock();
        if guard.is_none() {
            let (tx, rx) = bounded(1);
            *guard = Some(tx);
            spawn(rx);
        }
    }

    /// Stops the launcher and waits for it to acknowledge.
    pub fn disable(&self) {
        let mut guard = self.notify.lock();
        if let Some(tx) = guard.take() {
            let (done_tx, done_rx) = bounded(1);
            if tx
                .send(BgNotification {
                    action: BgAction::Disable,
                    done: done_tx,
                })
                .is_ok()
            {
                let _ = done_rx.recv();
            }
        }
    }

    /// Runs one complete pass synchronously. With the launcher running, the
    /// pass is routed through its mailbox (restarting any pass in flight);
    /// otherwise `direct` runs it on the calling thread with a mailbox nobody
    /// sends on.
    pub fn trigger(&self, direct: impl FnOnce(Receiver<BgNotification>)) {
        let guard = self.notify.lock();
        match guard.as_ref() {
            None => {
                let (_tx, rx) = bounded(1);
                direct(rx);
            }
            Some(tx) => {
                let (done_tx, done_rx) = bounded(1);
                if tx
                    .send(BgNotification {
                        action: BgAction::Pass,
                        done: done_tx,
                    })
                    .is_ok()
                {
                    let _ = done_rx.recv();
                }
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.notify.lock().is_some()
    }
}

impl Default for BgState {
    fn default() -> Self {
        Self::new()
    }
}

/// `interval` plus or minus up to 10%, drawn from the store-wide RNG.
pub fn jittered(interval: Duration, rng: &Mutex<StdRng>) -> Duration {
    let factor = 1.0 + rng.lock().gen_range(-0.1..0.1);
    Duration::from_secs_f64(interval.as_secs_f64() * factor)
}

/// The launcher body shared by every background component. `pass` runs one
/// pass, polling its mailbox for preemption; it returns the notification that
/// preempted it, if any, for the launcher to process next.
pub fn launcher_loop<F>(
    name: &'static str,
    interval: Duration,
    rng: &Mutex<StdRng>,
    notify_rx: Receiver<BgNotification>,
    mut pass: F,
) where
    F: FnMut(&Receiver<BgNotification>) -> Option<BgNotification>,
{
    let mut next_run = Instant::now() + jittered(interval, rng);
    let mut notification: Option<BgNotification> = None;
    let mut running = true;
    while running {
        if notification.is_none() {
            let now = Instant::now();
            if next_run > now {
                match notify_rx.recv_timeout(next_run - now) {
                    Ok(n) => notification = Some(n),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            } else {
                notification = notify_rx.try_recv().ok();
            }
        }
        next_run = Instant::now() + jittered(interval, rng);
        match notification.take() {
            Some(n) => {
                let next = match n.action {
                    BgAction::Pass => pass(&notify_rx),
                    BgAction::Disable => {
                        running = false;
                        None
                    }
                };
                let _ = n.done.send(());
                notification = next;
            }
            None => {
                tracing::debug!(task = name, "scheduled pass");
                notification = pass(&notify_rx);
            }
        }
    }
}

/// Fans a pass out over `workers` threads while watching the mailbox. A
/// notification raises the shared abort flag, waits for the workers to wind
/// down, and is handed back to the launcher to process next.
pub fn run_preemptible<F>(
    notify_rx: &Receiver<BgNotification>,
    workers: usize,
    work: F,
) -> Option<BgNotification>
where
    F: Fn(usize, &std::sync::atomic::AtomicBool) + Sync,
{
    let abort = std::sync::atomic::AtomicBool::new(false);
    let (done_tx, done_rx) = bounded::<()>(1);
    std::thread::scope(|scope| {
        for worker in 0..workers.max(1) {
            let done_tx = done_tx.clone();
            let work = &work;
            let abort = &abort;
            scope.spawn(move || {
                work(worker, abort);
                drop(done_tx);
            });
        }
        drop(done_tx);
        crossbeam_channel::select! {
            recv(notify_rx) -> n => match n {
                Ok(n) => {
                    abort.store(true, std::sync::atomic::Ordering::Release);
                    while done_rx.recv().is_ok() {}
                    Some(n)
                }
                Err(_) => {
                    while done_rx.recv().is_ok() {}
                    None
                }
            },
            recv(done_rx) -> _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_trigger_without_launcher_runs_directly() {
        let state = BgState::new();
        let ran = AtomicUsize::new(0);
        state.trigger(|_rx| {
            ran.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_enable_disable_round_trip() {
        let state = Arc::new(BgState::new());
        let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(1)));
        let passes = Arc::new(AtomicUsize::new(0));
        {
            let rng = rng.clone();
            let passes = passes.clone();
            state.enable(move |rx| {
                std::thread::spawn(move || {
                    launcher_loop("test", Duration::from_secs(60), &rng, rx, |_rx| {
                        passes.fetch_add(1, Ordering::SeqCst);
                        None
                    });
                });
            });
        }
        assert!(state.is_enabled());
        // Triggered pass goes through the mailbox.
        state.trigger(|_rx| panic!("launcher is running"));
        assert_eq!(passes.load(Ordering::SeqCst), 1);
        state.disable();
        assert!(!state.is_enabled());
        // Second disable is a no-op.
        state.disable();
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let rng = Mutex::new(StdRng::seed_from_u64(7));
        for _ in 0..100 {
            let d = jittered(Duration::from_secs(100), &rng);
            assert!(d >= Duration::from_secs(90) && d <= Duration::from_secs(110));
        }
    }
}
