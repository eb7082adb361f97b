use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, error, warn};

use crate::platform::CoreId;

/// One evaluation round for a core. The flag is the timer's cancel token and
/// must be checked under the coordinator lock before acting.
pub type RoundFn = dyn Fn(CoreId, &AtomicBool) + Send + Sync;

/// Factory for per-core periodic timers.
pub enum Ticker {
    /// One thread per online core, waking every `interval_ms`.
    Threaded {
        interval_ms: Arc<AtomicU64>,
        round: Arc<RoundFn>,
    },
    /// No threads; rounds are driven explicitly through `Engine::tick`.
    Manual,
}

impl Ticker {
    pub fn threaded(
        interval_ms: Arc<AtomicU64>,
        round: impl Fn(CoreId, &AtomicBool) + Send + Sync + 'static,
    ) -> Self {
        Ticker::Threaded {
            interval_ms,
            round: Arc::new(round),
        }
    }

    pub fn install(&self, core: CoreId) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let Ticker::Threaded { interval_ms, round } = self else {
            return TimerHandle {
                core,
                cancelled,
                stop: None,
                thread: None,
            };
        };

        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let interval_ms = Arc::clone(interval_ms);
        let round = Arc::clone(round);
        let token = Arc::clone(&cancelled);
        let spawned = thread::Builder::new()
            .name(format!("hotplug-cpu{core}"))
            .spawn(move || {
                loop {
                    let period = Duration::from_millis(interval_ms.load(Ordering::Relaxed));
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            if token.load(Ordering::Acquire) {
                                break;
                            }
                            round(core, &token);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!(core, "timer stopped");
            });

        let thread = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(core, error = %e, "failed to spawn timer thread, core will not be evaluated");
                None
            }
        };
        TimerHandle {
            core,
            cancelled,
            stop: Some(stop),
            thread,
        }
    }
}

/// A core's periodic timer. Dropping the handle without `cancel` leaves the
/// thread to exit on its own once the stop channel disconnects.
#[derive(Debug)]
pub struct TimerHandle {
    core: CoreId,
    cancelled: Arc<AtomicBool>,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TimerHandle {
    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether `token` belongs to this timer (and not to a newer one
    /// installed after a quick offline/online cycle).
    pub fn owns(&self, token: &AtomicBool) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.cancelled), token)
    }

    /// Mark cancelled and wake the thread. The caller joins the returned
    /// handle once it no longer holds the coordinator lock.
    pub fn cancel(mut self) -> Option<JoinHandle<()>> {
        self.cancelled.store(true, Ordering::Release);
        drop(self.stop.take());
        self.thread.take()
    }
}

/// Join cancelled timer threads, skipping the calling thread's own timer.
pub fn reap(handles: Vec<JoinHandle<()>>) {
    let current = thread::current().id();
    for handle in handles {
        if handle.thread().id() == current {
            continue;
        }
        let name = handle.thread().name().unwrap_or("timer").to_owned();
        if handle.join().is_err() {
            warn!(thread = %name, "timer thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn manual_handles_carry_a_token_only() {
        let handle = Ticker::Manual.install(3);
        assert_eq!(handle.core(), 3);
        let token = handle.token();
        assert!(handle.cancel().is_none());
        assert!(token.load(Ordering::Acquire));
    }

    #[test]
    fn threaded_timer_runs_rounds_until_cancelled() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&rounds);
        let ticker = Ticker::threaded(Arc::new(AtomicU64::new(5)), move |core, _| {
            assert_eq!(core, 1);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let handle = ticker.install(1);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while rounds.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        reap(handle.cancel().into_iter().collect());

        let after = rounds.load(Ordering::SeqCst);
        assert!(after >= 3);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(rounds.load(Ordering::SeqCst), after);
    }
}
