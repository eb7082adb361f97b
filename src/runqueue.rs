use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::constants::RUNQUEUE_SCALE;

#[derive(Debug, Default)]
struct RunqueueState {
    avg: u64,
    last_time: Option<Duration>,
    total_ms: u64,
}

/// Ready-queue length scaled by 100, read and reset once per tick.
///
/// Every `sample` hands out the average and zeroes it while keeping the
/// time baseline. A zero average also drops the accumulated time, so each
/// read starts a fresh window and reports the current depth; readings never
/// carry over from one tick to the next.
#[derive(Debug, Default)]
pub struct RunqueueAverage {
    state: Mutex<RunqueueState>,
}

impl RunqueueAverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the window ending at `now` given `ready` runnable tasks.
    pub fn sample(&self, now: Duration, ready: u64) -> u64 {
        let mut s = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let last = *s.last_time.get_or_insert(now);
        if s.avg == 0 {
            s.total_ms = 0;
        }

        let mut nr = ready.saturating_mul(RUNQUEUE_SCALE);
        let dt = now.saturating_sub(last).as_millis() as u64;

        // Never taken while every read resets the average: `total_ms` was
        // just cleared above, so each read is a fresh window.
        if dt != 0 && s.total_ms != 0 {
            nr = (nr * dt + s.avg * s.total_ms) / (s.total_ms + dt);
        }
        s.avg = nr;
        s.total_ms += dt;
        s.last_time = Some(now);

        std::mem::take(&mut s.avg)
    }

    /// Forget all history; the next sample seeds the time baseline.
    pub fn reset(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = RunqueueState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TICK: Duration = Duration::from_millis(60);

    #[test]
    fn first_sample_is_the_current_depth() {
        let rq = RunqueueAverage::new();
        assert_eq!(rq.sample(Duration::from_secs(5), 3), 300);
    }

    #[test]
    fn converges_to_constant_depth_and_back_to_zero() {
        let rq = RunqueueAverage::new();
        let mut now = Duration::ZERO;
        let mut last = 0;
        for _ in 0..5 {
            now += TICK;
            last = rq.sample(now, 2);
        }
        assert_eq!(last, 200);

        for _ in 0..5 {
            now += TICK;
            last = rq.sample(now, 0);
        }
        assert_eq!(last, 0);
    }

    #[test]
    fn each_read_is_its_own_window() {
        let rq = RunqueueAverage::new();
        assert_eq!(rq.sample(TICK, 6), 600);
        assert_eq!(rq.sample(TICK * 2, 0), 0);
        assert_eq!(rq.sample(TICK * 3, 2), 200);
        assert_eq!(rq.sample(TICK * 10, 1), 100);
    }

    #[test]
    fn clock_going_backwards_is_clamped() {
        let rq = RunqueueAverage::new();
        rq.sample(Duration::from_secs(10), 1);
        assert_eq!(rq.sample(Duration::from_secs(9), 4), 400);
    }

    #[test]
    fn concurrent_readers_never_see_more_than_the_depth() {
        let rq = Arc::new(RunqueueAverage::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let rq = Arc::clone(&rq);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|n| rq.sample(Duration::from_millis(i * 1000 + n), 5))
                        .max()
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap() <= 500);
        }
    }
}
