use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::platform::CoreId;

/// Structure to manage logging rate limiting (max 1 log per interval)
#[derive(Debug, Clone)]
pub struct LogThrottle {
    last_log: Option<Instant>,
    min_interval: Duration,
}

impl LogThrottle {
    pub fn new(min_interval_secs: u64) -> Self {
        Self {
            last_log: None,
            min_interval: Duration::from_secs(min_interval_secs),
        }
    }

    pub fn should_log(&mut self) -> bool {
        let now = Instant::now();
        match self.last_log {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_log = Some(now);
                true
            }
        }
    }
}

/// One throttle per core, shared between timer threads.
#[derive(Debug)]
pub struct CoreThrottles {
    throttles: Mutex<Vec<LogThrottle>>,
}

impl CoreThrottles {
    pub fn new(cores: usize, min_interval_secs: u64) -> Self {
        Self {
            throttles: Mutex::new(vec![LogThrottle::new(min_interval_secs); cores]),
        }
    }

    pub fn should_log(&self, core: CoreId) -> bool {
        self.throttles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(core)
            .is_none_or(LogThrottle::should_log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_message_passes_then_throttles() {
        let mut t = LogThrottle::new(60);
        assert!(t.should_log());
        assert!(!t.should_log());
    }

    #[test]
    fn zero_interval_never_throttles() {
        let mut t = LogThrottle::new(0);
        assert!(t.should_log());
        assert!(t.should_log());
    }

    #[test]
    fn cores_are_throttled_independently() {
        let t = CoreThrottles::new(2, 60);
        assert!(t.should_log(0));
        assert!(t.should_log(1));
        assert!(!t.should_log(0));
        assert!(t.should_log(7));
    }
}
