use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::log_throttle::LogThrottle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    Suspend,
    Resume,
}

/// Something that reports suspend/resume transitions.
pub trait PowerStateSource: Send {
    /// Check the current state once, returning an event on change.
    fn poll_once(&mut self) -> io::Result<Option<PowerEvent>>;

    fn poll_interval(&self) -> Duration;

    /// Poll until `stop` fires or disconnects, feeding events to `sink`.
    fn run(&mut self, stop: &Receiver<()>, sink: &mut dyn FnMut(PowerEvent)) {
        let mut throttle = LogThrottle::new(60);
        loop {
            match self.poll_once() {
                Ok(Some(event)) => sink(event),
                Ok(None) => {}
                Err(e) => {
                    if throttle.should_log() {
                        warn!(error = %e, "power state unavailable");
                    }
                }
            }
            match stop.recv_timeout(self.poll_interval()) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("power state source stopped");
    }
}

/// Watches a display blank-state file: `0` means awake, anything else
/// means the panel is blanked and the device is treated as suspended.
pub struct BlankFileSource {
    path: PathBuf,
    poll: Duration,
    suspended: Option<bool>,
}

impl BlankFileSource {
    pub fn new(path: impl Into<PathBuf>, poll: Duration) -> Self {
        Self {
            path: path.into(),
            poll,
            suspended: None,
        }
    }
}

impl PowerStateSource for BlankFileSource {
    fn poll_once(&mut self) -> io::Result<Option<PowerEvent>> {
        let blanked = fs::read_to_string(&self.path)?.trim() != "0";
        let previous = self.suspended.replace(blanked);
        let event = match (previous, blanked) {
            (Some(before), now) if before == now => None,
            // The first reading only reports a blanked panel; awake is the
            // engine's starting state.
            (None, false) => None,
            (_, true) => Some(PowerEvent::Suspend),
            (_, false) => Some(PowerEvent::Resume),
        };
        if let Some(event) = event {
            info!(?event, path = %self.path.display(), "display power state changed");
        }
        Ok(event)
    }

    fn poll_interval(&self) -> Duration {
        self.poll
    }
}
