//! Synchronous primitives supplied by the device: core power transitions,
//! per-core counters and clocks, and the runnable task count.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::Serialize;

pub mod sim;
pub mod sysfs;

pub use sim::SimPlatform;
pub use sysfs::SysfsPlatform;

/// Stable index of a processor core, independent of its power state.
pub type CoreId = usize;

/// Direction of a core power transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Online,
    Offline,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Online => f.write_str("online"),
            Direction::Offline => f.write_str("offline"),
        }
    }
}

/// Cumulative wall-clock and idle time of one core.
///
/// Units are platform defined; only deltas between two snapshots of the
/// same core are meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub wall: u64,
    pub idle: u64,
}

/// Hardware frequency range of a core, in kHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreqLimits {
    pub min_khz: u32,
    pub max_khz: u32,
}

/// Everything the engine needs from the device.
///
/// All calls are blocking and may be issued concurrently from several
/// per-core timer threads.
pub trait Platform: Send + Sync {
    /// Number of possible core ordinals (`0..possible_cores()`).
    fn possible_cores(&self) -> usize;

    fn is_online(&self, core: CoreId) -> io::Result<bool>;

    /// Power state of every possible core, indexed by ordinal.
    fn online_mask(&self) -> io::Result<Vec<bool>> {
        (0..self.possible_cores())
            .map(|core| self.is_online(core))
            .collect()
    }

    fn request_online(&self, core: CoreId) -> io::Result<()>;

    fn request_offline(&self, core: CoreId) -> io::Result<()>;

    fn cpu_times(&self, core: CoreId) -> io::Result<CpuTimes>;

    /// Instantaneous busy percentage (0-100).
    fn utilization(&self, core: CoreId) -> io::Result<u32>;

    /// Current clock of `core` in kHz.
    fn current_freq(&self, core: CoreId) -> io::Result<u32>;

    fn freq_limits(&self, core: CoreId) -> io::Result<FreqLimits>;

    /// Tasks currently ready to run, system wide.
    fn runnable_tasks(&self) -> io::Result<u64>;

    /// Monotonic time since an arbitrary platform epoch.
    fn now(&self) -> Duration;
}
