use std::cmp::Ordering;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::error::{GovernorError, Result};
use crate::platform::{CoreId, CpuTimes, Platform};

/// One core's load and clock for a single evaluation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadReading {
    pub load_pct: u32,
    /// `None` when the clock could not be read; frequency bands are skipped.
    pub freq_khz: Option<u32>,
}

/// Turns platform counters into a per-core load percentage.
pub trait LoadSampler: Send + Sync {
    /// Establish a baseline for `core` (engine start, core coming online).
    fn seed(&self, platform: &dyn Platform, core: CoreId);

    fn load(&self, platform: &dyn Platform, core: CoreId) -> Result<u32>;

    fn sample(&self, platform: &dyn Platform, core: CoreId) -> Result<LoadReading> {
        let load_pct = self.load(platform, core)?;
        let freq_khz = platform.current_freq(core).ok();
        Ok(LoadReading { load_pct, freq_khz })
    }
}

/// Busy percentage from wall and idle deltas.
///
/// `None` when idle ran ahead of wall: the reading is skipped this round.
pub fn load_from_deltas(wall: u64, idle: u64) -> Option<u32> {
    match wall.cmp(&idle) {
        Ordering::Less => None,
        Ordering::Equal => Some(0),
        Ordering::Greater => Some((100 * (wall - idle) / wall) as u32),
    }
}

/// Derives load from successive (wall, idle) snapshots.
#[derive(Debug, Default)]
pub struct CounterSampler {
    snapshots: Mutex<Vec<Option<CpuTimes>>>,
}

impl CounterSampler {
    pub fn new() -> Self {
        Self::default()
    }

    fn swap_snapshot(&self, core: CoreId, current: CpuTimes) -> Option<CpuTimes> {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        if snapshots.len() <= core {
            snapshots.resize(core + 1, None);
        }
        snapshots[core].replace(current)
    }
}

impl LoadSampler for CounterSampler {
    fn seed(&self, platform: &dyn Platform, core: CoreId) {
        if let Ok(times) = platform.cpu_times(core) {
            self.swap_snapshot(core, times);
        }
    }

    fn load(&self, platform: &dyn Platform, core: CoreId) -> Result<u32> {
        let current = platform
            .cpu_times(core)
            .map_err(|e| GovernorError::platform(format!("reading cpu{core} times"), e))?;
        let previous = self
            .swap_snapshot(core, current)
            .ok_or(GovernorError::SampleUnavailable { core })?;

        let wall = current.wall.checked_sub(previous.wall);
        let idle = current.idle.checked_sub(previous.idle);
        wall.zip(idle)
            .and_then(|(wall, idle)| load_from_deltas(wall, idle))
            .ok_or(GovernorError::SampleUnavailable { core })
    }
}

/// Asks the platform for utilization directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct UtilizationSampler;

impl LoadSampler for UtilizationSampler {
    fn seed(&self, _platform: &dyn Platform, _core: CoreId) {}

    fn load(&self, platform: &dyn Platform, core: CoreId) -> Result<u32> {
        platform
            .utilization(core)
            .map(|pct| pct.min(100))
            .map_err(|_| GovernorError::SampleUnavailable { core })
    }
}

/// The sampler picked at build time (`direct-util` feature).
pub fn default_sampler() -> Box<dyn LoadSampler> {
    if cfg!(feature = "direct-util") {
        Box::new(UtilizationSampler)
    } else {
        Box::new(CounterSampler::new())
    }
}
