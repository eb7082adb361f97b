use std::collections::HashSet;
use std::io::{self, ErrorKind};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{CoreId, CpuTimes, Direction, FreqLimits, Platform};

const SIM_MIN_FREQ_KHZ: u32 = 300_000;
const SIM_MAX_FREQ_KHZ: u32 = 2_000_000;

#[derive(Debug, Clone)]
struct SimCore {
    online: bool,
    load_pct: u32,
    freq_khz: u32,
    times: CpuTimes,
}

#[derive(Debug)]
struct SimState {
    cores: Vec<SimCore>,
    runnable: u64,
    clock: Duration,
    freq_limits: Option<FreqLimits>,
    fail_next: HashSet<(Direction, CoreId)>,
    requests: Vec<(Direction, CoreId)>,
}

/// In-memory device with a manually advanced clock.
///
/// Load, frequency and runnable count are set by the caller; `advance`
/// accumulates wall/idle counters for online cores from their load.
#[derive(Debug)]
pub struct SimPlatform {
    state: Mutex<SimState>,
}

impl SimPlatform {
    /// `cores` possible cores, the first `online` of them powered on.
    pub fn new(cores: usize, online: usize) -> Self {
        let online = online.clamp(1, cores.max(1));
        let cores = (0..cores.max(1))
            .map(|core| SimCore {
                online: core < online,
                load_pct: 0,
                freq_khz: SIM_MIN_FREQ_KHZ,
                times: CpuTimes::default(),
            })
            .collect();
        Self {
            state: Mutex::new(SimState {
                cores,
                runnable: 0,
                clock: Duration::ZERO,
                freq_limits: Some(FreqLimits {
                    min_khz: SIM_MIN_FREQ_KHZ,
                    max_khz: SIM_MAX_FREQ_KHZ,
                }),
                fail_next: HashSet::new(),
                requests: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_load(&self, core: CoreId, load_pct: u32) {
        if let Some(c) = self.lock().cores.get_mut(core) {
            c.load_pct = load_pct.min(100);
        }
    }

    pub fn set_all_loads(&self, load_pct: u32) {
        for c in &mut self.lock().cores {
            c.load_pct = load_pct.min(100);
        }
    }

    pub fn set_freq(&self, core: CoreId, freq_khz: u32) {
        if let Some(c) = self.lock().cores.get_mut(core) {
            c.freq_khz = freq_khz;
        }
    }

    pub fn set_all_freqs(&self, freq_khz: u32) {
        for c in &mut self.lock().cores {
            c.freq_khz = freq_khz;
        }
    }

    pub fn set_runnable(&self, tasks: u64) {
        self.lock().runnable = tasks;
    }

    /// `None` makes `freq_limits` fail, as if cpufreq were missing.
    pub fn set_freq_limits(&self, limits: Option<FreqLimits>) {
        self.lock().freq_limits = limits;
    }

    /// Make the next request of `direction` for `core` fail.
    pub fn fail_next(&self, direction: Direction, core: CoreId) {
        self.lock().fail_next.insert((direction, core));
    }

    /// Change a core's power state behind the engine's back.
    pub fn force_state(&self, core: CoreId, online: bool) {
        if let Some(c) = self.lock().cores.get_mut(core) {
            c.online = online;
        }
    }

    /// Advance the clock, accruing wall and idle time on online cores.
    pub fn advance(&self, dt: Duration) {
        let mut state = self.lock();
        state.clock += dt;
        let micros = dt.as_micros() as u64;
        for c in state.cores.iter_mut().filter(|c| c.online) {
            c.times.wall += micros;
            c.times.idle += micros * u64::from(100 - c.load_pct) / 100;
        }
    }

    /// Overwrite a core's cumulative counters, e.g. to feed a reading whose
    /// idle time runs ahead of wall time.
    pub fn set_times(&self, core: CoreId, times: CpuTimes) {
        if let Some(c) = self.lock().cores.get_mut(core) {
            c.times = times;
        }
    }

    /// Every transition request issued so far, in order.
    pub fn requests(&self) -> Vec<(Direction, CoreId)> {
        self.lock().requests.clone()
    }

    pub fn online_count(&self) -> usize {
        self.lock().cores.iter().filter(|c| c.online).count()
    }

    fn transition(&self, core: CoreId, direction: Direction) -> io::Result<()> {
        let mut state = self.lock();
        state.requests.push((direction, core));
        if state.fail_next.remove(&(direction, core)) {
            return Err(io::Error::new(ErrorKind::ResourceBusy, "simulated transition failure"));
        }
        let c = state
            .cores
            .get_mut(core)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("no cpu{core}")))?;
        c.online = direction == Direction::Online;
        Ok(())
    }

    fn with_core<T>(&self, core: CoreId, f: impl FnOnce(&SimCore) -> T) -> io::Result<T> {
        let state = self.lock();
        let c = state
            .cores
            .get(core)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("no cpu{core}")))?;
        Ok(f(c))
    }
}

impl Platform for SimPlatform {
    fn possible_cores(&self) -> usize {
        self.lock().cores.len()
    }

    fn is_online(&self, core: CoreId) -> io::Result<bool> {
        self.with_core(core, |c| c.online)
    }

    fn request_online(&self, core: CoreId) -> io::Result<()> {
        self.transition(core, Direction::Online)
    }

    fn request_offline(&self, core: CoreId) -> io::Result<()> {
        self.transition(core, Direction::Offline)
    }

    fn cpu_times(&self, core: CoreId) -> io::Result<CpuTimes> {
        self.with_core(core, |c| c.times)
    }

    fn utilization(&self, core: CoreId) -> io::Result<u32> {
        self.with_core(core, |c| c.load_pct)
    }

    fn current_freq(&self, core: CoreId) -> io::Result<u32> {
        self.with_core(core, |c| c.freq_khz)
    }

    fn freq_limits(&self, _core: CoreId) -> io::Result<FreqLimits> {
        self.lock()
            .freq_limits
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "cpufreq not available"))
    }

    fn runnable_tasks(&self) -> io::Result<u64> {
        Ok(self.lock().runnable)
    }

    fn now(&self) -> Duration {
        self.lock().clock
    }
}
