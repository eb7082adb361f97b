//! The hotplug engine: owns the platform, the samplers, the settings and
//! the coordinator, and runs one evaluation round per online core per tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError, Weak,
};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::constants::{LOG_THROTTLE_SECS, PRIMARY_CORE};
use crate::coordinator::{CoreEvent, Coordinator};
use crate::error::{GovernorError, Result};
use crate::governor::{self, Decision, PolicyInput};
use crate::load_monitor::{self, LoadSampler};
use crate::log_throttle::{CoreThrottles, LogThrottle};
use crate::platform::{CoreId, Direction, Platform};
use crate::power::PowerEvent;
use crate::runqueue::RunqueueAverage;
use crate::status::{CoreSnapshot, EngineSnapshot};
use crate::ticker::{self, Ticker};
use crate::tunables::{self, Applied, Attribute};

/// How evaluation rounds are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduling {
    /// A timer thread per online core.
    Threaded,
    /// Rounds run only through [`Engine::tick`].
    Manual,
}

struct Inner {
    platform: Arc<dyn Platform>,
    sampler: Box<dyn LoadSampler>,
    runqueue: RunqueueAverage,
    settings: RwLock<Settings>,
    interval_ms: Arc<AtomicU64>,
    suspended: AtomicBool,
    freq_checks: AtomicBool,
    // Serializes enable/disable.
    lifecycle: Mutex<()>,
    coordinator: Mutex<Coordinator>,
    // Held for the whole of a core's round; a second round for the same
    // core finds it taken and skips.
    rounds: Vec<Mutex<()>>,
    sample_throttle: CoreThrottles,
    transition_throttle: CoreThrottles,
    limits_throttle: Mutex<LogThrottle>,
}

/// Handle to a running (or stopped) hotplug engine.
///
/// Dropping the engine disables it and joins every timer thread.
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Threaded engine with the build's default sampler.
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self::build(platform, load_monitor::default_sampler(), Scheduling::Threaded)
    }

    pub fn build(platform: Arc<dyn Platform>, sampler: Box<dyn LoadSampler>, scheduling: Scheduling) -> Self {
        let cores = platform.possible_cores().max(1);
        let settings = Settings::defaults(cores);
        let interval_ms = Arc::new(AtomicU64::new(settings.config.sampling_interval_ms));

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let ticker = match scheduling {
                Scheduling::Manual => Ticker::Manual,
                Scheduling::Threaded => {
                    let weak = weak.clone();
                    Ticker::threaded(Arc::clone(&interval_ms), move |core, token| {
                        if let Some(inner) = weak.upgrade() {
                            // Errors are logged inside the round.
                            let _ = inner.round(core, token);
                        }
                    })
                }
            };
            Inner {
                platform,
                sampler,
                runqueue: RunqueueAverage::new(),
                settings: RwLock::new(settings),
                interval_ms,
                suspended: AtomicBool::new(false),
                freq_checks: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
                coordinator: Mutex::new(Coordinator::new(cores, ticker)),
                rounds: (0..cores).map(|_| Mutex::new(())).collect(),
                sample_throttle: CoreThrottles::new(cores, LOG_THROTTLE_SECS),
                transition_throttle: CoreThrottles::new(cores, LOG_THROTTLE_SECS),
                limits_throttle: Mutex::new(LogThrottle::new(LOG_THROTTLE_SECS)),
            }
        });
        Self { inner }
    }

    pub fn possible_cores(&self) -> usize {
        self.inner.coordinator().possible()
    }

    /// Start managing cores. A no-op when already enabled.
    pub fn enable(&self) -> Result<Applied> {
        self.inner.enable()
    }

    /// Stop managing cores, cancel and join every timer. A no-op when
    /// already disabled.
    pub fn disable(&self) -> Applied {
        self.inner.disable()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.settings().config.enabled
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::Acquire)
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.inner.interval_ms.load(Ordering::Relaxed))
    }

    /// Run one evaluation round for `core` now. Cores without a schedule
    /// (offline, or engine disabled) report `NoChange`, as does a core whose
    /// own timer is mid-round.
    pub fn tick(&self, core: CoreId) -> Result<Decision> {
        let token = self.inner.coordinator().timer_token(core);
        match token {
            Some(token) => self.inner.round(core, &token),
            None => Ok(Decision::NoChange),
        }
    }

    /// Run a round for every currently scheduled core, lowest first.
    pub fn tick_all(&self) -> Vec<(CoreId, Result<Decision>)> {
        let scheduled: Vec<CoreId> = {
            let coord = self.inner.coordinator();
            (0..coord.possible())
                .filter(|&c| coord.state(c).is_some_and(|s| s.has_timer()))
                .collect()
        };
        scheduled
            .into_iter()
            .map(|core| (core, self.tick(core)))
            .collect()
    }

    /// Feed a core power-transition notification.
    pub fn notify(&self, event: CoreEvent) {
        let inner = &self.inner;
        let mut coord = inner.coordinator();
        if !inner.settings().config.enabled {
            debug!(?event, "engine disabled, notification ignored");
            return;
        }
        coord.handle(event);
        if let CoreEvent::Online(core) = event {
            inner.sampler.seed(&*inner.platform, core);
        }
        inner.restore_primary(&mut coord);
        let reaped = coord.take_reaped();
        drop(coord);
        ticker::reap(reaped);
    }

    /// Compare the platform's online mask with the engine's view and apply
    /// the differences as notifications.
    pub fn reconcile(&self) -> Result<Vec<CoreEvent>> {
        let inner = &self.inner;
        let mut coord = inner.coordinator();
        if !inner.settings().config.enabled {
            return Ok(Vec::new());
        }
        let mask = inner
            .platform
            .online_mask()
            .map_err(|e| GovernorError::platform("reading online mask", e))?;
        let events = coord.reconcile(&mask);
        for event in &events {
            if let CoreEvent::Online(core) = *event {
                inner.sampler.seed(&*inner.platform, core);
            }
            info!(?event, "reconciled out-of-band transition");
        }
        inner.restore_primary(&mut coord);
        let reaped = coord.take_reaped();
        drop(coord);
        ticker::reap(reaped);
        Ok(events)
    }

    pub fn power_event(&self, event: PowerEvent) {
        let inner = &self.inner;
        match event {
            PowerEvent::Suspend => {
                if !inner.suspended.swap(true, Ordering::AcqRel) {
                    let cap = inner.settings().config.max_cores_suspended;
                    info!(cap, "suspended, lowering core cap");
                }
            }
            PowerEvent::Resume => {
                let mut coord = inner.coordinator();
                if inner.suspended.swap(false, Ordering::AcqRel) {
                    coord.arm_force_up();
                    let cap = inner.settings().config.max_cores;
                    info!(cap, "resumed, forcing bring-up");
                }
            }
        }
    }

    pub fn read_attr(&self, name: &str) -> Result<String> {
        let attr = Attribute::parse(name, self.possible_cores())?;
        Ok(tunables::read(&self.inner.settings(), &attr))
    }

    /// Validate and apply an attribute write. `enabled` starts or stops
    /// the engine; writing the current value does nothing.
    pub fn write_attr(&self, name: &str, value: &str) -> Result<Applied> {
        let attr = Attribute::parse(name, self.possible_cores())?;
        let applied = match attr {
            Attribute::Enabled => {
                if tunables::parse_enabled(value)? {
                    self.enable()?
                } else {
                    self.disable()
                }
            }
            _ => {
                let mut coord = self.inner.coordinator();
                let mut settings = self.inner.settings_mut();
                let applied = tunables::write(&mut settings, &attr, value)?;
                if let Attribute::Threshold { core, .. } = attr {
                    if let Some(row) = settings.thresholds.row(core) {
                        coord.clamp_counters(core, row.up_rate, row.down_rate);
                    }
                }
                if attr == Attribute::SamplingInterval {
                    self.inner
                        .interval_ms
                        .store(settings.config.sampling_interval_ms, Ordering::Relaxed);
                }
                applied
            }
        };
        if applied == Applied::Changed {
            debug!(attribute = %attr, value, "attribute updated");
        }
        Ok(applied)
    }

    /// Every attribute with its current value.
    pub fn attributes(&self) -> Vec<(String, String)> {
        let settings = self.inner.settings();
        Attribute::all(settings.thresholds.len())
            .into_iter()
            .map(|attr| (attr.to_string(), tunables::read(&settings, &attr)))
            .collect()
    }

    /// Apply `(name, value)` pairs in order. Rejected writes keep the
    /// current value and are logged; returns how many were rejected.
    pub fn apply_attributes(&self, attributes: &[(String, String)]) -> usize {
        attributes
            .iter()
            .filter(|(name, value)| match self.write_attr(name, value) {
                Ok(_) => false,
                Err(e) => {
                    warn!("{name} = {value}: {e}, replaced with the default");
                    true
                }
            })
            .count()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let inner = &self.inner;
        let coord = inner.coordinator();
        let settings = inner.settings();
        let suspended = inner.suspended.load(Ordering::Acquire);
        let cores = (0..coord.possible())
            .filter_map(|core| {
                coord.state(core).map(|s| CoreSnapshot {
                    core,
                    online: s.online(),
                    pending: s.pending(),
                    up_rate_counter: s.up_rate_counter(),
                    down_rate_counter: s.down_rate_counter(),
                    cascade_up_cpu: s.cascade_up_cpu(),
                    cascade_up_by: s.cascade_up_by(),
                    force_up: s.force_up(),
                    scheduled: s.has_timer(),
                })
            })
            .collect();
        EngineSnapshot {
            enabled: settings.config.enabled,
            suspended,
            cap: settings.config.active_cap(suspended),
            sampling_interval_ms: settings.config.sampling_interval_ms,
            down_policy: settings.config.down_policy,
            freq_checks: inner.freq_checks.load(Ordering::Acquire),
            online: coord.online_count(),
            cores,
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.inner.disable();
    }
}

impl Inner {
    fn coordinator(&self) -> MutexGuard<'_, Coordinator> {
        self.coordinator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings(&self) -> RwLockReadGuard<'_, Settings> {
        self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings_mut(&self) -> RwLockWriteGuard<'_, Settings> {
        self.settings.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn enable(&self) -> Result<Applied> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.settings().config.enabled {
            return Ok(Applied::Unchanged);
        }
        let platform = &*self.platform;

        if !platform.is_online(PRIMARY_CORE).unwrap_or(false) {
            warn!(core = PRIMARY_CORE, "primary core reported offline, requesting it online");
            platform
                .request_online(PRIMARY_CORE)
                .map_err(|source| GovernorError::TransitionFailed {
                    core: PRIMARY_CORE,
                    direction: Direction::Online,
                    source,
                })?;
        }
        let mask = platform
            .online_mask()
            .map_err(|e| GovernorError::platform("reading online mask", e))?;

        self.probe_freq_limits();
        self.runqueue.reset();
        self.settings_mut().config.enabled = true;

        let mut coord = self.coordinator();
        let online: Vec<CoreId> = mask
            .iter()
            .enumerate()
            .filter(|&(core, &on)| on || core == PRIMARY_CORE)
            .map(|(core, _)| core)
            .chain(mask.is_empty().then_some(PRIMARY_CORE))
            .collect();
        for &core in &online {
            self.sampler.seed(platform, core);
            coord.register(core, None, false);
        }
        info!(
            online = coord.online_count(),
            possible = coord.possible(),
            interval_ms = self.interval_ms.load(Ordering::Relaxed),
            "hotplug engine enabled"
        );
        Ok(Applied::Changed)
    }

    fn disable(&self) -> Applied {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut settings = self.settings_mut();
            if !settings.config.enabled {
                return Applied::Unchanged;
            }
            settings.config.enabled = false;
        }
        let handles = self.coordinator().shutdown();
        ticker::reap(handles);
        self.runqueue.reset();
        info!("hotplug engine disabled");
        Applied::Changed
    }

    /// Retry reading the frequency limits; frequency bands stay off until
    /// the platform can report them.
    fn probe_freq_limits(&self) {
        match self.platform.freq_limits(PRIMARY_CORE) {
            Ok(limits) => {
                if !self.freq_checks.swap(true, Ordering::AcqRel) {
                    info!(min_khz = limits.min_khz, max_khz = limits.max_khz, "frequency limits available");
                }
            }
            Err(e) => {
                self.freq_checks.store(false, Ordering::Release);
                let err = GovernorError::ConfigurationUnavailable(format!("frequency limits: {e}"));
                if self.limits_throttle.lock().unwrap_or_else(PoisonError::into_inner).should_log() {
                    warn!("{err}, skipping frequency checks");
                }
            }
        }
    }

    /// Core 0 is never a bring-up candidate, so when a notification leaves
    /// it down the engine asks for it back here. A failed request is retried
    /// on the next notification or reconcile.
    fn restore_primary(&self, coord: &mut Coordinator) {
        let idle = coord
            .state(PRIMARY_CORE)
            .is_some_and(|s| !s.online() && s.pending().is_none());
        if !idle {
            return;
        }
        warn!(core = PRIMARY_CORE, "primary core went offline, requesting it back");
        match coord.bring_up(&*self.platform, PRIMARY_CORE, PRIMARY_CORE, false) {
            Ok(()) => self.sampler.seed(&*self.platform, PRIMARY_CORE),
            Err(e) => {
                if self.transition_throttle.should_log(PRIMARY_CORE) {
                    warn!(error = %e, "primary core still offline");
                }
            }
        }
    }

    /// One evaluation round for `core`, driven by the timer owning `token`.
    fn round(&self, core: CoreId, token: &AtomicBool) -> Result<Decision> {
        let Some(slot) = self.rounds.get(core) else {
            return Ok(Decision::NoChange);
        };
        let _round = match slot.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!(core, "round already in progress, skipped");
                return Ok(Decision::NoChange);
            }
        };
        let platform = &*self.platform;

        // Sampling happens outside the coordinator lock.
        let ready = platform.runnable_tasks().unwrap_or_else(|e| {
            if self.sample_throttle.should_log(core) {
                debug!(core, error = %e, "runnable task count unavailable");
            }
            0
        });
        let rq_avg = self.runqueue.sample(platform.now(), ready);
        if !self.freq_checks.load(Ordering::Acquire) {
            self.probe_freq_limits();
        }
        let reading = match self.sampler.sample(platform, core) {
            Ok(reading) => reading,
            Err(e) => {
                if self.sample_throttle.should_log(core) {
                    debug!(core, error = %e, "skipping decision this round");
                }
                return Err(e);
            }
        };

        let mut coord = self.coordinator();
        if !coord.accepts(core, token) {
            return Ok(Decision::NoChange);
        }
        let settings = self.settings();
        if !settings.config.enabled {
            return Ok(Decision::NoChange);
        }
        let Some(row) = settings.thresholds.row(core) else {
            return Ok(Decision::NoChange);
        };

        coord.clear_stale_cascade(core);
        let force_up = coord.take_force_up(core);
        let Some(state) = coord.state(core) else {
            return Ok(Decision::NoChange);
        };
        let input = PolicyInput {
            core,
            reading,
            rq_avg,
            row,
            up_rate_counter: state.up_rate_counter(),
            down_rate_counter: state.down_rate_counter(),
            cascade_child: state.cascade_up_cpu(),
            force_up,
            cap: settings.config.active_cap(self.suspended.load(Ordering::Acquire)),
            online: coord.online_count(),
            pending_up: coord.pending_count(Direction::Online),
            pending_down: coord.pending_count(Direction::Offline),
            candidate: coord.next_candidate(),
            freq_checks: self.freq_checks.load(Ordering::Acquire),
            down_policy: settings.config.down_policy,
        };
        let verdict = governor::evaluate(&input);
        coord.commit_counters(core, verdict.up_rate_counter, verdict.down_rate_counter);

        let outcome = match verdict.decision {
            Decision::BringUp(target) => coord
                .bring_up(platform, core, target, force_up)
                .map(|()| self.sampler.seed(platform, target)),
            Decision::TakeDown => coord.take_down(platform, core),
            Decision::NoChange => Ok(()),
        };
        if verdict.decision != Decision::NoChange {
            debug!(
                core,
                load = reading.load_pct,
                freq_khz = ?reading.freq_khz,
                rq_avg,
                decision = ?verdict.decision,
                forced = force_up,
                "hotplug decision"
            );
        }
        drop(settings);
        let reaped = coord.take_reaped();
        drop(coord);
        ticker::reap(reaped);

        match outcome {
            Ok(()) => Ok(verdict.decision),
            Err(e) => {
                if self.transition_throttle.should_log(core) {
                    warn!(core, error = %e, "transition failed, retrying on a later tick");
                }
                Err(e)
            }
        }
    }
}
