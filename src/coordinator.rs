use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;

use tracing::{debug, info};

use crate::error::{GovernorError, Result};
use crate::platform::{CoreId, Direction, Platform};
use crate::ticker::{Ticker, TimerHandle};

/// Asynchronous power-transition notification for one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreEvent {
    Online(CoreId),
    OnlineFailed(CoreId),
    Offline(CoreId),
    OfflineFailed(CoreId),
}

impl CoreEvent {
    pub fn core(self) -> CoreId {
        match self {
            CoreEvent::Online(c)
            | CoreEvent::OnlineFailed(c)
            | CoreEvent::Offline(c)
            | CoreEvent::OfflineFailed(c) => c,
        }
    }
}

/// Bookkeeping for one core, owned by the [`Coordinator`].
#[derive(Debug)]
pub struct CoreRuntimeState {
    up_rate_counter: u32,
    down_rate_counter: u32,
    online: bool,
    pending: Option<Direction>,
    /// Core this one brought up.
    cascade_up_cpu: Option<CoreId>,
    /// Core that brought this one up.
    cascade_up_by: Option<CoreId>,
    force_up: bool,
    timer: Option<TimerHandle>,
}

impl Default for CoreRuntimeState {
    fn default() -> Self {
        Self {
            up_rate_counter: 1,
            down_rate_counter: 1,
            online: false,
            pending: None,
            cascade_up_cpu: None,
            cascade_up_by: None,
            force_up: false,
            timer: None,
        }
    }
}

impl CoreRuntimeState {
    pub fn up_rate_counter(&self) -> u32 {
        self.up_rate_counter
    }

    pub fn down_rate_counter(&self) -> u32 {
        self.down_rate_counter
    }

    pub fn online(&self) -> bool {
        self.online
    }

    pub fn pending(&self) -> Option<Direction> {
        self.pending
    }

    pub fn cascade_up_cpu(&self) -> Option<CoreId> {
        self.cascade_up_cpu
    }

    pub fn cascade_up_by(&self) -> Option<CoreId> {
        self.cascade_up_by
    }

    pub fn force_up(&self) -> bool {
        self.force_up
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }
}

/// Per-core state table and the only place transitions are issued.
///
/// Lives behind the engine's coordinator mutex; every method assumes the
/// caller holds it. Timer threads cancelled here are parked in `reaped`
/// and joined by the caller after the lock is released.
pub struct Coordinator {
    cores: Vec<CoreRuntimeState>,
    ticker: Ticker,
    reaped: Vec<JoinHandle<()>>,
}

impl Coordinator {
    pub fn new(possible: usize, ticker: Ticker) -> Self {
        Self {
            cores: (0..possible).map(|_| CoreRuntimeState::default()).collect(),
            ticker,
            reaped: Vec::new(),
        }
    }

    pub fn possible(&self) -> usize {
        self.cores.len()
    }

    pub fn state(&self, core: CoreId) -> Option<&CoreRuntimeState> {
        self.cores.get(core)
    }

    pub fn is_online(&self, core: CoreId) -> bool {
        self.cores.get(core).is_some_and(|s| s.online)
    }

    pub fn online_count(&self) -> usize {
        self.cores.iter().filter(|s| s.online).count()
    }

    pub fn pending_count(&self, direction: Direction) -> usize {
        self.cores
            .iter()
            .filter(|s| s.pending == Some(direction))
            .count()
    }

    /// Lowest non-primary core that is offline with nothing in flight.
    pub fn next_candidate(&self) -> Option<CoreId> {
        self.cores
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, s)| !s.online && s.pending.is_none())
            .map(|(core, _)| core)
    }

    /// Whether `token` is the live timer of an online core.
    pub fn accepts(&self, core: CoreId, token: &AtomicBool) -> bool {
        self.cores.get(core).is_some_and(|s| {
            s.online
                && s.timer
                    .as_ref()
                    .is_some_and(|t| t.owns(token) && !t.is_cancelled())
        })
    }

    pub fn timer_token(&self, core: CoreId) -> Option<std::sync::Arc<AtomicBool>> {
        self.cores.get(core)?.timer.as_ref().map(TimerHandle::token)
    }

    /// Flag every online core for one forced bring-up round.
    pub fn arm_force_up(&mut self) {
        for s in self.cores.iter_mut().filter(|s| s.online) {
            s.force_up = true;
        }
    }

    /// Read and clear the core's forced bring-up flag.
    pub fn take_force_up(&mut self, core: CoreId) -> bool {
        self.cores
            .get_mut(core)
            .is_some_and(|s| std::mem::take(&mut s.force_up))
    }

    /// Drop a cascade child link that points at a core no longer online.
    pub fn clear_stale_cascade(&mut self, core: CoreId) {
        let Some(child) = self.cores.get(core).and_then(|s| s.cascade_up_cpu) else {
            return;
        };
        let live = self
            .cores
            .get(child)
            .is_some_and(|c| c.online || c.pending.is_some());
        if !live {
            debug!(core, child, "clearing stale cascade link");
            self.unlink_child(core);
        }
    }

    pub fn commit_counters(&mut self, core: CoreId, up: u32, down: u32) {
        if let Some(s) = self.cores.get_mut(core) {
            s.up_rate_counter = up;
            s.down_rate_counter = down;
        }
    }

    /// Keep stored counters within `[1, rate]` after a rate write. A counter
    /// past the new rate restarts at 1, as it would on the next evaluation.
    pub fn clamp_counters(&mut self, core: CoreId, up_rate: u32, down_rate: u32) {
        if let Some(s) = self.cores.get_mut(core) {
            if s.up_rate_counter > up_rate {
                s.up_rate_counter = 1;
            }
            if s.down_rate_counter > down_rate {
                s.down_rate_counter = 1;
            }
        }
    }

    /// Register a core that came online. `parent` links the cascade;
    /// `forced` carries a resume bring-up on to the new core.
    pub fn register(&mut self, core: CoreId, parent: Option<CoreId>, forced: bool) {
        let Some(state) = self.cores.get(core) else {
            return;
        };
        if state.online {
            self.cores[core].pending = None;
            return;
        }

        let timer = match self.cores[core].timer.take() {
            Some(t) if !t.is_cancelled() => t,
            stale => {
                if let Some(handle) = stale.and_then(TimerHandle::cancel) {
                    self.reaped.push(handle);
                }
                self.ticker.install(core)
            }
        };

        let state = &mut self.cores[core];
        state.timer = Some(timer);
        state.online = true;
        state.pending = None;
        state.up_rate_counter = 1;
        state.force_up = forced;

        if let Some(parent) = parent.filter(|&p| p != core && p < self.cores.len()) {
            self.unlink_child(parent);
            self.cores[parent].cascade_up_cpu = Some(core);
            self.cores[parent].up_rate_counter = 1;
            self.cores[core].cascade_up_by = Some(parent);
        }
        info!(core, parent = ?parent, forced, "core online");
    }

    /// Tear down a core that went offline: timer, cascade links, counters.
    pub fn teardown(&mut self, core: CoreId) {
        let Some(state) = self.cores.get_mut(core) else {
            return;
        };
        state.pending = None;
        if let Some(handle) = state.timer.take().and_then(TimerHandle::cancel) {
            self.reaped.push(handle);
        }
        let was_online = std::mem::replace(&mut state.online, false);
        state.force_up = false;
        state.down_rate_counter = 1;

        self.unlink_child(core);
        if let Some(parent) = self.cores[core].cascade_up_by.take() {
            if let Some(p) = self.cores.get_mut(parent) {
                if p.cascade_up_cpu == Some(core) {
                    p.cascade_up_cpu = None;
                }
            }
        }
        if was_online {
            info!(core, "core offline");
        }
    }

    fn unlink_child(&mut self, core: CoreId) {
        let Some(child) = self.cores.get_mut(core).and_then(|s| s.cascade_up_cpu.take()) else {
            return;
        };
        if let Some(c) = self.cores.get_mut(child) {
            if c.cascade_up_by == Some(core) {
                c.cascade_up_by = None;
            }
        }
    }

    /// Request `target` online on behalf of `by`.
    pub fn bring_up(&mut self, platform: &dyn Platform, by: CoreId, target: CoreId, forced: bool) -> Result<()> {
        let Some(state) = self.cores.get_mut(target) else {
            return Ok(());
        };
        state.pending = Some(Direction::Online);
        match platform.request_online(target) {
            Ok(()) => {
                self.register(target, Some(by), forced);
                Ok(())
            }
            Err(source) => {
                self.handle(CoreEvent::OnlineFailed(target));
                Err(GovernorError::TransitionFailed {
                    core: target,
                    direction: Direction::Online,
                    source,
                })
            }
        }
    }

    /// Request `core` offline.
    pub fn take_down(&mut self, platform: &dyn Platform, core: CoreId) -> Result<()> {
        let Some(state) = self.cores.get_mut(core) else {
            return Ok(());
        };
        state.pending = Some(Direction::Offline);
        match platform.request_offline(core) {
            Ok(()) => {
                self.teardown(core);
                Ok(())
            }
            Err(source) => {
                self.handle(CoreEvent::OfflineFailed(core));
                Err(GovernorError::TransitionFailed {
                    core,
                    direction: Direction::Offline,
                    source,
                })
            }
        }
    }

    /// Apply a notification. Repeats and unsolicited events are fine.
    pub fn handle(&mut self, event: CoreEvent) {
        let core = event.core();
        if core >= self.cores.len() {
            debug!(?event, "notification for unknown core ignored");
            return;
        }
        match event {
            CoreEvent::Online(_) => self.register(core, None, false),
            CoreEvent::Offline(_) => self.teardown(core),
            CoreEvent::OnlineFailed(_) | CoreEvent::OfflineFailed(_) => {
                self.cores[core].pending = None;
                debug!(?event, "transition failed, pending cleared");
            }
        }
    }

    /// Bring the table in line with the platform's online mask, returning
    /// the notifications synthesized for the differences.
    pub fn reconcile(&mut self, mask: &[bool]) -> Vec<CoreEvent> {
        let events: Vec<CoreEvent> = self
            .cores
            .iter()
            .zip(mask)
            .enumerate()
            .filter(|(_, (s, _))| s.pending.is_none())
            .filter_map(|(core, (s, &on))| match (s.online, on) {
                (false, true) => Some(CoreEvent::Online(core)),
                (true, false) => Some(CoreEvent::Offline(core)),
                _ => None,
            })
            .collect();
        for &event in &events {
            self.handle(event);
        }
        events
    }

    /// Cancel every timer and reset the table. Returns all threads to join.
    pub fn shutdown(&mut self) -> Vec<JoinHandle<()>> {
        for state in &mut self.cores {
            if let Some(handle) = state.timer.take().and_then(TimerHandle::cancel) {
                self.reaped.push(handle);
            }
            *state = CoreRuntimeState::default();
        }
        self.take_reaped()
    }

    pub fn take_reaped(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.reaped)
    }
}
