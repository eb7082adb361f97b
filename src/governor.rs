use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::GovernorError;
use crate::load_monitor::LoadReading;
use crate::platform::CoreId;
use crate::thresholds::ThresholdRow;

/// Outcome of one core's evaluation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Bring the given offline core up, with the evaluated core as parent.
    BringUp(CoreId),
    /// Take the evaluated core down.
    TakeDown,
    NoChange,
}

/// How the down-direction terms combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownPolicy {
    /// `load < down_load || (freq <= down_freq && rq <= down_rq)`
    #[default]
    LoadOrIdleFreq,
    /// `freq <= down_freq || (load < down_load && rq <= down_rq)`
    FreqOrIdleLoad,
}

impl DownPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            DownPolicy::LoadOrIdleFreq => "load-or-idle-freq",
            DownPolicy::FreqOrIdleLoad => "freq-or-idle-load",
        }
    }

    fn holds(self, load: u32, freq: Option<u32>, rq: u64, row: &ThresholdRow) -> bool {
        let low_load = load < row.down_load;
        let idle_queue = rq <= row.down_runqueue;
        match (self, freq) {
            (DownPolicy::LoadOrIdleFreq, Some(f)) => low_load || (f <= row.down_freq && idle_queue),
            (DownPolicy::LoadOrIdleFreq, None) => low_load || idle_queue,
            (DownPolicy::FreqOrIdleLoad, Some(f)) => f <= row.down_freq || (low_load && idle_queue),
            (DownPolicy::FreqOrIdleLoad, None) => low_load && idle_queue,
        }
    }
}

impl fmt::Display for DownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownPolicy {
    type Err = GovernorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "load-or-idle-freq" => Ok(DownPolicy::LoadOrIdleFreq),
            "freq-or-idle-load" => Ok(DownPolicy::FreqOrIdleLoad),
            other => Err(GovernorError::invalid(
                "down_policy",
                format!("`{other}` is neither load-or-idle-freq nor freq-or-idle-load"),
            )),
        }
    }
}

/// Everything one evaluation needs, gathered under the coordinator lock.
#[derive(Debug, Clone)]
pub struct PolicyInput<'a> {
    pub core: CoreId,
    pub reading: LoadReading,
    pub rq_avg: u64,
    pub row: &'a ThresholdRow,
    pub up_rate_counter: u32,
    pub down_rate_counter: u32,
    /// Core this one already brought up, if still linked.
    pub cascade_child: Option<CoreId>,
    pub force_up: bool,
    pub cap: usize,
    pub online: usize,
    pub pending_up: usize,
    pub pending_down: usize,
    /// Lowest offline core with no transition in flight.
    pub candidate: Option<CoreId>,
    /// False while the platform's frequency limits are unknown.
    pub freq_checks: bool,
    pub down_policy: DownPolicy,
}

/// A decision plus the counter values to commit for the evaluated core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    pub up_rate_counter: u32,
    pub down_rate_counter: u32,
}

/// Advance a rate-limit counter. Returns whether to act now and the new
/// counter, always within `[1, rate]`.
fn rate_step(counter: u32, rate: u32) -> (bool, u32) {
    let rate = rate.max(1);
    let counter = if counter > rate { 1 } else { counter.max(1) };
    if counter % rate == 0 {
        (true, counter)
    } else {
        (false, counter + 1)
    }
}

pub fn evaluate(input: &PolicyInput<'_>) -> Verdict {
    let row = input.row;
    let load = input.reading.load_pct;
    let freq = input.reading.freq_khz.filter(|_| input.freq_checks);
    let mut verdict = Verdict {
        decision: Decision::NoChange,
        up_rate_counter: input.up_rate_counter,
        down_rate_counter: input.down_rate_counter,
    };

    let committed_online = input.online.saturating_sub(input.pending_down);
    if input.core != 0 && committed_online > input.cap {
        verdict.decision = Decision::TakeDown;
        return verdict;
    }

    if input.online + input.pending_up < input.cap && input.cascade_child.is_none() {
        if let Some(target) = input.candidate {
            let wants_up = load >= row.up_load
                && freq.is_none_or(|f| f >= row.up_freq)
                && input.rq_avg > row.up_runqueue;
            if wants_up || input.force_up {
                let (act, counter) = rate_step(input.up_rate_counter, row.up_rate);
                verdict.up_rate_counter = counter;
                if act || input.force_up {
                    verdict.decision = Decision::BringUp(target);
                }
                return verdict;
            }
        }
    }

    if input.core != 0
        && committed_online > 1
        && input.down_policy.holds(load, freq, input.rq_avg, row)
    {
        let (act, counter) = rate_step(input.down_rate_counter, row.down_rate);
        verdict.down_rate_counter = counter;
        if act {
            verdict.decision = Decision::TakeDown;
        }
    }

    verdict
}
