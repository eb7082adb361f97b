// Public modules
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod governor;
pub mod load_monitor;
pub mod log_throttle;
pub mod platform;
pub mod power;
pub mod runqueue;
pub mod status;
pub mod thresholds;
pub mod ticker;
pub mod tunables;

pub use engine::{Engine, Scheduling};
pub use error::{GovernorError, Result};

// Re-export constants commonly used
pub mod constants {
    use crate::platform::CoreId;

    pub const MIN_SAMPLING_INTERVAL_MS: u64 = 10;
    pub const DEFAULT_SAMPLING_INTERVAL_MS: u64 = 60;
    pub const DEFAULT_MAX_CORES_SUSPENDED: usize = 1;

    /// The boot core; never taken offline by policy.
    pub const PRIMARY_CORE: CoreId = 0;
    /// Runqueue averages are reported in tasks × 100.
    pub const RUNQUEUE_SCALE: u64 = 100;

    pub const LOG_THROTTLE_SECS: u64 = 1;

    pub const DEFAULT_CONFIG_PATH: &str = "/etc/hotplug-governor/config.toml";
    pub const DEFAULT_POWER_POLL_MS: u64 = 500;
    pub const DEFAULT_STATUS_INTERVAL_MS: u64 = 1000;
}
