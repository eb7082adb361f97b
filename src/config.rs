use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use toml::{Table, Value};
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_CONFIG_PATH, DEFAULT_MAX_CORES_SUSPENDED, DEFAULT_POWER_POLL_MS,
    DEFAULT_SAMPLING_INTERVAL_MS, DEFAULT_STATUS_INTERVAL_MS,
};
use crate::error::Result;
use crate::governor::DownPolicy;
use crate::thresholds::{PolicyThresholds, ThresholdField};

/// Process-wide knobs read by every round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GovernorConfig {
    pub sampling_interval_ms: u64,
    pub enabled: bool,
    pub max_cores: usize,
    pub max_cores_suspended: usize,
    pub down_policy: DownPolicy,
}

impl GovernorConfig {
    pub fn defaults(cores: usize) -> Self {
        let cores = cores.max(1);
        Self {
            sampling_interval_ms: DEFAULT_SAMPLING_INTERVAL_MS,
            enabled: false,
            max_cores: cores,
            max_cores_suspended: DEFAULT_MAX_CORES_SUSPENDED.min(cores),
            down_policy: DownPolicy::default(),
        }
    }

    /// The cap in force for the given suspend state.
    pub fn active_cap(&self, suspended: bool) -> usize {
        if suspended {
            self.max_cores_suspended
        } else {
            self.max_cores
        }
    }
}

/// Everything the tunables registry can change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub config: GovernorConfig,
    pub thresholds: PolicyThresholds,
}

impl Settings {
    pub fn defaults(cores: usize) -> Self {
        Self {
            config: GovernorConfig::defaults(cores),
            thresholds: PolicyThresholds::defaults(cores),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerOptions {
    /// Display blank-state file; `None` leaves suspend/resume unwired.
    pub blank_file: Option<PathBuf>,
    pub poll_interval: Duration,
}

impl Default for PowerOptions {
    fn default() -> Self {
        Self {
            blank_file: None,
            poll_interval: Duration::from_millis(DEFAULT_POWER_POLL_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusOptions {
    pub file: Option<PathBuf>,
    /// Zero disables the status file.
    pub interval: Duration,
}

impl Default for StatusOptions {
    fn default() -> Self {
        Self {
            file: None,
            interval: Duration::from_millis(DEFAULT_STATUS_INTERVAL_MS),
        }
    }
}

/// A parsed config file.
///
/// Engine knobs are kept as `(attribute, value)` pairs and applied through
/// the tunables registry; `enabled` always comes last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedConfig {
    pub attributes: Vec<(String, String)>,
    pub power: PowerOptions,
    pub status: StatusOptions,
}

impl LoadedConfig {
    pub fn enabled(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name == "enabled")
            .map(|(_, v)| v.as_str())
    }
}

/// `/etc/hotplug-governor/config.toml` if present, else the user config dir.
pub fn default_path() -> PathBuf {
    let system = PathBuf::from(DEFAULT_CONFIG_PATH);
    if system.exists() {
        return system;
    }
    dirs::config_dir()
        .map(|dir| dir.join("hotplug-governor").join("config.toml"))
        .filter(|p| p.exists())
        .unwrap_or(system)
}

pub fn load(path: &Path) -> Result<LoadedConfig> {
    let text = std::fs::read_to_string(path)?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<LoadedConfig> {
    let config = text.parse::<Table>()?;
    let mut loaded = LoadedConfig::default();
    let attrs = &mut loaded.attributes;

    warn_unknown("", &config, &["enabled", "timing", "cores", "policy", "thresholds", "power", "status"]);

    let timing = section(&config, "timing");
    if let Some(t) = timing {
        warn_unknown("timing.", t, &["sampling-interval"]);
    }
    // ms
    if let Some(v) = unsigned(timing, "timing.sampling-interval") {
        attrs.push(("sampling_interval_ms".into(), v.to_string()));
    }

    let cores = section(&config, "cores");
    if let Some(t) = cores {
        warn_unknown("cores.", t, &["max", "max-suspended"]);
    }
    if let Some(v) = unsigned(cores, "cores.max") {
        attrs.push(("max_cores".into(), v.to_string()));
    }
    if let Some(v) = unsigned(cores, "cores.max-suspended") {
        attrs.push(("max_cores_suspended".into(), v.to_string()));
    }

    let policy = section(&config, "policy");
    if let Some(t) = policy {
        warn_unknown("policy.", t, &["down"]);
    }
    let down = policy
        .and_then(|t| t.get("down"))
        .map(|v| v.as_str().ok_or("must be a string"))
        .transpose()
        .unwrap_or_else(|s| {
            warn!("policy.down {s}, replaced with the default of {}", DownPolicy::default());
            None
        });
    if let Some(down) = down {
        attrs.push(("down_policy".into(), down.to_owned()));
    }

    if let Some(thresholds) = section(&config, "thresholds") {
        for (cpu, row) in thresholds {
            let Some(row) = row.as_table() else {
                warn!("thresholds.{cpu} must be a table, ignored");
                continue;
            };
            for (key, value) in row {
                let path = format!("thresholds.{cpu}.{key}");
                let Some(field) = ThresholdField::from_key(&key.replace('-', "_")) else {
                    warn!("{path} is not a known threshold, ignored");
                    continue;
                };
                match integer(value) {
                    Ok(v) => attrs.push((format!("{cpu}.{}", field.key()), v.to_string())),
                    Err(s) => warn!("{path} {s}, replaced with the default"),
                }
            }
        }
    }

    let power = section(&config, "power");
    if let Some(t) = power {
        warn_unknown("power.", t, &["blank-file", "poll-interval"]);
    }
    loaded.power.blank_file = path_key(power, "power.blank-file");
    // ms
    if let Some(v) = unsigned(power, "power.poll-interval") {
        if v == 0 {
            warn!("power.poll-interval must be positive, replaced with the default of {DEFAULT_POWER_POLL_MS} ms");
        } else {
            loaded.power.poll_interval = Duration::from_millis(v);
        }
    }

    let status = section(&config, "status");
    if let Some(t) = status {
        warn_unknown("status.", t, &["file", "interval"]);
    }
    loaded.status.file = path_key(status, "status.file");
    // ms, 0 = disabled
    if let Some(v) = unsigned(status, "status.interval") {
        loaded.status.interval = Duration::from_millis(v);
    }

    let enabled = config
        .get("enabled")
        .map(|v| v.as_bool().ok_or("must be a boolean"))
        .transpose()
        .unwrap_or_else(|s| {
            warn!("enabled {s}, replaced with the default of true");
            None
        })
        .unwrap_or(true);
    loaded
        .attributes
        .push(("enabled".into(), u8::from(enabled).to_string()));

    debug!(attributes = loaded.attributes.len(), "config parsed");
    Ok(loaded)
}

fn section<'a>(config: &'a Table, name: &str) -> Option<&'a Table> {
    let value = config.get(name)?;
    let table = value.as_table();
    if table.is_none() {
        warn!("{name} must be a table, ignored");
    }
    table
}

fn warn_unknown(prefix: &str, table: &Table, known: &[&str]) {
    for key in table.keys().filter(|k| !known.contains(&k.as_str())) {
        warn!("{prefix}{key} is not a known setting, ignored");
    }
}

fn integer(value: &Value) -> std::result::Result<u64, &'static str> {
    value
        .as_integer()
        .ok_or("must be an integer")
        .and_then(|v| u64::try_from(v).map_err(|_| "must not be negative"))
}

/// Read `section.key` as an unsigned integer. Missing keys keep the
/// default silently; invalid ones warn.
fn unsigned(table: Option<&Table>, path: &str) -> Option<u64> {
    let key = path.rsplit('.').next()?;
    let value = table?.get(key)?;
    integer(value)
        .map_err(|s| warn!("{path} {s}, replaced with the default"))
        .ok()
}

fn path_key(table: Option<&Table>, path: &str) -> Option<PathBuf> {
    let key = path.rsplit('.').next()?;
    let value = table?.get(key)?;
    value
        .as_str()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            warn!("{path} must be a non-empty string, ignored");
            None
        })
}
