//! Named, typed and validated runtime attributes.
//!
//! Every external write goes through [`write`], whether it comes from the
//! config file, the command line or a running daemon. A rejected write
//! leaves the settings untouched.

use std::fmt;

use crate::config::Settings;
use crate::constants::MIN_SAMPLING_INTERVAL_MS;
use crate::error::{GovernorError, Result};
use crate::governor::DownPolicy;
use crate::platform::CoreId;
use crate::thresholds::ThresholdField;

/// Result of an accepted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    /// The value matched the current one; nothing was re-applied.
    Unchanged,
}

impl Applied {
    fn from_change(changed: bool) -> Self {
        if changed { Applied::Changed } else { Applied::Unchanged }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    SamplingInterval,
    Enabled,
    MaxCores,
    MaxCoresSuspended,
    DownPolicy,
    Threshold { core: CoreId, field: ThresholdField },
}

impl Attribute {
    /// Resolve an attribute name for a device with `cores` cores.
    pub fn parse(name: &str, cores: usize) -> Result<Self> {
        let unknown = || GovernorError::UnknownAttribute(name.to_owned());
        match name.trim() {
            "sampling_interval_ms" => Ok(Attribute::SamplingInterval),
            "enabled" => Ok(Attribute::Enabled),
            "max_cores" => Ok(Attribute::MaxCores),
            "max_cores_suspended" => Ok(Attribute::MaxCoresSuspended),
            "down_policy" => Ok(Attribute::DownPolicy),
            other => {
                let (cpu, key) = other.split_once('.').ok_or_else(unknown)?;
                let core: CoreId = cpu
                    .strip_prefix("cpu")
                    .and_then(|n| n.parse().ok())
                    .filter(|&n| n < cores)
                    .ok_or_else(unknown)?;
                let field = ThresholdField::from_key(key).ok_or_else(unknown)?;
                Ok(Attribute::Threshold { core, field })
            }
        }
    }

    /// Every attribute, in listing order.
    pub fn all(cores: usize) -> Vec<Attribute> {
        let mut attrs = vec![
            Attribute::SamplingInterval,
            Attribute::Enabled,
            Attribute::MaxCores,
            Attribute::MaxCoresSuspended,
            Attribute::DownPolicy,
        ];
        for core in 0..cores {
            attrs.extend(
                ThresholdField::ALL
                    .into_iter()
                    .map(|field| Attribute::Threshold { core, field }),
            );
        }
        attrs
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::SamplingInterval => f.write_str("sampling_interval_ms"),
            Attribute::Enabled => f.write_str("enabled"),
            Attribute::MaxCores => f.write_str("max_cores"),
            Attribute::MaxCoresSuspended => f.write_str("max_cores_suspended"),
            Attribute::DownPolicy => f.write_str("down_policy"),
            Attribute::Threshold { core, field } => write!(f, "cpu{core}.{}", field.key()),
        }
    }
}

fn parse_unsigned(attr: &Attribute, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| GovernorError::invalid(attr.to_string(), format!("`{}` is not an unsigned integer", value.trim())))
}

/// Parse an `enabled` value: a positive integer or `true` enables.
pub fn parse_enabled(value: &str) -> Result<bool> {
    let value = value.trim();
    if let Ok(n) = value.parse::<i64>() {
        return Ok(n > 0);
    }
    match value {
        "true" | "on" => Ok(true),
        "false" | "off" => Ok(false),
        other => Err(GovernorError::invalid(
            "enabled",
            format!("`{other}` is neither a number nor true/false"),
        )),
    }
}

pub fn read(settings: &Settings, attr: &Attribute) -> String {
    let config = &settings.config;
    match attr {
        Attribute::SamplingInterval => config.sampling_interval_ms.to_string(),
        Attribute::Enabled => u8::from(config.enabled).to_string(),
        Attribute::MaxCores => config.max_cores.to_string(),
        Attribute::MaxCoresSuspended => config.max_cores_suspended.to_string(),
        Attribute::DownPolicy => config.down_policy.to_string(),
        Attribute::Threshold { core, field } => settings
            .thresholds
            .row(*core)
            .map(|row| field.get(row).to_string())
            .unwrap_or_default(),
    }
}

/// Validate and store `value`. `Enabled` only records the flag; starting
/// and stopping the engine is the caller's job.
pub fn write(settings: &mut Settings, attr: &Attribute, value: &str) -> Result<Applied> {
    let cores = settings.thresholds.len().max(1);
    let config = &mut settings.config;
    let changed = match attr {
        Attribute::SamplingInterval => {
            let ms = parse_unsigned(attr, value)?.max(MIN_SAMPLING_INTERVAL_MS);
            std::mem::replace(&mut config.sampling_interval_ms, ms) != ms
        }
        Attribute::Enabled => {
            let on = parse_enabled(value)?;
            std::mem::replace(&mut config.enabled, on) != on
        }
        Attribute::MaxCores => {
            let cap = clamp_cap(parse_unsigned(attr, value)?, cores);
            std::mem::replace(&mut config.max_cores, cap) != cap
        }
        Attribute::MaxCoresSuspended => {
            let cap = clamp_cap(parse_unsigned(attr, value)?, cores);
            std::mem::replace(&mut config.max_cores_suspended, cap) != cap
        }
        Attribute::DownPolicy => {
            let policy: DownPolicy = value.parse()?;
            std::mem::replace(&mut config.down_policy, policy) != policy
        }
        Attribute::Threshold { core, field } => {
            let raw = parse_unsigned(attr, value)?;
            let checked = field
                .validate(raw)
                .map_err(|reason| GovernorError::invalid(attr.to_string(), reason))?;
            let row = settings
                .thresholds
                .row_mut(*core)
                .ok_or_else(|| GovernorError::UnknownAttribute(attr.to_string()))?;
            let before = field.get(row);
            field.set(row, checked);
            before != checked
        }
    };
    Ok(Applied::from_change(changed))
}

fn clamp_cap(requested: u64, cores: usize) -> usize {
    usize::try_from(requested).unwrap_or(usize::MAX).clamp(1, cores)
}
