use serde::Serialize;

use crate::platform::CoreId;

/// Per-core policy bounds. Frequencies in kHz, runqueue in tasks × 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThresholdRow {
    pub up_load: u32,
    pub down_load: u32,
    pub up_freq: u32,
    pub down_freq: u32,
    pub up_runqueue: u64,
    pub down_runqueue: u64,
    pub up_rate: u32,
    pub down_rate: u32,
}

const DEFAULT_ROWS: [ThresholdRow; 4] = [
    ThresholdRow {
        up_load: 65,
        down_load: 0,
        up_freq: 1_242_000,
        down_freq: 0,
        up_runqueue: 100,
        down_runqueue: 0,
        up_rate: 1,
        down_rate: 1,
    },
    ThresholdRow {
        up_load: 65,
        down_load: 30,
        up_freq: 1_566_000,
        down_freq: 810_000,
        up_runqueue: 200,
        down_runqueue: 100,
        up_rate: 2,
        down_rate: 3,
    },
    ThresholdRow {
        up_load: 65,
        down_load: 30,
        up_freq: 1_674_000,
        down_freq: 918_000,
        up_runqueue: 300,
        down_runqueue: 200,
        up_rate: 2,
        down_rate: 3,
    },
    ThresholdRow {
        up_load: 0,
        down_load: 30,
        up_freq: 0,
        down_freq: 1_026_000,
        up_runqueue: 0,
        down_runqueue: 300,
        up_rate: 1,
        down_rate: 4,
    },
];

/// Ordered threshold table, one row per possible core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyThresholds {
    rows: Vec<ThresholdRow>,
}

impl PolicyThresholds {
    /// Built-in table for `cores` cores. Beyond four cores the middle rows
    /// repeat row 2 and the highest core takes row 3.
    pub fn defaults(cores: usize) -> Self {
        let cores = cores.max(1);
        let rows = (0..cores)
            .map(|core| {
                if core < 3 {
                    DEFAULT_ROWS[core]
                } else if core == cores - 1 {
                    DEFAULT_ROWS[3]
                } else {
                    DEFAULT_ROWS[2]
                }
            })
            .collect();
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, core: CoreId) -> Option<&ThresholdRow> {
        self.rows.get(core)
    }

    pub fn row_mut(&mut self, core: CoreId) -> Option<&mut ThresholdRow> {
        self.rows.get_mut(core)
    }
}

/// A single column of [`ThresholdRow`], addressable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdField {
    UpLoad,
    DownLoad,
    UpFreq,
    DownFreq,
    UpRunqueue,
    DownRunqueue,
    UpRate,
    DownRate,
}

impl ThresholdField {
    pub const ALL: [ThresholdField; 8] = [
        ThresholdField::UpLoad,
        ThresholdField::DownLoad,
        ThresholdField::UpFreq,
        ThresholdField::DownFreq,
        ThresholdField::UpRunqueue,
        ThresholdField::DownRunqueue,
        ThresholdField::UpRate,
        ThresholdField::DownRate,
    ];

    /// Attribute-style name, e.g. `up_load`.
    pub fn key(self) -> &'static str {
        match self {
            ThresholdField::UpLoad => "up_load",
            ThresholdField::DownLoad => "down_load",
            ThresholdField::UpFreq => "up_freq",
            ThresholdField::DownFreq => "down_freq",
            ThresholdField::UpRunqueue => "up_runqueue",
            ThresholdField::DownRunqueue => "down_runqueue",
            ThresholdField::UpRate => "up_rate",
            ThresholdField::DownRate => "down_rate",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.key() == key)
    }

    pub fn get(self, row: &ThresholdRow) -> u64 {
        match self {
            ThresholdField::UpLoad => row.up_load.into(),
            ThresholdField::DownLoad => row.down_load.into(),
            ThresholdField::UpFreq => row.up_freq.into(),
            ThresholdField::DownFreq => row.down_freq.into(),
            ThresholdField::UpRunqueue => row.up_runqueue,
            ThresholdField::DownRunqueue => row.down_runqueue,
            ThresholdField::UpRate => row.up_rate.into(),
            ThresholdField::DownRate => row.down_rate.into(),
        }
    }

    /// Range check for a raw value, returning the reason on rejection.
    pub fn validate(self, value: u64) -> Result<u64, &'static str> {
        match self {
            ThresholdField::UpLoad | ThresholdField::DownLoad if value > 100 => {
                Err("must be between 0 and 100")
            }
            ThresholdField::UpRate | ThresholdField::DownRate if value == 0 => {
                Err("must be at least 1")
            }
            ThresholdField::UpRunqueue | ThresholdField::DownRunqueue => Ok(value),
            _ if value > u64::from(u32::MAX) => Err("out of range"),
            _ => Ok(value),
        }
    }

    /// Store an already validated value.
    pub fn set(self, row: &mut ThresholdRow, value: u64) {
        let narrow = u32::try_from(value).unwrap_or(u32::MAX);
        match self {
            ThresholdField::UpLoad => row.up_load = narrow,
            ThresholdField::DownLoad => row.down_load = narrow,
            ThresholdField::UpFreq => row.up_freq = narrow,
            ThresholdField::DownFreq => row.down_freq = narrow,
            ThresholdField::UpRunqueue => row.up_runqueue = value,
            ThresholdField::DownRunqueue => row.down_runqueue = value,
            ThresholdField::UpRate => row.up_rate = narrow,
            ThresholdField::DownRate => row.down_rate = narrow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_core_defaults() {
        let t = PolicyThresholds::defaults(4);
        assert_eq!(t.len(), 4);
        let row1 = t.row(1).unwrap();
        assert_eq!((row1.down_load, row1.up_load), (30, 65));
        assert_eq!((row1.down_freq, row1.up_freq), (810_000, 1_566_000));
        assert_eq!((row1.up_rate, row1.down_rate), (2, 3));
        assert_eq!(t.row(3).unwrap().down_rate, 4);
        assert!(t.row(4).is_none());
    }

    #[test]
    fn larger_devices_reuse_rows() {
        let t = PolicyThresholds::defaults(8);
        assert_eq!(t.row(5), t.row(2));
        assert_eq!(t.row(7), Some(&DEFAULT_ROWS[3]));
    }

    #[test]
    fn field_validation() {
        assert!(ThresholdField::UpLoad.validate(101).is_err());
        assert_eq!(ThresholdField::DownLoad.validate(100), Ok(100));
        assert!(ThresholdField::UpRate.validate(0).is_err());
        assert!(ThresholdField::UpFreq.validate(u64::MAX).is_err());
        assert_eq!(ThresholdField::UpRunqueue.validate(u64::MAX), Ok(u64::MAX));
    }

    #[test]
    fn get_set_by_field() {
        let mut row = DEFAULT_ROWS[1];
        ThresholdField::UpRate.set(&mut row, 5);
        assert_eq!(ThresholdField::UpRate.get(&row), 5);
        assert_eq!(ThresholdField::from_key("down_runqueue"), Some(ThresholdField::DownRunqueue));
        assert_eq!(ThresholdField::from_key("sideways"), None);
    }
}
