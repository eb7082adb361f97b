use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;
use crate::governor::DownPolicy;
use crate::platform::{CoreId, Direction};

/// One row of the status file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoreSnapshot {
    pub core: CoreId,
    pub online: bool,
    pub pending: Option<Direction>,
    pub up_rate_counter: u32,
    pub down_rate_counter: u32,
    pub cascade_up_cpu: Option<CoreId>,
    pub cascade_up_by: Option<CoreId>,
    pub force_up: bool,
    pub scheduled: bool,
}

/// Point-in-time view of the engine, as written to the status file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineSnapshot {
    pub enabled: bool,
    pub suspended: bool,
    pub cap: usize,
    pub sampling_interval_ms: u64,
    pub down_policy: DownPolicy,
    pub freq_checks: bool,
    pub online: usize,
    pub cores: Vec<CoreSnapshot>,
}

impl EngineSnapshot {
    pub fn online_cores(&self) -> Vec<CoreId> {
        self.cores.iter().filter(|c| c.online).map(|c| c.core).collect()
    }
}

/// Writes snapshots as pretty JSON, replacing the file atomically.
pub struct StatusWriter {
    path: PathBuf,
}

impl StatusWriter {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path: path.unwrap_or_else(default_path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, snapshot: &EngineSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut temp_path = self.path.clone().into_os_string();
        temp_path.push(".tmp");
        let json = serde_json::to_string_pretty(snapshot)?;

        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

/// `$XDG_RUNTIME_DIR/hotplug-governor/status.json`, or under `/run`.
pub fn default_path() -> PathBuf {
    let mut path = dirs::runtime_dir().unwrap_or_else(|| PathBuf::from("/run"));
    path.push("hotplug-governor");
    path.push("status.json");
    path
}
