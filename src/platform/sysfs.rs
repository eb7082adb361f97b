use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::{CoreId, CpuTimes, FreqLimits, Platform};
use crate::load_monitor::load_from_deltas;

const CPU_ROOT: &str = "/sys/devices/system/cpu";
const PROC_ROOT: &str = "/proc";

/// Linux backend: core power through `cpuN/online`, counters from
/// `/proc/stat`, clocks from cpufreq.
pub struct SysfsPlatform {
    cpu_root: PathBuf,
    proc_root: PathBuf,
    possible: usize,
    epoch: Instant,
    // Previous /proc/stat snapshot per core, backing `utilization`.
    util_snapshots: Mutex<Vec<Option<CpuTimes>>>,
}

impl SysfsPlatform {
    pub fn new() -> io::Result<Self> {
        Self::with_roots(CPU_ROOT, PROC_ROOT)
    }

    /// Build against alternate sysfs/procfs roots (used by tests).
    pub fn with_roots(cpu_root: impl Into<PathBuf>, proc_root: impl Into<PathBuf>) -> io::Result<Self> {
        let cpu_root = cpu_root.into();
        let possible = fs::read_to_string(cpu_root.join("possible"))?;
        let possible = parse_cpu_list(&possible)
            .and_then(|cores| cores.into_iter().max())
            .map(|max| max + 1)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "empty or malformed possible cpu list"))?;

        Ok(Self {
            cpu_root,
            proc_root: proc_root.into(),
            possible,
            epoch: Instant::now(),
            util_snapshots: Mutex::new(vec![None; possible]),
        })
    }

    fn core_path(&self, core: CoreId, file: &str) -> PathBuf {
        self.cpu_root.join(format!("cpu{core}")).join(file)
    }

    fn write_online(&self, core: CoreId, value: &str) -> io::Result<()> {
        fs::write(self.core_path(core, "online"), value)
    }

    fn read_proc_stat(&self) -> io::Result<String> {
        fs::read_to_string(self.proc_root.join("stat"))
    }
}

impl Platform for SysfsPlatform {
    fn possible_cores(&self) -> usize {
        self.possible
    }

    fn is_online(&self, core: CoreId) -> io::Result<bool> {
        match fs::read_to_string(self.core_path(core, "online")) {
            Ok(s) => Ok(s.trim() == "1"),
            // The boot core usually has no `online` control file.
            Err(e) if e.kind() == ErrorKind::NotFound && core == 0 => Ok(true),
            Err(e) => Err(e),
        }
    }

    fn online_mask(&self) -> io::Result<Vec<bool>> {
        let online = fs::read_to_string(self.cpu_root.join("online"))?;
        let cores = parse_cpu_list(&online)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "malformed online cpu list"))?;
        let mut mask = vec![false; self.possible];
        for core in cores.into_iter().filter(|&c| c < self.possible) {
            mask[core] = true;
        }
        Ok(mask)
    }

    fn request_online(&self, core: CoreId) -> io::Result<()> {
        self.write_online(core, "1")
    }

    fn request_offline(&self, core: CoreId) -> io::Result<()> {
        self.write_online(core, "0")
    }

    fn cpu_times(&self, core: CoreId) -> io::Result<CpuTimes> {
        let stat = self.read_proc_stat()?;
        parse_cpu_times(&stat, core).ok_or_else(|| {
            io::Error::new(ErrorKind::NotFound, format!("cpu{core} missing from /proc/stat"))
        })
    }

    fn utilization(&self, core: CoreId) -> io::Result<u32> {
        let current = self.cpu_times(core)?;
        let mut snapshots = self
            .util_snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = snapshots
            .get_mut(core)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("no cpu{core}")))?;
        let previous = slot.replace(current).unwrap_or_default();
        let wall = current.wall.saturating_sub(previous.wall);
        let idle = current.idle.saturating_sub(previous.idle);
        load_from_deltas(wall, idle)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "idle time ran ahead of wall time"))
    }

    fn current_freq(&self, core: CoreId) -> io::Result<u32> {
        read_u32(&self.core_path(core, "cpufreq/scaling_cur_freq"))
    }

    fn freq_limits(&self, core: CoreId) -> io::Result<FreqLimits> {
        Ok(FreqLimits {
            min_khz: read_u32(&self.core_path(core, "cpufreq/cpuinfo_min_freq"))?,
            max_khz: read_u32(&self.core_path(core, "cpufreq/cpuinfo_max_freq"))?,
        })
    }

    fn runnable_tasks(&self) -> io::Result<u64> {
        let stat = self.read_proc_stat()?;
        stat.lines()
            .find_map(|line| line.strip_prefix("procs_running"))
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "procs_running missing from /proc/stat"))
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

fn read_u32(path: &Path) -> io::Result<u32> {
    fs::read_to_string(path)?
        .trim()
        .parse()
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, format!("{}: {e}", path.display())))
}

/// Parse a kernel cpu list such as `0-3,6,8-9`.
pub fn parse_cpu_list(list: &str) -> Option<Vec<CoreId>> {
    let list = list.trim();
    if list.is_empty() {
        return Some(Vec::new());
    }
    let mut cores = Vec::new();
    for part in list.split(',') {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: CoreId = lo.trim().parse().ok()?;
                let hi: CoreId = hi.trim().parse().ok()?;
                if hi < lo {
                    return None;
                }
                cores.extend(lo..=hi);
            }
            None => cores.push(part.trim().parse().ok()?),
        }
    }
    Some(cores)
}

/// Extract one core's (wall, idle) ticks from `/proc/stat` text.
///
/// Wall is the sum of user through steal; idle is idle + iowait. Guest time
/// is already folded into user by the kernel.
pub fn parse_cpu_times(stat: &str, core: CoreId) -> Option<CpuTimes> {
    let label = format!("cpu{core}");
    let line = stat
        .lines()
        .find(|line| line.split_whitespace().next() == Some(label.as_str()))?;
    let nums: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|s| s.parse().ok())
        .collect();
    if nums.len() < 5 {
        return None;
    }
    let wall = nums.iter().take(8).sum();
    let idle = nums[3] + nums[4];
    Some(CpuTimes { wall, idle })
}
