use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use hotplug_governor::load_monitor::{CounterSampler, LoadSampler, UtilizationSampler};
use hotplug_governor::platform::{Platform, SimPlatform, SysfsPlatform};
use hotplug_governor::runqueue::RunqueueAverage;

/// Print the per-core readings the governor would see, without touching
/// core power states.
#[derive(Parser)]
#[command(name = "core-load-probe")]
struct Cli {
    /// Time between samples.
    #[arg(long, default_value_t = 1000, value_name = "MS")]
    interval_ms: u64,

    /// Stop after this many samples.
    #[arg(long)]
    count: Option<u64>,

    /// Use the platform's utilization figure instead of counter deltas.
    #[arg(long)]
    direct: bool,

    /// Probe a simulated device with this many cores, all online.
    #[arg(long, value_name = "CORES")]
    simulate: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let interval = Duration::from_millis(cli.interval_ms.max(1));

    let sim = cli.simulate.map(|cores| {
        let sim = Arc::new(SimPlatform::new(cores.max(1), cores.max(1)));
        sim.set_all_loads(50);
        sim.set_all_freqs(1_000_000);
        sim.set_runnable(2);
        sim
    });
    let platform: Arc<dyn Platform> = match &sim {
        Some(sim) => Arc::clone(sim) as Arc<dyn Platform>,
        None => Arc::new(SysfsPlatform::new().context("reading cpu topology from sysfs")?),
    };
    let sampler: Box<dyn LoadSampler> = if cli.direct {
        Box::new(UtilizationSampler)
    } else {
        Box::new(CounterSampler::new())
    };
    let runqueue = RunqueueAverage::new();

    let cores = platform.possible_cores();
    for core in 0..cores {
        sampler.seed(platform.as_ref(), core);
    }
    runqueue.sample(platform.now(), platform.runnable_tasks().unwrap_or(0));

    let mut taken = 0;
    while cli.count.is_none_or(|n| taken < n) {
        thread::sleep(interval);
        if let Some(sim) = &sim {
            sim.advance(interval);
        }
        taken += 1;

        let runnable = platform.runnable_tasks().context("reading runnable tasks")?;
        let rq = runqueue.sample(platform.now(), runnable);
        println!("sample {taken}: runnable {runnable}, rq avg {}.{:02}", rq / 100, rq % 100);
        println!("  {:<6} {:<7} {:>5} {:>10}", "core", "state", "load", "freq");

        for core in 0..cores {
            let online = platform.is_online(core).unwrap_or(false);
            if !online {
                println!("  cpu{core:<3} {:<7} {:>5} {:>10}", "offline", "-", "-");
                continue;
            }
            let load = match sampler.load(platform.as_ref(), core) {
                Ok(pct) => format!("{pct}%"),
                Err(_) => "n/a".to_owned(),
            };
            let freq = platform
                .current_freq(core)
                .map(|khz| format!("{} MHz", khz / 1000))
                .unwrap_or_else(|_| "n/a".to_owned());
            println!("  cpu{core:<3} {:<7} {load:>5} {freq:>10}", "online");
        }
    }
    Ok(())
}
