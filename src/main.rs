use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hotplug_governor::config::{self, LoadedConfig};
use hotplug_governor::log_throttle::LogThrottle;
use hotplug_governor::platform::{Platform, SimPlatform, SysfsPlatform};
use hotplug_governor::power::{BlankFileSource, PowerStateSource};
use hotplug_governor::status::StatusWriter;
use hotplug_governor::{Engine, GovernorError};

// seconds - length of each busy/idle phase in simulation mode
const SIM_PHASE_SECS: u64 = 5;

#[derive(Parser)]
#[command(name = "hotplug-governor", about = "Adaptive CPU core hotplug daemon")]
struct Cli {
    /// Config file (TOML).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override an attribute after the config file, e.g. `cpu1.up_rate=3`.
    #[arg(long = "set", value_name = "NAME=VALUE", value_parser = parse_assignment)]
    set: Vec<(String, String)>,

    /// Drive a simulated device with this many cores instead of sysfs.
    #[arg(long, value_name = "CORES")]
    simulate: Option<usize>,

    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Print every attribute with its value and exit.
    #[arg(long)]
    list: bool,
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(name, value)| (name.trim().to_owned(), value.trim().to_owned()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected NAME=VALUE, got `{s}`"))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,hotplug_governor=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let loaded = load_config(cli.config.as_ref())?;

    let sim = cli.simulate.map(|cores| Arc::new(SimPlatform::new(cores.max(1), 1)));
    let platform: Arc<dyn Platform> = match &sim {
        Some(sim) => Arc::clone(sim) as Arc<dyn Platform>,
        None => Arc::new(SysfsPlatform::new().context("reading cpu topology from sysfs")?),
    };
    let engine = Arc::new(Engine::new(platform));

    // `enabled` goes last so every other knob is in place before the
    // first round.
    let (enabled, mut attributes): (Vec<_>, Vec<_>) = loaded
        .attributes
        .iter()
        .cloned()
        .chain(cli.set.iter().cloned())
        .partition(|(name, _)| name == "enabled");

    if cli.list {
        engine.apply_attributes(&attributes);
        for (name, value) in engine.attributes() {
            println!("{name} = {value}");
        }
        return Ok(());
    }

    attributes.extend(enabled.into_iter().last());
    let rejected = engine.apply_attributes(&attributes);
    if rejected > 0 {
        warn!(rejected, "some settings were rejected");
    }
    if !engine.is_enabled() {
        info!("engine disabled by configuration, cores left as they are");
    }

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("installing signal handler")?;

    // Dropping `stop_tx` stops every auxiliary thread.
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
    let mut threads = vec![spawn_watcher(Arc::clone(&engine), stop_rx.clone())?];
    if let Some(path) = &loaded.power.blank_file {
        let source = BlankFileSource::new(path, loaded.power.poll_interval);
        threads.push(spawn_power(source, Arc::clone(&engine), stop_rx.clone())?);
    }
    if let Some(sim) = sim {
        info!(cores = sim.possible_cores(), "running against a simulated device");
        threads.push(spawn_simulation(sim, Arc::clone(&engine), stop_rx.clone())?);
    }
    drop(stop_rx);

    run_status(&engine, &loaded, &shutdown_rx);

    info!("shutting down");
    drop(stop_tx);
    for handle in threads {
        if handle.join().is_err() {
            warn!("auxiliary thread panicked");
        }
    }
    engine.disable();
    Ok(())
}

fn load_config(explicit: Option<&PathBuf>) -> anyhow::Result<LoadedConfig> {
    if let Some(path) = explicit {
        return config::load(path).with_context(|| format!("loading {}", path.display()));
    }
    let path = config::default_path();
    match config::load(&path) {
        Ok(loaded) => {
            info!(path = %path.display(), "config loaded");
            Ok(loaded)
        }
        Err(GovernorError::Io(e)) if e.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "no config file, using defaults");
            Ok(config::parse("")?)
        }
        Err(e) => Err(e).with_context(|| format!("loading {}", path.display())),
    }
}

/// Write the status file until shutdown; without one, just wait.
fn run_status(engine: &Engine, loaded: &LoadedConfig, shutdown: &Receiver<()>) {
    if loaded.status.interval.is_zero() {
        let _ = shutdown.recv();
        return;
    }
    let writer = StatusWriter::new(loaded.status.file.clone());
    info!(path = %writer.path().display(), "writing status snapshots");
    let mut throttle = LogThrottle::new(60);
    loop {
        if let Err(e) = writer.write(&engine.snapshot()) {
            if throttle.should_log() {
                warn!(error = %e, "failed to write status file");
            }
        }
        match shutdown.recv_timeout(loaded.status.interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Poll the platform's online mask and feed differences to the engine.
fn spawn_watcher(engine: Arc<Engine>, stop: Receiver<()>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("hotplug-watch".into())
        .spawn(move || {
            let mut throttle = LogThrottle::new(60);
            while let Err(RecvTimeoutError::Timeout) = stop.recv_timeout(engine.sampling_interval()) {
                if let Err(e) = engine.reconcile() {
                    if throttle.should_log() {
                        warn!(error = %e, "online mask unavailable");
                    }
                }
            }
        })
}

fn spawn_power(mut source: BlankFileSource, engine: Arc<Engine>, stop: Receiver<()>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("hotplug-power".into())
        .spawn(move || source.run(&stop, &mut |event| engine.power_event(event)))
}

/// Alternate the simulated device between busy and idle phases.
fn spawn_simulation(sim: Arc<SimPlatform>, engine: Arc<Engine>, stop: Receiver<()>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("hotplug-sim".into())
        .spawn(move || {
            let mut elapsed = Duration::ZERO;
            let mut was_busy = None;
            loop {
                let step = engine.sampling_interval();
                let busy = (elapsed.as_secs() / SIM_PHASE_SECS) % 2 == 0;
                if was_busy != Some(busy) {
                    info!(busy, online = sim.online_count(), "simulated load phase");
                    if busy {
                        sim.set_all_loads(90);
                        sim.set_all_freqs(2_000_000);
                        sim.set_runnable(4);
                    } else {
                        sim.set_all_loads(5);
                        sim.set_all_freqs(300_000);
                        sim.set_runnable(0);
                    }
                    was_busy = Some(busy);
                }
                sim.advance(step);
                elapsed += step;
                if !matches!(stop.recv_timeout(step), Err(RecvTimeoutError::Timeout)) {
                    break;
                }
            }
        })
}
