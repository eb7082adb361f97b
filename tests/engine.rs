// End-to-end engine behavior over the simulated platform. Rounds are driven
// by hand unless a test says otherwise.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hotplug_governor::coordinator::CoreEvent;
use hotplug_governor::governor::Decision;
use hotplug_governor::load_monitor::{CounterSampler, UtilizationSampler};
use hotplug_governor::platform::{CoreId, CpuTimes, Direction, Platform, SimPlatform};
use hotplug_governor::power::PowerEvent;
use hotplug_governor::status::EngineSnapshot;
use hotplug_governor::tunables::Applied;
use hotplug_governor::{Engine, GovernorError, Scheduling};

fn engine(cores: usize, online: usize) -> (Arc<SimPlatform>, Engine) {
    let sim = Arc::new(SimPlatform::new(cores, online));
    let engine = Engine::build(sim.clone(), Box::new(UtilizationSampler), Scheduling::Manual);
    (sim, engine)
}

const TICK: Duration = Duration::from_millis(60);

fn counter_engine(cores: usize, online: usize) -> (Arc<SimPlatform>, Engine) {
    let sim = Arc::new(SimPlatform::new(cores, online));
    let engine = Engine::build(sim.clone(), Box::new(CounterSampler::new()), Scheduling::Manual);
    (sim, engine)
}

fn busy(sim: &SimPlatform, runnable: u64) {
    sim.set_all_loads(100);
    sim.set_all_freqs(2_000_000);
    sim.set_runnable(runnable);
}

fn rate(engine: &Engine, core: CoreId, field: &str) -> u32 {
    engine
        .read_attr(&format!("cpu{core}.{field}"))
        .unwrap()
        .parse()
        .unwrap()
}

fn assert_consistent(engine: &Engine, snap: &EngineSnapshot) {
    for c in &snap.cores {
        if let Some(parent) = c.cascade_up_by {
            assert_eq!(snap.cores[parent].cascade_up_cpu, Some(c.core), "{snap:#?}");
        }
        if let Some(child) = c.cascade_up_cpu {
            assert_eq!(snap.cores[child].cascade_up_by, Some(c.core), "{snap:#?}");
        }
        assert_eq!(c.scheduled, c.online && snap.enabled, "{snap:#?}");
        assert!(c.up_rate_counter >= 1 && c.down_rate_counter >= 1);
        assert!(c.up_rate_counter <= rate(engine, c.core, "up_rate"), "{snap:#?}");
        assert!(c.down_rate_counter <= rate(engine, c.core, "down_rate"), "{snap:#?}");
        assert!(c.pending.is_none());
    }
}

fn online(snap: &EngineSnapshot) -> Vec<CoreId> {
    snap.online_cores()
}

// === decisions ===

#[test]
fn busy_core_one_brings_up_core_two_immediately() {
    let (sim, engine) = engine(4, 2);
    for (name, value) in [
        ("cpu1.up_load", "65"),
        ("cpu1.up_freq", "810000"),
        ("cpu1.up_runqueue", "100"),
        ("cpu1.up_rate", "1"),
    ] {
        engine.write_attr(name, value).unwrap();
    }
    engine.enable().unwrap();

    sim.set_load(1, 70);
    sim.set_freq(1, 1_000_000);
    sim.set_runnable(2);

    assert_eq!(engine.tick(1).unwrap(), Decision::BringUp(2));
    let snap = engine.snapshot();
    assert_eq!(online(&snap), vec![0, 1, 2]);
    assert_eq!(snap.cores[1].cascade_up_cpu, Some(2));
    assert_eq!(snap.cores[2].cascade_up_by, Some(1));
    assert_eq!(sim.requests(), vec![(Direction::Online, 2)]);
}

#[test]
fn up_rate_three_waits_for_the_third_qualifying_tick() {
    let (sim, engine) = engine(2, 1);
    engine.write_attr("cpu0.up_rate", "3").unwrap();
    engine.enable().unwrap();
    busy(&sim, 2);

    assert_eq!(engine.tick(0).unwrap(), Decision::NoChange);
    assert_eq!(engine.tick(0).unwrap(), Decision::NoChange);
    assert!(sim.requests().is_empty());
    assert_eq!(engine.tick(0).unwrap(), Decision::BringUp(1));
    assert_eq!(sim.requests(), vec![(Direction::Online, 1)]);
}

#[test]
fn cascade_links_stay_symmetric_through_up_and_down() {
    let (sim, engine) = engine(4, 1);
    engine.write_attr("cpu1.up_rate", "1").unwrap();
    engine.write_attr("cpu2.up_rate", "1").unwrap();
    engine.write_attr("cpu2.down_rate", "1").unwrap();
    engine.enable().unwrap();
    busy(&sim, 4);

    for _ in 0..3 {
        engine.tick_all();
        assert_consistent(&engine, &engine.snapshot());
    }
    let snap = engine.snapshot();
    assert_eq!(online(&snap), vec![0, 1, 2, 3]);
    assert_eq!(
        snap.cores.iter().map(|c| c.cascade_up_cpu).collect::<Vec<_>>(),
        vec![Some(1), Some(2), Some(3), None]
    );

    sim.set_load(2, 0);
    assert_eq!(engine.tick(2).unwrap(), Decision::TakeDown);
    let snap = engine.snapshot();
    assert_consistent(&engine, &snap);
    assert_eq!(online(&snap), vec![0, 1, 3]);
    assert_eq!(snap.cores[1].cascade_up_cpu, None);
    assert_eq!(snap.cores[3].cascade_up_by, None);
}

#[test]
fn primary_core_is_never_taken_down() {
    let (sim, engine) = engine(2, 1);
    engine.enable().unwrap();
    sim.set_all_loads(0);
    for _ in 0..10 {
        assert_eq!(engine.tick(0).unwrap(), Decision::NoChange);
    }
    assert!(sim.requests().is_empty());
}

// === suspend / resume ===

#[test]
fn suspend_drops_to_one_core_and_resume_restores_four() {
    let (sim, engine) = engine(4, 4);
    engine.enable().unwrap();
    sim.set_all_loads(50);
    sim.set_all_freqs(2_000_000);

    engine.power_event(PowerEvent::Suspend);
    assert_eq!(engine.snapshot().cap, 1);
    for core in 1..4 {
        assert_eq!(engine.tick(core).unwrap(), Decision::TakeDown);
    }
    assert_eq!(sim.online_count(), 1);
    assert_eq!(online(&engine.snapshot()), vec![0]);

    engine.power_event(PowerEvent::Resume);
    assert_eq!(engine.snapshot().cap, 4);
    for _ in 0..3 {
        engine.tick_all();
    }
    let snap = engine.snapshot();
    assert_eq!(online(&snap), vec![0, 1, 2, 3]);
    assert_eq!(sim.online_count(), 4);
    assert_consistent(&engine, &snap);

    // The last core inherited the flag; its next round consumes it.
    assert!(snap.cores[3].force_up);
    assert_eq!(engine.tick(3).unwrap(), Decision::NoChange);
    assert!(engine.snapshot().cores.iter().all(|c| !c.force_up));
}

#[test]
fn resume_without_suspend_forces_nothing() {
    let (sim, engine) = engine(2, 1);
    engine.enable().unwrap();
    engine.power_event(PowerEvent::Resume);
    assert_eq!(engine.tick(0).unwrap(), Decision::NoChange);
    assert!(sim.requests().is_empty());
}

// === cap invariant ===

struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 33) % bound
    }
}

#[test]
fn online_count_never_exceeds_the_active_cap() {
    const FREQS: [u32; 5] = [300_000, 900_000, 1_300_000, 1_700_000, 2_000_000];
    let (sim, engine) = engine(6, 1);
    engine.write_attr("max_cores", "4").unwrap();
    engine.write_attr("max_cores_suspended", "2").unwrap();
    engine.enable().unwrap();

    let mut rng = Lcg(0x5eed);
    for round in 0..400 {
        for core in 0..6 {
            sim.set_load(core, rng.next(101) as u32);
            sim.set_freq(core, FREQS[rng.next(FREQS.len() as u64) as usize]);
        }
        sim.set_runnable(rng.next(7));
        match rng.next(20) {
            0 => engine.power_event(PowerEvent::Suspend),
            1 => engine.power_event(PowerEvent::Resume),
            _ => {}
        }

        engine.tick_all();
        let snap = engine.snapshot();
        assert!(snap.online <= snap.cap, "round {round}: {snap:#?}");
        assert!(snap.cores[0].online, "round {round}");
        assert_eq!(snap.online, sim.online_count());
        assert_consistent(&engine, &snap);
    }
}

// === notifications ===

#[test]
fn unsolicited_offline_clears_links_and_schedule() {
    let (sim, engine) = engine(4, 1);
    engine.write_attr("cpu1.up_rate", "1").unwrap();
    engine.enable().unwrap();
    busy(&sim, 4);
    engine.tick_all();
    engine.tick_all();
    assert_eq!(online(&engine.snapshot()), vec![0, 1, 2]);

    sim.force_state(1, false);
    engine.notify(CoreEvent::Offline(1));
    engine.notify(CoreEvent::Offline(1));

    let snap = engine.snapshot();
    assert!(!snap.cores[1].online && !snap.cores[1].scheduled);
    assert_eq!(snap.cores[0].cascade_up_cpu, None);
    assert_eq!(snap.cores[2].cascade_up_by, None);
    assert_consistent(&engine, &snap);

    let before = sim.requests().len();
    assert_eq!(engine.tick(1).unwrap(), Decision::NoChange);
    assert_eq!(sim.requests().len(), before);
}

#[test]
fn unsolicited_online_is_registered_without_parent() {
    let (_sim, engine) = engine(3, 1);
    engine.enable().unwrap();
    engine.notify(CoreEvent::Online(2));
    let snap = engine.snapshot();
    assert!(snap.cores[2].online && snap.cores[2].scheduled);
    assert_eq!(snap.cores[2].cascade_up_by, None);
}

#[test]
fn reconcile_picks_up_out_of_band_changes() {
    let (sim, engine) = engine(4, 2);
    engine.enable().unwrap();
    sim.force_state(1, false);
    sim.force_state(3, true);

    let events = engine.reconcile().unwrap();
    assert_eq!(events, vec![CoreEvent::Offline(1), CoreEvent::Online(3)]);
    assert_eq!(online(&engine.snapshot()), vec![0, 3]);
    assert!(engine.reconcile().unwrap().is_empty());
}

#[test]
fn primary_core_is_requested_back_after_unsolicited_offline() {
    let (sim, engine) = engine(4, 2);
    engine.enable().unwrap();

    sim.force_state(0, false);
    engine.notify(CoreEvent::Offline(0));

    assert!(sim.is_online(0).unwrap());
    assert_eq!(sim.requests(), vec![(Direction::Online, 0)]);
    let snap = engine.snapshot();
    assert!(snap.cores[0].online && snap.cores[0].scheduled);
    assert_consistent(&engine, &snap);
    assert_eq!(engine.tick(0).unwrap(), Decision::NoChange);
}

#[test]
fn failed_primary_restore_is_retried_by_reconcile() {
    let (sim, engine) = engine(3, 1);
    engine.enable().unwrap();
    sim.fail_next(Direction::Online, 0);
    sim.force_state(0, false);

    assert_eq!(engine.reconcile().unwrap(), vec![CoreEvent::Offline(0)]);
    assert!(!sim.is_online(0).unwrap());
    assert!(!engine.snapshot().cores[0].online);

    assert!(engine.reconcile().unwrap().is_empty());
    assert!(sim.is_online(0).unwrap());
    assert_eq!(online(&engine.snapshot()), vec![0]);
    assert_consistent(&engine, &engine.snapshot());
}

#[test]
fn failed_bring_up_clears_pending_and_retries_next_tick() {
    let (sim, engine) = engine(2, 1);
    engine.enable().unwrap();
    busy(&sim, 2);
    sim.fail_next(Direction::Online, 1);

    let err = engine.tick(0).unwrap_err();
    assert!(matches!(
        err,
        GovernorError::TransitionFailed { core: 1, direction: Direction::Online, .. }
    ));
    let snap = engine.snapshot();
    assert!(!snap.cores[1].online);
    assert_consistent(&engine, &snap);

    assert_eq!(engine.tick(0).unwrap(), Decision::BringUp(1));
    assert!(sim.is_online(1).unwrap());
}

#[test]
fn failed_take_down_keeps_core_online() {
    let (sim, engine) = engine(2, 2);
    engine.write_attr("cpu1.down_rate", "1").unwrap();
    engine.enable().unwrap();
    sim.set_all_loads(0);
    sim.fail_next(Direction::Offline, 1);

    assert!(engine.tick(1).is_err());
    assert!(engine.snapshot().cores[1].online);
    assert_eq!(engine.tick(1).unwrap(), Decision::TakeDown);
    assert_eq!(online(&engine.snapshot()), vec![0]);
}

// === counter sampler ===

#[test]
fn counter_sampler_drives_bring_up_and_seeds_new_cores() {
    let (sim, engine) = counter_engine(3, 1);
    engine.enable().unwrap();
    busy(&sim, 2);
    sim.advance(TICK);
    assert_eq!(engine.tick(0).unwrap(), Decision::BringUp(1));

    // Core 1 got its baseline when it came up, so its first round samples.
    sim.advance(TICK);
    assert!(engine.tick(1).is_ok());
}

#[test]
fn counter_sampler_seeds_cores_reported_online() {
    let (sim, engine) = counter_engine(4, 1);
    engine.enable().unwrap();
    sim.set_all_loads(50);

    sim.force_state(1, true);
    engine.notify(CoreEvent::Online(1));
    sim.force_state(2, true);
    assert_eq!(engine.reconcile().unwrap(), vec![CoreEvent::Online(2)]);

    sim.advance(TICK);
    assert!(engine.tick(1).is_ok());
    assert!(engine.tick(2).is_ok());
}

#[test]
fn idle_ahead_of_wall_skips_the_round_untouched() {
    let (sim, engine) = counter_engine(3, 1);
    engine.write_attr("cpu0.up_rate", "3").unwrap();
    engine.enable().unwrap();
    busy(&sim, 2);
    sim.advance(TICK);
    assert_eq!(engine.tick(0).unwrap(), Decision::NoChange);
    engine.power_event(PowerEvent::Suspend);
    engine.power_event(PowerEvent::Resume);

    let before = engine.snapshot();
    assert!(before.cores[0].force_up);
    assert_eq!(before.cores[0].up_rate_counter, 2);

    let CpuTimes { wall, idle } = sim.cpu_times(0).unwrap();
    sim.set_times(0, CpuTimes { wall: wall + 10, idle: idle + 50 });
    assert!(matches!(
        engine.tick(0),
        Err(GovernorError::SampleUnavailable { core: 0 })
    ));
    assert_eq!(engine.snapshot(), before);
    assert!(sim.requests().is_empty());

    // The next sane reading still finds the flag armed.
    sim.advance(TICK);
    assert_eq!(engine.tick(0).unwrap(), Decision::BringUp(1));
    assert!(!engine.snapshot().cores[0].force_up);
}

// === tunables ===

#[test]
fn lowering_a_rate_restarts_counters_beyond_it() {
    let (sim, engine) = engine(2, 1);
    engine.write_attr("cpu0.up_rate", "5").unwrap();
    engine.enable().unwrap();
    busy(&sim, 2);
    for _ in 0..3 {
        assert_eq!(engine.tick(0).unwrap(), Decision::NoChange);
    }
    assert_eq!(engine.snapshot().cores[0].up_rate_counter, 4);

    engine.write_attr("cpu0.up_rate", "2").unwrap();
    let snap = engine.snapshot();
    assert_eq!(snap.cores[0].up_rate_counter, 1);
    assert_consistent(&engine, &snap);
}

#[test]
fn enabling_twice_does_not_restart() {
    let (_sim, engine) = engine(2, 2);
    assert_eq!(engine.write_attr("enabled", "1").unwrap(), Applied::Changed);
    let before = engine.snapshot();
    assert_eq!(engine.write_attr("enabled", "1").unwrap(), Applied::Unchanged);
    assert_eq!(engine.snapshot(), before);

    assert_eq!(engine.write_attr("enabled", "0").unwrap(), Applied::Changed);
    assert!(!engine.is_enabled());
    assert!(engine.snapshot().cores.iter().all(|c| !c.scheduled && !c.online));
}

#[test]
fn rejected_writes_leave_values_alone() {
    let (_sim, engine) = engine(4, 1);
    assert!(matches!(
        engine.write_attr("cpu1.up_load", "150"),
        Err(GovernorError::InvalidConfig { .. })
    ));
    assert_eq!(engine.read_attr("cpu1.up_load").unwrap(), "65");
    assert!(matches!(
        engine.write_attr("cpu9.up_load", "10"),
        Err(GovernorError::UnknownAttribute(_))
    ));
    assert!(engine.write_attr("enabled", "perhaps").is_err());
    assert!(!engine.is_enabled());

    engine.write_attr("sampling_interval_ms", "1").unwrap();
    assert_eq!(engine.read_attr("sampling_interval_ms").unwrap(), "10");
    engine.write_attr("max_cores", "12").unwrap();
    assert_eq!(engine.read_attr("max_cores").unwrap(), "4");
}

#[test]
fn config_file_flows_through_tunables() {
    let (_sim, engine) = engine(4, 1);
    let loaded = hotplug_governor::config::parse(
        r#"
        [cores]
        max = 2
        [policy]
        down = "freq-or-idle-load"
        [thresholds.cpu1]
        up-load = 150
        down-rate = 5
        [thresholds.cpu7]
        up-load = 10
        "#,
    )
    .unwrap();

    let rejected = engine.apply_attributes(&loaded.attributes);
    assert_eq!(rejected, 2);
    assert_eq!(engine.read_attr("max_cores").unwrap(), "2");
    assert_eq!(engine.read_attr("down_policy").unwrap(), "freq-or-idle-load");
    assert_eq!(engine.read_attr("cpu1.up_load").unwrap(), "65");
    assert_eq!(engine.read_attr("cpu1.down_rate").unwrap(), "5");
    assert!(engine.is_enabled());
}

#[test]
fn attribute_listing_covers_every_core() {
    let (_sim, engine) = engine(3, 1);
    let attrs = engine.attributes();
    assert_eq!(attrs.len(), 5 + 3 * 8);
    assert!(attrs.contains(&("cpu2.down_freq".to_string(), "918000".to_string())));
}

// === threaded timers ===

#[test]
fn threaded_engine_ramps_up_and_stops_cleanly() {
    let sim = Arc::new(SimPlatform::new(4, 1));
    let engine = Engine::build(sim.clone(), Box::new(UtilizationSampler), Scheduling::Threaded);
    engine.write_attr("sampling_interval_ms", "10").unwrap();
    busy(&sim, 4);
    engine.enable().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while sim.online_count() < 4 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(sim.online_count(), 4);

    assert_eq!(engine.disable(), Applied::Changed);
    let snap = engine.snapshot();
    assert!(snap.cores.iter().all(|c| !c.scheduled));
    let requests = sim.requests().len();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(sim.requests().len(), requests);
}
