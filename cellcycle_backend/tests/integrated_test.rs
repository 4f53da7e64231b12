use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cellcycle_backend::*;
use maplit::hashmap;

const CELL: &str = "BBM04r8";
const BANK: [&str; 3] = ["BBM04r8", "BBM05r8", "BBM06r8"];

fn scripted_bench(
    model: impl FnMut(usize, &SimView) -> f64 + Send + 'static,
) -> (SimInstrument, EventLog, Bench<SimInstrument, SimClock, MemorySink>) {
    let sim = SimInstrument::scripted(model);
    let log = EventLog::new();
    let bench = Bench::new(sim.handle(), SimClock::new(), MemorySink::new()).with_observer(log.clone());
    (sim, log, bench)
}

fn voltages(samples: &[Sample]) -> Vec<f64> {
    samples.iter().map(|s| s.voltage).collect()
}

#[test]
fn begin_records_resting_voltage_with_outputs_off() {
    let readings = hashmap! { 0usize => 3.71, 1 => 4.9 };
    let (sim, log, mut bench) = scripted_bench(move |port, _| readings[&port]);
    let mut cell = SingleCellController::new(CELL, CellTestConfig::default()).unwrap();

    cell.begin(&mut bench).unwrap();

    assert_eq!(sim.output_log(), vec![(0.0, 5.0)]);
    let expected = Sample {
        elapsed_seconds: 0.0,
        voltage: 3.71,
        cycle_index: 1,
        phase_label: PhaseLabel::StartingTest,
    };
    assert_eq!(cell.state().sample_history(), &[expected]);
    assert_eq!(bench.sink.series(CELL).unwrap(), &[expected]);
    assert!(log
        .events()
        .contains(&TestEvent::OutputsOff { scope: CELL.to_string() }));
}

#[test]
fn discharge_stops_on_first_reading_at_v_min() {
    let readings = [3.2, 3.0, 2.95, 2.9, 2.5];
    let (sim, _, mut bench) = scripted_bench(move |_, view| readings[view.reads]);
    let mut cell = SingleCellController::new(CELL, CellTestConfig::default()).unwrap();
    bench.init_series(CELL).unwrap();

    cell.discharge(&mut bench, false).unwrap();

    let history = cell.state().sample_history();
    assert_eq!(voltages(history), vec![3.2, 3.0, 2.95, 2.9]);
    assert!(history.iter().all(|s| s.phase_label == PhaseLabel::Discharging));
    assert_eq!(bench.sink.series(CELL).unwrap(), history);
    assert_eq!(bench.clock.sleeps(), &[Duration::from_secs(30); 3]);
    assert_eq!(sim.output_log(), vec![(0.76, 5.0)]);
}

#[test]
fn taper_walks_source_drive_up_to_cutoff() {
    let config = CellTestConfig::builder()
        .source_on_v_max(4.0)
        .taper_step(0.25)
        .source_cutoff_v(5.0)
        .source_off_v(5.0)
        .build()
        .unwrap();
    // The monitor follows the source drive; the cell already sits at v_max.
    let (sim, log, mut bench) =
        scripted_bench(|port, view| if port == 1 { view.outputs.1 } else { 4.2 });
    let mut cell = SingleCellController::new(CELL, config).unwrap();
    bench.init_series(CELL).unwrap();

    cell.charge(&mut bench).unwrap();

    let drives = log.filter_map(|e| match e {
        TestEvent::SourceDriveReduced { drive_v, .. } => Some(*drive_v),
        _ => None,
    });
    assert_eq!(drives, vec![4.25, 4.5, 4.75, 5.0]);
    assert_eq!(
        sim.output_log(),
        vec![(0.0, 4.0), (0.0, 4.25), (0.0, 4.5), (0.0, 4.75), (0.0, 5.0)]
    );
    assert_eq!(cell.state().sample_history().len(), 5);
    assert_eq!(cell.state().current_phase, ControllerState::ChargingTaper);
    assert!(log
        .events()
        .iter()
        .all(|e| !matches!(e, TestEvent::TaperExhausted { .. })));
}

#[test]
fn default_taper_step_reaches_cutoff_without_drift() {
    let config = CellTestConfig::default();
    let (on, step) = (config.source_on_v_max, config.taper_step);
    let (_, log, mut bench) =
        scripted_bench(|port, view| if port == 1 { view.outputs.1 } else { 4.2 });
    let mut cell = SingleCellController::new(CELL, config.clone()).unwrap();
    bench.init_series(CELL).unwrap();

    cell.charge(&mut bench).unwrap();

    let drive = cell.state().current_source_drive_v;
    assert!(drive >= config.source_cutoff_v, "drive {} below cutoff", drive);
    assert_eq!(drive, on + 44.0 * step);
    let steps = log.filter_map(|e| match e {
        TestEvent::SourceDriveReduced { drive_v, .. } => Some(*drive_v),
        _ => None,
    });
    assert_eq!(steps.len(), 44);
    assert_eq!(steps[9], on + 10.0 * step);
}

#[test]
fn taper_gives_up_when_drive_is_exhausted() {
    let config = CellTestConfig::builder()
        .source_on_v_max(4.5)
        .taper_step(0.25)
        .source_cutoff_v(5.0)
        .source_off_v(5.0)
        .build()
        .unwrap();
    // The monitor never reaches the cutoff.
    let (sim, log, mut bench) = scripted_bench(|port, _| if port == 1 { 4.0 } else { 4.2 });
    let mut cell = SingleCellController::new(CELL, config).unwrap();
    bench.init_series(CELL).unwrap();

    cell.charge(&mut bench).unwrap();

    assert_eq!(sim.outputs(), (0.0, 5.0));
    let exhausted = log.filter_map(|e| match e {
        TestEvent::TaperExhausted { drive_v, monitor_v, .. } => Some((*drive_v, *monitor_v)),
        _ => None,
    });
    assert_eq!(exhausted, vec![(5.0, 4.0)]);
}

#[test]
fn pulsed_discharge_toggles_sink_and_cadence() {
    let config = CellTestConfig::builder()
        .pulse_duration(Duration::from_secs(30))
        .sample_interval(Duration::from_secs(10))
        .pulse_sample_interval(Duration::from_secs(5))
        .build()
        .unwrap();
    let (sim, log, mut bench) = scripted_bench(|_, view| if view.reads < 13 { 3.5 } else { 2.5 });
    let mut cell = SingleCellController::new(CELL, config).unwrap();
    bench.init_series(CELL).unwrap();

    cell.discharge(&mut bench, true).unwrap();

    let secs = |s: &[u64]| s.iter().map(|&s| Duration::from_secs(s)).collect::<Vec<_>>();
    assert_eq!(
        bench.clock.sleeps(),
        secs(&[10, 10, 10, 5, 5, 5, 5, 5, 5, 10, 10, 10, 5]).as_slice()
    );

    let history = cell.state().sample_history();
    let times: Vec<f64> = history.iter().map(|s| s.elapsed_seconds).collect();
    assert_eq!(
        times,
        vec![0.0, 10.0, 20.0, 30.0, 35.0, 40.0, 45.0, 50.0, 55.0, 60.0, 70.0, 80.0, 90.0, 95.0]
    );
    let pulsed: Vec<usize> = history
        .iter()
        .enumerate()
        .filter(|(_, s)| s.phase_label == PhaseLabel::DischargingPulsed)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(pulsed, vec![4, 5, 6, 7, 8, 9, 13]);

    let toggles = log.filter_map(|e| match e {
        TestEvent::PulseToggled { active, sink_v, .. } => Some((*active, *sink_v)),
        _ => None,
    });
    assert_eq!(toggles, vec![(true, 1.3), (false, 0.76), (true, 1.3)]);
    assert_eq!(
        sim.output_log(),
        vec![(0.76, 5.0), (1.3, 5.0), (0.76, 5.0), (1.3, 5.0)]
    );
}

#[test]
fn swapped_ports_swap_the_output_pair() {
    let config = CellTestConfig::builder()
        .sink_port(1)
        .source_port(0)
        .build()
        .unwrap();
    let (sim, _, mut bench) = scripted_bench(|_, _| 3.7);
    let mut cell = SingleCellController::new(CELL, config).unwrap();

    cell.sink_on(&mut bench, false).unwrap();
    cell.source_on(&mut bench, true).unwrap();
    cell.off(&mut bench).unwrap();

    assert_eq!(sim.output_log(), vec![(5.0, 0.76), (4.08, 0.0), (5.0, 0.0)]);
}

#[test]
fn full_run_alternates_pulsed_and_flat_discharges() {
    let config = CellTestConfig::builder().max_cycles(3).build().unwrap();
    let sim = SimInstrument::battery_bank(&config, &[(0, 3.7, 1.0)]);
    let log = EventLog::new();
    let bench = Bench::new(sim.handle(), SimClock::new(), MemorySink::new()).with_observer(log.clone());
    let cell = SingleCellController::new(CELL, config.clone()).unwrap();
    let mut runner = Runner::new(cell, bench);

    let report = runner.run().unwrap();

    assert_eq!(report.cycles_completed, 3);
    assert_eq!(runner.controller().cycle_index(), 4);
    let pulsed = log.filter_map(|e| match e {
        TestEvent::DischargeStarted { pulsed, .. } => Some(*pulsed),
        _ => None,
    });
    assert_eq!(pulsed, vec![true, false, true]);
    assert!(matches!(
        log.events().last(),
        Some(TestEvent::RunFinished { cycles_completed: 3 })
    ));

    let history = runner.controller().state().sample_history();
    assert_eq!(history[0].phase_label, PhaseLabel::StartingTest);
    assert!(history
        .windows(2)
        .all(|w| w[0].elapsed_seconds <= w[1].elapsed_seconds && w[0].cycle_index <= w[1].cycle_index));
    assert_eq!(runner.bench().sink.series(CELL).unwrap(), history);
    assert_eq!(sim.output_log().last(), Some(&(0.0, 5.0)));

    let summaries = &report.cells[CELL];
    assert_eq!(
        summaries.iter().map(|c| c.cycle).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    for summary in summaries {
        assert!(summary.min_v <= config.v_min);
        assert!(summary.max_v >= config.v_max);
    }
}

#[test]
fn device_failure_still_turns_outputs_off() {
    let config = CellTestConfig::builder().max_cycles(2).build().unwrap();
    let sim = SimInstrument::battery_bank(&config, &[(0, 3.7, 1.0)]).fail_on(DeviceOp::ReadInput, 20);
    let log = EventLog::new();
    let bench = Bench::new(sim.handle(), SimClock::new(), MemorySink::new()).with_observer(log.clone());
    let mut runner = Runner::new(SingleCellController::new(CELL, config).unwrap(), bench);

    let err = runner.run().unwrap_err();

    match err {
        CycleError::Device(e) => assert_eq!(e.operation, DeviceOp::ReadInput),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(sim.output_log().last(), Some(&(0.0, 5.0)));
    assert!(log
        .events()
        .iter()
        .any(|e| matches!(e, TestEvent::ErrorRaised { .. })));
}

#[test]
fn persistence_failure_names_the_cell() {
    let config = CellTestConfig::builder().max_cycles(1).build().unwrap();
    let sim = SimInstrument::battery_bank(&config, &[(0, 3.7, 1.0)]);
    let bench = Bench::new(sim.handle(), SimClock::new(), MemorySink::failing_after(3));
    let mut runner = Runner::new(SingleCellController::new(CELL, config).unwrap(), bench);

    match runner.run() {
        Err(CycleError::Persistence { cell, .. }) => assert_eq!(cell, CELL),
        other => panic!("unexpected outcome: {:?}", other.map(|r| r.cycles_completed)),
    }
    assert_eq!(runner.bench().sink.series(CELL).unwrap().len(), 3);
    assert_eq!(sim.output_log().last(), Some(&(0.0, 5.0)));
}

#[test]
fn stop_request_ends_the_run_with_outputs_off() {
    let config = CellTestConfig::builder().max_cycles(2).build().unwrap();
    let sim = SimInstrument::battery_bank(&config, &[(0, 3.7, 1.0)]);
    let (handle, token) = StopToken::channel();
    let mut recorded = 0;
    let observer = move |event: &TestEvent| {
        if let TestEvent::SampleRecorded { .. } = event {
            recorded += 1;
            if recorded == 5 {
                handle.request_stop("operator");
            }
        }
    };
    let log = EventLog::new();
    let bench = Bench::new(sim.handle(), SimClock::new(), MemorySink::new())
        .with_observer(Observers::new().with(log.clone()).with(observer))
        .with_stop_token(token);
    let mut runner = Runner::new(SingleCellController::new(CELL, config).unwrap(), bench);

    match runner.run() {
        Err(CycleError::Stopped(reason)) => assert_eq!(reason, "operator"),
        other => panic!("unexpected outcome: {:?}", other.map(|r| r.cycles_completed)),
    }
    assert_eq!(runner.controller().state().sample_history().len(), 5);
    assert_eq!(sim.outputs(), (0.0, 5.0));
    assert!(matches!(
        log.events().last(),
        Some(TestEvent::ErrorRaised { .. })
    ));
}

#[test]
fn mux_samples_every_cell_each_tick_and_waits_for_the_whole_bank() {
    let config = CellTestConfig::builder().max_cycles(1).build().unwrap();
    let sim = SimInstrument::battery_bank(
        &config,
        &[(0, 3.6, 1.0), (1, 3.8, 0.7), (2, 3.4, 1.3)],
    );
    let routing = RoutingTable::from_pairs([("BBM04r8", 0), ("BBM05r8", 1), ("BBM06r8", 2)]).unwrap();
    let mux = MultiplexedController::new(config.clone(), routing).unwrap();
    let log = EventLog::new();
    let bench = Bench::new(sim.handle(), SimClock::new(), MemorySink::new()).with_observer(log.clone());
    let mut runner = Runner::new(mux, bench);

    let report = runner.run().unwrap();
    assert_eq!(report.cycles_completed, 1);

    let mux = runner.controller();
    let histories = mux.histories();
    let ticks = histories[0].1.len();
    for (_, history) in &histories {
        assert_eq!(history.len(), ticks);
    }
    for i in 0..ticks {
        let t = histories[0].1[i].elapsed_seconds;
        assert!(histories.iter().all(|(_, h)| h[i].elapsed_seconds == t));
    }

    // Discharge ends only once every cell is at or below v_min.
    let last_discharge = |history: &[Sample]| {
        history
            .iter()
            .rev()
            .find(|s| {
                matches!(
                    s.phase_label,
                    PhaseLabel::Discharging | PhaseLabel::DischargingPulsed
                )
            })
            .map(|s| s.voltage)
            .unwrap()
    };
    for (_, history) in &histories {
        assert!(last_discharge(*history) <= config.v_min);
    }

    let selected = log.filter_map(|e| match e {
        TestEvent::CellSelected { switch_index, .. } => Some(*switch_index),
        _ => None,
    });
    assert_eq!(&selected[..6], &[0, 1, 2, 0, 1, 2]);
    assert_eq!(
        report.cells.keys().collect::<Vec<_>>(),
        vec!["BBM04r8", "BBM05r8", "BBM06r8"]
    );
    assert_eq!(sim.output_log().last(), Some(&(0.0, 5.0)));
}

fn bank_bench(
    config: CellTestConfig,
    model: impl FnMut(usize, &SimView) -> f64 + Send + 'static,
) -> (
    SimInstrument,
    EventLog,
    MultiplexedController,
    Bench<SimInstrument, SimClock, MemorySink>,
) {
    let (sim, log, mut bench) = scripted_bench(model);
    let routing = RoutingTable::from_pairs(BANK.iter().copied().zip(0..)).unwrap();
    let mux = MultiplexedController::new(config, routing).unwrap();
    for id in BANK {
        bench.init_series(id).unwrap();
    }
    (sim, log, mux, bench)
}

#[test]
fn mux_taper_reads_the_source_monitor_once_per_step() {
    let config = CellTestConfig::builder()
        .source_on_v_max(4.0)
        .taper_step(0.25)
        .source_cutoff_v(5.0)
        .source_off_v(5.0)
        .build()
        .unwrap();
    let monitor_reads = Arc::new(AtomicUsize::new(0));
    let cell_reads = Arc::new(AtomicUsize::new(0));
    let (monitor, cells) = (monitor_reads.clone(), cell_reads.clone());
    let (sim, log, mut mux, mut bench) = bank_bench(config, move |port, view| {
        if port == 1 {
            monitor.fetch_add(1, Ordering::SeqCst);
            view.outputs.1
        } else {
            cells.fetch_add(1, Ordering::SeqCst);
            4.2
        }
    });

    mux.charge(&mut bench).unwrap();

    let drives = log.filter_map(|e| match e {
        TestEvent::SourceDriveReduced { drive_v, .. } => Some(*drive_v),
        _ => None,
    });
    assert_eq!(drives, vec![4.25, 4.5, 4.75, 5.0]);
    // One monitor read per step plus the one that sees the cutoff.
    assert_eq!(monitor_reads.load(Ordering::SeqCst), drives.len() + 1);
    assert_eq!(cell_reads.load(Ordering::SeqCst), 3 * (drives.len() + 1));
    assert_eq!(mux.source_drive_v(), 5.0);
    for id in BANK {
        assert_eq!(mux.cell(id).unwrap().state().current_source_drive_v, 5.0);
    }
    assert_eq!(
        sim.output_log(),
        vec![(0.0, 4.0), (0.0, 4.25), (0.0, 4.5), (0.0, 4.75), (0.0, 5.0)]
    );
    assert_eq!(bench.sink.cell_ids().collect::<Vec<_>>(), BANK);
}

#[test]
fn mux_pulsed_discharge_toggles_the_shared_sink() {
    let config = CellTestConfig::builder()
        .pulse_duration(Duration::from_secs(30))
        .sample_interval(Duration::from_secs(10))
        .pulse_sample_interval(Duration::from_secs(5))
        .build()
        .unwrap();
    // Three reads per tick; the whole bank drops below v_min on tick 13.
    let (sim, log, mut mux, mut bench) =
        bank_bench(config, |_, view| if view.reads / 3 < 13 { 3.5 } else { 2.5 });

    mux.discharge(&mut bench, true).unwrap();

    let cadence: Vec<u64> = bench
        .clock
        .sleeps()
        .iter()
        .filter(|&&d| d != SETTLE_DELAY)
        .map(|d| d.as_secs())
        .collect();
    assert_eq!(cadence, vec![10, 10, 10, 5, 5, 5, 5, 5, 5, 10, 10, 10, 5]);
    assert_eq!(
        bench.clock.sleeps().iter().filter(|&&d| d == SETTLE_DELAY).count(),
        3 * 14
    );

    let toggles = log.filter_map(|e| match e {
        TestEvent::PulseToggled { scope, active, sink_v } => Some((scope.clone(), *active, *sink_v)),
        _ => None,
    });
    assert_eq!(
        toggles,
        vec![
            ("mux".to_string(), true, 1.3),
            ("mux".to_string(), false, 0.76),
            ("mux".to_string(), true, 1.3),
        ]
    );
    assert_eq!(
        sim.output_log(),
        vec![(0.76, 5.0), (1.3, 5.0), (0.76, 5.0), (1.3, 5.0)]
    );

    for (id, history) in mux.histories() {
        assert_eq!(history.len(), 14, "{}", id);
        let pulsed: Vec<usize> = history
            .iter()
            .enumerate()
            .filter(|(_, s)| s.phase_label == PhaseLabel::DischargingPulsed)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(pulsed, vec![4, 5, 6, 7, 8, 9, 13], "{}", id);
        assert_eq!(bench.sink.series(id).unwrap(), history);
    }
}
