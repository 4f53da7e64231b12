//! Several cells cycled together through one instrument and a routing switch.
//!
//! The [`MultiplexedController`] owns one [`SingleCellController`] per cell for bookkeeping (each
//! keeps its own configuration, cycle index and sample history) and adds the group layer on
//! top: the drive outputs are shared, so every phase is group-wide, and each sampling tick
//! selects and reads every cell in routing order via [`MultiplexedController::measure_all`].
//!
//! Group phases end on aggregates of the tick's readings: discharge continues while the
//! highest cell is above `v_min`, constant-current charge while the lowest cell is below
//! `v_max`. Cells that cross early keep being sampled and recorded every tick. The taper cutoff
//! is checked on the single shared source monitor.

use indexmap::IndexMap;
use log::warn;

use crate::bench::Bench;
use crate::clock::Clock;
use crate::config::CellTestConfig;
use crate::controller::{taper_drive, CycleController, PulseTimer, SingleCellController};
use crate::error::{ConfigError, CycleError};
use crate::events::TestEvent;
use crate::instrument::InstrumentAdapter;
use crate::routing::RoutingTable;
use crate::sample::{ControllerState, PhaseLabel, Sample};
use crate::sink::PersistenceSink;

const SCOPE: &str = "mux";

/// Discharge goes on while any cell is still above `v_min`.
pub fn discharge_continues(voltages: &[f64], v_min: f64) -> bool {
    voltages.iter().copied().fold(f64::NEG_INFINITY, f64::max) > v_min
}

/// Constant-current charge goes on while any cell is still below `v_max`.
pub fn constant_current_continues(voltages: &[f64], v_max: f64) -> bool {
    voltages.iter().copied().fold(f64::INFINITY, f64::min) < v_max
}

pub struct MultiplexedController {
    config: CellTestConfig,
    routing: RoutingTable,
    cells: IndexMap<String, SingleCellController>,
    phase: ControllerState,
    source_drive_v: f64,
    cycle_index: u32,
}

impl MultiplexedController {
    /// Creates one cell controller per routing entry, each with its own copy of `config`.
    pub fn new(config: CellTestConfig, routing: RoutingTable) -> Result<Self, ConfigError> {
        Self::with_cell_configs(config, routing, IndexMap::new())
    }

    /// Like [`MultiplexedController::new`], with per-cell configuration overrides.
    ///
    /// Drive levels, thresholds and timing always come from the group `config`; an override
    /// only changes the cell's own bookkeeping (for example its `cell_voltage_port`).
    pub fn with_cell_configs(
        config: CellTestConfig,
        routing: RoutingTable,
        mut overrides: IndexMap<String, CellTestConfig>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if routing.is_empty() {
            return Err(ConfigError::invalid("the routing table lists no batteries"));
        }
        let mut cells = IndexMap::new();
        for (id, _) in routing.iter() {
            let cell_config = overrides.shift_remove(id).unwrap_or_else(|| config.clone());
            cells.insert(id.to_string(), SingleCellController::new(id, cell_config)?);
        }
        if let Some(unknown) = overrides.keys().next() {
            return Err(ConfigError::invalid(format!(
                "configuration given for battery {} which is not in the routing table",
                unknown
            )));
        }
        let source_drive_v = config.source_on_v_max;
        Ok(Self {
            config,
            routing,
            cells,
            phase: ControllerState::Off,
            source_drive_v,
            cycle_index: 1,
        })
    }

    pub fn config(&self) -> &CellTestConfig {
        &self.config
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn cell(&self, id: &str) -> Option<&SingleCellController> {
        self.cells.get(id)
    }

    pub fn cells(&self) -> impl Iterator<Item = &SingleCellController> {
        self.cells.values()
    }

    pub fn phase(&self) -> ControllerState {
        self.phase
    }

    pub fn source_drive_v(&self) -> f64 {
        self.source_drive_v
    }

    fn set_phase<I, C, S>(&mut self, bench: &mut Bench<I, C, S>, phase: ControllerState)
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        self.cells.values_mut().for_each(|cell| cell.set_phase_quiet(phase));
        if self.phase != phase {
            self.phase = phase;
            bench.emit(TestEvent::StateChanged {
                scope: SCOPE.to_string(),
                state: phase,
            });
        }
    }

    /// One tick: select, read and record every cell in routing order.
    ///
    /// All samples of a tick share the elapsed time taken at the start of the tick.
    pub fn measure_all<I, C, S>(
        &mut self,
        bench: &mut Bench<I, C, S>,
        label: PhaseLabel,
    ) -> Result<Vec<f64>, CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        let elapsed = bench.elapsed_seconds();
        let mut voltages = Vec::with_capacity(self.cells.len());
        for (id, cell) in self.cells.iter_mut() {
            self.routing.select(id, bench)?;
            let voltage = bench.instrument.read_input(cell.config().cell_voltage_port)?;
            cell.record_at(bench, elapsed, voltage, label)?;
            voltages.push(voltage);
        }
        Ok(voltages)
    }

    fn sink_on<I, C, S>(&mut self, bench: &mut Bench<I, C, S>, pulse: bool) -> Result<(), CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        let sink_v = if pulse {
            self.config.sink_pulse_v
        } else {
            self.config.sink_on_v
        };
        bench.apply_drive(&self.config, sink_v, self.config.source_off_v)?;
        Ok(())
    }

    fn source_on<I, C, S>(&mut self, bench: &mut Bench<I, C, S>, reset: bool) -> Result<(), CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        if reset {
            self.source_drive_v = self.config.source_on_v_max;
        }
        let drive_v = self.source_drive_v;
        self.cells.values_mut().for_each(|cell| cell.set_source_drive(drive_v));
        bench.apply_drive(&self.config, self.config.sink_off_v, drive_v)?;
        Ok(())
    }

    pub fn discharge<I, C, S>(&mut self, bench: &mut Bench<I, C, S>, pulse: bool) -> Result<(), CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        self.sink_on(bench, false)?;
        self.set_phase(bench, ControllerState::Discharging);
        bench.emit(TestEvent::DischargeStarted {
            scope: SCOPE.to_string(),
            cycle: self.cycle_index,
            pulsed: pulse,
        });

        let mut timer = PulseTimer::start(bench.clock.now());
        loop {
            bench.check_stop()?;
            let voltages = self.measure_all(bench, timer.label())?;
            if !discharge_continues(&voltages, self.config.v_min) {
                break;
            }
            let interval = if pulse {
                if timer.poll(bench.clock.now(), self.config.pulse_duration) {
                    self.sink_on(bench, timer.active())?;
                    let (state, sink_v) = if timer.active() {
                        (ControllerState::DischargingPulsed, self.config.sink_pulse_v)
                    } else {
                        (ControllerState::Discharging, self.config.sink_on_v)
                    };
                    self.set_phase(bench, state);
                    bench.emit(TestEvent::PulseToggled {
                        scope: SCOPE.to_string(),
                        active: timer.active(),
                        sink_v,
                    });
                }
                timer.interval(&self.config)
            } else {
                self.config.sample_interval
            };
            bench.clock.sleep(interval);
        }
        Ok(())
    }

    fn constant_current<I, C, S>(&mut self, bench: &mut Bench<I, C, S>) -> Result<(), CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        loop {
            bench.check_stop()?;
            let voltages = self.measure_all(bench, PhaseLabel::Charging)?;
            if !constant_current_continues(&voltages, self.config.v_max) {
                return Ok(());
            }
            bench.clock.sleep(self.config.sample_interval);
        }
    }

    pub fn charge<I, C, S>(&mut self, bench: &mut Bench<I, C, S>) -> Result<(), CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        self.source_on(bench, true)?;
        self.set_phase(bench, ControllerState::ChargingConstantCurrent);
        bench.emit(TestEvent::ChargeStarted {
            scope: SCOPE.to_string(),
            cycle: self.cycle_index,
        });
        self.constant_current(bench)?;

        let mut taper_steps = 0;
        loop {
            bench.check_stop()?;
            let monitor_v = bench.instrument.read_input(self.config.source_monitor_port)?;
            if monitor_v >= self.config.source_cutoff_v {
                return Ok(());
            }
            if self.source_drive_v >= self.config.source_off_v {
                warn!(
                    "battery bank: source drive exhausted at {:.3} V, monitor {:.3} V",
                    self.source_drive_v, monitor_v
                );
                bench.emit(TestEvent::TaperExhausted {
                    scope: SCOPE.to_string(),
                    drive_v: self.source_drive_v,
                    monitor_v,
                });
                return Ok(());
            }
            taper_steps += 1;
            self.source_drive_v = taper_drive(&self.config, taper_steps);
            self.set_phase(bench, ControllerState::ChargingTaper);
            self.source_on(bench, false)?;
            bench.emit(TestEvent::SourceDriveReduced {
                scope: SCOPE.to_string(),
                drive_v: self.source_drive_v,
                monitor_v,
            });
            self.constant_current(bench)?;
        }
    }
}

impl CycleController for MultiplexedController {
    fn scope(&self) -> &str {
        SCOPE
    }

    fn cell_ids(&self) -> Vec<String> {
        self.cells.keys().cloned().collect()
    }

    fn max_cycles(&self) -> u32 {
        self.config.max_cycles
    }

    fn cycle_index(&self) -> u32 {
        self.cycle_index
    }

    fn histories(&self) -> Vec<(&str, &[Sample])> {
        self.cells
            .iter()
            .map(|(id, cell)| (id.as_str(), cell.state().sample_history()))
            .collect()
    }

    fn begin<I, C, S>(&mut self, bench: &mut Bench<I, C, S>) -> Result<(), CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        self.off(bench)?;
        for id in self.cells.keys() {
            bench.init_series(id)?;
        }
        self.measure_all(bench, PhaseLabel::StartingTest)?;
        Ok(())
    }

    fn run_cycle<I, C, S>(&mut self, bench: &mut Bench<I, C, S>) -> Result<(), CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        let cycle = self.cycle_index;
        self.discharge(bench, cycle % 2 == 1)?;
        self.off(bench)?;
        self.charge(bench)?;
        self.off(bench)?;
        bench.emit(TestEvent::CycleCompleted {
            scope: SCOPE.to_string(),
            cycle,
        });
        self.cells.values_mut().for_each(|cell| cell.advance_cycle());
        self.cycle_index += 1;
        Ok(())
    }

    fn off<I, C, S>(&mut self, bench: &mut Bench<I, C, S>) -> Result<(), CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        bench.apply_drive(&self.config, self.config.sink_off_v, self.config.source_off_v)?;
        self.set_phase(bench, ControllerState::Off);
        bench.emit(TestEvent::OutputsOff {
            scope: SCOPE.to_string(),
        });
        Ok(())
    }
}
