//! Charge/discharge state machine for a single cell.
//!
//! ## Cycle
//!
//! [`SingleCellController::run_cycle`] performs `discharge` → `off` → `charge` → `off` and then
//! advances the cycle index. Odd cycles (1-based) discharge with the pulsed sink, even cycles
//! discharge flat.
//!
//! ## Discharge
//!
//! The sink is driven at its nominal level and the cell is sampled until a reading is at or
//! below `v_min`; that last reading is recorded before the loop exits. When pulsing, a
//! [`PulseTimer`] measures time since the last toggle; once `pulse_duration` has elapsed the sink
//! flips between the nominal and pulse levels and the sampling interval flips with it
//! (`pulse_sample_interval` while the pulse is on). The timer restarts at each toggle, so the
//! pulse-on and pulse-off halves are each one `pulse_duration` long and are sampled at different
//! cadences.
//!
//! ## Charge
//!
//! Constant current at `source_on_v_max` until the cell reaches `v_max`, then a taper: while the
//! source monitor is below `source_cutoff_v`, the source drive is raised by `taper_step` (less
//! current) and the constant-current loop runs again. The drive never passes `source_off_v`.

use log::warn;

use crate::clock::Clock;
use crate::config::{validate_battery_id, CellTestConfig};
use crate::error::{ConfigError, CycleError};
use crate::events::TestEvent;
use crate::instrument::InstrumentAdapter;
use crate::bench::Bench;
use crate::sample::{CellTestState, ControllerState, PhaseLabel, Sample};
use crate::sink::PersistenceSink;

use std::time::Duration;

/// Behaviour the [`crate::runner::Runner`] needs from a controller.
pub trait CycleController {
    /// Name used as the event scope.
    fn scope(&self) -> &str;
    fn cell_ids(&self) -> Vec<String>;
    fn max_cycles(&self) -> u32;
    /// 1-based index of the next cycle to run.
    fn cycle_index(&self) -> u32;
    /// Every cell's sample history, in cell order.
    fn histories(&self) -> Vec<(&str, &[Sample])>;

    /// Initialises storage and records the resting voltage before the first cycle.
    fn begin<I, C, S>(&mut self, bench: &mut Bench<I, C, S>) -> Result<(), CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink;

    fn run_cycle<I, C, S>(&mut self, bench: &mut Bench<I, C, S>) -> Result<(), CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink;

    /// Turns sink and source off. Safe from any state.
    fn off<I, C, S>(&mut self, bench: &mut Bench<I, C, S>) -> Result<(), CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink;

    /// Runs cycles until the cycle index exceeds `max_cycles`.
    fn run<I, C, S>(&mut self, bench: &mut Bench<I, C, S>, max_cycles: u32) -> Result<(), CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        while self.cycle_index() <= max_cycles {
            self.run_cycle(bench)?;
        }
        Ok(())
    }
}

/// Tracks the duty-cycled sink during a pulsed discharge.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PulseTimer {
    last_toggle: Duration,
    active: bool,
}

impl PulseTimer {
    pub(crate) fn start(now: Duration) -> Self {
        Self {
            last_toggle: now,
            active: false,
        }
    }

    pub(crate) fn active(&self) -> bool {
        self.active
    }

    pub(crate) fn label(&self) -> PhaseLabel {
        if self.active {
            PhaseLabel::DischargingPulsed
        } else {
            PhaseLabel::Discharging
        }
    }

    /// Toggles if `pulse_duration` has elapsed since the last toggle; returns whether it did.
    pub(crate) fn poll(&mut self, now: Duration, pulse_duration: Duration) -> bool {
        if now.saturating_sub(self.last_toggle) >= pulse_duration {
            self.last_toggle = now;
            self.active = !self.active;
            true
        } else {
            false
        }
    }

    pub(crate) fn interval(&self, config: &CellTestConfig) -> Duration {
        if self.active {
            config.pulse_sample_interval
        } else {
            config.sample_interval
        }
    }
}

/// Source drive after `steps` taper steps, computed from the constant-current level so rounding
/// does not build up over long tapers.
pub(crate) fn taper_drive(config: &CellTestConfig, steps: u32) -> f64 {
    (config.source_on_v_max + steps as f64 * config.taper_step).min(config.source_off_v)
}

/// Drives one cell through repeated charge/discharge cycles.
#[derive(Clone, Debug)]
pub struct SingleCellController {
    id: String,
    config: CellTestConfig,
    state: CellTestState,
}

impl SingleCellController {
    pub fn new(id: &str, config: CellTestConfig) -> Result<Self, ConfigError> {
        validate_battery_id(id)?;
        config.validate()?;
        let state = CellTestState::new(&config);
        Ok(Self {
            id: id.to_string(),
            config,
            state,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &CellTestConfig {
        &self.config
    }

    pub fn state(&self) -> &CellTestState {
        &self.state
    }

    pub(crate) fn advance_cycle(&mut self) {
        self.state.advance_cycle();
    }

    pub(crate) fn set_source_drive(&mut self, drive_v: f64) {
        self.state.current_source_drive_v = drive_v;
    }

    pub(crate) fn set_phase_quiet(&mut self, phase: ControllerState) {
        self.state.current_phase = phase;
    }

    fn set_phase<I, C, S>(&mut self, bench: &mut Bench<I, C, S>, phase: ControllerState)
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        if self.state.current_phase != phase {
            self.state.current_phase = phase;
            bench.emit(TestEvent::StateChanged {
                scope: self.id.clone(),
                state: phase,
            });
        }
    }

    /// Appends a sample taken at `elapsed_seconds` and persists it.
    pub(crate) fn record_at<I, C, S>(
        &mut self,
        bench: &mut Bench<I, C, S>,
        elapsed_seconds: f64,
        voltage: f64,
        label: PhaseLabel,
    ) -> Result<Sample, CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        let sample = self.state.record(elapsed_seconds, voltage, label);
        bench.persist(&self.id, sample)?;
        Ok(sample)
    }

    fn sample<I, C, S>(&mut self, bench: &mut Bench<I, C, S>, label: PhaseLabel) -> Result<f64, CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        let voltage = bench.instrument.read_input(self.config.cell_voltage_port)?;
        let elapsed = bench.elapsed_seconds();
        self.record_at(bench, elapsed, voltage, label)?;
        Ok(voltage)
    }

    /// Sink on (nominal or pulse level), source off.
    pub fn sink_on<I, C, S>(&mut self, bench: &mut Bench<I, C, S>, pulse: bool) -> Result<(), CycleError>
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

    /// Source on, sink off. `reset` restores the constant-current drive level first.
    pub fn source_on<I, C, S>(&mut self, bench: &mut Bench<I, C, S>, reset: bool) -> Result<(), CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        if reset {
            self.state.current_source_drive_v = self.config.source_on_v_max;
        }
        bench.apply_drive(&self.config, self.config.sink_off_v, self.state.current_source_drive_v)?;
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
            scope: self.id.clone(),
            cycle: self.state.cycle_index(),
            pulsed: pulse,
        });

        let mut timer = PulseTimer::start(bench.clock.now());
        loop {
            bench.check_stop()?;
            let voltage = self.sample(bench, timer.label())?;
            if voltage <= self.config.v_min {
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
                        scope: self.id.clone(),
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

    /// Samples under the present source drive until the cell reaches `v_max`.
    fn constant_current<I, C, S>(&mut self, bench: &mut Bench<I, C, S>) -> Result<(), CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        loop {
            bench.check_stop()?;
            let voltage = self.sample(bench, PhaseLabel::Charging)?;
            if voltage >= self.config.v_max {
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
            scope: self.id.clone(),
            cycle: self.state.cycle_index(),
        });
        self.constant_current(bench)?;

        let mut taper_steps = 0;
        loop {
            bench.check_stop()?;
            let monitor_v = bench.instrument.read_input(self.config.source_monitor_port)?;
            if monitor_v >= self.config.source_cutoff_v {
                return Ok(());
            }
            let drive_v = self.state.current_source_drive_v;
            if drive_v >= self.config.source_off_v {
                warn!(
                    "battery {}: source drive exhausted at {:.3} V, monitor {:.3} V",
                    self.id, drive_v, monitor_v
                );
                bench.emit(TestEvent::TaperExhausted {
                    scope: self.id.clone(),
                    drive_v,
                    monitor_v,
                });
                return Ok(());
            }
            taper_steps += 1;
            self.state.current_source_drive_v = taper_drive(&self.config, taper_steps);
            self.set_phase(bench, ControllerState::ChargingTaper);
            self.source_on(bench, false)?;
            bench.emit(TestEvent::SourceDriveReduced {
                scope: self.id.clone(),
                drive_v: self.state.current_source_drive_v,
                monitor_v,
            });
            self.constant_current(bench)?;
        }
    }
}

impl CycleController for SingleCellController {
    fn scope(&self) -> &str {
        &self.id
    }

    fn cell_ids(&self) -> Vec<String> {
        vec![self.id.clone()]
    }

    fn max_cycles(&self) -> u32 {
        self.config.max_cycles
    }

    fn cycle_index(&self) -> u32 {
        self.state.cycle_index()
    }

    fn histories(&self) -> Vec<(&str, &[Sample])> {
        vec![(self.id.as_str(), self.state.sample_history())]
    }

    fn begin<I, C, S>(&mut self, bench: &mut Bench<I, C, S>) -> Result<(), CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        self.off(bench)?;
        bench.init_series(&self.id)?;
        self.sample(bench, PhaseLabel::StartingTest)?;
        Ok(())
    }

    fn run_cycle<I, C, S>(&mut self, bench: &mut Bench<I, C, S>) -> Result<(), CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        let cycle = self.state.cycle_index();
        self.discharge(bench, cycle % 2 == 1)?;
        self.off(bench)?;
        self.charge(bench)?;
        self.off(bench)?;
        bench.emit(TestEvent::CycleCompleted {
            scope: self.id.clone(),
            cycle,
        });
        self.state.advance_cycle();
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
            scope: self.id.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_timer_toggles_after_full_duration() {
        let duration = Duration::from_secs(30);
        let mut timer = PulseTimer::start(Duration::ZERO);
        assert!(!timer.poll(Duration::from_secs(29), duration));
        assert!(timer.poll(Duration::from_secs(30), duration));
        assert!(timer.active());
        assert_eq!(timer.label(), PhaseLabel::DischargingPulsed);
        assert!(!timer.poll(Duration::from_secs(59), duration));
        assert!(timer.poll(Duration::from_secs(61), duration));
        assert!(!timer.active());
        // Measured from the late toggle at 61 s, not from the 60 s boundary.
        assert!(!timer.poll(Duration::from_secs(90), duration));
        assert!(timer.poll(Duration::from_secs(91), duration));
    }

    #[test]
    fn pulse_timer_switches_sampling_cadence() {
        let config = CellTestConfig::default();
        let mut timer = PulseTimer::start(Duration::ZERO);
        assert_eq!(timer.interval(&config), config.sample_interval);
        timer.poll(config.pulse_duration, config.pulse_duration);
        assert_eq!(timer.interval(&config), config.pulse_sample_interval);
    }

    #[test]
    fn rejects_unusable_battery_id() {
        assert!(SingleCellController::new("", CellTestConfig::default()).is_err());
        assert!(SingleCellController::new("a/b", CellTestConfig::default()).is_err());
    }
}
