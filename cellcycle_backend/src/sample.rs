//! Data recorded while a cell is cycled.
//!
//! - [`Sample`]: one immutable voltage reading, tagged with the phase and cycle it belongs to.
//! - [`CellTestState`]: the mutable record a controller keeps for its cell. Its
//!   `sample_history` is append-only and is the run's output record.
//! - [`ControllerState`]: where the charge/discharge state machine currently is.

use std::fmt;
use std::str::FromStr;

use crate::config::CellTestConfig;

/// Phase label persisted in a series' `type` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhaseLabel {
    StartingTest,
    Charging,
    Discharging,
    DischargingPulsed,
}

impl PhaseLabel {
    pub const fn as_str(self) -> &'static str {
        match self {
            PhaseLabel::StartingTest => "starting_test",
            PhaseLabel::Charging => "charging",
            PhaseLabel::Discharging => "discharging",
            PhaseLabel::DischargingPulsed => "discharging_pulsed",
        }
    }
}

impl fmt::Display for PhaseLabel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PhaseLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting_test" => Ok(PhaseLabel::StartingTest),
            "charging" => Ok(PhaseLabel::Charging),
            "discharging" => Ok(PhaseLabel::Discharging),
            "discharging_pulsed" => Ok(PhaseLabel::DischargingPulsed),
            other => Err(format!("unknown phase label {:?}", other)),
        }
    }
}

/// A single recorded reading. Never modified after creation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub elapsed_seconds: f64,
    pub voltage: f64,
    pub cycle_index: u32,
    pub phase_label: PhaseLabel,
}

/// States of the charge/discharge state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Off,
    ChargingConstantCurrent,
    ChargingTaper,
    Discharging,
    DischargingPulsed,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ControllerState::Off => "off",
                ControllerState::ChargingConstantCurrent => "charging (constant current)",
                ControllerState::ChargingTaper => "charging (taper)",
                ControllerState::Discharging => "discharging",
                ControllerState::DischargingPulsed => "discharging (pulsed)",
            }
        )
    }
}

/// Mutable per-cell record, owned exclusively by one controller.
#[derive(Clone, Debug)]
pub struct CellTestState {
    cycle_index: u32,
    sample_history: Vec<Sample>,
    pub current_phase: ControllerState,
    pub current_source_drive_v: f64,
}

impl CellTestState {
    pub fn new(config: &CellTestConfig) -> Self {
        Self {
            cycle_index: 1,
            sample_history: Vec::new(),
            current_phase: ControllerState::Off,
            current_source_drive_v: config.source_on_v_max,
        }
    }

    /// 1-based index of the cycle in progress (or `max_cycles + 1` once the run is done).
    pub fn cycle_index(&self) -> u32 {
        self.cycle_index
    }

    pub fn advance_cycle(&mut self) {
        self.cycle_index += 1;
    }

    pub fn sample_history(&self) -> &[Sample] {
        &self.sample_history
    }

    pub fn last_sample(&self) -> Option<&Sample> {
        self.sample_history.last()
    }

    /// Builds a sample for the current cycle and appends it.
    pub fn record(&mut self, elapsed_seconds: f64, voltage: f64, phase_label: PhaseLabel) -> Sample {
        let sample = Sample {
            elapsed_seconds,
            voltage,
            cycle_index: self.cycle_index,
            phase_label,
        };
        self.sample_history.push(sample);
        sample
    }
}
