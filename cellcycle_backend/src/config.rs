//! Immutable per-cell test parameters.
//!
//! A [`CellTestConfig`] is constructed fresh for every controller (from [`Default`], the
//! [`CellTestConfigBuilder`], or a YAML file) and is never mutated once a controller owns it.
//! Every constructor path ends in [`CellTestConfig::validate`], so a controller can assume:
//!
//! - `v_min < v_max`
//! - `sink_port` and `source_port` are the two distinct analog outputs (0 and 1, either order)
//! - the taper loop terminates: `taper_step > 0` and `source_cutoff_v <= source_off_v`
//!
//! ```yaml
//! v_min: 3.0
//! v_max: 4.1
//! sample_interval: 15.0   # seconds
//! ```

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Drive levels, thresholds, timing and port assignment for one cell under test.
///
/// Voltages are the levels the instrument writes to the transistor bias networks, not cell
/// currents. For the PNP source a *higher* drive voltage means *less* current, which is why the
/// taper walks `current_source_drive_v` upward from `source_on_v_max`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CellTestConfig {
    pub sink_on_v: f64,
    pub sink_off_v: f64,
    pub sink_pulse_v: f64,
    pub source_on_v_max: f64,
    pub source_off_v: f64,
    pub source_cutoff_v: f64,
    pub v_min: f64,
    pub v_max: f64,
    pub max_cycles: u32,
    #[serde(with = "secs")]
    pub sample_interval: Duration,
    #[serde(with = "secs")]
    pub pulse_sample_interval: Duration,
    #[serde(with = "secs")]
    pub pulse_duration: Duration,
    pub taper_step: f64,
    pub sink_port: usize,
    pub source_port: usize,
    pub cell_voltage_port: usize,
    pub source_monitor_port: usize,
}

impl Default for CellTestConfig {
    // Li-poly cell on the bench sink/source boards: ~3 mA sink (0.2 C), ~7 mA source (0.5 C),
    // ~15 mA pulsed sink (1 C).
    fn default() -> Self {
        Self {
            sink_on_v: 0.76,
            sink_off_v: 0.0,
            sink_pulse_v: 1.3,
            source_on_v_max: 4.08,
            source_off_v: 5.0,
            source_cutoff_v: 4.30,
            v_min: 2.9,
            v_max: 4.2,
            max_cycles: 300,
            sample_interval: Duration::from_secs(30),
            pulse_sample_interval: Duration::from_secs(10),
            pulse_duration: Duration::from_secs(30),
            taper_step: 0.005,
            sink_port: 0,
            source_port: 1,
            cell_voltage_port: 0,
            source_monitor_port: 1,
        }
    }
}

impl CellTestConfig {
    pub fn builder() -> CellTestConfigBuilder {
        CellTestConfigBuilder::new()
    }

    /// Parses a YAML document; fields that are not present keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: CellTestConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Checks every construction-time invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let voltages = [
            ("sink_on_v", self.sink_on_v),
            ("sink_off_v", self.sink_off_v),
            ("sink_pulse_v", self.sink_pulse_v),
            ("source_on_v_max", self.source_on_v_max),
            ("source_off_v", self.source_off_v),
            ("source_cutoff_v", self.source_cutoff_v),
            ("v_min", self.v_min),
            ("v_max", self.v_max),
            ("taper_step", self.taper_step),
        ];
        if let Some((name, value)) = voltages.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ConfigError::invalid(format!("{} must be finite, got {}", name, value)));
        }
        if self.v_min >= self.v_max {
            return Err(ConfigError::invalid(format!(
                "v_min ({}) must be strictly below v_max ({})",
                self.v_min, self.v_max
            )));
        }
        if self.sink_port > 1 || self.source_port > 1 {
            return Err(ConfigError::invalid(format!(
                "sink_port ({}) and source_port ({}) must name analog outputs 0 or 1",
                self.sink_port, self.source_port
            )));
        }
        if self.sink_port == self.source_port {
            return Err(ConfigError::invalid(format!(
                "sink_port and source_port both map to analog output {}",
                self.sink_port
            )));
        }
        if self.cell_voltage_port == self.source_monitor_port {
            return Err(ConfigError::invalid(format!(
                "cell_voltage_port and source_monitor_port both map to analog input {}",
                self.cell_voltage_port
            )));
        }
        if self.taper_step <= 0.0 {
            return Err(ConfigError::invalid(format!(
                "taper_step must be positive for the charge taper to terminate, got {}",
                self.taper_step
            )));
        }
        if self.source_cutoff_v > self.source_off_v {
            return Err(ConfigError::invalid(format!(
                "source_cutoff_v ({}) is unreachable: the taper drive is capped at source_off_v ({})",
                self.source_cutoff_v, self.source_off_v
            )));
        }
        let intervals = [
            ("sample_interval", self.sample_interval),
            ("pulse_sample_interval", self.pulse_sample_interval),
            ("pulse_duration", self.pulse_duration),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::invalid(format!("{} must be non-zero", name)));
        }
        if self.max_cycles == 0 {
            return Err(ConfigError::invalid("max_cycles must be at least 1"));
        }
        Ok(())
    }

    /// Maps a (sink, source) drive pair onto the instrument's (AO0, AO1) order.
    pub fn output_pair(&self, sink_v: f64, source_v: f64) -> (f64, f64) {
        if self.sink_port == 0 {
            (sink_v, source_v)
        } else {
            (source_v, sink_v)
        }
    }
}

macro_rules! builder_setters {
    ($($field:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $field(mut self, value: $ty) -> Self {
                self.config.$field = value;
                self
            }
        )*
    };
}

/// Overrides selected defaults and validates on [`CellTestConfigBuilder::build`].
#[derive(Debug, Default, Clone)]
pub struct CellTestConfigBuilder {
    config: CellTestConfig,
}

impl CellTestConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an existing configuration instead of the defaults.
    pub fn from_config(config: CellTestConfig) -> Self {
        Self { config }
    }

    builder_setters!(
        sink_on_v: f64,
        sink_off_v: f64,
        sink_pulse_v: f64,
        source_on_v_max: f64,
        source_off_v: f64,
        source_cutoff_v: f64,
        v_min: f64,
        v_max: f64,
        max_cycles: u32,
        sample_interval: Duration,
        pulse_sample_interval: Duration,
        pulse_duration: Duration,
        taper_step: f64,
        sink_port: usize,
        source_port: usize,
        cell_voltage_port: usize,
        source_monitor_port: usize,
    );

    pub fn build(self) -> Result<CellTestConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Checks that a battery identifier can double as a storage name.
pub fn validate_battery_id(id: &str) -> Result<(), ConfigError> {
    let re = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("static regex");
    if re.is_match(id) {
        Ok(())
    } else {
        Err(ConfigError::invalid(format!(
            "battery id {:?} must start with a letter or digit and contain only letters, digits, '_', '.' or '-'",
            id
        )))
    }
}

/// Parses the single-cell command-line argument `id=<battery id>`.
pub fn parse_battery_arg(arg: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"^\s*id=(\S*)\s*$").expect("static regex");
    let id = re
        .captures(arg)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| {
            ConfigError::invalid(format!(
                "expected 'id=<battery id>' naming the battery under test, got {:?}",
                arg
            ))
        })?;
    if id.is_empty() {
        return Err(ConfigError::invalid("missing battery id after 'id='"));
    }
    validate_battery_id(id)?;
    Ok(id.to_string())
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
