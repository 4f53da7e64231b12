//! Error taxonomy shared by every controller in this crate.
//!
//! Nothing in here is retried. A [`ConfigError`] is raised eagerly while a test is being set up,
//! a [`DeviceError`] or [`PersistenceError`] aborts the running test after the outputs have been
//! forced off, and [`CycleError`] is what the runner hands back to the operator.

use std::fmt;
use std::io;

use thiserror::Error;

/// Invalid or missing test parameter, detected before any output is driven.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }
}

/// Instrument call that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceOp {
    Open,
    ReadInput,
    WriteOutputs,
    WriteDigital,
    Close,
}

impl fmt::Display for DeviceOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DeviceOp::Open => "open",
                DeviceOp::ReadInput => "read_input",
                DeviceOp::WriteOutputs => "write_outputs",
                DeviceOp::WriteDigital => "write_digital",
                DeviceOp::Close => "close",
            }
        )
    }
}

/// I/O failure against the instrument.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Device error during {operation}: {detail}")]
pub struct DeviceError {
    pub operation: DeviceOp,
    pub detail: String,
}

impl DeviceError {
    pub fn new(operation: DeviceOp, detail: impl Into<String>) -> Self {
        Self {
            operation,
            detail: detail.into(),
        }
    }
}

/// Failure to initialise or append to a per-cell sample series.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to encode sample: {0}")]
    Encode(String),
    #[error("Series {0} already exists")]
    SeriesExists(String),
    #[error("Series {0} was never initialised")]
    UnknownSeries(String),
}

/// Top-level outcome of a failed test run.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Persistence error on cell {cell}: {source}")]
    Persistence {
        cell: String,
        #[source]
        source: PersistenceError,
    },
    #[error("Test stopped: {0}")]
    Stopped(String),
}

impl CycleError {
    pub fn persistence(cell: &str, source: PersistenceError) -> Self {
        CycleError::Persistence {
            cell: cell.to_string(),
            source,
        }
    }
}
