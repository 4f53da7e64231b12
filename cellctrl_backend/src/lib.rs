//! Device-facing layer of the battery cycler.
//!
//! Connects the controllers of `cellcycle_backend` to an NI-DAQmx device ([`daq`], behind the
//! `nidaqmx` feature), stores samples on disk ([`storage`]) and lets an operator stop a run
//! from the terminal ([`stop`]).

pub mod cli;
#[cfg(feature = "nidaqmx")]
pub mod daq;
#[cfg(feature = "nidaqmx")]
pub mod nidaqmx;
pub mod stop;
pub mod storage;

#[cfg(feature = "nidaqmx")]
pub use crate::daq::NiInstrument;
pub use crate::stop::{install_interrupt_handler, spawn_stdin_watcher, watch_commands, OperatorCmd};
pub use crate::storage::{read_series, series_file_name, JsonlSink};
