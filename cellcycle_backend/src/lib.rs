//! Hardware-agnostic core for charge/discharge cycling of battery cells.
//!
//! A test is a [`Runner`] driving a [`CycleController`] over a [`Bench`]. The bench bundles the
//! three seams to the outside world: an [`InstrumentAdapter`] (analog outputs, analog inputs and
//! digital lines), a [`Clock`] and a [`PersistenceSink`]. Two controllers are provided:
//! [`SingleCellController`] for one cell wired straight to the instrument, and
//! [`MultiplexedController`] for a bank of cells behind a 4-bit routing switch.
//!
//! [`SimInstrument`], [`SimClock`] and [`MemorySink`] let a whole test run without hardware.

pub mod bench;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod instrument;
pub mod mux;
pub mod report;
pub mod routing;
pub mod runner;
pub mod sample;
pub mod sim;
pub mod sink;

pub use bench::*;
pub use clock::*;
pub use config::*;
pub use controller::*;
pub use error::*;
pub use events::*;
pub use instrument::*;
pub use mux::*;
pub use report::*;
pub use routing::*;
pub use runner::*;
pub use sample::*;
pub use sim::*;
pub use sink::*;
