//! Structured notifications emitted while a test runs.
//!
//! Controllers report what they do as [`TestEvent`]s to whatever [`Observer`] the bench was built
//! with. The control logic never prints; [`LogObserver`] forwards events to the `log` facade and
//! [`EventLog`] keeps them in memory for inspection.

use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::sample::{ControllerState, Sample};

#[derive(Clone, Debug, PartialEq)]
pub enum TestEvent {
    TestStarted { cells: Vec<String>, max_cycles: u32 },
    StateChanged { scope: String, state: ControllerState },
    DischargeStarted { scope: String, cycle: u32, pulsed: bool },
    ChargeStarted { scope: String, cycle: u32 },
    SampleRecorded { cell: String, sample: Sample },
    PulseToggled { scope: String, active: bool, sink_v: f64 },
    SourceDriveReduced { scope: String, drive_v: f64, monitor_v: f64 },
    TaperExhausted { scope: String, drive_v: f64, monitor_v: f64 },
    CellSelected { cell: String, switch_index: u8 },
    OutputsOff { scope: String },
    CycleCompleted { scope: String, cycle: u32 },
    RunFinished { cycles_completed: u32 },
    ErrorRaised { message: String },
}

pub trait Observer {
    fn notify(&mut self, event: &TestEvent);
}

impl<F: FnMut(&TestEvent)> Observer for F {
    fn notify(&mut self, event: &TestEvent) {
        self(event)
    }
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn notify(&mut self, _: &TestEvent) {}
}

/// Forwards events to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn notify(&mut self, event: &TestEvent) {
        match event {
            TestEvent::TestStarted { cells, max_cycles } => {
                info!("Starting {} cycles on {}", max_cycles, cells.join(", "))
            }
            TestEvent::StateChanged { scope, state } => debug!("{}: {}", scope, state),
            TestEvent::DischargeStarted { scope, cycle, pulsed } => {
                info!("{}: cycle {} discharge (pulsed: {})", scope, cycle, pulsed)
            }
            TestEvent::ChargeStarted { scope, cycle } => info!("{}: cycle {} charge", scope, cycle),
            TestEvent::SampleRecorded { cell, sample } => debug!(
                "{}, battery {}: {:.4} V (cycle {}, t={:.1}s)",
                sample.phase_label, cell, sample.voltage, sample.cycle_index, sample.elapsed_seconds
            ),
            TestEvent::PulseToggled { scope, active, sink_v } => {
                info!("{}: pulse {} (sink at {} V)", scope, if *active { "on" } else { "off" }, sink_v)
            }
            TestEvent::SourceDriveReduced { scope, drive_v, monitor_v } => info!(
                "{}: source voltage changed to {:.3} V (monitor {:.3} V)",
                scope, drive_v, monitor_v
            ),
            TestEvent::TaperExhausted { scope, drive_v, monitor_v } => warn!(
                "{}: source drive reached {:.3} V before the monitor ({:.3} V) hit its cutoff",
                scope, drive_v, monitor_v
            ),
            TestEvent::CellSelected { cell, switch_index } => {
                debug!("Selected battery {} on switch output {}", cell, switch_index)
            }
            TestEvent::OutputsOff { scope } => debug!("{}: sink and source off", scope),
            TestEvent::CycleCompleted { scope, cycle } => info!("{}: done with cycle {}", scope, cycle),
            TestEvent::RunFinished { cycles_completed } => {
                info!("Done with test after {} cycles", cycles_completed)
            }
            TestEvent::ErrorRaised { message } => error!("{}", message),
        }
    }
}

/// Records every event; clones share the same log.
#[derive(Clone, Debug, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<TestEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TestEvent> {
        self.events.lock().clone()
    }

    /// Events for which `f` returns `Some`, mapped.
    pub fn filter_map<T>(&self, f: impl FnMut(&TestEvent) -> Option<T>) -> Vec<T> {
        self.events.lock().iter().filter_map(f).collect()
    }
}

impl Observer for EventLog {
    fn notify(&mut self, event: &TestEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Fans one event out to several observers, in order.
#[derive(Default)]
pub struct Observers {
    observers: Vec<Box<dyn Observer + Send>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: impl Observer + Send + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }
}

impl Observer for Observers {
    fn notify(&mut self, event: &TestEvent) {
        self.observers.iter_mut().for_each(|o| o.notify(event));
    }
}
