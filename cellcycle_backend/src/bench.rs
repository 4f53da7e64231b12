//! The shared hardware context a controller drives.
//!
//! A [`Bench`] bundles the single instrument, the clock, the sample sink, the event observer and
//! the operator stop token. There is exactly one bench per test: the single-cell runner hands it
//! to one controller, the multiplexed controller hands it to each of its cells in turn, so the
//! analog outputs and routing lines are only ever commanded through one `&mut Bench` at a time.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};

use crate::clock::Clock;
use crate::config::CellTestConfig;
use crate::error::{CycleError, DeviceError};
use crate::events::{NullObserver, Observer, TestEvent};
use crate::instrument::InstrumentAdapter;
use crate::sample::Sample;
use crate::sink::PersistenceSink;

/// Cooperative stop request, polled at sampling-loop boundaries.
pub struct StopToken {
    rx: Option<Receiver<String>>,
    reason: Option<String>,
}

impl StopToken {
    /// A token that never fires.
    pub fn never() -> Self {
        Self {
            rx: None,
            reason: None,
        }
    }

    /// A token together with the handle that fires it.
    pub fn channel() -> (StopHandle, StopToken) {
        let (tx, rx) = channel::bounded(1);
        (
            StopHandle { tx },
            StopToken {
                rx: Some(rx),
                reason: None,
            },
        )
    }

    /// Returns the stop reason once a stop has been requested; stays latched afterwards.
    pub fn poll(&mut self) -> Option<&str> {
        if self.reason.is_none() {
            if let Some(rx) = &self.rx {
                match rx.try_recv() {
                    Ok(reason) => self.reason = Some(reason),
                    Err(TryRecvError::Empty) => {}
                    // Every handle dropped: nobody can ask us to stop any more.
                    Err(TryRecvError::Disconnected) => self.rx = None,
                }
            }
        }
        self.reason.as_deref()
    }
}

/// Fires a [`StopToken`]. Cloneable and sendable to another thread.
#[derive(Clone)]
pub struct StopHandle {
    tx: Sender<String>,
}

impl StopHandle {
    pub fn request_stop(&self, reason: impl Into<String>) {
        // A full channel already carries a pending stop.
        let _ = self.tx.try_send(reason.into());
    }
}

pub struct Bench<I, C, S> {
    pub instrument: I,
    pub clock: C,
    pub sink: S,
    observer: Box<dyn Observer + Send>,
    stop: StopToken,
    origin: Duration,
}

impl<I: InstrumentAdapter, C: Clock, S: PersistenceSink> Bench<I, C, S> {
    pub fn new(instrument: I, clock: C, sink: S) -> Self {
        let origin = clock.now();
        Self {
            instrument,
            clock,
            sink,
            observer: Box::new(NullObserver),
            stop: StopToken::never(),
            origin,
        }
    }

    pub fn with_observer(mut self, observer: impl Observer + Send + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn with_stop_token(mut self, stop: StopToken) -> Self {
        self.stop = stop;
        self
    }

    /// Resets the test-time origin to now.
    pub fn start_test_clock(&mut self) {
        self.origin = self.clock.now();
    }

    /// Seconds since the test-time origin.
    pub fn elapsed_seconds(&self) -> f64 {
        self.clock.now().saturating_sub(self.origin).as_secs_f64()
    }

    pub fn emit(&mut self, event: TestEvent) {
        self.observer.notify(&event);
    }

    /// Fails with [`CycleError::Stopped`] once a stop has been requested.
    pub fn check_stop(&mut self) -> Result<(), CycleError> {
        match self.stop.poll() {
            Some(reason) => Err(CycleError::Stopped(reason.to_string())),
            None => Ok(()),
        }
    }

    /// Writes a (sink, source) drive pair in the instrument's output order.
    pub fn apply_drive(
        &mut self,
        config: &CellTestConfig,
        sink_v: f64,
        source_v: f64,
    ) -> Result<(), DeviceError> {
        let (v_ao0, v_ao1) = config.output_pair(sink_v, source_v);
        self.instrument.write_outputs(v_ao0, v_ao1)
    }

    /// Persists a sample and announces it.
    pub fn persist(&mut self, cell_id: &str, sample: Sample) -> Result<(), CycleError> {
        self.sink
            .append_sample(cell_id, &sample)
            .map_err(|e| CycleError::persistence(cell_id, e))?;
        self.emit(TestEvent::SampleRecorded {
            cell: cell_id.to_string(),
            sample,
        });
        Ok(())
    }

    pub fn init_series(&mut self, cell_id: &str) -> Result<(), CycleError> {
        self.sink
            .init_series(cell_id)
            .map_err(|e| CycleError::persistence(cell_id, e))
    }

    /// Closes the instrument.
    pub fn close(&mut self) -> Result<(), DeviceError> {
        self.instrument.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use crate::sim::SimInstrument;
    use crate::sink::MemorySink;

    #[test]
    fn stop_token_latches_the_first_request() {
        let (handle, mut token) = StopToken::channel();
        assert_eq!(token.poll(), None);
        handle.request_stop("operator");
        handle.request_stop("again");
        assert_eq!(token.poll(), Some("operator"));
        drop(handle);
        assert_eq!(token.poll(), Some("operator"));
    }

    #[test]
    fn dropped_handle_never_stops() {
        let (handle, mut token) = StopToken::channel();
        drop(handle);
        assert_eq!(token.poll(), None);
        assert_eq!(token.poll(), None);
    }

    #[test]
    fn elapsed_time_is_measured_from_test_start() {
        let mut clock = SimClock::new();
        clock.advance(Duration::from_secs(100));
        let mut bench = Bench::new(SimInstrument::scripted(|_, _| 0.0), clock, MemorySink::new());
        bench.clock.sleep(Duration::from_secs(5));
        assert_eq!(bench.elapsed_seconds(), 5.0);
        bench.start_test_clock();
        assert_eq!(bench.elapsed_seconds(), 0.0);
    }

    #[test]
    fn drive_follows_port_assignment() {
        let sim = SimInstrument::scripted(|_, _| 0.0);
        let mut bench = Bench::new(sim.handle(), SimClock::new(), MemorySink::new());
        let swapped = CellTestConfig::builder().sink_port(1).source_port(0).build().unwrap();
        bench.apply_drive(&swapped, 0.76, 5.0).unwrap();
        assert_eq!(sim.outputs(), (5.0, 0.76));
    }
}
