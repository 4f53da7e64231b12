//! Drives a controller through a whole test and guarantees the outputs end up off.

use log::{error, info};

use crate::bench::Bench;
use crate::clock::Clock;
use crate::controller::CycleController;
use crate::error::CycleError;
use crate::events::TestEvent;
use crate::instrument::InstrumentAdapter;
use crate::report::RunReport;
use crate::sink::PersistenceSink;

/// Owns a controller and its bench for the length of a test.
///
/// Whatever way [`Runner::run`] ends (completion, device or storage failure, a stop request)
/// the outputs are turned off before it returns. If the runner is dropped while the outputs
/// may still be driven, for example while unwinding from a panic, the drop does the same.
pub struct Runner<T, I, C, S>
where
    T: CycleController,
    I: InstrumentAdapter,
    C: Clock,
    S: PersistenceSink,
{
    controller: T,
    bench: Bench<I, C, S>,
    outputs_safe: bool,
}

impl<T, I, C, S> Runner<T, I, C, S>
where
    T: CycleController,
    I: InstrumentAdapter,
    C: Clock,
    S: PersistenceSink,
{
    pub fn new(controller: T, bench: Bench<I, C, S>) -> Self {
        Self {
            controller,
            bench,
            outputs_safe: true,
        }
    }

    pub fn controller(&self) -> &T {
        &self.controller
    }

    pub fn bench(&self) -> &Bench<I, C, S> {
        &self.bench
    }

    pub fn bench_mut(&mut self) -> &mut Bench<I, C, S> {
        &mut self.bench
    }

    /// Runs every cycle up to the controller's `max_cycles`.
    pub fn run(&mut self) -> Result<RunReport, CycleError> {
        let max_cycles = self.controller.max_cycles();
        self.bench.emit(TestEvent::TestStarted {
            cells: self.controller.cell_ids(),
            max_cycles,
        });
        info!(
            "{}: starting test of {} cycle(s) on {:?}",
            self.controller.scope(),
            max_cycles,
            self.controller.cell_ids()
        );

        self.outputs_safe = false;
        self.bench.start_test_clock();
        let result = self
            .controller
            .begin(&mut self.bench)
            .and_then(|()| self.controller.run(&mut self.bench, max_cycles));

        let cleanup = self.shut_off();
        if let Err(e) = &result {
            error!("{}: test aborted: {}", self.controller.scope(), e);
            self.bench.emit(TestEvent::ErrorRaised {
                message: e.to_string(),
            });
        }
        result?;
        cleanup?;

        let cycles_completed = self.controller.cycle_index() - 1;
        self.bench.emit(TestEvent::RunFinished { cycles_completed });
        info!(
            "{}: finished after {} cycle(s)",
            self.controller.scope(),
            cycles_completed
        );
        Ok(RunReport::from_histories(
            cycles_completed,
            self.controller.histories(),
        ))
    }

    fn shut_off(&mut self) -> Result<(), CycleError> {
        match self.controller.off(&mut self.bench) {
            Ok(()) => {
                self.outputs_safe = true;
                Ok(())
            }
            Err(e) => {
                error!(
                    "{}: failed to turn outputs off: {}",
                    self.controller.scope(),
                    e
                );
                Err(e)
            }
        }
    }
}

impl<T, I, C, S> Drop for Runner<T, I, C, S>
where
    T: CycleController,
    I: InstrumentAdapter,
    C: Clock,
    S: PersistenceSink,
{
    fn drop(&mut self) {
        if !self.outputs_safe {
            let _ = self.shut_off();
        }
    }
}
