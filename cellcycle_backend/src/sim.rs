//! Simulated instrument for tests and `--simulate` runs.
//!
//! [`SimInstrument`] answers analog reads from a reading function (scripted per test, or the
//! [`SimInstrument::battery_bank`] model) and records every output and digital write. Clones
//! share one state, so a test can keep a handle while the bench owns the instrument.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::CellTestConfig;
use crate::error::{DeviceError, DeviceOp};
use crate::instrument::InstrumentAdapter;
use crate::routing::DEFAULT_ADDRESS_LINES;

/// What the reading function gets to see when a port is read.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimView {
    /// Current (AO0, AO1) levels.
    pub outputs: (f64, f64),
    /// Routing switch address decoded from the A0..A3 lines.
    pub address: u8,
    /// Number of analog reads served before this one.
    pub reads: usize,
}

type ReadingFn = Box<dyn FnMut(usize, &SimView) -> f64 + Send>;

struct SimState {
    model: ReadingFn,
    outputs: (f64, f64),
    output_log: Vec<(f64, f64)>,
    lines: BTreeMap<usize, bool>,
    digital_log: Vec<(usize, bool)>,
    address_lines: [usize; 4],
    reads: usize,
    calls: BTreeMap<DeviceOp, usize>,
    fail_at: Option<(DeviceOp, usize)>,
    closed: bool,
}

impl SimState {
    fn address(&self) -> u8 {
        self.address_lines
            .iter()
            .enumerate()
            .filter(|(_, line)| self.lines.get(*line).copied().unwrap_or(false))
            .fold(0u8, |acc, (bit, _)| acc | (1 << bit))
    }

    // Counts the call and fails it if it is the scheduled one.
    fn enter(&mut self, op: DeviceOp) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::new(op, "instrument is closed"));
        }
        let count = self.calls.entry(op).or_insert(0);
        let index = *count;
        *count += 1;
        match self.fail_at {
            Some((fail_op, at)) if fail_op == op && at == index => {
                self.fail_at = None;
                Err(DeviceError::new(op, format!("injected failure on call #{}", index)))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct SimInstrument {
    state: Arc<Mutex<SimState>>,
}

impl SimInstrument {
    /// Instrument whose analog inputs are produced by `model(port, view)`.
    pub fn scripted(model: impl FnMut(usize, &SimView) -> f64 + Send + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                model: Box::new(model),
                outputs: (0.0, 0.0),
                output_log: Vec::new(),
                lines: BTreeMap::new(),
                digital_log: Vec::new(),
                address_lines: DEFAULT_ADDRESS_LINES,
                reads: 0,
                calls: BTreeMap::new(),
                fail_at: None,
                closed: false,
            })),
        }
    }

    /// Crude bank of cells behind a routing switch.
    ///
    /// Each read of `config.cell_voltage_port` moves the addressed cell's voltage according to the
    /// current drive (down with the sink, up with the source), scaled by that cell's rate factor.
    /// The source monitor reads back the source drive level, so the taper ends once the drive has
    /// been walked up to `source_cutoff_v`.
    pub fn battery_bank(config: &CellTestConfig, cells: &[(u8, f64, f64)]) -> Self {
        let config = config.clone();
        let mut voltages: BTreeMap<u8, (f64, f64)> = cells
            .iter()
            .map(|&(address, voltage, rate)| (address, (voltage, rate)))
            .collect();
        let ceiling = config.v_max + 0.15;
        let floor = config.v_min - 0.3;
        Self::scripted(move |port, view| {
            let (ao0, ao1) = view.outputs;
            let (sink_v, source_v) = if config.sink_port == 0 { (ao0, ao1) } else { (ao1, ao0) };
            if port == config.source_monitor_port {
                return source_v;
            }
            if port != config.cell_voltage_port {
                return 0.0;
            }
            match voltages.get_mut(&view.address) {
                Some((voltage, rate)) => {
                    let sink_drive = (sink_v - config.sink_off_v).max(0.0);
                    let source_drive = (config.source_off_v - source_v).max(0.0);
                    *voltage += *rate * 0.02 * (source_drive - sink_drive);
                    *voltage = voltage.clamp(floor, ceiling);
                    *voltage
                }
                None => 0.0,
            }
        })
    }

    /// Moves the routing address lines away from digital lines 0..3.
    pub fn with_address_lines(self, lines: [usize; 4]) -> Self {
        self.state.lock().address_lines = lines;
        self
    }

    /// Makes the `call_index`-th (0-based) call of `op` fail once.
    pub fn fail_on(self, op: DeviceOp, call_index: usize) -> Self {
        self.state.lock().fail_at = Some((op, call_index));
        self
    }

    /// Another handle onto the same simulated device.
    pub fn handle(&self) -> SimInstrument {
        self.clone()
    }

    pub fn outputs(&self) -> (f64, f64) {
        self.state.lock().outputs
    }

    /// Every successful `write_outputs` call, in order.
    pub fn output_log(&self) -> Vec<(f64, f64)> {
        self.state.lock().output_log.clone()
    }

    /// Every successful `write_digital` call, in order.
    pub fn digital_log(&self) -> Vec<(usize, bool)> {
        self.state.lock().digital_log.clone()
    }

    pub fn address(&self) -> u8 {
        self.state.lock().address()
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl InstrumentAdapter for SimInstrument {
    fn read_input(&mut self, port: usize) -> Result<f64, DeviceError> {
        let mut state = self.state.lock();
        state.enter(DeviceOp::ReadInput)?;
        let view = SimView {
            outputs: state.outputs,
            address: state.address(),
            reads: state.reads,
        };
        state.reads += 1;
        Ok((state.model)(port, &view))
    }

    fn write_outputs(&mut self, v_ao0: f64, v_ao1: f64) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.enter(DeviceOp::WriteOutputs)?;
        state.outputs = (v_ao0, v_ao1);
        state.output_log.push((v_ao0, v_ao1));
        Ok(())
    }

    fn write_digital(&mut self, line: usize, bit: bool) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.enter(DeviceOp::WriteDigital)?;
        state.lines.insert(line, bit);
        state.digital_log.push((line, bit));
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.enter(DeviceOp::Close)?;
        state.closed = true;
        Ok(())
    }
}
