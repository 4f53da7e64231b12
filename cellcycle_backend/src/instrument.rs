//! Capability set of the shared analog/digital I/O instrument.
//!
//! The instrument exposes two analog outputs (AO0, AO1) that bias the current sink and source,
//! analog inputs for the cell voltage and the source monitor, and digital lines that address the
//! routing switch. Implementations hold no business logic, buffer nothing and never retry: each
//! call reflects the hardware at that instant and any failure is returned as a [`DeviceError`].

use crate::error::DeviceError;

pub trait InstrumentAdapter {
    /// Reads the voltage at analog input `port`.
    fn read_input(&mut self, port: usize) -> Result<f64, DeviceError>;

    /// Sets both analog outputs in one call; no intermediate state is observable.
    fn write_outputs(&mut self, v_ao0: f64, v_ao1: f64) -> Result<(), DeviceError>;

    /// Drives digital line `line` high (`true`) or low.
    fn write_digital(&mut self, line: usize, bit: bool) -> Result<(), DeviceError>;

    /// Releases the device.
    fn close(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

impl<T: InstrumentAdapter + ?Sized> InstrumentAdapter for Box<T> {
    fn read_input(&mut self, port: usize) -> Result<f64, DeviceError> {
        (**self).read_input(port)
    }

    fn write_outputs(&mut self, v_ao0: f64, v_ao1: f64) -> Result<(), DeviceError> {
        (**self).write_outputs(v_ao0, v_ao1)
    }

    fn write_digital(&mut self, line: usize, bit: bool) -> Result<(), DeviceError> {
        (**self).write_digital(line, bit)
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        (**self).close()
    }
}
