//! [`InstrumentAdapter`] backed by an NI-DAQmx device.
//!
//! Both analog outputs live in one task that stays open for the whole test, so a
//! `write_outputs` call updates AO0 and AO1 together. Analog reads and digital writes are
//! software-timed one-shots on short-lived tasks.

use cellcycle_backend::{DeviceError, DeviceOp, InstrumentAdapter};
use log::info;

use crate::nidaqmx::{reset_ni_device, NiTask};

pub struct NiInstrument {
    device: String,
    digital_port: usize,
    ao_task: Option<NiTask>,
}

impl NiInstrument {
    /// Resets `device` and opens its two analog outputs.
    pub fn open(device: &str) -> Result<Self, DeviceError> {
        reset_ni_device(device)?;
        let ao_task = NiTask::new(DeviceOp::Open)?;
        ao_task.create_ao_chan(&format!("{}/ao0:1", device))?;
        info!("Opened NI device {}", device);
        Ok(Self {
            device: device.to_string(),
            digital_port: 0,
            ao_task: Some(ao_task),
        })
    }

    /// Digital port holding the routing address lines (port 0 unless set).
    pub fn with_digital_port(mut self, port: usize) -> Self {
        self.digital_port = port;
        self
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

impl InstrumentAdapter for NiInstrument {
    fn read_input(&mut self, port: usize) -> Result<f64, DeviceError> {
        let task = NiTask::new(DeviceOp::ReadInput)?;
        task.create_ai_chan(&format!("{}/ai{}", self.device, port))?;
        task.read_analog_scalar()
    }

    fn write_outputs(&mut self, v_ao0: f64, v_ao1: f64) -> Result<(), DeviceError> {
        let task = self
            .ao_task
            .as_ref()
            .ok_or_else(|| DeviceError::new(DeviceOp::WriteOutputs, "device is closed"))?;
        task.write_analog_sample(&[v_ao0, v_ao1])?;
        Ok(())
    }

    fn write_digital(&mut self, line: usize, bit: bool) -> Result<(), DeviceError> {
        let task = NiTask::new(DeviceOp::WriteDigital)?;
        task.create_do_chan(&format!(
            "{}/port{}/line{}",
            self.device, self.digital_port, line
        ))?;
        task.write_digital_line(bit)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if let Some(task) = self.ao_task.take() {
            task.stop(DeviceOp::Close)?;
            info!("Closed NI device {}", self.device);
        }
        Ok(())
    }
}
