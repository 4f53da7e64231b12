//! Provides a minimal rust wrapper for the on-demand parts of the NI-DAQmx C library.
//!
//! ## Overview
//!
//! The core of this module is the [`NiTask`] struct which represents an NI-DAQmx task. It encapsulates
//! a handle to an NI-DAQmx task and provides methods that map to the DAQmx C-functions needed for
//! software-timed I/O: creating analog input, analog output and digital output channels, and
//! reading or writing a single sample on them.
//!
//! Additionally, the module provides [`daqmx_call`] and [`reset_ni_device`] to simplify error
//! handling and device interactions.
//!
//! **Refer to implementations of the [`NiTask`] struct to see the wrapped methods and invoked
//! [DAQmx C-functions](https://www.ni.com/docs/en-US/bundle/ni-daqmx-c-api-ref/page/cdaqmx/help_file_title.html)**
//!
//! ## Safety and Error Handling
//!
//! Every DAQmx call goes through [`daqmx_call`], which turns a negative status code into a
//! [`DeviceError`] carrying the driver's extended error message. In addition to being returned,
//! NI-DAQmx driver errors are appended to a `nidaqmx_error.logs` file in the directory of the
//! calling shell.
//!
//! ## Cleanup and Resource Management
//!
//! [`NiTask`] implements `Drop` and clears its task handle when it goes out of scope.
//!
//! ## Further Reading
//!
//! [NI-DAQmx C Reference](https://www.ni.com/docs/en-US/bundle/ni-daqmx-c-api-ref/page/cdaqmx/help_file_title.html).

use cellcycle_backend::{DeviceError, DeviceOp};
use libc;
use log::error;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write;

type CConstStr = *const libc::c_char;
type CCharBuf = *mut libc::c_char;
type CFloat64 = libc::c_double;
type CUint32 = libc::c_uint;
type CBool32 = libc::c_uint;
type CInt32 = libc::c_int;
pub type TaskHandle = *mut libc::c_void;

pub const DAQMX_VAL_VOLTS: CInt32 = 10348;
pub const DAQMX_VAL_CFG_DEFAULT: CInt32 = -1;
pub const DAQMX_VAL_GROUPBYSCANNUMBER: CBool32 = 1;
pub const DAQMX_VAL_CHANPERLINE: CInt32 = 0;

/// Timeout for a single on-demand read or write, in seconds.
pub const ON_DEMAND_TIMEOUT: CFloat64 = 10.0;

#[link(name = "NIDAQmx")]
extern "C" {
    fn DAQmxResetDevice(name: CConstStr) -> CInt32;
    fn DAQmxGetExtendedErrorInfo(errorString: CCharBuf, bufferSize: CUint32) -> CInt32;

    fn DAQmxCreateTask(taskName: CConstStr, taskHandle_ptr: &mut TaskHandle) -> CInt32;
    fn DAQmxStopTask(handle: TaskHandle) -> CInt32;
    fn DAQmxClearTask(handle: TaskHandle) -> CInt32;

    fn DAQmxCreateAIVoltageChan(
        handle: TaskHandle,
        name: CConstStr,
        assigned_name: CConstStr,
        terminalConfig: CInt32,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;
    fn DAQmxCreateAOVoltageChan(
        handle: TaskHandle,
        name: CConstStr,
        assigned_name: CConstStr,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;
    fn DAQmxCreateDOChan(
        handle: TaskHandle,
        lines: CConstStr,
        name: CConstStr,
        lineGrouping: CInt32,
    ) -> CInt32;

    fn DAQmxReadAnalogScalarF64(
        handle: TaskHandle,
        timeout: CFloat64,
        value: *mut CFloat64,
        reserved: *mut CBool32,
    ) -> CInt32;
    fn DAQmxWriteAnalogF64(
        handle: TaskHandle,
        seqLen: CInt32,
        autoStart: CBool32,
        timeout: CFloat64,
        dataLayout: CBool32,
        writeArray: *const CFloat64,
        sampsPerChanWritten: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
    fn DAQmxWriteDigitalLines(
        handle: TaskHandle,
        seqLen: CInt32,
        autoStart: CBool32,
        timeout: CFloat64,
        dataLayout: CBool32,
        writeArray: *const u8,
        sampsPerChanWritten: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
}

/// Calls a DAQmx C-function and converts a failure into a [`DeviceError`].
///
/// Every DAQmx C-function returns an `int32` which, if negative, indicates an error. In that
/// case the extended error information is fetched with `DAQmxGetExtendedErrorInfo`, appended to
/// `nidaqmx_error.logs`, and returned as the error detail for `op`.
///
/// # Examples
///
/// ```ignore
/// daqmx_call(DeviceOp::Open, || unsafe { DAQmxSomeFunction(param1, param2) })?;
/// ```
pub fn daqmx_call<F: FnOnce() -> CInt32>(op: DeviceOp, func: F) -> Result<(), DeviceError> {
    let err_code = func();
    if err_code >= 0 {
        return Ok(());
    }
    let mut err_buff = [0 as libc::c_char; 2048];
    unsafe {
        DAQmxGetExtendedErrorInfo(err_buff.as_mut_ptr(), 2048 as CUint32);
    }
    let error_string = unsafe { std::ffi::CStr::from_ptr(err_buff.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    let logged = OpenOptions::new()
        .append(true)
        .create(true)
        .open("./nidaqmx_error.logs")
        .and_then(|mut file| writeln!(file, "DAQmx Error ({}): {}", op, error_string));
    if let Err(e) = logged {
        error!("Failed to write to nidaqmx_error.logs: {}", e);
    }
    Err(DeviceError::new(
        op,
        format!("DAQmx error {}: {}", err_code, error_string),
    ))
}

fn to_cstring(op: DeviceOp, s: &str) -> Result<CString, DeviceError> {
    CString::new(s).map_err(|_| DeviceError::new(op, format!("{:?} contains a NUL byte", s)))
}

/// Resets a specified National Instruments (NI) device.
///
/// # Example
/// ```ignore
/// # use cellctrl_backend::nidaqmx::*;
/// reset_ni_device("Dev1")?;
/// ```
pub fn reset_ni_device(name: &str) -> Result<(), DeviceError> {
    let name_cstr = to_cstring(DeviceOp::Open, name)?;
    daqmx_call(DeviceOp::Open, || unsafe { DAQmxResetDevice(name_cstr.as_ptr()) })
}

/// Represents a National Instruments (NI) DAQmx task.
///
/// Creating an instance of this struct corresponds to creating a new NI-DAQmx task; the
/// task is cleared when the instance is dropped.
///
/// ```ignore
/// let task = NiTask::new(DeviceOp::ReadInput)?;
/// task.create_ai_chan("Dev1/ai0")?;
/// let volts = task.read_analog_scalar()?;
/// ```
pub struct NiTask {
    handle: TaskHandle,
}

impl NiTask {
    pub fn new(op: DeviceOp) -> Result<Self, DeviceError> {
        let mut taskhandle: TaskHandle = std::ptr::null_mut();
        let task_name_cstr = to_cstring(op, "")?;
        daqmx_call(op, || unsafe {
            DAQmxCreateTask(task_name_cstr.as_ptr(), &mut taskhandle)
        })?;
        Ok(Self { handle: taskhandle })
    }

    pub fn stop(&self, op: DeviceOp) -> Result<(), DeviceError> {
        daqmx_call(op, || unsafe { DAQmxStopTask(self.handle) })
    }

    /// Single-ended or differential according to the device default, ±10 V.
    pub fn create_ai_chan(&self, name: &str) -> Result<(), DeviceError> {
        let op = DeviceOp::ReadInput;
        let name_cstr = to_cstring(op, name)?;
        let assigned_name_cstr = to_cstring(op, "")?;
        daqmx_call(op, || unsafe {
            DAQmxCreateAIVoltageChan(
                self.handle,
                name_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                DAQMX_VAL_CFG_DEFAULT,
                -10.,
                10.,
                DAQMX_VAL_VOLTS,
                std::ptr::null(),
            )
        })
    }

    /// `name` may span several outputs, e.g. `Dev1/ao0:1`.
    pub fn create_ao_chan(&self, name: &str) -> Result<(), DeviceError> {
        let op = DeviceOp::WriteOutputs;
        let name_cstr = to_cstring(op, name)?;
        let assigned_name_cstr = to_cstring(op, "")?;
        daqmx_call(op, || unsafe {
            DAQmxCreateAOVoltageChan(
                self.handle,
                name_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                -10.,
                10.,
                DAQMX_VAL_VOLTS,
                std::ptr::null(),
            )
        })
    }

    pub fn create_do_chan(&self, name: &str) -> Result<(), DeviceError> {
        let op = DeviceOp::WriteDigital;
        let name_cstr = to_cstring(op, name)?;
        let assigned_name_cstr = to_cstring(op, "")?;
        daqmx_call(op, || unsafe {
            DAQmxCreateDOChan(
                self.handle,
                name_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                DAQMX_VAL_CHANPERLINE,
            )
        })
    }

    pub fn read_analog_scalar(&self) -> Result<f64, DeviceError> {
        let mut value: CFloat64 = 0.0;
        daqmx_call(DeviceOp::ReadInput, || unsafe {
            DAQmxReadAnalogScalarF64(
                self.handle,
                ON_DEMAND_TIMEOUT,
                &mut value as *mut CFloat64,
                std::ptr::null_mut(),
            )
        })?;
        Ok(value as f64)
    }

    /// Writes one sample per channel, in channel order, and starts the task if needed.
    pub fn write_analog_sample(&self, values: &[f64]) -> Result<usize, DeviceError> {
        let mut nwritten: CInt32 = 0;
        daqmx_call(DeviceOp::WriteOutputs, || unsafe {
            DAQmxWriteAnalogF64(
                self.handle,
                1,
                true as CBool32,
                ON_DEMAND_TIMEOUT,
                DAQMX_VAL_GROUPBYSCANNUMBER,
                values.as_ptr(),
                &mut nwritten as *mut CInt32,
                std::ptr::null_mut(),
            )
        })?;
        Ok(nwritten as usize)
    }

    pub fn write_digital_line(&self, bit: bool) -> Result<usize, DeviceError> {
        let mut nwritten: CInt32 = 0;
        let data = [bit as u8];
        daqmx_call(DeviceOp::WriteDigital, || unsafe {
            DAQmxWriteDigitalLines(
                self.handle,
                1,
                true as CBool32,
                ON_DEMAND_TIMEOUT,
                DAQMX_VAL_GROUPBYSCANNUMBER,
                data.as_ptr(),
                &mut nwritten as *mut CInt32,
                std::ptr::null_mut(),
            )
        })?;
        Ok(nwritten as usize)
    }
}

// Define deletion behavior
impl Drop for NiTask {
    fn drop(&mut self) {
        let _ = daqmx_call(DeviceOp::Close, || unsafe { DAQmxClearTask(self.handle) });
    }
}

// The handle is only ever used from the thread that owns the task.
unsafe impl Send for NiTask {}
