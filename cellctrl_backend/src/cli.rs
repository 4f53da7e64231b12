//! Pieces shared by the `cycle_cell` and `cycle_mux` binaries.

use std::path::PathBuf;

use anyhow::{bail, Context};
use cellcycle_backend::{
    Bench, CellTestConfig, CellTestConfigBuilder, CycleController, InstrumentAdapter, LogObserver,
    RunReport, Runner, SimInstrument, StopToken, SystemClock,
};
use clap::Args;
use log::{error, info};

use crate::stop::{install_interrupt_handler, spawn_stdin_watcher};
use crate::storage::JsonlSink;

/// Options common to both binaries.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// YAML file overriding the default test configuration.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory receiving the `testdata_<id>.jsonl.gz` files.
    #[arg(long, default_value = ".")]
    pub data_dir: PathBuf,

    /// NI-DAQmx device name.
    #[arg(long, default_value = "Dev1")]
    pub device: String,

    /// Overrides `max_cycles` from the configuration.
    #[arg(long)]
    pub max_cycles: Option<u32>,

    /// Run against a simulated battery bank instead of hardware.
    #[arg(long)]
    pub simulate: bool,

    /// With --simulate, run this many times faster than real time.
    #[arg(long, default_value_t = 1.0)]
    pub time_scale: f64,
}

impl CommonArgs {
    pub fn load_config(&self) -> anyhow::Result<CellTestConfig> {
        let config = match &self.config {
            Some(path) => CellTestConfig::load(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => CellTestConfig::default(),
        };
        let config = match self.max_cycles {
            Some(max_cycles) => CellTestConfigBuilder::from_config(config)
                .max_cycles(max_cycles)
                .build()?,
            None => config,
        };
        if !(self.time_scale.is_finite() && self.time_scale > 0.0) {
            bail!("--time-scale must be a positive number, got {}", self.time_scale);
        }
        if self.time_scale != 1.0 && !self.simulate {
            bail!("--time-scale only applies to --simulate runs");
        }
        Ok(config)
    }
}

pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[cfg(feature = "nidaqmx")]
fn open_device(device: &str) -> anyhow::Result<Box<dyn InstrumentAdapter>> {
    let instrument = crate::daq::NiInstrument::open(device)
        .with_context(|| format!("opening NI device {}", device))?;
    Ok(Box::new(instrument))
}

#[cfg(not(feature = "nidaqmx"))]
fn open_device(device: &str) -> anyhow::Result<Box<dyn InstrumentAdapter>> {
    bail!(
        "cannot open {}: built without the `nidaqmx` feature (use --simulate)",
        device
    )
}

/// Runs `controller` to completion on the selected instrument.
///
/// `simulated` builds the stand-in instrument and is only called with `--simulate`.
pub fn run_test<T: CycleController>(
    controller: T,
    args: &CommonArgs,
    simulated: impl FnOnce() -> SimInstrument,
) -> anyhow::Result<RunReport> {
    let instrument: Box<dyn InstrumentAdapter> = if args.simulate {
        info!("Simulating the bench at {}x real time", args.time_scale);
        Box::new(simulated())
    } else {
        open_device(&args.device)?
    };
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating data directory {}", args.data_dir.display()))?;

    let (handle, token) = StopToken::channel();
    install_interrupt_handler(handle.clone()).context("installing the Ctrl-C handler")?;
    spawn_stdin_watcher(handle).context("starting the stdin watcher")?;
    info!("Type \"stop\" and press enter, or press Ctrl-C, to end the test early");

    let sink = JsonlSink::new(args.data_dir.clone());
    info!("Writing battery data to {}", sink.dir().display());
    let bench = Bench::new(instrument, SystemClock::scaled(args.time_scale), sink)
        .with_observer(LogObserver)
        .with_stop_token(token);

    let mut runner = Runner::new(controller, bench);
    let outcome = runner.run();
    let bench = runner.bench_mut();
    if let Err(e) = bench.close() {
        error!("Failed to close the instrument: {}", e);
    }
    if let Err(e) = bench.sink.finish() {
        error!("Failed to complete the data files: {}", e);
    }
    let report = outcome.context("battery test failed")?;
    log_report(&report);
    Ok(report)
}

pub fn log_report(report: &RunReport) {
    info!("Completed {} cycle(s)", report.cycles_completed);
    for (cell, cycles) in &report.cells {
        for c in cycles {
            info!(
                "{} cycle {}: {} samples over {:.0} s, {:.3} V .. {:.3} V",
                cell, c.cycle, c.samples, c.duration_s, c.min_v, c.max_v
            );
        }
    }
}
