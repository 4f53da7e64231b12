//! Cycles one battery wired straight to the instrument.
//!
//! ```text
//! cycle_cell id=BBM04r8 --data-dir data --simulate --time-scale 600
//! ```

use anyhow::Context;
use cellcycle_backend::{parse_battery_arg, SimInstrument, SingleCellController};
use cellctrl_backend::cli::{init_logging, run_test, CommonArgs};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "Charge/discharge cycling of a single battery")]
struct Cli {
    /// Battery to test, as `id=<battery id>`.
    battery: String,

    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let id = parse_battery_arg(&cli.battery)?;
    let config = cli.common.load_config()?;
    let controller = SingleCellController::new(&id, config.clone())
        .with_context(|| format!("setting up battery {}", id))?;

    run_test(controller, &cli.common, || {
        SimInstrument::battery_bank(&config, &[(0, 3.7, 1.0)])
    })?;
    Ok(())
}
