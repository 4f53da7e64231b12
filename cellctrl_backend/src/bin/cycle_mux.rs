//! Cycles the bank of batteries behind the 16-way routing switch.
//!
//! ```text
//! cycle_mux --data-dir data --simulate --time-scale 600
//! ```

use anyhow::bail;
use cellcycle_backend::{MultiplexedController, RoutingTable, SimInstrument};
use cellctrl_backend::cli::{init_logging, run_test, CommonArgs};
use clap::Parser;

/// Batteries on the bench and the switch output each one is wired to.
const BANK: [(&str, u8); 5] = [
    ("BBM04r8", 0),
    ("BBM05r8", 1),
    ("BBM06r8", 2),
    ("BBM07r8", 3),
    ("BBM08r8", 4),
];

#[derive(Parser, Debug)]
#[command(about = "Charge/discharge cycling of a multiplexed battery bank")]
struct Cli {
    /// Digital lines wired to the switch address inputs A0, A1, A2, A3.
    #[arg(long, value_delimiter = ',', default_values_t = [0usize, 1, 2, 3])]
    address_lines: Vec<usize>,

    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = cli.common.load_config()?;
    let lines: [usize; 4] = match cli.address_lines.as_slice() {
        &[a0, a1, a2, a3] => [a0, a1, a2, a3],
        other => bail!("--address-lines needs exactly 4 lines, got {}", other.len()),
    };
    let routing = RoutingTable::from_pairs(BANK)?.with_address_lines(lines)?;
    let controller = MultiplexedController::new(config.clone(), routing)?;

    // Slightly different simulated cells so the bank does not move in lockstep.
    let sim_cells: Vec<(u8, f64, f64)> = BANK
        .iter()
        .enumerate()
        .map(|(i, &(_, output))| (output, 3.6 + 0.05 * i as f64, 0.8 + 0.1 * i as f64))
        .collect();
    run_test(controller, &cli.common, || {
        SimInstrument::battery_bank(&config, &sim_cells).with_address_lines(lines)
    })?;
    Ok(())
}
