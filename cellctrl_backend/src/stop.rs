//! Operator stop requests: commands typed on stdin and Ctrl-C.

use std::io::{self, BufRead};
use std::thread;

use cellcycle_backend::StopHandle;
use log::{info, warn};

/// Command recognised on an input line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorCmd {
    Stop,
}

pub fn parse_command(line: &str) -> Option<OperatorCmd> {
    match line.trim().to_ascii_lowercase().as_str() {
        "stop" | "q" | "quit" => Some(OperatorCmd::Stop),
        _ => None,
    }
}

/// Reads lines until a stop command (forwarded to `handle`) or end of input.
///
/// Returns whether a stop was requested.
pub fn watch_commands<R: BufRead>(reader: R, handle: &StopHandle) -> bool {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Stopped reading operator commands: {}", e);
                return false;
            }
        };
        match parse_command(&line) {
            Some(OperatorCmd::Stop) => {
                info!("Stop requested; outputs will be turned off at the next sample");
                handle.request_stop("operator requested stop");
                return true;
            }
            None if !line.trim().is_empty() => {
                warn!("Unknown command {:?}; type \"stop\" to end the test", line.trim())
            }
            None => {}
        }
    }
    false
}

/// Watches stdin on a background thread.
///
/// The thread is detached: it ends on a stop command, on end of input, or with the process.
pub fn spawn_stdin_watcher(handle: StopHandle) -> io::Result<()> {
    thread::Builder::new()
        .name("stdin-watcher".to_string())
        .spawn(move || {
            watch_commands(io::stdin().lock(), &handle);
        })?;
    Ok(())
}

fn on_interrupt(handle: &StopHandle) {
    warn!("Interrupted; turning outputs off before exiting");
    handle.request_stop("interrupted");
}

/// Turns Ctrl-C into a stop request.
///
/// The process keeps running until the controller has turned the outputs off.
pub fn install_interrupt_handler(handle: StopHandle) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || on_interrupt(&handle))
}
