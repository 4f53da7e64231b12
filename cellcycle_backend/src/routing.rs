//! Routing switch addressing for the multiplexed bench.
//!
//! A 16-way analog multiplexer connects one cell at a time to the shared drive and measurement
//! lines. Its four address inputs A0..A3 are wired to digital lines of the instrument; output
//! `index` is selected by presenting `index` in plain binary (`Ak` is bit `k`).
//!
//! Selecting a cell writes A3, A2, A1, A0 in that order and then waits the settle delay. A reading
//! taken before the switch has settled is meaningless, so [`RoutingTable::select`] only returns
//! once the delay has passed.

use std::time::Duration;

use indexmap::IndexMap;

use crate::bench::Bench;
use crate::clock::Clock;
use crate::config::validate_battery_id;
use crate::error::{ConfigError, CycleError};
use crate::events::TestEvent;
use crate::instrument::InstrumentAdapter;
use crate::sink::PersistenceSink;

/// Digital lines driving A0, A1, A2, A3 unless configured otherwise.
pub const DEFAULT_ADDRESS_LINES: [usize; 4] = [0, 1, 2, 3];
/// Time allowed for the switch to propagate a new address.
pub const SETTLE_DELAY: Duration = Duration::from_millis(50);

/// One of the sixteen switch outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SwitchAddress(u8);

impl SwitchAddress {
    pub fn new(index: u8) -> Result<Self, ConfigError> {
        if index > 15 {
            return Err(ConfigError::invalid(format!(
                "switch output index {} is outside 0..=15",
                index
            )));
        }
        Ok(Self(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }

    /// Level of address input `Ak`.
    pub fn bit(self, k: usize) -> bool {
        (self.0 >> k) & 1 == 1
    }

    /// Address levels ordered `(A3, A2, A1, A0)`.
    pub fn lines(self) -> [bool; 4] {
        [self.bit(3), self.bit(2), self.bit(1), self.bit(0)]
    }
}

/// Maps battery ids to switch outputs, in the order cells are sampled.
#[derive(Clone, Debug)]
pub struct RoutingTable {
    entries: IndexMap<String, SwitchAddress>,
    address_lines: [usize; 4],
    settle_delay: Duration,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
            address_lines: DEFAULT_ADDRESS_LINES,
            settle_delay: SETTLE_DELAY,
        }
    }

    /// Builds a table from `(battery id, switch output)` pairs.
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, u8)>,
    ) -> Result<Self, ConfigError> {
        let mut table = Self::new();
        for (id, index) in pairs {
            table.insert(id, index)?;
        }
        Ok(table)
    }

    /// Digital lines wired to `[A0, A1, A2, A3]`.
    pub fn with_address_lines(mut self, lines: [usize; 4]) -> Result<Self, ConfigError> {
        for (i, line) in lines.iter().enumerate() {
            if lines[..i].contains(line) {
                return Err(ConfigError::invalid(format!(
                    "digital line {} is assigned to more than one address input",
                    line
                )));
            }
        }
        self.address_lines = lines;
        Ok(self)
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn insert(&mut self, id: &str, index: u8) -> Result<(), ConfigError> {
        validate_battery_id(id)?;
        let address = SwitchAddress::new(index)?;
        if self.entries.contains_key(id) {
            return Err(ConfigError::invalid(format!("battery {} is listed twice", id)));
        }
        if let Some((other, _)) = self.entries.iter().find(|(_, a)| **a == address) {
            return Err(ConfigError::invalid(format!(
                "batteries {} and {} share switch output {}",
                other, id, index
            )));
        }
        self.entries.insert(id.to_string(), address);
        Ok(())
    }

    /// Address levels `(A3, A2, A1, A0)` for switch output `index`.
    pub fn address(index: u8) -> Result<[bool; 4], ConfigError> {
        Ok(SwitchAddress::new(index)?.lines())
    }

    pub fn lookup(&self, id: &str) -> Option<SwitchAddress> {
        self.entries.get(id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, SwitchAddress)> {
        self.entries.iter().map(|(id, a)| (id.as_str(), *a))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// Routes `id` onto the shared lines and waits for the switch to settle.
    pub fn select<I, C, S>(&self, id: &str, bench: &mut Bench<I, C, S>) -> Result<SwitchAddress, CycleError>
    where
        I: InstrumentAdapter,
        C: Clock,
        S: PersistenceSink,
    {
        let address = self.lookup(id).ok_or_else(|| {
            ConfigError::invalid(format!("couldn't identify the switch output for battery {}", id))
        })?;
        for k in (0..4).rev() {
            bench.instrument.write_digital(self.address_lines[k], address.bit(k))?;
        }
        bench.clock.sleep(self.settle_delay);
        bench.emit(TestEvent::CellSelected {
            cell: id.to_string(),
            switch_index: address.index(),
        });
        Ok(address)
    }
}
