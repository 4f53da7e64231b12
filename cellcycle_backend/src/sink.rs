//! Append-only per-cell sample storage.
//!
//! A sink keeps one series per cell id with four parallel columns (`time`, `type`, `cycle`,
//! `voltage`). [`PersistenceSink::init_series`] is called once per cell before its first sample;
//! every [`PersistenceSink::append_sample`] must either land or return an error, a dropped sample
//! is never reported as written.

use indexmap::IndexMap;

use crate::error::PersistenceError;
use crate::sample::Sample;

pub trait PersistenceSink {
    fn init_series(&mut self, cell_id: &str) -> Result<(), PersistenceError>;
    fn append_sample(&mut self, cell_id: &str, sample: &Sample) -> Result<(), PersistenceError>;
}

impl<T: PersistenceSink + ?Sized> PersistenceSink for Box<T> {
    fn init_series(&mut self, cell_id: &str) -> Result<(), PersistenceError> {
        (**self).init_series(cell_id)
    }

    fn append_sample(&mut self, cell_id: &str, sample: &Sample) -> Result<(), PersistenceError> {
        (**self).append_sample(cell_id, sample)
    }
}

/// Keeps every series in memory, in the order cells were initialised.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    series: IndexMap<String, Vec<Sample>>,
    append_budget: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that accepts `appends` samples in total and fails every append after that.
    pub fn failing_after(appends: usize) -> Self {
        Self {
            series: IndexMap::new(),
            append_budget: Some(appends),
        }
    }

    pub fn series(&self, cell_id: &str) -> Option<&[Sample]> {
        self.series.get(cell_id).map(|samples| samples.as_slice())
    }

    pub fn cell_ids(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(|id| id.as_str())
    }
}

impl PersistenceSink for MemorySink {
    fn init_series(&mut self, cell_id: &str) -> Result<(), PersistenceError> {
        if self.series.contains_key(cell_id) {
            return Err(PersistenceError::SeriesExists(cell_id.to_string()));
        }
        self.series.insert(cell_id.to_string(), Vec::new());
        Ok(())
    }

    fn append_sample(&mut self, cell_id: &str, sample: &Sample) -> Result<(), PersistenceError> {
        if let Some(budget) = self.append_budget.as_mut() {
            if *budget == 0 {
                return Err(PersistenceError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "storage full",
                )));
            }
            *budget -= 1;
        }
        self.series
            .get_mut(cell_id)
            .ok_or_else(|| PersistenceError::UnknownSeries(cell_id.to_string()))?
            .push(*sample);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::PhaseLabel;

    fn sample(voltage: f64) -> Sample {
        Sample {
            elapsed_seconds: 0.0,
            voltage,
            cycle_index: 1,
            phase_label: PhaseLabel::Charging,
        }
    }

    #[test]
    fn appends_require_an_initialised_series() {
        let mut sink = MemorySink::new();
        assert!(matches!(
            sink.append_sample("BBM04", &sample(3.7)),
            Err(PersistenceError::UnknownSeries(_))
        ));
        sink.init_series("BBM04").unwrap();
        sink.append_sample("BBM04", &sample(3.7)).unwrap();
        assert_eq!(sink.series("BBM04").unwrap().len(), 1);
    }

    #[test]
    fn series_cannot_be_initialised_twice() {
        let mut sink = MemorySink::new();
        sink.init_series("BBM04").unwrap();
        assert!(matches!(
            sink.init_series("BBM04"),
            Err(PersistenceError::SeriesExists(_))
        ));
    }

    #[test]
    fn failing_sink_surfaces_the_error() {
        let mut sink = MemorySink::failing_after(1);
        sink.init_series("a").unwrap();
        sink.append_sample("a", &sample(3.7)).unwrap();
        assert!(sink.append_sample("a", &sample(3.6)).is_err());
        assert_eq!(sink.series("a").unwrap().len(), 1);
    }
}
