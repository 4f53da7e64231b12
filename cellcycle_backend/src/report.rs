//! Column views and per-cycle summaries of recorded samples.

use indexmap::IndexMap;
use ndarray::{s, Array1};

use crate::sample::{PhaseLabel, Sample};

/// A cell's sample history split into columns.
#[derive(Clone, Debug, Default)]
pub struct SampleColumns {
    pub time: Array1<f64>,
    pub cycle: Array1<u32>,
    pub voltage: Array1<f64>,
    pub labels: Vec<PhaseLabel>,
}

/// Statistics for one cycle of one cell.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleSummary {
    pub cycle: u32,
    pub samples: usize,
    pub start_s: f64,
    pub duration_s: f64,
    pub min_v: f64,
    pub max_v: f64,
}

impl SampleColumns {
    pub fn from_samples(samples: &[Sample]) -> Self {
        Self {
            time: samples.iter().map(|s| s.elapsed_seconds).collect(),
            cycle: samples.iter().map(|s| s.cycle_index).collect(),
            voltage: samples.iter().map(|s| s.voltage).collect(),
            labels: samples.iter().map(|s| s.phase_label).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Half-open index ranges of consecutive samples sharing a cycle index.
    pub fn cycle_segments(&self) -> Vec<(u32, std::ops::Range<usize>)> {
        let mut segments = Vec::new();
        let mut start = 0;
        for i in 1..=self.cycle.len() {
            if i == self.cycle.len() || self.cycle[i] != self.cycle[start] {
                segments.push((self.cycle[start], start..i));
                start = i;
            }
        }
        segments
    }

    pub fn summarize(&self) -> Vec<CycleSummary> {
        self.cycle_segments()
            .into_iter()
            .map(|(cycle, range)| {
                let time = self.time.slice(s![range.clone()]);
                let voltage = self.voltage.slice(s![range.clone()]);
                let start_s = time[0];
                CycleSummary {
                    cycle,
                    samples: range.len(),
                    start_s,
                    duration_s: time[time.len() - 1] - start_s,
                    min_v: voltage.fold(f64::INFINITY, |a, &b| a.min(b)),
                    max_v: voltage.fold(f64::NEG_INFINITY, |a, &b| a.max(b)),
                }
            })
            .collect()
    }
}

/// Outcome of a finished run.
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    pub cycles_completed: u32,
    pub cells: IndexMap<String, Vec<CycleSummary>>,
}

impl RunReport {
    pub fn from_histories<'a>(
        cycles_completed: u32,
        histories: impl IntoIterator<Item = (&'a str, &'a [Sample])>,
    ) -> Self {
        let cells = histories
            .into_iter()
            .map(|(id, samples)| (id.to_string(), SampleColumns::from_samples(samples).summarize()))
            .collect();
        Self {
            cycles_completed,
            cells,
        }
    }
}
