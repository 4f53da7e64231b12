//! File-backed [`PersistenceSink`]: one gzip-compressed JSON-lines file per cell.
//!
//! A cell's series lives in `testdata_<id>.jsonl.gz` under the data directory. Every line is one
//! sample with the columns `time`, `type`, `cycle` and `voltage`. The deflate stream is
//! sync-flushed after each sample, so an interrupted test keeps everything recorded up to that
//! point even though the gzip trailer is missing.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use cellcycle_backend::{PersistenceError, PersistenceSink, Sample};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SampleRecord {
    time: f64,
    #[serde(rename = "type")]
    kind: String,
    cycle: u32,
    voltage: f64,
}

impl From<&Sample> for SampleRecord {
    fn from(sample: &Sample) -> Self {
        Self {
            time: sample.elapsed_seconds,
            kind: sample.phase_label.as_str().to_string(),
            cycle: sample.cycle_index,
            voltage: sample.voltage,
        }
    }
}

pub fn series_file_name(cell_id: &str) -> String {
    format!("testdata_{}.jsonl.gz", cell_id)
}

/// Dropping the sink also writes the gzip trailers, but errors are only reported by
/// [`JsonlSink::finish`].
pub struct JsonlSink {
    dir: PathBuf,
    files: BTreeMap<String, GzEncoder<File>>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn series_path(&self, cell_id: &str) -> PathBuf {
        self.dir.join(series_file_name(cell_id))
    }

    /// Completes every open series. Later appends fail with `UnknownSeries`.
    pub fn finish(&mut self) -> Result<(), PersistenceError> {
        for (cell_id, encoder) in std::mem::take(&mut self.files) {
            encoder.finish()?;
            info!("Closed series for battery {}", cell_id);
        }
        Ok(())
    }
}

impl PersistenceSink for JsonlSink {
    fn init_series(&mut self, cell_id: &str) -> Result<(), PersistenceError> {
        if self.files.contains_key(cell_id) {
            return Err(PersistenceError::SeriesExists(cell_id.to_string()));
        }
        let path = self.series_path(cell_id);
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(PersistenceError::SeriesExists(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        info!("Recording battery {} to {}", cell_id, path.display());
        self.files
            .insert(cell_id.to_string(), GzEncoder::new(file, Compression::default()));
        Ok(())
    }

    fn append_sample(&mut self, cell_id: &str, sample: &Sample) -> Result<(), PersistenceError> {
        let writer = self
            .files
            .get_mut(cell_id)
            .ok_or_else(|| PersistenceError::UnknownSeries(cell_id.to_string()))?;
        let mut line = serde_json::to_vec(&SampleRecord::from(sample))
            .map_err(|e| PersistenceError::Encode(e.to_string()))?;
        line.push(b'\n');
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }
}

/// Reads a series written by [`JsonlSink`] back into samples.
///
/// A file whose gzip trailer is missing (the run was killed) yields every flushed sample.
pub fn read_series(path: impl AsRef<Path>) -> Result<Vec<Sample>, PersistenceError> {
    let reader = BufReader::new(MultiGzDecoder::new(File::open(path)?));
    let mut samples = Vec::new();
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        let record: SampleRecord =
            serde_json::from_str(&line).map_err(|e| PersistenceError::Encode(e.to_string()))?;
        samples.push(Sample {
            elapsed_seconds: record.time,
            voltage: record.voltage,
            cycle_index: record.cycle,
            phase_label: record.kind.parse().map_err(PersistenceError::Encode)?,
        });
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellcycle_backend::PhaseLabel;

    fn sample(t: f64, v: f64, label: PhaseLabel) -> Sample {
        Sample {
            elapsed_seconds: t,
            voltage: v,
            cycle_index: 1,
            phase_label: label,
        }
    }

    fn decompress(path: &Path) -> String {
        let mut text = String::new();
        io::Read::read_to_string(&mut MultiGzDecoder::new(File::open(path).unwrap()), &mut text)
            .unwrap();
        text
    }

    #[test]
    fn writes_one_json_object_per_sample() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::new(dir.path());
        sink.init_series("BBM04r8").unwrap();
        sink.append_sample("BBM04r8", &sample(0.0, 3.71, PhaseLabel::StartingTest))
            .unwrap();
        sink.append_sample("BBM04r8", &sample(30.0, 3.65, PhaseLabel::DischargingPulsed))
            .unwrap();
        sink.finish().unwrap();

        let path = dir.path().join("testdata_BBM04r8.jsonl.gz");
        let text = decompress(&path);
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["type"], "starting_test");
        assert_eq!(first["cycle"], 1);
        assert_eq!(text.lines().count(), 2);

        let samples = read_series(&path).unwrap();
        assert_eq!(samples[1], sample(30.0, 3.65, PhaseLabel::DischargingPulsed));
    }

    #[test]
    fn long_series_is_stored_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::new(dir.path());
        sink.init_series("BBM04r8").unwrap();
        for i in 0..500 {
            sink.append_sample("BBM04r8", &sample(30.0 * i as f64, 3.7, PhaseLabel::Discharging))
                .unwrap();
        }
        sink.finish().unwrap();

        let path = sink.series_path("BBM04r8");
        let stored = std::fs::metadata(&path).unwrap().len() as usize;
        assert!(stored < decompress(&path).len() / 2);
        assert_eq!(read_series(&path).unwrap().len(), 500);
    }

    #[test]
    fn flushed_samples_survive_a_missing_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::new(dir.path());
        sink.init_series("BBM04r8").unwrap();
        sink.append_sample("BBM04r8", &sample(0.0, 3.71, PhaseLabel::StartingTest))
            .unwrap();
        sink.append_sample("BBM04r8", &sample(30.0, 3.65, PhaseLabel::Discharging))
            .unwrap();

        // The encoder is still open, as in a killed process.
        let samples = read_series(sink.series_path("BBM04r8")).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].phase_label, PhaseLabel::StartingTest);
    }

    #[test]
    fn never_overwrites_an_existing_series() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("testdata_BBM04r8.jsonl.gz");
        std::fs::write(&existing, "old data\n").unwrap();
        let mut sink = JsonlSink::new(dir.path());
        assert_eq!(sink.dir(), dir.path());

        let err = sink.init_series("BBM04r8").unwrap_err();
        assert!(matches!(err, PersistenceError::SeriesExists(_)));
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "old data\n");
    }

    #[test]
    fn finish_closes_every_series() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::new(dir.path());
        sink.init_series("BBM04r8").unwrap();
        sink.finish().unwrap();
        let err = sink
            .append_sample("BBM04r8", &sample(0.0, 3.7, PhaseLabel::Charging))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::UnknownSeries(_)));
    }

    #[test]
    fn append_needs_an_initialised_series() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::new(dir.path());
        let err = sink
            .append_sample("BBM05r8", &sample(0.0, 3.7, PhaseLabel::Charging))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::UnknownSeries(_)));
    }
}
