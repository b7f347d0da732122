// Scalar metric sinks
//
// The trainer emits `Loss` and `Accuracy` groups with `Train`/`Val` series per
// epoch. `ScalarWriter` appends them as JSON lines for the aggregator.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::errors::Result;

/// Name of the scalar event file inside a run log directory
pub const SCALARS_FILE: &str = "scalars.jsonl";

/// One scalar sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    /// `<group>/<series>`, e.g. `Loss/Train`
    pub tag: String,
    pub step: usize,
    pub value: f64,
    /// Seconds since the unix epoch
    pub wall_time: f64,
}

/// Destination for per-epoch scalar metrics
pub trait MetricsSink {
    /// Record several series of one group at the same step
    fn add_scalars(&mut self, group: &str, values: &[(&str, f64)], step: usize) -> Result<()>;
}

/// Appends scalar events to `<log_dir>/scalars.jsonl`
pub struct ScalarWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ScalarWriter {
    pub fn new(log_dir: &Path) -> Result<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(SCALARS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for ScalarWriter {
    fn add_scalars(&mut self, group: &str, values: &[(&str, f64)], step: usize) -> Result<()> {
        let wall_time = Utc::now().timestamp_micros() as f64 / 1e6;
        for (series, value) in values {
            let event = ScalarEvent {
                tag: format!("{}/{}", group, series),
                step,
                value: *value,
                wall_time,
            };
            serde_json::to_writer(&mut self.writer, &event)?;
            self.writer.write_all(b"\n")?;
        }
        // Flushed per group so the file is complete before the log dir is mirrored
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps events in memory; clones share the same buffer
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Rc<RefCell<Vec<ScalarEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ScalarEvent> {
        self.events.borrow().clone()
    }

    /// Values of one tag in emission order
    pub fn series(&self, tag: &str) -> Vec<(usize, f64)> {
        self.events
            .borrow()
            .iter()
            .filter(|e| e.tag == tag)
            .map(|e| (e.step, e.value))
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn add_scalars(&mut self, group: &str, values: &[(&str, f64)], step: usize) -> Result<()> {
        let mut events = self.events.borrow_mut();
        for (series, value) in values {
            events.push(ScalarEvent {
                tag: format!("{}/{}", group, series),
                step,
                value: *value,
                wall_time: 0.0,
            });
        }
        Ok(())
    }
}

/// Read every event from a scalar file
pub fn read_scalars(path: &Path) -> Result<Vec<ScalarEvent>> {
    let contents = fs::read_to_string(path)?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}
