use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::TerminationCause;
use crate::error::SimError;

/// State emitted at caller-chosen intervals, and the only way to resume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    pub time: f64,
    #[serde(default)]
    pub events: u64,
    pub populations: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<TerminationCause>,
}

impl Snapshot {
    pub fn validate(&self) -> Result<(), SimError> {
        if !(self.time.is_finite() && self.time >= 0.0) {
            return Err(SimError::invalid(format!(
                "snapshot time must be finite and non-negative, got {}",
                self.time
            )));
        }
        if self.populations.keys().any(String::is_empty) {
            return Err(SimError::invalid("snapshot holds an unnamed compound"));
        }
        Ok(())
    }

    pub fn from_json(text: &str) -> Result<Self, SimError> {
        let snapshot: Snapshot = serde_json::from_str(text)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Reads the last snapshot of a JSON-lines file (or a file holding a
    /// single snapshot).
    pub fn read_last(path: &Path) -> Result<Self, SimError> {
        let reader = BufReader::new(File::open(path)?);
        let mut last = None;
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                last = Some(line);
            }
        }
        match last {
            Some(line) => Self::from_json(&line),
            None => Err(SimError::invalid(format!(
                "no snapshot found in {}",
                path.display()
            ))),
        }
    }
}

pub trait SnapshotSink {
    fn emit(&mut self, snapshot: &Snapshot) -> Result<(), SimError>;
}

/// Writes one JSON document per line.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self, SimError> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> SnapshotSink for JsonLinesSink<W> {
    fn emit(&mut self, snapshot: &Snapshot) -> Result<(), SimError> {
        serde_json::to_writer(&mut self.writer, snapshot)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps every snapshot in memory.
#[derive(Default, Debug)]
pub struct MemorySink {
    pub snapshots: Vec<Snapshot>,
}

impl SnapshotSink for MemorySink {
    fn emit(&mut self, snapshot: &Snapshot) -> Result<(), SimError> {
        self.snapshots.push(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ConvergedBy;

    fn sample() -> Snapshot {
        let mut populations = BTreeMap::new();
        populations.insert("A".to_string(), 9);
        populations.insert("C".to_string(), 1);
        Snapshot {
            time: 0.25,
            events: 1,
            populations,
            cause: Some(TerminationCause::Converged(ConvergedBy::TimeLimit)),
        }
    }

    #[test]
    fn json_lines_sink_writes_one_line_per_snapshot() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.emit(&sample()).unwrap();
        sink.emit(&sample()).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(Snapshot::from_json(lines[1]).unwrap(), sample());
    }

    #[test]
    fn malformed_resume_data_is_an_input_error() {
        assert!(Snapshot::from_json("{\"time\": 1.0}").unwrap_err().is_input_error());
        let negative = "{\"time\": -1.0, \"populations\": {}}";
        assert!(Snapshot::from_json(negative).unwrap_err().is_input_error());
        let unnamed = "{\"time\": 1.0, \"populations\": {\"\": 3}}";
        assert!(Snapshot::from_json(unnamed).unwrap_err().is_input_error());
    }

    #[test]
    fn reads_the_last_snapshot_of_a_file() {
        let file = format!("reactnet-snapshot-{}.jsonl", std::process::id());
        let path = std::env::temp_dir().join(file);
        {
            let mut sink = JsonLinesSink::create(&path).unwrap();
            let mut first = sample();
            first.events = 0;
            sink.emit(&first).unwrap();
            sink.emit(&sample()).unwrap();
        }
        let last = Snapshot::read_last(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(last.events, 1);
    }
}
