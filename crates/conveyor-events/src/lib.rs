//! Job lifecycle event log for conveyor.
//!
//! Events are buffered per delivery and appended to a JSONL file once the
//! delivery has been acknowledged or rejected, giving operators a
//! machine-readable history next to the human-readable status lines.
//!
//! # Example
//!
//! ```
//! use conveyor_events::EventLog;
//! use conveyor_types::{EventType, JobEvent};
//!
//! let mut log = EventLog::new();
//! log.record(JobEvent::now("job-1", EventType::TransactionCommitted));
//! assert_eq!(log.events_for_job("job-1").len(), 1);
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use conveyor_types::JobEvent;

/// In-memory buffer of job events with JSONL persistence.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<JobEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: JobEvent) {
        self.events.push(event);
    }

    /// Append all buffered events to `path`, creating parent directories.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = BufWriter::new(file);
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;

        Ok(())
    }

    /// Append buffered events to `path` and empty the buffer.
    ///
    /// The buffer is emptied even if writing fails.
    pub fn drain_to_file(&mut self, path: &Path) -> Result<()> {
        let written = self.write_to_file(path);
        self.events.clear();
        written
    }

    /// Read every event from a JSONL file; a missing file is an empty log.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| {
                format!("failed to read line from events file {}", path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let event: JobEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {line}"))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    pub fn events_for_job(&self, job: &str) -> Vec<&JobEvent> {
        self.events.iter().filter(|e| e.job == job).collect()
    }

    pub fn all_events(&self) -> &[JobEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
