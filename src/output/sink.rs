//! Record and monitor sinks
//!
//! The formatter owns exactly one [`RecordSink`] and one [`MonitorSink`] and
//! calls them from its own thread only.

use super::record::OutputRecord;
use crate::error::{ReadoutError, Result, ResultExt};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Downstream consumer of output records
pub trait RecordSink: Send {
    /// Accept one record
    fn commit(&mut self, record: &OutputRecord) -> Result<()>;

    /// Push anything buffered to its destination
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Consumer of monitor-stack entries
pub trait MonitorSink: Send {
    fn forward(&mut self, run_number: u32, words: &[u16]) -> Result<()>;
}

// ==================== In-memory sinks ====================

/// Shared in-memory record list
///
/// Clones share the same list, so a test can keep one clone and hand the
/// other to the pipeline.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<OutputRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything committed so far
    pub fn records(&self) -> Vec<OutputRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordSink for MemorySink {
    fn commit(&mut self, record: &OutputRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

/// Shared in-memory list of monitor entries
#[derive(Debug, Clone, Default)]
pub struct MemoryMonitor {
    entries: Arc<Mutex<Vec<(u32, Vec<u16>)>>>,
}

impl MemoryMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(u32, Vec<u16>)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MonitorSink for MemoryMonitor {
    fn forward(&mut self, run_number: u32, words: &[u16]) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((run_number, words.to_vec()));
        Ok(())
    }
}

/// Monitor sink that only traces what it receives
#[derive(Debug, Default)]
pub struct LogMonitor {
    forwarded: u64,
}

impl LogMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }
}

impl MonitorSink for LogMonitor {
    fn forward(&mut self, run_number: u32, words: &[u16]) -> Result<()> {
        self.forwarded += 1;
        tracing::trace!(run_number, words = words.len(), "Monitor entry");
        Ok(())
    }
}

// ==================== JSON lines ====================

/// Writes one JSON object per record, one record per line
pub struct JsonLinesSink {
    writer: BufWriter<File>,
    path: PathBuf,
    records_written: u64,
}

impl JsonLinesSink {
    /// Create (or truncate) the output file
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Creating output directory {:?}", parent))?;
            }
        }
        let file =
            File::create(&path).with_context(|| format!("Creating record file {:?}", path))?;
        tracing::info!("Writing JSON-lines records to {:?}", path);
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            records_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }
}

impl RecordSink for JsonLinesSink {
    fn commit(&mut self, record: &OutputRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)
            .map_err(|e| ReadoutError::Serialization(e.to_string()))?;
        self.writer.write_all(b"\n").context("Writing record")?;
        self.records_written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("Flushing record file")
    }
}

impl Drop for JsonLinesSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::error!("Failed to flush {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use tempfile::TempDir;

    fn count(n: u64) -> OutputRecord {
        OutputRecord::Count {
            run_number: 1,
            events_so_far: n,
            run_offset: n,
        }
    }

    #[test]
    fn test_memory_sink_shares_records() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.commit(&count(1)).unwrap();
        writer.commit(&count(2)).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.records()[1], count(2));
    }

    #[test]
    fn test_json_lines_sink() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("records.jsonl");
        {
            let mut sink = JsonLinesSink::create(&path).unwrap();
            for n in 0..3 {
                sink.commit(&count(n)).unwrap();
            }
            sink.flush().unwrap();
            assert_eq!(sink.records_written(), 3);
        }

        let file = std::io::BufReader::new(File::open(&path).unwrap());
        let records: Vec<OutputRecord> = file
            .lines()
            .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
            .collect();
        assert_eq!(records, vec![count(0), count(1), count(2)]);
    }

    #[test]
    fn test_monitor_sinks() {
        let monitor = MemoryMonitor::new();
        let mut writer = monitor.clone();
        writer.forward(5, &[1, 2]).unwrap();
        assert_eq!(monitor.entries(), vec![(5, vec![1, 2])]);

        let mut log = LogMonitor::new();
        log.forward(5, &[1]).unwrap();
        assert_eq!(log.forwarded(), 1);
    }
}
