//! Message sink: ordered in-memory buffer plus best-effort file append
//!
//! The in-memory append always happens; the file append follows under the same lock
//! and a failure there is logged, never rolled back.

pub mod ingest;

pub use ingest::{spawn_ingest_worker, IngestStats, IngestStatsSnapshot};

use crate::telemetry::TelemetryRecord;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sink file CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Recorder for normalized telemetry records
#[derive(Debug)]
pub struct MessageSink {
    records: Mutex<Vec<TelemetryRecord>>,
    file_path: Option<PathBuf>,
    // Held across the memory push and the file write so both see one order.
    // Taken before `records`, never after.
    file_lock: Mutex<()>,
}

impl MessageSink {
    /// Sink with no durable file
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            file_path: None,
            file_lock: Mutex::new(()),
        }
    }

    /// Sink that also appends every record to `path`
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: Some(path.into()),
            ..Self::in_memory()
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    fn records(&self) -> MutexGuard<'_, Vec<TelemetryRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a normalized message
    pub fn append(&self, record: TelemetryRecord) {
        let row = record.to_row();
        let _guard = self.file_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.records().push(record);

        if let Some(path) = &self.file_path {
            if let Err(e) = append_row(path, &row) {
                warn!(path = %path.display(), error = %e, "Failed to append record to sink file");
            }
        }
    }

    /// All buffered records, leaving the buffer empty
    pub fn snapshot_and_clear(&self) -> Vec<TelemetryRecord> {
        std::mem::take(&mut *self.records())
    }

    /// Most recently appended record
    pub fn latest(&self) -> Option<TelemetryRecord> {
        self.records().last().cloned()
    }

    /// Records not handed out before, in arrival order. Marks them delivered.
    pub fn take_undelivered(&self) -> Vec<TelemetryRecord> {
        let mut records = self.records();
        records
            .iter_mut()
            .filter(|record| !record.delivered())
            .map(|record| {
                record.mark_delivered();
                record.clone()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

fn append_row(path: &Path, row: &[String; 4]) -> Result<(), SinkError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.write_record(row)?;
    writer.flush()?;
    Ok(())
}

/// Load a sink file back into records.
///
/// Empty fields are absent measurements; rows that do not form a valid record
/// are skipped.
pub fn read_sink_file(path: impl AsRef<Path>) -> Result<Vec<TelemetryRecord>, SinkError> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row?;
        match parse_sink_row(&row) {
            Some(record) => records.push(record),
            None => debug!(line = index + 1, "Skipping unusable sink row"),
        }
    }
    Ok(records)
}

fn parse_sink_row(row: &csv::StringRecord) -> Option<TelemetryRecord> {
    if row.len() != 4 {
        return None;
    }
    let time = row.get(0)?.trim().parse::<i64>().ok()?;
    let temperature = optional_field::<f64>(row.get(1)?)?;
    let humidity = optional_field::<f64>(row.get(2)?)?;
    let pressure = optional_field::<i64>(row.get(3)?)?;
    TelemetryRecord::new(time, temperature, humidity, pressure)
}

/// `Some(None)` for an empty field, `None` for an unparseable one
fn optional_field<T: std::str::FromStr>(field: &str) -> Option<Option<T>> {
    let field = field.trim();
    if field.is_empty() {
        return Some(None);
    }
    field.parse::<T>().ok().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(time: i64) -> TelemetryRecord {
        TelemetryRecord::new(time, Some(20.0), Some(50.0), Some(1000)).unwrap()
    }

    #[test]
    fn test_append_preserves_order() {
        let sink = MessageSink::in_memory();
        sink.append(record(3));
        sink.append(record(1));
        sink.append(record(2));

        let times: Vec<i64> = sink
            .snapshot_and_clear()
            .iter()
            .map(TelemetryRecord::time_millis)
            .collect();
        assert_eq!(times, vec![3, 1, 2]);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_latest() {
        let sink = MessageSink::in_memory();
        assert!(sink.latest().is_none());
        sink.append(record(1));
        sink.append(record(2));
        assert_eq!(sink.latest().unwrap().time_millis(), 2);
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_take_undelivered_marks_records() {
        let sink = MessageSink::in_memory();
        sink.append(record(1));
        sink.append(record(2));

        let first = sink.take_undelivered();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(TelemetryRecord::delivered));

        sink.append(record(3));
        let second = sink.take_undelivered();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].time_millis(), 3);
        assert_eq!(sink.len(), 3);
    }

    #[test]
    fn test_file_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        let sink = MessageSink::with_file(&path);

        sink.append(record(1000));
        sink.append(TelemetryRecord::new(2000, None, Some(40.5), None).unwrap());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "1000,20.0,50.0,1000\n2000,,40.5,\n");

        let records = read_sink_file(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].humidity(), Some(40.5));
        assert_eq!(records[1].temperature(), None);
    }

    #[test]
    fn test_file_failure_keeps_memory_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing-dir").join("out.csv");
        let sink = MessageSink::with_file(&path);

        sink.append(record(1));
        assert_eq!(sink.len(), 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_read_skips_unusable_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        std::fs::write(&path, "1000,20,50,1000\nbad,1,2,3\n2000,,,\n3000,1,2\n4000,21.5,,\n").unwrap();

        let records = read_sink_file(&path).unwrap();
        let times: Vec<i64> = records.iter().map(TelemetryRecord::time_millis).collect();
        assert_eq!(times, vec![1000, 4000]);
    }

    #[test]
    fn test_concurrent_appends_are_all_kept() {
        let sink = Arc::new(MessageSink::in_memory());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let sink = Arc::clone(&sink);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        sink.append(record(t * 1000 + i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sink.len(), 400);
    }

    #[test]
    fn test_concurrent_file_order_matches_memory_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        let sink = Arc::new(MessageSink::with_file(&path));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let sink = Arc::clone(&sink);
                std::thread::spawn(move || {
                    for i in 0..300 {
                        sink.append(record(t * 1000 + i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let memory: Vec<i64> = sink
            .snapshot_and_clear()
            .iter()
            .map(TelemetryRecord::time_millis)
            .collect();
        let file: Vec<i64> = read_sink_file(&path)
            .unwrap()
            .iter()
            .map(TelemetryRecord::time_millis)
            .collect();
        assert_eq!(memory.len(), 2400);
        assert_eq!(memory, file);
    }
}
