//! Dataset file handling
//!
//! A dataset is a headerless delimited file of `[epoch-millis, temperature,
//! humidity, pressure]` rows. Starting a job sorts the file on disk by the
//! first column.

use crate::telemetry::TelemetryReading;
use csv::StringRecord;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const DATASET_FIELDS: usize = 4;

/// Dataset-level failure; stops a job from starting
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Dataset I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dataset CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Dataset task failed: {0}")]
    Task(String),
}

/// A single unusable row; the row is skipped and the job continues
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DatasetRowError {
    #[error("Row has {0} fields, expected 4")]
    FieldCount(usize),

    #[error("Field '{field}' has unusable value '{value}'")]
    InvalidField { field: &'static str, value: String },
}

fn read_rows(path: &Path) -> Result<Vec<StringRecord>, DatasetError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let rows = reader.records().collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Rows whose first field is not an integer have no key; they sort after
/// every keyed row and keep their relative order.
fn sort_key(row: &StringRecord) -> Option<i64> {
    row.get(0).and_then(|value| value.trim().parse::<i64>().ok())
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());
    path.with_file_name(format!(".{name}.sorting"))
}

/// Sort the dataset file by its first column, ascending and stable, and write
/// the sorted rows back to the same path. Returns the sorted rows.
///
/// Rows without an integer first field are written back unchanged at the end
/// of the file; the worker skips them as row errors.
pub fn sort_dataset_in_place(path: &Path) -> Result<Vec<StringRecord>, DatasetError> {
    let rows = read_rows(path)?;

    let mut keyed: Vec<(Option<i64>, StringRecord)> =
        rows.into_iter().map(|row| (sort_key(&row), row)).collect();
    keyed.sort_by_key(|(key, _)| (key.is_none(), *key));
    let unkeyed = keyed.iter().filter(|(key, _)| key.is_none()).count();
    let rows: Vec<StringRecord> = keyed.into_iter().map(|(_, row)| row).collect();

    let staging = staging_path(path);
    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&staging)?;
        for row in &rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
    }
    fs::rename(&staging, path)?;

    debug!(
        path = %path.display(),
        rows = rows.len(),
        unkeyed,
        "Dataset sorted in place"
    );
    Ok(rows)
}

/// Parse one dataset row into a reading
pub fn parse_row(row: &StringRecord) -> Result<TelemetryReading, DatasetRowError> {
    if row.len() != DATASET_FIELDS {
        return Err(DatasetRowError::FieldCount(row.len()));
    }

    fn field<T: std::str::FromStr>(
        row: &StringRecord,
        index: usize,
        name: &'static str,
    ) -> Result<T, DatasetRowError> {
        let raw = row.get(index).unwrap_or_default().trim();
        raw.parse::<T>().map_err(|_| DatasetRowError::InvalidField {
            field: name,
            value: raw.to_string(),
        })
    }

    let temperature: f64 = field(row, 1, "temperature")?;
    let humidity: f64 = field(row, 2, "humidity")?;
    if !temperature.is_finite() || !humidity.is_finite() {
        return Err(DatasetRowError::InvalidField {
            field: if temperature.is_finite() { "humidity" } else { "temperature" },
            value: row.iter().skip(1).take(2).collect::<Vec<_>>().join(","),
        });
    }

    Ok(TelemetryReading {
        time_millis: field(row, 0, "time")?,
        temperature,
        humidity,
        pressure: field(row, 3, "pressure")?,
    })
}
