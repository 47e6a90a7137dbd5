//! Inbound payload normalization
//!
//! Three payload schemas are probed in fixed priority order, first match wins:
//!
//! 1. [`PayloadSchema::NestedValue`]: `{"items": {"DetectTime": {"value": ..}, "CurrentTemperature": {"value": ..}, ..}}`
//! 2. [`PayloadSchema::FlatParams`]: `{"params": {"DetectTime": .., "CurrentTemperature": .., ..}}`
//! 3. [`PayloadSchema::Direct`]: `{"time": .., "temperature": .., "humidity": .., "pressure": ..}`
//!
//! The direct schema is the fallback for every JSON object, so a payload that
//! matches neither of the first two is still accepted when it carries at least
//! one usable measurement.

use super::TelemetryRecord;
use crate::error::ErrorKind;
use serde_json::{Map, Value};
use thiserror::Error;

/// Why a payload produced no record
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizationError {
    /// Payload is not valid JSON
    #[error("Malformed JSON payload: {0}")]
    Decode(String),

    /// A field is present but cannot be coerced to its type
    #[error("Field '{field}' has unusable value {value}")]
    FieldType { field: &'static str, value: String },

    /// No temperature, humidity or pressure in the payload
    #[error("Payload carries no measurement")]
    NoMeasurement,
}

impl NormalizationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NormalizationError::Decode(_) => ErrorKind::DecodeError,
            NormalizationError::FieldType { .. } => ErrorKind::FieldTypeError,
            NormalizationError::NoMeasurement => ErrorKind::Discarded,
        }
    }

    /// Discards that are not worth surfacing
    pub fn is_silent(&self) -> bool {
        matches!(self, NormalizationError::NoMeasurement)
    }
}

/// Inbound payload schema, in probing order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSchema {
    NestedValue,
    FlatParams,
    Direct,
}

/// Raw field values pulled out of a payload, before coercion
struct ExtractedFields<'a> {
    schema: PayloadSchema,
    time: Option<&'a Value>,
    temperature: Option<&'a Value>,
    humidity: Option<&'a Value>,
    pressure: Option<&'a Value>,
}

/// Pure payload normalization
pub struct PayloadNormalizer;

impl PayloadNormalizer {
    /// Normalize a payload, stamping it with the current time when it has none
    pub fn normalize(payload: &[u8]) -> Result<TelemetryRecord, NormalizationError> {
        Self::normalize_at(payload, super::now_millis())
    }

    /// Normalize a payload, stamping it with `received_at_millis` when it has no time
    pub fn normalize_at(
        payload: &[u8],
        received_at_millis: i64,
    ) -> Result<TelemetryRecord, NormalizationError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| NormalizationError::Decode(e.to_string()))?;

        // Valid JSON that is not an object cannot carry measurements
        let root = value.as_object().ok_or(NormalizationError::NoMeasurement)?;
        let fields = Self::extract(root);

        let time = match fields.time {
            Some(v) => coerce_i64(v, "time")?,
            None => None,
        };
        let temperature = fields
            .temperature
            .map(|v| coerce_f64(v, "temperature"))
            .transpose()?
            .flatten();
        let humidity = fields
            .humidity
            .map(|v| coerce_f64(v, "humidity"))
            .transpose()?
            .flatten();
        let pressure = fields
            .pressure
            .map(|v| coerce_i64(v, "pressure"))
            .transpose()?
            .flatten();

        tracing::trace!(schema = ?fields.schema, "Payload schema matched");

        TelemetryRecord::new(
            time.unwrap_or(received_at_millis),
            temperature,
            humidity,
            pressure,
        )
        .ok_or(NormalizationError::NoMeasurement)
    }

    /// Schema the payload object is read with
    pub fn detect_schema(root: &Map<String, Value>) -> PayloadSchema {
        Self::extract(root).schema
    }

    fn extract(root: &Map<String, Value>) -> ExtractedFields<'_> {
        Self::probe_nested_value(root)
            .or_else(|| Self::probe_flat_params(root))
            .unwrap_or_else(|| Self::read_direct(root))
    }

    fn probe_nested_value(root: &Map<String, Value>) -> Option<ExtractedFields<'_>> {
        let items = root.get("items")?.as_object()?;
        let time = items.get("DetectTime")?.as_object()?.get("value")?;

        Some(ExtractedFields {
            schema: PayloadSchema::NestedValue,
            time: Some(time),
            temperature: nested_value(items, "CurrentTemperature"),
            humidity: nested_value(items, "CurrentHumidity"),
            pressure: nested_value(items, "CurrentPressure"),
        })
    }

    fn probe_flat_params(root: &Map<String, Value>) -> Option<ExtractedFields<'_>> {
        let params = root.get("params")?.as_object()?;
        let time = params.get("DetectTime")?;

        Some(ExtractedFields {
            schema: PayloadSchema::FlatParams,
            time: Some(time),
            temperature: params.get("CurrentTemperature"),
            humidity: params.get("CurrentHumidity"),
            pressure: params.get("CurrentPressure"),
        })
    }

    fn read_direct(root: &Map<String, Value>) -> ExtractedFields<'_> {
        ExtractedFields {
            schema: PayloadSchema::Direct,
            time: root.get("time"),
            temperature: root.get("temperature"),
            humidity: root.get("humidity"),
            pressure: root.get("pressure"),
        }
    }
}

/// `{"value": x}` yields x; a bare scalar is taken as the value itself
fn nested_value<'a>(items: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    match items.get(key)? {
        Value::Object(entry) => entry.get("value"),
        other => Some(other),
    }
}

fn type_error(field: &'static str, value: &Value) -> NormalizationError {
    NormalizationError::FieldType {
        field,
        value: value.to_string(),
    }
}

/// Integer coercion: integers, floats (truncated) and integer strings. Null is absent.
fn coerce_i64(value: &Value, field: &'static str) -> Result<Option<i64>, NormalizationError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
                    .map(|f| f.trunc() as i64)
            })
            .map(Some)
            .ok_or_else(|| type_error(field, value)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| type_error(field, value)),
        _ => Err(type_error(field, value)),
    }
}

/// Float coercion: numbers and numeric strings, finite only. Null is absent.
fn coerce_f64(value: &Value, field: &'static str) -> Result<Option<f64>, NormalizationError> {
    let parsed = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|f| f.is_finite())
        .map(Some)
        .ok_or_else(|| type_error(field, value))
}
