//! Telemetry records and the payload formats around them
//!
//! Inbound payloads arrive in one of three schemas and are normalized into a
//! single [`TelemetryRecord`]. Outbound payloads are always the canonical
//! property-post message built from a [`TelemetryReading`].

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod canonical;
pub mod normalizer;

pub use canonical::{PropertyParams, PropertyPost, PROPERTY_POST_METHOD};
pub use normalizer::{NormalizationError, PayloadNormalizer, PayloadSchema};

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Canonical telemetry record.
///
/// At least one of temperature, humidity and pressure is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    time_millis: i64,
    temperature: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<i64>,
    delivered: bool,
}

impl TelemetryRecord {
    /// Build a record, returning `None` when no measurement is present
    pub fn new(
        time_millis: i64,
        temperature: Option<f64>,
        humidity: Option<f64>,
        pressure: Option<i64>,
    ) -> Option<Self> {
        if temperature.is_none() && humidity.is_none() && pressure.is_none() {
            return None;
        }
        Some(Self {
            time_millis,
            temperature,
            humidity,
            pressure,
            delivered: false,
        })
    }

    pub fn time_millis(&self) -> i64 {
        self.time_millis
    }

    pub fn temperature(&self) -> Option<f64> {
        self.temperature
    }

    pub fn humidity(&self) -> Option<f64> {
        self.humidity
    }

    pub fn pressure(&self) -> Option<i64> {
        self.pressure
    }

    /// Whether the record has been handed out by the sink
    pub fn delivered(&self) -> bool {
        self.delivered
    }

    pub(crate) fn mark_delivered(&mut self) {
        self.delivered = true;
    }

    /// Sink file columns: time, temperature, humidity, pressure.
    /// Absent measurements are empty fields.
    pub fn to_row(&self) -> [String; 4] {
        [
            self.time_millis.to_string(),
            self.temperature.map(format_measurement).unwrap_or_default(),
            self.humidity.map(format_measurement).unwrap_or_default(),
            self.pressure.map(|v| v.to_string()).unwrap_or_default(),
        ]
    }
}

/// Whole values keep a trailing `.0` so the column reads as a float
fn format_measurement(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

impl fmt::Display for TelemetryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DateTime::<Utc>::from_timestamp_millis(self.time_millis) {
            Some(time) => write!(f, "time:{}", time.format("%Y-%m-%d T %H:%M:%S"))?,
            None => write!(f, "time:{}", self.time_millis)?,
        }
        if let Some(temperature) = self.temperature {
            write!(f, " temperature:{temperature}")?;
        }
        if let Some(humidity) = self.humidity {
            write!(f, " humidity:{humidity}")?;
        }
        if let Some(pressure) = self.pressure {
            write!(f, " pressure:{pressure}")?;
        }
        Ok(())
    }
}

/// Raw inbound message; consumed by normalization
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub topic: String,
    pub bytes: Vec<u8>,
    pub received_at_millis: i64,
}

impl RawPayload {
    pub fn new(topic: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            bytes: bytes.into(),
            received_at_millis: now_millis(),
        }
    }

    /// Normalize using the receipt time as the fallback timestamp
    pub fn normalize(self) -> Result<TelemetryRecord, NormalizationError> {
        PayloadNormalizer::normalize_at(&self.bytes, self.received_at_millis)
    }
}

/// A complete outbound reading: one dataset row or one ad-hoc sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryReading {
    pub time_millis: i64,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: i64,
}

impl TelemetryReading {
    /// Random plausible reading stamped with the current time
    pub fn random() -> Self {
        let mut rng = rand::rng();
        Self {
            time_millis: now_millis(),
            temperature: f64::from(rng.random_range(-10..=40)) + rng.random::<f64>(),
            humidity: f64::from(rng.random_range(0..=100)) + rng.random::<f64>(),
            pressure: rng.random_range(900..=1100),
        }
    }

    pub fn to_record(&self) -> TelemetryRecord {
        TelemetryRecord {
            time_millis: self.time_millis,
            temperature: Some(self.temperature),
            humidity: Some(self.humidity),
            pressure: Some(self.pressure),
            delivered: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_requires_a_measurement() {
        assert!(TelemetryRecord::new(1000, None, None, None).is_none());
        assert!(TelemetryRecord::new(1000, None, None, Some(1013)).is_some());
    }

    #[test]
    fn test_new_record_is_undelivered() {
        let record = TelemetryRecord::new(1000, Some(20.0), None, None).unwrap();
        assert!(!record.delivered());
    }

    #[test]
    fn test_to_row_leaves_absent_fields_empty() {
        let record = TelemetryRecord::new(1000, Some(20.5), None, Some(1013)).unwrap();
        assert_eq!(record.to_row(), ["1000", "20.5", "", "1013"]);
    }

    #[test]
    fn test_to_row_keeps_decimal_point_on_whole_values() {
        let record = TelemetryRecord::new(1000, Some(20.0), Some(-3.0), Some(1000)).unwrap();
        assert_eq!(record.to_row(), ["1000", "20.0", "-3.0", "1000"]);

        let record = TelemetryRecord::new(1000, Some(0.25), Some(40.5), None).unwrap();
        assert_eq!(record.to_row(), ["1000", "0.25", "40.5", ""]);
    }

    #[test]
    fn test_display_format() {
        let record =
            TelemetryRecord::new(1392220800000, Some(25.5), Some(60.2), Some(1013)).unwrap();
        assert_eq!(
            record.to_string(),
            "time:2014-02-12 T 16:00:00 temperature:25.5 humidity:60.2 pressure:1013"
        );
    }

    #[test]
    fn test_random_reading_ranges() {
        for _ in 0..100 {
            let reading = TelemetryReading::random();
            assert!((-10.0..41.0).contains(&reading.temperature));
            assert!((0.0..101.0).contains(&reading.humidity));
            assert!((900..=1100).contains(&reading.pressure));
        }
    }

    #[test]
    fn test_reading_to_record() {
        let reading = TelemetryReading {
            time_millis: 1000,
            temperature: 20.0,
            humidity: 50.0,
            pressure: 1000,
        };
        let record = reading.to_record();
        assert_eq!(record.time_millis(), 1000);
        assert_eq!(record.pressure(), Some(1000));
    }

    #[test]
    fn test_raw_payload_uses_receipt_time() {
        let payload = RawPayload::new("t", br#"{"humidity": 40}"#.to_vec());
        let received = payload.received_at_millis;
        let record = payload.normalize().unwrap();
        assert_eq!(record.time_millis(), received);
    }
}
