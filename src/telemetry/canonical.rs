//! Canonical outbound property-post message

use super::TelemetryReading;
use serde::{Deserialize, Serialize};

pub const PROPERTY_POST_METHOD: &str = "thing.event.property.post";
pub const PROPERTY_POST_VERSION: &str = "1.0";

/// Measurement block of a property post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PropertyParams {
    /// Epoch milliseconds, carried as a decimal string
    pub detect_time: String,
    pub current_temperature: f64,
    pub current_humidity: f64,
    pub current_pressure: i64,
}

/// `{id, version, params, method}` message sent for every outbound reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyPost {
    pub id: String,
    pub version: String,
    pub params: PropertyParams,
    pub method: String,
}

impl PropertyPost {
    pub fn from_reading(id: impl Into<String>, reading: &TelemetryReading) -> Self {
        Self {
            id: id.into(),
            version: PROPERTY_POST_VERSION.to_string(),
            params: PropertyParams {
                detect_time: reading.time_millis.to_string(),
                current_temperature: reading.temperature,
                current_humidity: reading.humidity,
                current_pressure: reading.pressure,
            },
            method: PROPERTY_POST_METHOD.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::PayloadNormalizer;

    fn reading() -> TelemetryReading {
        TelemetryReading {
            time_millis: 1000,
            temperature: 20.0,
            humidity: 50.0,
            pressure: 1000,
        }
    }

    #[test]
    fn test_wire_shape() {
        let post = PropertyPost::from_reading("1", &reading());
        let json: serde_json::Value = serde_json::from_slice(&post.to_bytes().unwrap()).unwrap();

        assert_eq!(json["id"], "1");
        assert_eq!(json["version"], "1.0");
        assert_eq!(json["method"], "thing.event.property.post");
        assert_eq!(json["params"]["DetectTime"], "1000");
        assert_eq!(json["params"]["CurrentTemperature"], 20.0);
        assert_eq!(json["params"]["CurrentHumidity"], 50.0);
        assert_eq!(json["params"]["CurrentPressure"], 1000);
    }

    #[test]
    fn test_outbound_message_normalizes_back() {
        let post = PropertyPost::from_reading("7", &reading());
        let record = PayloadNormalizer::normalize(&post.to_bytes().unwrap()).unwrap();
        assert_eq!(record, reading().to_record());
    }
}
