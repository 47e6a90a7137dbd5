//! THP telemetry bridge
//!
//! MQTT client layer for temperature/humidity/pressure sensor telemetry.
//!
//! # Overview
//!
//! - [`supervisor::ConnectionSupervisor`] keeps one broker connection alive with a
//!   recurring health check, reconnecting with stored credentials unless the user
//!   disconnected on purpose.
//! - [`telemetry::PayloadNormalizer`] turns any of three inbound payload schemas
//!   into one [`telemetry::TelemetryRecord`].
//! - [`sink::MessageSink`] records normalized messages in memory and in a file.
//! - [`publisher::BulkPublisher`] replays a dataset file to the broker at a fixed
//!   pace, with live progress and cooperative cancellation.
//!
//! # Quick Start
//!
//! ```rust
//! use thp_telemetry::telemetry::PayloadNormalizer;
//!
//! let payload = br#"{"params":{"DetectTime":"1000","CurrentTemperature":20.0,"CurrentHumidity":50.0,"CurrentPressure":1000}}"#;
//! let record = PayloadNormalizer::normalize(payload).unwrap();
//!
//! assert_eq!(record.time_millis(), 1000);
//! assert_eq!(record.pressure(), Some(1000));
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod publisher;
pub mod scheduler;
pub mod sink;
pub mod supervisor;
pub mod telemetry;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, TelemetryConfig};
pub use error::{ErrorKind, OperationResult, OperationStatus, TelemetryError, TelemetryResult};
pub use publisher::{BulkPublisher, PublishStatus, PublisherError};
pub use sink::{read_sink_file, MessageSink};
pub use supervisor::{ConnectionCredentials, ConnectionSupervisor, SupervisorSettings};
pub use telemetry::{PayloadNormalizer, TelemetryReading, TelemetryRecord};
pub use transport::mqtt::{MqttClient, MqttTransportFactory};
pub use transport::ConnectionState;
