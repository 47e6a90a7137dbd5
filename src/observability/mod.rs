//! Observability for the telemetry bridge
//!
//! Structured logging via `tracing`, plus span macros for the three concurrent
//! execution contexts: the MQTT I/O loop, the ingest worker and the bulk publisher.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{ingest_span, mqtt_span, publish_span};
