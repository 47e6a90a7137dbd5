//! Testing utilities and mock implementations
//!
//! Mock transports for exercising the supervisor, publisher and ingest path
//! without an MQTT broker.

pub mod mocks;

pub use mocks::*;
