//! MQTT transport built on rumqttc (MQTT v5)
//!
//! Split the same way throughout: pure configuration and routing logic in
//! [`connection`] and [`message_handler`], network I/O in [`client`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use thp_telemetry::supervisor::{ConnectionCredentials, ConnectionSupervisor, SupervisorSettings};
//! use thp_telemetry::sink::MessageSink;
//! use thp_telemetry::transport::mqtt::{MqttSettings, MqttTransportFactory};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let settings = MqttSettings {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     keep_alive: Duration::from_secs(60),
//!     handshake_timeout: Duration::from_secs(60),
//!     qos: rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
//!     request_capacity: 10,
//! };
//! let sink = Arc::new(MessageSink::in_memory());
//! let supervisor = ConnectionSupervisor::new(
//!     Arc::new(MqttTransportFactory::new(settings)),
//!     SupervisorSettings::default(),
//!     sink,
//! );
//! supervisor
//!     .connect(ConnectionCredentials::new("thp-listener", "", ""))
//!     .await;
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttClient, MqttTransportFactory};
pub use connection::{configure_mqtt_options, parse_broker_url, qos_from_level, MqttSettings};
pub use message_handler::{EventRoute, MessageHandler};
