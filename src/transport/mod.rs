//! Transport layer for broker communication
//!
//! A [`Transport`] owns one broker connection. It reports lifecycle events to a
//! [`TransportObserver`] from its own I/O task, and is created per connection
//! attempt by a [`TransportFactory`] so the supervisor can swap connections
//! without knowing the concrete client.

use crate::supervisor::ConnectionCredentials;
use std::sync::Arc;
use thiserror::Error;

pub mod mqtt;

/// Connection state of a transport or of the supervisor that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Failures reported by the transport layer
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("Subscription to {topic} failed: {reason}")]
    SubscriptionFailed { topic: String, reason: String },
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),
}

/// Lifecycle events delivered by a transport's I/O task.
///
/// Implementations must return quickly and must not block: they run on the
/// transport's network loop.
pub trait TransportObserver: Send + Sync {
    /// Broker accepted the handshake
    fn on_connected(&self);

    /// Connection lost, handshake failed or timed out
    fn on_disconnected(&self, reason: &str);

    /// Broker acknowledged a publish
    fn on_publish_ack(&self, packet_id: u16);

    /// Message received on a subscribed topic
    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// One broker connection.
///
/// `connect` only starts the handshake; completion is reported through
/// [`TransportObserver::on_connected`] or [`TransportObserver::on_disconnected`].
/// `publish` and `subscribe` enqueue requests and return without waiting for
/// the broker.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Start connecting to the broker
    async fn connect(&self) -> Result<(), TransportError>;

    /// Tear the connection down and stop the I/O task
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Publish a payload to a topic
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Remove a subscription
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Current connection state as seen by the I/O task
    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// Creates a fresh transport for each connection attempt
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        credentials: &ConnectionCredentials,
        observer: Arc<dyn TransportObserver>,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Type alias for the MQTT transport
pub type MqttTransport = mqtt::MqttClient;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_transport_error_display() {
        let errors = vec![
            TransportError::InvalidBrokerUrl("x".to_string()),
            TransportError::ConnectionFailed("refused".to_string()),
            TransportError::NotConnected {
                state: ConnectionState::Connecting,
            },
            TransportError::PublishFailed {
                topic: "t".to_string(),
                reason: "queue full".to_string(),
            },
            TransportError::SubscriptionFailed {
                topic: "#".to_string(),
                reason: "closed".to_string(),
            },
            TransportError::DisconnectFailed("closed".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
