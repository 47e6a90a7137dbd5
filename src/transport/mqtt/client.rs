//! Impure I/O operations for the MQTT transport
//!
//! Each [`MqttClient`] owns one rumqttc connection. `connect` spawns the event
//! loop task, which runs the handshake under a bounded timeout and then turns
//! broker events into [`TransportObserver`] callbacks. The task never
//! reconnects on its own: a lost connection is reported once and the task ends,
//! leaving recovery to the connection supervisor.

use super::connection::{configure_mqtt_options, MqttSettings};
use super::message_handler::{EventRoute, MessageHandler};
use crate::supervisor::ConnectionCredentials;
use crate::transport::{
    ConnectionState, Transport, TransportError, TransportFactory, TransportObserver,
};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Time the event loop gets to flush DISCONNECT before it is dropped
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Time `disconnect` waits for the event loop task to finish
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// MQTT transport backed by a rumqttc v5 client
pub struct MqttClient {
    client_id: String,
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    observer: Arc<dyn TransportObserver>,
    qos: QoS,
    handshake_timeout: Duration,
}

impl MqttClient {
    pub fn new(
        credentials: &ConnectionCredentials,
        settings: &MqttSettings,
        observer: Arc<dyn TransportObserver>,
    ) -> Result<Self, TransportError> {
        let mqtt_options = configure_mqtt_options(credentials, settings)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, settings.request_capacity);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            client_id: credentials.client_id().to_string(),
            client,
            event_loop: Mutex::new(Some(event_loop)),
            event_loop_handle: Mutex::new(None),
            state_tx,
            shutdown_tx,
            observer,
            qos: settings.qos,
            handshake_timeout: settings.handshake_timeout,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn check_connection_state(&self) -> Result<(), TransportError> {
        let state = *self.state_tx.borrow();
        if state != ConnectionState::Connected {
            return Err(TransportError::NotConnected { state });
        }
        Ok(())
    }

    /// Poll until the broker answers CONNECT
    async fn await_handshake(event_loop: &mut EventLoop) -> Result<(), String> {
        loop {
            match event_loop.poll().await {
                Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                    EventRoute::ConnectionAcknowledged => return Ok(()),
                    EventRoute::ConnectionRefused(code) => {
                        return Err(format!("Broker refused connection: {code}"));
                    }
                    route => debug!(target: "mqtt_transport", "Pre-handshake event: {:?}", route),
                },
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    /// Body of the event loop task
    async fn run_event_loop(
        mut event_loop: EventLoop,
        state_tx: watch::Sender<ConnectionState>,
        mut shutdown_rx: watch::Receiver<bool>,
        observer: Arc<dyn TransportObserver>,
        handshake_timeout: Duration,
    ) {
        let handshake = tokio::time::timeout(
            handshake_timeout,
            Self::await_handshake(&mut event_loop),
        );

        let handshake_result = tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!("Shutdown requested during handshake");
                return;
            }
            result = handshake => result,
        };

        match handshake_result {
            Ok(Ok(())) => {
                state_tx.send_replace(ConnectionState::Connected);
                info!("MQTT connection established");
                observer.on_connected();
            }
            Ok(Err(reason)) => {
                state_tx.send_replace(ConnectionState::Disconnected);
                warn!("MQTT handshake failed: {}", reason);
                observer.on_disconnected(&reason);
                return;
            }
            Err(_) => {
                state_tx.send_replace(ConnectionState::Disconnected);
                let reason = format!(
                    "Handshake timed out after {}s",
                    handshake_timeout.as_secs_f64()
                );
                warn!("{}", reason);
                observer.on_disconnected(&reason);
                return;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    // Let the queued DISCONNECT reach the broker
                    let _ = tokio::time::timeout(DISCONNECT_GRACE, async {
                        while event_loop.poll().await.is_ok() {}
                    })
                    .await;
                    break;
                }
                event_result = event_loop.poll() => match event_result {
                    Ok(event) => {
                        if !Self::process_event_route(
                            MessageHandler::route_mqtt_event(&event),
                            &state_tx,
                            observer.as_ref(),
                        ) {
                            break;
                        }
                    }
                    Err(e) => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        state_tx.send_replace(ConnectionState::Disconnected);
                        error!("MQTT event loop error: {}", e);
                        observer.on_disconnected(&e.to_string());
                        break;
                    }
                },
            }
        }
        debug!("MQTT event loop stopped");
    }

    /// Act on a routed event. Returns false when the loop must stop.
    fn process_event_route(
        route: EventRoute,
        state_tx: &watch::Sender<ConnectionState>,
        observer: &dyn TransportObserver,
    ) -> bool {
        match route {
            EventRoute::MessageReceived { topic, payload } => {
                debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", topic);
                observer.on_message(&topic, &payload);
                true
            }
            EventRoute::PublishAcknowledged { packet_id } => {
                observer.on_publish_ack(packet_id);
                true
            }
            EventRoute::Disconnected => {
                state_tx.send_replace(ConnectionState::Disconnected);
                warn!("MQTT broker closed the session");
                observer.on_disconnected("Broker disconnected");
                false
            }
            EventRoute::SubscriptionConfirmed { packet_id } => {
                debug!(target: "mqtt_transport", "Subscription confirmed: pkid {}", packet_id);
                true
            }
            EventRoute::ConnectionAcknowledged | EventRoute::ConnectionRefused(_) => {
                debug!(target: "mqtt_transport", "Unexpected CONNACK mid-session: {:?}", route);
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }
}

#[async_trait]
impl Transport for MqttClient {
    async fn connect(&self) -> Result<(), TransportError> {
        let event_loop = self
            .event_loop
            .lock()
            .map_err(|_| TransportError::ConnectionFailed("event loop lock poisoned".into()))?
            .take()
            .ok_or_else(|| {
                TransportError::ConnectionFailed("Event loop already started".to_string())
            })?;

        self.state_tx.send_replace(ConnectionState::Connecting);

        let span = crate::mqtt_span!(client_id = %self.client_id);
        let handle = tokio::spawn(
            Self::run_event_loop(
                event_loop,
                self.state_tx.clone(),
                self.shutdown_tx.subscribe(),
                self.observer.clone(),
                self.handshake_timeout,
            )
            .instrument(span),
        );

        if let Ok(mut slot) = self.event_loop_handle.lock() {
            *slot = Some(handle);
        }
        info!(client_id = %self.client_id, "MQTT client connecting");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        // Non-blocking: a stalled request channel must not hang the caller
        if let Err(e) = self.client.try_disconnect() {
            debug!("DISCONNECT not queued: {}", e);
        }
        self.shutdown_tx.send_replace(true);

        let handle = self
            .event_loop_handle
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(mut handle) = handle {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Event loop task didn't shut down gracefully, aborting");
                    handle.abort();
                }
            }
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!(client_id = %self.client_id, "MQTT client disconnected");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.check_connection_state()?;

        self.client
            .try_publish(topic, self.qos, false, payload)
            .map_err(|e| TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        debug!(target: "mqtt_transport", "Queued publish to {}", topic);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.check_connection_state()?;

        self.client
            .try_subscribe(topic, self.qos)
            .map_err(|e| TransportError::SubscriptionFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        info!("Subscribed to: {}", topic);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.check_connection_state()?;

        self.client
            .try_unsubscribe(topic)
            .map_err(|e| TransportError::SubscriptionFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        info!("Unsubscribed from: {}", topic);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Ok(mut slot) = self.event_loop_handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// Builds one [`MqttClient`] per connection attempt
#[derive(Debug, Clone)]
pub struct MqttTransportFactory {
    settings: MqttSettings,
}

impl MqttTransportFactory {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }
}

impl TransportFactory for MqttTransportFactory {
    fn create(
        &self,
        credentials: &ConnectionCredentials,
        observer: Arc<dyn TransportObserver>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let client = MqttClient::new(credentials, &self.settings, observer)?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingObserver {
        connected: AtomicUsize,
        disconnected: Mutex<Vec<String>>,
    }

    impl TransportObserver for RecordingObserver {
        fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_disconnected(&self, reason: &str) {
            self.disconnected.lock().unwrap().push(reason.to_string());
        }
        fn on_publish_ack(&self, _packet_id: u16) {}
        fn on_message(&self, _topic: &str, _payload: &[u8]) {}
    }

    fn settings(url: &str, handshake_timeout: Duration) -> MqttSettings {
        MqttSettings {
            broker_url: url.to_string(),
            keep_alive: Duration::from_secs(60),
            handshake_timeout,
            qos: QoS::AtLeastOnce,
            request_capacity: 10,
        }
    }

    #[tokio::test]
    async fn test_new_client_starts_disconnected() {
        let observer = Arc::new(RecordingObserver::default());
        let client = MqttClient::new(
            &ConnectionCredentials::new("unit", "", ""),
            &settings("mqtt://localhost:1883", Duration::from_secs(1)),
            observer,
        )
        .unwrap();

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.client_id(), "unit");
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let observer = Arc::new(RecordingObserver::default());
        let client = MqttClient::new(
            &ConnectionCredentials::new("unit", "", ""),
            &settings("mqtt://localhost:1883", Duration::from_secs(1)),
            observer,
        )
        .unwrap();

        let result = client.publish("a/b", b"{}".to_vec()).await;
        assert!(matches!(
            result,
            Err(TransportError::NotConnected {
                state: ConnectionState::Disconnected
            })
        ));
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let observer = Arc::new(RecordingObserver::default());
        // Port 1 on loopback refuses immediately
        let client = MqttClient::new(
            &ConnectionCredentials::new("unit", "", ""),
            &settings("mqtt://127.0.0.1:1", Duration::from_secs(1)),
            observer,
        )
        .unwrap();

        client.connect().await.unwrap();
        assert!(client.connect().await.is_err());
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_disconnect() {
        let observer = Arc::new(RecordingObserver::default());
        let client = MqttClient::new(
            &ConnectionCredentials::new("unit", "", ""),
            &settings("mqtt://127.0.0.1:1", Duration::from_secs(2)),
            observer.clone(),
        )
        .unwrap();

        client.connect().await.unwrap();

        let mut reported = false;
        for _ in 0..60 {
            if !observer.disconnected.lock().unwrap().is_empty() {
                reported = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(reported, "connection failure should reach the observer");
        assert_eq!(observer.connected.load(Ordering::SeqCst), 0);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_factory_rejects_invalid_url() {
        let factory = MqttTransportFactory::new(settings("invalid-url", Duration::from_secs(1)));
        let observer: Arc<dyn TransportObserver> = Arc::new(RecordingObserver::default());
        let result = factory.create(&ConnectionCredentials::new("id", "", ""), observer);
        assert!(matches!(result, Err(TransportError::InvalidBrokerUrl(_))));
    }
}
