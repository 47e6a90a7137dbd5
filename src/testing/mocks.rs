//! Mock implementations for testing
//!
//! [`MockTransportFactory`] hands out [`MockTransport`]s that record what they
//! were asked to do and let tests fire the observer callbacks a broker would
//! cause. With loopback enabled, a publish is delivered back to the same
//! transport's observer when it matches one of its subscriptions.

use crate::supervisor::ConnectionCredentials;
use crate::transport::{
    ConnectionState, Transport, TransportError, TransportFactory, TransportObserver,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

pub type PublishedMessage = (String, Vec<u8>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// MQTT topic filter match with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// How a mock transport answers `connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeBehavior {
    /// Report `on_connected` from within `connect`
    #[default]
    Accept,
    /// Stay in Connecting until the test calls [`MockTransport::simulate_connected`]
    Manual,
}

/// Mock transport for testing
pub struct MockTransport {
    credentials: ConnectionCredentials,
    observer: Arc<dyn TransportObserver>,
    handshake: HandshakeBehavior,
    loopback: bool,
    state: Mutex<ConnectionState>,
    published: Mutex<Vec<PublishedMessage>>,
    publish_times: Mutex<Vec<Instant>>,
    subscriptions: Mutex<Vec<String>>,
    subscribe_calls: AtomicUsize,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    // Publishes after this many successes fail
    fail_publishes_after: Mutex<Option<usize>>,
    next_packet_id: AtomicU16,
}

impl MockTransport {
    pub fn new(
        credentials: ConnectionCredentials,
        observer: Arc<dyn TransportObserver>,
        handshake: HandshakeBehavior,
        loopback: bool,
    ) -> Self {
        Self {
            credentials,
            observer,
            handshake,
            loopback,
            state: Mutex::new(ConnectionState::Disconnected),
            published: Mutex::new(Vec::new()),
            publish_times: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            subscribe_calls: AtomicUsize::new(0),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            fail_publishes_after: Mutex::new(None),
            next_packet_id: AtomicU16::new(1),
        }
    }

    pub fn credentials(&self) -> &ConnectionCredentials {
        &self.credentials
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    pub fn publish_times(&self) -> Vec<Instant> {
        lock(&self.publish_times).clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Let `successes` more publishes through, then fail every publish
    pub fn fail_publishes_after(&self, successes: usize) {
        let already = lock(&self.published).len();
        *lock(&self.fail_publishes_after) = Some(already + successes);
    }

    /// Broker accepted the handshake
    pub fn simulate_connected(&self) {
        *lock(&self.state) = ConnectionState::Connected;
        self.observer.on_connected();
    }

    /// Connection dropped without the client asking
    pub fn simulate_disconnect(&self, reason: &str) {
        *lock(&self.state) = ConnectionState::Disconnected;
        self.observer.on_disconnected(reason);
    }

    /// Broker delivered a message
    pub fn simulate_message(&self, topic: &str, payload: &[u8]) {
        self.observer.on_message(topic, payload);
    }

    fn publish_allowed(&self) -> bool {
        match *lock(&self.fail_publishes_after) {
            Some(limit) => lock(&self.published).len() < limit,
            None => true,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state) = ConnectionState::Connecting;
        if self.handshake == HandshakeBehavior::Accept {
            self.simulate_connected();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state) = ConnectionState::Disconnected;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(TransportError::NotConnected { state });
        }
        if !self.publish_allowed() {
            return Err(TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: "Mock publish failure".to_string(),
            });
        }

        lock(&self.published).push((topic.to_string(), payload.clone()));
        lock(&self.publish_times).push(Instant::now());
        let packet_id = self.next_packet_id.fetch_add(1, Ordering::SeqCst);
        self.observer.on_publish_ack(packet_id);

        let delivered = self.loopback
            && lock(&self.subscriptions)
                .iter()
                .any(|filter| topic_matches(filter, topic));
        if delivered {
            self.observer.on_message(topic, &payload);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(TransportError::NotConnected { state });
        }
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let mut subscriptions = lock(&self.subscriptions);
        if !subscriptions.iter().any(|s| s == topic) {
            subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(TransportError::NotConnected { state });
        }
        lock(&self.subscriptions).retain(|s| s != topic);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }
}

/// Factory that records every transport it creates
#[derive(Default)]
pub struct MockTransportFactory {
    handshake: HandshakeBehavior,
    loopback: bool,
    fail_create: bool,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    /// Transports complete the handshake as soon as they connect
    pub fn auto_connecting() -> Self {
        Self::default()
    }

    /// Transports wait for [`MockTransport::simulate_connected`]
    pub fn manual() -> Self {
        Self {
            handshake: HandshakeBehavior::Manual,
            ..Self::default()
        }
    }

    /// Every `create` fails
    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    /// Auto-connecting transports that echo publishes to matching subscriptions
    pub fn loopback() -> Self {
        Self {
            loopback: true,
            ..Self::default()
        }
    }

    pub fn created_count(&self) -> usize {
        lock(&self.created).len()
    }

    pub fn transport(&self, index: usize) -> Option<Arc<MockTransport>> {
        lock(&self.created).get(index).cloned()
    }

    pub fn latest(&self) -> Option<Arc<MockTransport>> {
        lock(&self.created).last().cloned()
    }

    pub fn created_credentials(&self) -> Vec<ConnectionCredentials> {
        lock(&self.created)
            .iter()
            .map(|t| t.credentials().clone())
            .collect()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        credentials: &ConnectionCredentials,
        observer: Arc<dyn TransportObserver>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        if self.fail_create {
            return Err(TransportError::ConnectionFailed(
                "Mock connection failure".to_string(),
            ));
        }
        let transport = Arc::new(MockTransport::new(
            credentials.clone(),
            observer,
            self.handshake,
            self.loopback,
        ));
        lock(&self.created).push(Arc::clone(&transport));
        Ok(transport)
    }
}
