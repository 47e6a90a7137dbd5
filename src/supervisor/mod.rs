//! Connection supervisor
//!
//! Owns the broker connection for the listener role. A recurring health check
//! reconnects with the stored credentials whenever the transport is down,
//! unless the last disconnect was requested by the user. Reconnects are
//! single-flight: a tick that finds a connect under way does nothing.
//!
//! Every transport is created with an observer tagged by a generation number.
//! Replacing the transport bumps the generation, so late callbacks from a
//! replaced transport are ignored.

pub mod health;

pub use health::{HealthCheckOutcome, HealthSnapshot};

use crate::config::SupervisorSection;
use crate::error::{OperationResult, OperationStatus};
use crate::scheduler::RecurringTask;
use crate::sink::{spawn_ingest_worker, IngestStats, IngestStatsSnapshot, MessageSink};
use crate::telemetry::RawPayload;
use crate::transport::{
    ConnectionState, Transport, TransportError, TransportFactory, TransportObserver,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

/// Broker credentials, reused verbatim on every reconnect
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionCredentials {
    client_id: String,
    username: String,
    secret: String,
}

impl ConnectionCredentials {
    pub fn new(
        client_id: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for ConnectionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCredentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("secret", &"***")
            .finish()
    }
}

/// Supervisor tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub health_check_interval: Duration,
    /// Topic filter subscribed after every successful handshake
    pub subscribe_topic: String,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_section(&SupervisorSection::default())
    }
}

impl SupervisorSettings {
    pub fn from_section(section: &SupervisorSection) -> Self {
        Self {
            health_check_interval: Duration::from_millis(section.health_check_interval_ms),
            subscribe_topic: section.subscribe_topic.clone(),
        }
    }
}

/// Mutable connection state; only ever touched under the state lock
#[derive(Default)]
struct SupervisorState {
    credentials: Option<ConnectionCredentials>,
    connection: ConnectionState,
    user_initiated_disconnect: bool,
    generation: u64,
    transport: Option<Arc<dyn Transport>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectOrigin {
    Explicit,
    HealthCheck,
}

struct SupervisorInner {
    factory: Arc<dyn TransportFactory>,
    settings: SupervisorSettings,
    state: Mutex<SupervisorState>,
    state_tx: watch::Sender<ConnectionState>,
    // Held for the whole of a connect or disconnect
    connect_gate: tokio::sync::Mutex<()>,
    health_task: Mutex<Option<RecurringTask>>,
    inbound_tx: mpsc::UnboundedSender<RawPayload>,
    connect_attempts: AtomicU64,
    publish_acks: AtomicU64,
}

impl SupervisorInner {
    fn lock_state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_connection(&self, state: &mut SupervisorState, connection: ConnectionState) {
        state.connection = connection;
        self.state_tx.send_replace(connection);
    }

    /// Move to Disconnected if `generation` is still the live transport
    fn mark_disconnected(&self, generation: u64) {
        let mut state = self.lock_state();
        if state.generation == generation && state.connection != ConnectionState::Disconnected {
            self.set_connection(&mut state, ConnectionState::Disconnected);
        }
    }

    fn active_transport(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let state = self.lock_state();
        match &state.transport {
            Some(transport) if state.connection == ConnectionState::Connected => {
                Ok(Arc::clone(transport))
            }
            _ => Err(TransportError::NotConnected {
                state: state.connection,
            }),
        }
    }

    fn health_snapshot(&self, connect_in_flight: bool) -> HealthSnapshot {
        let state = self.lock_state();
        HealthSnapshot {
            has_credentials: state.credentials.is_some(),
            transport_connected: state
                .transport
                .as_ref()
                .is_some_and(|transport| transport.is_connected()),
            user_initiated_disconnect: state.user_initiated_disconnect,
            connect_in_flight,
            state: state.connection,
        }
    }

    /// Replace the transport and start a handshake. Caller holds the connect gate.
    async fn establish(
        self: &Arc<Self>,
        credentials: ConnectionCredentials,
        origin: ConnectOrigin,
    ) -> Result<(), TransportError> {
        let (generation, previous) = {
            let mut state = self.lock_state();
            state.generation += 1;
            state.credentials = Some(credentials.clone());
            if origin == ConnectOrigin::Explicit {
                state.user_initiated_disconnect = false;
            }
            let previous = state.transport.take();
            self.set_connection(&mut state, ConnectionState::Connecting);
            (state.generation, previous)
        };

        if let Some(previous) = previous {
            if let Err(e) = previous.disconnect().await {
                debug!(error = %e, "Previous transport did not disconnect cleanly");
            }
        }

        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        info!(
            client_id = credentials.client_id(),
            generation,
            origin = ?origin,
            "Connecting to broker"
        );

        let observer = Arc::new(SupervisorObserver {
            inner: Arc::downgrade(self),
            generation,
        });
        let transport = match self.factory.create(&credentials, observer) {
            Ok(transport) => transport,
            Err(e) => {
                self.mark_disconnected(generation);
                return Err(e);
            }
        };
        self.lock_state().transport = Some(Arc::clone(&transport));

        if let Err(e) = transport.connect().await {
            self.mark_disconnected(generation);
            return Err(e);
        }
        Ok(())
    }

    /// Replace the live health check schedule
    fn arm_health_check(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let task = RecurringTask::start(
            "health-check",
            self.settings.health_check_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner
                            .health_tick()
                            .instrument(crate::mqtt_span!(operation = "health_check"))
                            .await;
                    }
                }
            },
        );
        let previous = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        drop(previous);
    }

    fn cancel_health_check(&self) -> bool {
        let task = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        task.is_some()
    }

    async fn health_tick(self: &Arc<Self>) -> HealthCheckOutcome {
        let gate = self.connect_gate.try_lock();
        let outcome = HealthCheckOutcome::evaluate(&self.health_snapshot(gate.is_err()));

        match outcome {
            HealthCheckOutcome::Reconnect => {
                let credentials = self.lock_state().credentials.clone();
                if let Some(credentials) = credentials {
                    info!("Connection down, reconnecting with stored credentials");
                    if let Err(e) = self
                        .establish(credentials, ConnectOrigin::HealthCheck)
                        .await
                    {
                        warn!(error = %e, "Reconnect attempt failed, next tick retries");
                    }
                }
            }
            HealthCheckOutcome::Healthy => trace!("Connection healthy"),
            HealthCheckOutcome::NoCredentials => debug!("No credentials set, skipping check"),
            other => debug!(outcome = ?other, "Health check skipped reconnect"),
        }

        drop(gate);
        outcome
    }

    fn spawn_resubscribe(self: &Arc<Self>, generation: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available, skipping re-subscribe");
            return;
        };
        let inner = Arc::clone(self);
        runtime.spawn(async move {
            let transport = {
                let state = inner.lock_state();
                if state.generation != generation {
                    return;
                }
                state.transport.clone()
            };
            let Some(transport) = transport else {
                return;
            };
            let topic = &inner.settings.subscribe_topic;
            match transport.subscribe(topic).await {
                Ok(()) => info!(topic = %topic, "Subscribed after handshake"),
                Err(e) => warn!(topic = %topic, error = %e, "Re-subscribe failed"),
            }
        });
    }
}

/// Transport callbacks bound to one transport generation
struct SupervisorObserver {
    inner: Weak<SupervisorInner>,
    generation: u64,
}

impl SupervisorObserver {
    /// The supervisor, if this observer's transport is still the live one
    fn current(&self) -> Option<Arc<SupervisorInner>> {
        let inner = self.inner.upgrade()?;
        let is_current = inner.lock_state().generation == self.generation;
        if is_current {
            Some(inner)
        } else {
            trace!(generation = self.generation, "Ignoring callback from replaced transport");
            None
        }
    }
}

impl TransportObserver for SupervisorObserver {
    fn on_connected(&self) {
        let Some(inner) = self.current() else {
            return;
        };
        {
            let mut state = inner.lock_state();
            if state.generation != self.generation {
                return;
            }
            inner.set_connection(&mut state, ConnectionState::Connected);
        }
        info!(generation = self.generation, "Broker handshake complete");
        inner.spawn_resubscribe(self.generation);
    }

    fn on_disconnected(&self, reason: &str) {
        let Some(inner) = self.current() else {
            return;
        };
        inner.mark_disconnected(self.generation);
        warn!(reason, "Broker connection lost");
    }

    fn on_publish_ack(&self, packet_id: u16) {
        if let Some(inner) = self.current() {
            inner.publish_acks.fetch_add(1, Ordering::Relaxed);
            trace!(packet_id, "Publish acknowledged");
        }
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        let Some(inner) = self.current() else {
            return;
        };
        if inner
            .inbound_tx
            .send(RawPayload::new(topic, payload.to_vec()))
            .is_err()
        {
            debug!(topic, "Ingest queue closed, dropping message");
        }
    }
}

/// Supervised broker connection feeding a [`MessageSink`]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
    sink: Arc<MessageSink>,
    ingest_stats: Arc<IngestStats>,
    _ingest_worker: JoinHandle<()>,
}

impl ConnectionSupervisor {
    /// Create a supervisor. Must be called within a tokio runtime: the ingest
    /// worker is spawned here.
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        settings: SupervisorSettings,
        sink: Arc<MessageSink>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let ingest_stats = Arc::new(IngestStats::default());
        let ingest_worker =
            spawn_ingest_worker(inbound_rx, Arc::clone(&sink), Arc::clone(&ingest_stats));

        let inner = Arc::new(SupervisorInner {
            factory,
            settings,
            state: Mutex::new(SupervisorState::default()),
            state_tx,
            connect_gate: tokio::sync::Mutex::new(()),
            health_task: Mutex::new(None),
            inbound_tx,
            connect_attempts: AtomicU64::new(0),
            publish_acks: AtomicU64::new(0),
        });

        Self {
            inner,
            sink,
            ingest_stats,
            _ingest_worker: ingest_worker,
        }
    }

    /// Connect with `credentials`, or report that a connection already exists.
    ///
    /// Any previous transport is discarded. The health check is re-armed and
    /// the user-disconnect flag cleared whether or not the handshake starts.
    pub async fn connect(&self, credentials: ConnectionCredentials) -> OperationResult {
        let _gate = self.inner.connect_gate.lock().await;

        if self.inner.lock_state().connection == ConnectionState::Connected {
            debug!("Connect requested while connected");
            return OperationResult::success(OperationStatus::AlreadyConnected, "Already connected");
        }

        let result = self
            .inner
            .establish(credentials, ConnectOrigin::Explicit)
            .await;
        self.inner.arm_health_check();

        match result {
            Ok(()) => OperationResult::success(OperationStatus::Connected, "Connecting to broker"),
            Err(e) => {
                warn!(error = %e, "Connect failed, health check will retry");
                e.into()
            }
        }
    }

    /// Stop supervising and close the connection. Suppresses reconnects until
    /// the next explicit [`connect`](Self::connect).
    pub async fn disconnect(&self) -> OperationResult {
        let _gate = self.inner.connect_gate.lock().await;
        let had_health_check = self.inner.cancel_health_check();

        let (transport, was_active) = {
            let mut state = self.inner.lock_state();
            let was_active = state.transport.is_some() || state.credentials.is_some();
            state.generation += 1;
            state.credentials = None;
            state.user_initiated_disconnect = true;
            self.inner
                .set_connection(&mut state, ConnectionState::Disconnected);
            (state.transport.take(), was_active)
        };

        if let Some(transport) = transport {
            if let Err(e) = transport.disconnect().await {
                warn!(error = %e, "Transport did not disconnect cleanly");
            }
        }

        if was_active || had_health_check {
            info!("Disconnected by user");
            OperationResult::success(OperationStatus::Disconnected, "Disconnected")
        } else {
            OperationResult::success(OperationStatus::AlreadyDisconnected, "Already disconnected")
        }
    }

    /// Run one health check now, outside the schedule
    pub async fn check_health(&self) -> HealthCheckOutcome {
        self.inner.health_tick().await
    }

    /// Publish through the live transport
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let transport = self.inner.active_transport()?;
        transport.publish(topic, payload).await
    }

    pub async fn subscribe(&self, topic: &str) -> OperationResult {
        let result = match self.inner.active_transport() {
            Ok(transport) => transport.subscribe(topic).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                OperationResult::success(OperationStatus::Subscribed, format!("Subscribed to {topic}"))
            }
            Err(e) => e.into(),
        }
    }

    pub async fn unsubscribe(&self, topic: &str) -> OperationResult {
        let result = match self.inner.active_transport() {
            Ok(transport) => transport.unsubscribe(topic).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => OperationResult::success(
                OperationStatus::Unsubscribed,
                format!("Unsubscribed from {topic}"),
            ),
            Err(e) => e.into(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock_state().connection
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Wait until the state equals `target`. Returns false on timeout.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.inner.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|state| *state == target))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    /// Credentials the health check reconnects with
    pub fn stored_credentials(&self) -> Option<ConnectionCredentials> {
        self.inner.lock_state().credentials.clone()
    }

    pub fn user_initiated_disconnect(&self) -> bool {
        self.inner.lock_state().user_initiated_disconnect
    }

    pub fn health_check_armed(&self) -> bool {
        self.inner
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Transports created so far, explicit and automatic
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn publish_acks(&self) -> u64 {
        self.inner.publish_acks.load(Ordering::Relaxed)
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    pub fn sink(&self) -> &Arc<MessageSink> {
        &self.sink
    }

    pub fn ingest_stats(&self) -> IngestStatsSnapshot {
        self.ingest_stats.snapshot()
    }
}
