//! Health check decision logic
//!
//! The tick itself lives on the supervisor; this module only decides what a
//! tick should do given a snapshot of supervisor state.

use crate::transport::ConnectionState;
use serde::Serialize;

/// Supervisor state as seen by one health tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub has_credentials: bool,
    pub transport_connected: bool,
    pub user_initiated_disconnect: bool,
    pub connect_in_flight: bool,
    pub state: ConnectionState,
}

/// What a health tick decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckOutcome {
    /// Nothing to supervise yet
    NoCredentials,
    Healthy,
    /// Last disconnect was requested by the user
    Suppressed,
    /// A connect or handshake is already under way
    InFlight,
    Reconnect,
}

impl HealthCheckOutcome {
    /// Decide the tick outcome (pure function)
    pub fn evaluate(snapshot: &HealthSnapshot) -> Self {
        if !snapshot.has_credentials {
            return HealthCheckOutcome::NoCredentials;
        }
        if snapshot.transport_connected {
            return HealthCheckOutcome::Healthy;
        }
        if snapshot.user_initiated_disconnect {
            return HealthCheckOutcome::Suppressed;
        }
        if snapshot.connect_in_flight || snapshot.state == ConnectionState::Connecting {
            return HealthCheckOutcome::InFlight;
        }
        HealthCheckOutcome::Reconnect
    }
}
