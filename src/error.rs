//! Error taxonomy and structured operation results
//!
//! Every externally callable operation reports through [`OperationResult`]:
//! a status, an optional named error kind and a human readable detail string.
//! Failures never escape past an operation boundary as panics.

use crate::publisher::PublisherError;
use crate::telemetry::NormalizationError;
use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Umbrella error type for the telemetry bridge
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Normalization error: {0}")]
    Normalization(#[from] NormalizationError),

    #[error("Publisher error: {0}")]
    Publisher(#[from] PublisherError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Sink error: {0}")]
    Sink(#[from] crate::sink::SinkError),
}

impl TelemetryError {
    /// Map the error onto its named kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            TelemetryError::Transport(TransportError::NotConnected { .. }) => {
                ErrorKind::NotConnectedError
            }
            TelemetryError::Transport(_) => ErrorKind::TransportError,
            TelemetryError::Normalization(e) => e.kind(),
            TelemetryError::Publisher(e) => e.kind(),
            TelemetryError::Config(_) => ErrorKind::ConfigError,
            TelemetryError::Sink(_) => ErrorKind::SinkError,
        }
    }
}

/// Result type for bridge operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Named error kinds surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransportError,
    DecodeError,
    FieldTypeError,
    /// Payload carried no measurement; dropped without surfacing
    Discarded,
    AlreadyRunningError,
    NotConnectedError,
    DatasetRowError,
    DatasetError,
    PublishFailure,
    ConfigError,
    SinkError,
}

/// Outcome of an externally callable operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Connected,
    AlreadyConnected,
    Disconnected,
    AlreadyDisconnected,
    Subscribed,
    Unsubscribed,
    Published,
    Started,
    Stopping,
    NotRunning,
    Error,
}

/// Structured result returned by every externally callable operation
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub timestamp: DateTime<Utc>,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub detail: String,
}

impl OperationResult {
    pub fn success<S: Into<String>>(status: OperationStatus, detail: S) -> Self {
        Self {
            timestamp: Utc::now(),
            status,
            error_kind: None,
            detail: detail.into(),
        }
    }

    pub fn failure<S: AsRef<str>>(kind: ErrorKind, detail: S) -> Self {
        Self {
            timestamp: Utc::now(),
            status: OperationStatus::Error,
            error_kind: Some(kind),
            detail: sanitize_error_message(detail.as_ref()),
        }
    }

    pub fn from_error(error: &TelemetryError) -> Self {
        Self::failure(error.kind(), error.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.status != OperationStatus::Error
    }
}

impl From<TelemetryError> for OperationResult {
    fn from(error: TelemetryError) -> Self {
        Self::from_error(&error)
    }
}

impl From<PublisherError> for OperationResult {
    fn from(error: PublisherError) -> Self {
        Self::from_error(&error.into())
    }
}

impl From<TransportError> for OperationResult {
    fn from(error: TransportError) -> Self {
        Self::from_error(&error.into())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|secret|token|key)[=:]\s*\S+").expect("valid secret pattern")
});

const MAX_DETAIL_LEN: usize = 500;

/// Redact credentials from detail strings and cap their length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    if sanitized.len() > MAX_DETAIL_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_DETAIL_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
