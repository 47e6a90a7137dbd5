//! Ingest worker: normalizes queued inbound payloads into the sink
//!
//! The transport callback only enqueues; normalization and the file append
//! run here, off the network I/O task.

use super::MessageSink;
use crate::telemetry::{NormalizationError, RawPayload};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Outcome counters for inbound payloads
#[derive(Debug, Default)]
pub struct IngestStats {
    accepted: AtomicU64,
    decode_errors: AtomicU64,
    field_type_errors: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub accepted: u64,
    pub decode_errors: u64,
    pub field_type_errors: u64,
    pub discarded: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            field_type_errors: self.field_type_errors.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    fn record_error(&self, error: &NormalizationError) {
        let counter = match error {
            NormalizationError::Decode(_) => &self.decode_errors,
            NormalizationError::FieldType { .. } => &self.field_type_errors,
            NormalizationError::NoMeasurement => &self.discarded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Normalize one payload and record it. Rejections are counted and logged, never raised.
pub fn ingest(payload: RawPayload, sink: &MessageSink, stats: &IngestStats) {
    let topic = payload.topic.clone();
    match payload.normalize() {
        Ok(record) => {
            debug!(topic = %topic, record = %record, "Telemetry record accepted");
            sink.append(record);
            stats.accepted.fetch_add(1, Ordering::Relaxed);
        }
        Err(error) => {
            stats.record_error(&error);
            if error.is_silent() {
                debug!(topic = %topic, "Payload without measurements discarded");
            } else {
                warn!(topic = %topic, kind = ?error.kind(), error = %error, "Payload rejected");
            }
        }
    }
}

/// Drain `queue` into `sink` until every sender is gone
pub fn spawn_ingest_worker(
    mut queue: mpsc::UnboundedReceiver<RawPayload>,
    sink: Arc<MessageSink>,
    stats: Arc<IngestStats>,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            while let Some(payload) = queue.recv().await {
                ingest(payload, &sink, &stats);
            }
            info!(stats = ?stats.snapshot(), "Ingest queue closed");
        }
        .instrument(crate::ingest_span!(queue = "inbound")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_counts_each_outcome() {
        let sink = MessageSink::in_memory();
        let stats = IngestStats::default();

        ingest(RawPayload::new("a", br#"{"temperature": 20.5}"#.to_vec()), &sink, &stats);
        ingest(RawPayload::new("a", b"{oops".to_vec()), &sink, &stats);
        ingest(RawPayload::new("a", br#"{"humidity": "wet"}"#.to_vec()), &sink, &stats);
        ingest(RawPayload::new("a", br#"{"status": "online"}"#.to_vec()), &sink, &stats);

        assert_eq!(
            stats.snapshot(),
            IngestStatsSnapshot {
                accepted: 1,
                decode_errors: 1,
                field_type_errors: 1,
                discarded: 1,
            }
        );
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_worker_drains_queue_in_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(MessageSink::in_memory());
        let stats = Arc::new(IngestStats::default());
        let worker = spawn_ingest_worker(rx, sink.clone(), stats.clone());

        for time in [3, 1, 2] {
            let bytes = format!(r#"{{"time": {time}, "pressure": 1000}}"#);
            tx.send(RawPayload::new("t", bytes.into_bytes())).unwrap();
        }
        drop(tx);
        worker.await.unwrap();

        let times: Vec<i64> = sink
            .snapshot_and_clear()
            .iter()
            .map(|r| r.time_millis())
            .collect();
        assert_eq!(times, vec![3, 1, 2]);
        assert_eq!(stats.snapshot().accepted, 3);
    }
}
