//! Bulk publisher
//!
//! Replays a dataset file to the broker, one canonical property-post message
//! per interval. One job runs at a time. A job stops at the first failed
//! publish, at the end of the dataset, or when [`BulkPublisher::stop`] is
//! called; stopping is cooperative and takes effect before the next record.

pub mod dataset;

pub use dataset::{parse_row, sort_dataset_in_place, DatasetError, DatasetRowError};

use crate::error::{ErrorKind, OperationResult, OperationStatus};
use crate::supervisor::ConnectionSupervisor;
use crate::telemetry::{PropertyPost, TelemetryReading};
use crate::transport::TransportError;
use csv::StringRecord;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("A publish job is already running")]
    AlreadyRunning,

    #[error("Not connected to the broker")]
    NotConnected,

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("Publish failed: {0}")]
    Publish(#[from] TransportError),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PublisherError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PublisherError::AlreadyRunning => ErrorKind::AlreadyRunningError,
            PublisherError::NotConnected => ErrorKind::NotConnectedError,
            PublisherError::Publish(TransportError::NotConnected { .. }) => {
                ErrorKind::NotConnectedError
            }
            PublisherError::Dataset(_) => ErrorKind::DatasetError,
            PublisherError::Publish(_) | PublisherError::Encode(_) => ErrorKind::PublishFailure,
        }
    }
}

/// Progress of the current or most recent job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishStatus {
    /// Successful publishes
    pub records_sent: u64,
    pub complete: bool,
    pub last_error: Option<String>,
    /// Rows dropped as malformed
    pub rows_skipped: u64,
    /// Rows consumed from the dataset so far
    pub cursor: u64,
}

#[derive(Default)]
struct PublishJob {
    status: PublishStatus,
    active: bool,
    cancel_requested: bool,
    cancel_tx: Option<watch::Sender<bool>>,
    dataset_path: Option<PathBuf>,
    topic: Option<String>,
}

/// Paced dataset replay through a [`ConnectionSupervisor`]
pub struct BulkPublisher {
    supervisor: Arc<ConnectionSupervisor>,
    interval: Duration,
    job: Arc<Mutex<PublishJob>>,
    next_message_id: Arc<AtomicU64>,
}

fn lock_job(job: &Mutex<PublishJob>) -> MutexGuard<'_, PublishJob> {
    job.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BulkPublisher {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, interval: Duration) -> Self {
        Self {
            supervisor,
            interval,
            job: Arc::new(Mutex::new(PublishJob::default())),
            next_message_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    /// Sort the dataset in place and start replaying it to `topic`
    pub async fn start(
        &self,
        dataset_path: impl Into<PathBuf>,
        topic: impl Into<String>,
    ) -> OperationResult {
        match self.try_start(dataset_path.into(), topic.into()).await {
            Ok(rows) => OperationResult::success(
                OperationStatus::Started,
                format!("Publishing {rows} dataset rows"),
            ),
            Err(e) => {
                warn!(error = %e, "Publish job not started");
                e.into()
            }
        }
    }

    async fn try_start(&self, dataset_path: PathBuf, topic: String) -> Result<usize, PublisherError> {
        let cancel_rx = {
            let mut job = lock_job(&self.job);
            if job.active {
                return Err(PublisherError::AlreadyRunning);
            }
            if !self.supervisor.is_connected() {
                return Err(PublisherError::NotConnected);
            }
            let (cancel_tx, cancel_rx) = watch::channel(false);
            *job = PublishJob {
                status: PublishStatus::default(),
                active: true,
                cancel_requested: false,
                cancel_tx: Some(cancel_tx),
                dataset_path: Some(dataset_path.clone()),
                topic: Some(topic.clone()),
            };
            cancel_rx
        };

        let sort_path = dataset_path.clone();
        let sorted = tokio::task::spawn_blocking(move || sort_dataset_in_place(&sort_path))
            .await
            .map_err(|e| DatasetError::Task(e.to_string()))
            .and_then(|result| result);
        let rows = match sorted {
            Ok(rows) => rows,
            Err(e) => {
                let mut job = lock_job(&self.job);
                job.status.last_error = Some(e.to_string());
                job.status.complete = true;
                job.active = false;
                return Err(e.into());
            }
        };

        let row_count = rows.len();
        info!(
            dataset = %dataset_path.display(),
            topic = %topic,
            rows = row_count,
            "Publish job started"
        );

        let worker = JobWorker {
            supervisor: Arc::clone(&self.supervisor),
            job: Arc::clone(&self.job),
            next_message_id: Arc::clone(&self.next_message_id),
            interval: self.interval,
            topic: topic.clone(),
        };
        let span = crate::publish_span!(dataset = %dataset_path.display(), topic = %topic);
        tokio::spawn(worker.run(rows, cancel_rx).instrument(span));

        Ok(row_count)
    }

    /// Ask the running job to stop before its next record
    pub fn stop(&self) -> OperationResult {
        let mut job = lock_job(&self.job);
        if !job.active {
            return OperationResult::success(OperationStatus::NotRunning, "No publish job running");
        }
        job.cancel_requested = true;
        if let Some(cancel_tx) = &job.cancel_tx {
            cancel_tx.send_replace(true);
        }
        info!("Stop requested for publish job");
        OperationResult::success(OperationStatus::Stopping, "Stop requested")
    }

    /// Consistent snapshot of job progress
    pub fn status(&self) -> PublishStatus {
        lock_job(&self.job).status.clone()
    }

    pub fn is_running(&self) -> bool {
        lock_job(&self.job).active
    }

    /// Dataset and topic of the current or last job
    pub fn job_target(&self) -> Option<(PathBuf, String)> {
        let job = lock_job(&self.job);
        Some((job.dataset_path.clone()?, job.topic.clone()?))
    }

    /// Publish one reading outside of any job
    pub async fn publish_reading(&self, topic: &str, reading: &TelemetryReading) -> OperationResult {
        let result = async {
            if !self.supervisor.is_connected() {
                return Err(PublisherError::NotConnected);
            }
            let post = PropertyPost::from_reading(self.message_id(), reading);
            self.supervisor.publish(topic, post.to_bytes()?).await?;
            Ok(post)
        }
        .await;

        match result {
            Ok(post) => OperationResult::success(
                OperationStatus::Published,
                format!("Published reading at {}", post.params.detect_time),
            ),
            Err(e) => e.into(),
        }
    }

    /// Publish a random plausible reading stamped with the current time
    pub async fn publish_random(&self, topic: &str) -> OperationResult {
        self.publish_reading(topic, &TelemetryReading::random()).await
    }

    fn message_id(&self) -> String {
        self.next_message_id.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// State the spawned job task needs
struct JobWorker {
    supervisor: Arc<ConnectionSupervisor>,
    job: Arc<Mutex<PublishJob>>,
    next_message_id: Arc<AtomicU64>,
    interval: Duration,
    topic: String,
}

impl JobWorker {
    fn cancel_requested(&self) -> bool {
        lock_job(&self.job).cancel_requested
    }

    async fn run(self, rows: Vec<StringRecord>, mut cancel_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for (index, row) in rows.iter().enumerate() {
            if self.cancel_requested() {
                break;
            }
            lock_job(&self.job).status.cursor = index as u64 + 1;

            let reading = match parse_row(row) {
                Ok(reading) => reading,
                Err(e) => {
                    warn!(line = index + 1, error = %e, "Skipping dataset row");
                    lock_job(&self.job).status.rows_skipped += 1;
                    continue;
                }
            };

            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel_rx.changed() => {}
            }
            if self.cancel_requested() {
                break;
            }

            if let Err(e) = self.publish(&reading).await {
                let mut job = lock_job(&self.job);
                let record_index = job.status.records_sent + 1;
                warn!(record = record_index, error = %e, "Publish failed, stopping job");
                job.status.last_error = Some(format!("Record {record_index} failed to publish: {e}"));
                break;
            }

            let sent = {
                let mut job = lock_job(&self.job);
                job.status.records_sent += 1;
                job.status.records_sent
            };
            debug!(records_sent = sent, time = reading.time_millis, "Record published");
        }

        let mut job = lock_job(&self.job);
        job.status.complete = true;
        job.active = false;
        if job.cancel_requested {
            info!(records_sent = job.status.records_sent, "Publish job cancelled");
        } else {
            info!(
                records_sent = job.status.records_sent,
                rows_skipped = job.status.rows_skipped,
                "Publish job finished"
            );
        }
    }

    async fn publish(&self, reading: &TelemetryReading) -> Result<(), PublisherError> {
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed).to_string();
        let payload = PropertyPost::from_reading(id, reading).to_bytes()?;
        self.supervisor.publish(&self.topic, payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MessageSink;
    use crate::supervisor::{ConnectionCredentials, SupervisorSettings};
    use crate::testing::mocks::MockTransportFactory;

    async fn connected_publisher(
        interval: Duration,
    ) -> (Arc<MockTransportFactory>, BulkPublisher) {
        let factory = Arc::new(MockTransportFactory::auto_connecting());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            factory.clone(),
            SupervisorSettings {
                health_check_interval: Duration::from_secs(3600),
                subscribe_topic: "#".to_string(),
            },
            Arc::new(MessageSink::in_memory()),
        ));
        supervisor
            .connect(ConnectionCredentials::new("pub", "", ""))
            .await;
        (factory, BulkPublisher::new(supervisor, interval))
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            PublisherError::AlreadyRunning.kind(),
            ErrorKind::AlreadyRunningError
        );
        assert_eq!(PublisherError::NotConnected.kind(), ErrorKind::NotConnectedError);
        assert_eq!(
            PublisherError::Publish(TransportError::PublishFailed {
                topic: "t".into(),
                reason: "rc=4".into()
            })
            .kind(),
            ErrorKind::PublishFailure
        );
    }

    #[tokio::test]
    async fn test_stop_without_job() {
        let (_factory, publisher) = connected_publisher(Duration::from_millis(10)).await;
        assert_eq!(publisher.stop().status, OperationStatus::NotRunning);
        assert_eq!(publisher.status(), PublishStatus::default());
    }

    #[tokio::test]
    async fn test_publish_reading_wire_format() {
        let (factory, publisher) = connected_publisher(Duration::from_millis(10)).await;
        let reading = TelemetryReading {
            time_millis: 1000,
            temperature: 20.0,
            humidity: 50.0,
            pressure: 1000,
        };

        let result = publisher.publish_reading("a/b", &reading).await;
        assert_eq!(result.status, OperationStatus::Published);

        let published = factory.latest().unwrap().published();
        assert_eq!(published.len(), 1);
        let post: PropertyPost = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(post.id, "1");
        assert_eq!(post.params.detect_time, "1000");
    }

    #[tokio::test]
    async fn test_missing_dataset_fails_start() {
        let (_factory, publisher) = connected_publisher(Duration::from_millis(10)).await;
        let result = publisher.start("/nonexistent/THP_data.csv", "t").await;

        assert_eq!(result.error_kind, Some(ErrorKind::DatasetError));
        assert!(!publisher.is_running());
        let status = publisher.status();
        assert!(status.complete);
        assert!(status.last_error.is_some());
    }
}
