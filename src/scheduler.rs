//! Recurring background tasks with handle-based cancellation
//!
//! Starting a task returns a [`RecurringTask`] handle. Dropping the handle (or
//! calling [`RecurringTask::cancel`]) stops the schedule, so at most one live
//! schedule exists per owner without any string tags.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Handle to a running recurring task
#[derive(Debug)]
pub struct RecurringTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl RecurringTask {
    /// Run `tick` every `period`, first run one period from now.
    ///
    /// Ticks never overlap: a tick that overruns delays the next one instead of
    /// stacking up missed ticks. Must be called from within a tokio runtime.
    pub fn start<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        debug!(task = name, period_ms = period.as_millis() as u64, "Recurring task started");
        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the schedule. Equivalent to dropping the handle.
    pub fn cancel(self) {}
}

impl Drop for RecurringTask {
    fn drop(&mut self) {
        self.handle.abort();
        debug!(task = self.name, "Recurring task cancelled");
    }
}
