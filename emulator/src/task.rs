//! Task state and retry arithmetic
//!
//! A task entry couples the wire representation of a task with the emulator's
//! internal bookkeeping: its creation sequence number (used to break
//! scheduling ties), its lifecycle state, and the handle of the timer that
//! will announce it to the dispatch loop.

use chrono::{DateTime, Utc};
use shared::api::RetryConfig;
use tokio::task::JoinHandle;

/// Lifecycle state of a task inside its queue.
///
/// `Pending` covers the window between (re)scheduling and the moment the
/// dispatch loop claims the task; `Dispatching` means an outbound request is
/// being prepared or in flight. Terminal tasks are removed from the queue
/// rather than kept in a dead state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Dispatching,
}

/// A task as stored inside its queue.
#[derive(Debug)]
pub struct TaskEntry {
    /// Wire representation; counts and attempt descriptors live here so that
    /// `GetTask` snapshots need no translation
    pub task: shared::api::Task,
    /// Creation order within the queue, used to break schedule-time ties
    pub seq: u64,
    pub state: TaskState,
    /// Handle of the sleeper that announces the task to the ready channel
    pub timer: Option<JoinHandle<()>>,
}

impl TaskEntry {
    /// Cancels the pending timer, if any.
    pub fn cancel_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
    }
}

impl Drop for TaskEntry {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// Retry policy of a queue, resolved to concrete values.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts; `-1` means unlimited
    pub max_attempts: i32,
    /// Time limit for retrying, measured from the first attempt, in seconds
    pub max_retry_duration: Option<f64>,
    pub min_backoff: f64,
    pub max_backoff: f64,
    pub max_doublings: i32,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            max_retry_duration: config.max_retry_duration,
            min_backoff: config.min_backoff,
            max_backoff: config.max_backoff,
            max_doublings: config.max_doublings,
        }
    }

    /// Whether a task that has just finished its `dispatch_count`-th attempt
    /// is out of retries.
    pub fn is_exhausted(
        &self,
        dispatch_count: i32,
        first_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.max_attempts >= 0 && dispatch_count >= self.max_attempts {
            return true;
        }
        if let (Some(limit), Some(first)) = (self.max_retry_duration, first_attempt_at) {
            let elapsed = (now - first).as_seconds_f64();
            if elapsed >= limit {
                return true;
            }
        }
        false
    }

    /// Backoff in seconds applied after the `dispatch_count`-th failed
    /// attempt.
    ///
    /// The delay doubles from `min_backoff` for the first `max_doublings`
    /// retries, then grows linearly in steps of `max_backoff`, and is capped
    /// at `max_backoff`.
    pub fn backoff_seconds(&self, dispatch_count: i32) -> f64 {
        let retries = (dispatch_count - 1).max(0);
        let doublings = retries.min(self.max_doublings);
        let base = self.min_backoff * 2f64.powi(doublings);
        let linear_steps = (retries - self.max_doublings).max(0);
        let backoff = base + linear_steps as f64 * self.max_backoff;
        backoff.min(self.max_backoff)
    }
}
