//! Queue ownership and the per-queue dispatch loop
//!
//! Every queue owns its task set, a token bucket, a concurrency semaphore
//! and one long-running dispatch loop. Task timers announce readiness on an
//! mpsc channel; the loop consumes names from that channel, passes the rate
//! and concurrency gates, claims the task and spawns the outbound request.
//! Outcome application re-acquires the queue lock and either removes the
//! task or reschedules it with backoff.
//!
//! Tasks are stored by name and timers carry only the task name, so there
//! are no reference cycles between queues, tasks and timers.

use chrono::{DateTime, TimeDelta, Utc};
use shared::api::{
    AppEngineRouting, Attempt, Queue as WireQueue, QueueState, RateLimits, RetryConfig, RpcStatus,
    Task as WireTask,
};
use shared::defaults::default_dispatch_deadline;
use shared::EmulatorError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock;
use crate::dispatcher::{DispatchOutcome, DispatchRequest, HttpDispatcher};
use crate::rate_limiter::TokenBucket;
use crate::task::{RetryPolicy, TaskEntry, TaskState};

/// Result of trying to claim a ready task for dispatch.
enum Claim {
    /// The task was claimed; fire the request.
    Dispatch {
        request: DispatchRequest,
        /// Purge generation at claim time; a mismatch before sending means
        /// the queue was hard-purged and the dispatch must not fire.
        generation: u64,
    },
    /// The queue was paused while the loop waited on its gates; the task
    /// was put back without counting an attempt.
    Deferred,
    /// The task no longer exists (deleted, purged, or already claimed).
    Gone,
}

struct QueueInner {
    state: QueueState,
    tasks: HashMap<String, TaskEntry>,
    /// Creation counter, used to break schedule-time ties
    next_seq: u64,
}

/// A single queue: task set, rate limiter, concurrency gate and dispatch
/// loop.
///
/// All mutable state lives behind `inner`; the lock is never held across a
/// dispatch or any other await point that depends on the outside world.
pub struct TaskQueue {
    name: String,
    rate_limits: RateLimits,
    retry_config: RetryConfig,
    retry_policy: RetryPolicy,
    routing_override: Option<AppEngineRouting>,
    dispatcher: Arc<HttpDispatcher>,
    inner: Mutex<QueueInner>,
    /// Timers and task creation push names here; the dispatch loop consumes
    /// them. Unbounded so that re-deferral from inside the loop can never
    /// deadlock on a full channel.
    ready_tx: mpsc::UnboundedSender<String>,
    paused_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    /// Purge generation; bumped by a hard purge to abort in-flight work
    abort_tx: watch::Sender<u64>,
    concurrency: Arc<Semaphore>,
    in_flight: AtomicUsize,
    quiesced: Notify,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Creates the queue and spawns its dispatch loop.
    pub fn start(
        name: String,
        rate_limits: RateLimits,
        retry_config: RetryConfig,
        routing_override: Option<AppEngineRouting>,
        dispatcher: Arc<HttpDispatcher>,
    ) -> Arc<Self> {
        // The loop's watch receivers are created here, before the loop is
        // spawned, so a pause or shutdown sent in the creation instant is
        // never missed.
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (paused_tx, paused_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (abort_tx, _) = watch::channel(0u64);
        let concurrency = Arc::new(Semaphore::new(
            rate_limits.max_concurrent_dispatches.max(1) as usize,
        ));
        let retry_policy = RetryPolicy::from_config(&retry_config);

        let queue = Arc::new(Self {
            name,
            rate_limits,
            retry_config,
            retry_policy,
            routing_override,
            dispatcher,
            inner: Mutex::new(QueueInner {
                state: QueueState::Running,
                tasks: HashMap::new(),
                next_seq: 0,
            }),
            ready_tx,
            paused_tx,
            shutdown_tx,
            abort_tx,
            concurrency,
            in_flight: AtomicUsize::new(0),
            quiesced: Notify::new(),
            loop_handle: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::run_loop(
            queue.clone(),
            ready_rx,
            shutdown_rx,
            paused_rx,
        ));
        *queue
            .loop_handle
            .try_lock()
            .expect("loop handle lock is uncontended at startup") = Some(handle);
        queue
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wire snapshot of the queue with its effective configuration.
    pub async fn to_wire(&self) -> WireQueue {
        let inner = self.inner.lock().await;
        WireQueue {
            name: self.name.clone(),
            app_engine_routing_override: self.routing_override.clone(),
            rate_limits: Some(self.rate_limits.clone()),
            retry_config: Some(self.retry_config.clone()),
            state: inner.state,
        }
    }

    /// Stores a validated task, arms its timer and returns the stored
    /// snapshot.
    pub async fn create_task(&self, mut task: WireTask) -> WireTask {
        let mut inner = self.inner.lock().await;
        let now = clock::now();
        task.create_time = Some(now);
        if task.schedule_time.is_none() {
            task.schedule_time = Some(now);
        }
        // Server-owned fields start from zero regardless of client input.
        task.dispatch_count = 0;
        task.response_count = 0;
        task.first_attempt = None;
        task.last_attempt = None;

        let name = task.name.clone();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let mut entry = TaskEntry {
            task,
            seq,
            state: TaskState::Pending,
            timer: None,
        };
        self.arm_timer(&mut entry);
        let snapshot = entry.task.clone();
        inner.tasks.insert(name, entry);
        snapshot
    }

    pub async fn get_task(&self, name: &str) -> Option<WireTask> {
        self.inner
            .lock()
            .await
            .tasks
            .get(name)
            .map(|entry| entry.task.clone())
    }

    /// Tasks ordered by schedule time, creation order breaking ties.
    pub async fn list_tasks(&self) -> Vec<WireTask> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<&TaskEntry> = inner.tasks.values().collect();
        entries.sort_by(|a, b| {
            a.task
                .schedule_time
                .cmp(&b.task.schedule_time)
                .then(a.seq.cmp(&b.seq))
        });
        entries.into_iter().map(|entry| entry.task.clone()).collect()
    }

    /// Removes a task and cancels its timer. A dispatch already in flight
    /// keeps running but its outcome is discarded.
    pub async fn delete_task(&self, name: &str) -> Result<(), EmulatorError> {
        let mut inner = self.inner.lock().await;
        match inner.tasks.remove(name) {
            Some(_) => Ok(()),
            None => Err(EmulatorError::NotFound(format!(
                "task '{}' does not exist",
                name
            ))),
        }
    }

    /// Forces immediate dispatch by moving the schedule time to now and
    /// rearming the timer.
    pub async fn run_task(&self, name: &str) -> Result<WireTask, EmulatorError> {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.tasks.get_mut(name) else {
            return Err(EmulatorError::NotFound(format!(
                "task '{}' does not exist",
                name
            )));
        };
        if entry.state == TaskState::Dispatching {
            return Err(EmulatorError::FailedPrecondition(format!(
                "task '{}' is currently being dispatched",
                name
            )));
        }
        entry.task.schedule_time = Some(clock::now());
        self.arm_timer(entry);
        Ok(entry.task.clone())
    }

    /// Pauses dispatching. The dispatch loop observes the flag before
    /// claiming the next task, and a claim that races the flag is deferred
    /// without counting an attempt.
    pub async fn pause(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = QueueState::Paused;
        let _ = self.paused_tx.send(true);
        debug!(queue = %self.name, "Queue paused");
    }

    pub async fn resume(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = QueueState::Running;
        let _ = self.paused_tx.send(false);
        debug!(queue = %self.name, "Queue resumed");
    }

    /// Drops every task and cancels its timer. In-flight dispatches keep
    /// running; their outcomes are discarded because the tasks are gone.
    pub async fn purge(&self) {
        let mut inner = self.inner.lock().await;
        let count = inner.tasks.len();
        inner.tasks.clear();
        debug!(queue = %self.name, count, "Queue purged");
    }

    /// Like [`purge`](Self::purge), but also aborts in-flight dispatches and
    /// returns only once the queue is quiescent.
    pub async fn purge_hard(&self) {
        {
            let mut inner = self.inner.lock().await;
            let count = inner.tasks.len();
            inner.tasks.clear();
            // Bumping the generation invalidates claimed-but-unsent
            // dispatches and interrupts those already on the wire.
            self.abort_tx.send_modify(|generation| *generation += 1);
            debug!(queue = %self.name, count, "Queue hard-purged");
        }
        self.await_quiescence().await;
    }

    /// Purges the queue, stops the dispatch loop and joins it.
    pub async fn shutdown(&self) {
        self.purge().await;
        let _ = self.shutdown_tx.send(true);
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!(queue = %self.name, "Dispatch loop stopped");
    }

    /// Waits until no dispatch is in flight for this queue.
    async fn await_quiescence(&self) {
        loop {
            let notified = self.quiesced.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a decrement between the
            // check and the await cannot be missed.
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Cancels any pending timer and either announces the task immediately
    /// or spawns a sleeper that will.
    fn arm_timer(&self, entry: &mut TaskEntry) {
        entry.cancel_timer();
        entry.state = TaskState::Pending;
        let when = entry.task.schedule_time.unwrap_or_else(clock::now);
        let name = entry.task.name.clone();
        let ready_tx = self.ready_tx.clone();

        if when <= clock::now() {
            // Already due: enqueue directly so creation order is preserved.
            let _ = ready_tx.send(name);
            return;
        }
        entry.timer = Some(tokio::spawn(async move {
            clock::sleep_until_wall(when).await;
            let _ = ready_tx.send(name);
        }));
    }

    /// Claims a ready task for dispatch, recording the attempt.
    async fn claim(&self, task_name: &str) -> Claim {
        let mut inner = self.inner.lock().await;

        if inner.state == QueueState::Paused {
            if inner.tasks.contains_key(task_name) {
                let _ = self.ready_tx.send(task_name.to_string());
                return Claim::Deferred;
            }
            return Claim::Gone;
        }

        let Some(entry) = inner.tasks.get_mut(task_name) else {
            return Claim::Gone;
        };
        if entry.state == TaskState::Dispatching {
            // A duplicate ready notification (e.g. RunTask racing a timer).
            return Claim::Gone;
        }
        let Some(payload) = entry.task.payload.clone() else {
            return Claim::Gone;
        };

        entry.cancel_timer();
        entry.state = TaskState::Dispatching;

        let now = clock::now();
        entry.task.dispatch_count += 1;
        let attempt = Attempt {
            schedule_time: entry.task.schedule_time,
            dispatch_time: Some(now),
            response_time: None,
            response_status: None,
        };
        if entry.task.first_attempt.is_none() {
            entry.task.first_attempt = Some(attempt.clone());
        }
        entry.task.last_attempt = Some(attempt);

        let request = DispatchRequest {
            task_name: entry.task.name.clone(),
            queue_name: self.name.clone(),
            payload,
            routing_override: self.routing_override.clone(),
            retry_count: entry.task.dispatch_count - 1,
            execution_count: entry.task.response_count,
            eta_unix: entry
                .task
                .schedule_time
                .map(clock::unix_seconds)
                .unwrap_or_else(|| clock::unix_seconds(now)),
            deadline: clock::duration_from_secs(
                entry
                    .task
                    .dispatch_deadline
                    .unwrap_or_else(default_dispatch_deadline),
            ),
        };
        Claim::Dispatch {
            request,
            generation: *self.abort_tx.borrow(),
        }
    }

    /// Applies a dispatch outcome: success removes the task, failure runs
    /// the retry policy. Outcomes for tasks that were deleted or purged in
    /// the meantime are discarded.
    async fn apply_outcome(&self, task_name: &str, outcome: DispatchOutcome) {
        let mut inner = self.inner.lock().await;
        let now = clock::now();
        let Some(entry) = inner.tasks.get_mut(task_name) else {
            debug!(task = %task_name, "Discarding outcome of a removed task");
            return;
        };

        match outcome {
            DispatchOutcome::Response { status } => {
                entry.task.response_count += 1;
                if let Some(attempt) = entry.task.last_attempt.as_mut() {
                    attempt.response_time = Some(now);
                    attempt.response_status = Some(RpcStatus::from_http(status));
                }
                if (200..300).contains(&status) {
                    debug!(task = %task_name, status, "Task completed");
                    inner.tasks.remove(task_name);
                } else {
                    self.retry_or_remove(&mut inner, task_name, now);
                }
            }
            DispatchOutcome::TransportError { message } => {
                if let Some(attempt) = entry.task.last_attempt.as_mut() {
                    attempt.response_time = Some(now);
                    attempt.response_status = Some(RpcStatus::unavailable(message.clone()));
                }
                warn!(task = %task_name, error = %message, "Dispatch failed without a response");
                self.retry_or_remove(&mut inner, task_name, now);
            }
            DispatchOutcome::NotDispatchable { message } => {
                if let Some(attempt) = entry.task.last_attempt.as_mut() {
                    attempt.response_time = Some(now);
                    attempt.response_status = Some(RpcStatus::internal(message.clone()));
                }
                warn!(task = %task_name, error = %message, "Task cannot be dispatched, removing it");
                inner.tasks.remove(task_name);
            }
        }
    }

    /// Reschedules a failed task with backoff, or removes it when its
    /// retries are exhausted.
    fn retry_or_remove(&self, inner: &mut QueueInner, task_name: &str, now: DateTime<Utc>) {
        let Some(entry) = inner.tasks.get_mut(task_name) else {
            return;
        };
        let first_attempt_at = entry
            .task
            .first_attempt
            .as_ref()
            .and_then(|attempt| attempt.dispatch_time);
        if self
            .retry_policy
            .is_exhausted(entry.task.dispatch_count, first_attempt_at, now)
        {
            debug!(
                task = %task_name,
                attempts = entry.task.dispatch_count,
                "Task is out of retries, removing it"
            );
            inner.tasks.remove(task_name);
            return;
        }

        let backoff = self.retry_policy.backoff_seconds(entry.task.dispatch_count);
        // Schedule times move strictly forward across retries.
        entry.task.schedule_time = Some(now + TimeDelta::microseconds((backoff * 1e6) as i64));
        self.arm_timer(entry);
        debug!(
            task = %task_name,
            attempts = entry.task.dispatch_count,
            backoff_seconds = backoff,
            "Task rescheduled with backoff"
        );
    }

    /// The dispatch loop: one long-running worker per queue.
    async fn run_loop(
        queue: Arc<Self>,
        mut ready_rx: mpsc::UnboundedReceiver<String>,
        mut shutdown_rx: watch::Receiver<bool>,
        mut paused_rx: watch::Receiver<bool>,
    ) {
        let mut bucket = TokenBucket::new(
            queue.rate_limits.max_dispatches_per_second,
            queue.rate_limits.max_burst_size,
        );

        debug!(queue = %queue.name, "Dispatch loop started");

        loop {
            // Hold off while paused; ResumeQueue (or shutdown) wakes us.
            while *paused_rx.borrow() {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    changed = paused_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }

            // Next ready task.
            let task_name = tokio::select! {
                _ = shutdown_rx.changed() => return,
                received = ready_rx.recv() => match received {
                    Some(name) => name,
                    None => return,
                },
            };

            // Rate limit, then a concurrency slot. Neither gate holds the
            // queue lock.
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = bucket.take() => {}
            }
            let permit = tokio::select! {
                _ = shutdown_rx.changed() => return,
                acquired = queue.concurrency.clone().acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            match queue.claim(&task_name).await {
                Claim::Dispatch {
                    request,
                    generation,
                } => {
                    queue.in_flight.fetch_add(1, Ordering::AcqRel);
                    let queue = queue.clone();
                    let mut abort_rx = queue.abort_tx.subscribe();
                    tokio::spawn(async move {
                        // The permit is held for the whole attempt so that
                        // at most max_concurrent_dispatches requests are in
                        // flight at any instant.
                        let outcome = if *abort_rx.borrow() != generation {
                            None
                        } else {
                            tokio::select! {
                                outcome = queue.dispatcher.dispatch(&request) => Some(outcome),
                                _ = abort_rx.changed() => None,
                            }
                        };
                        match outcome {
                            Some(outcome) => {
                                queue.apply_outcome(&request.task_name, outcome).await;
                            }
                            None => {
                                debug!(task = %request.task_name, "Dispatch aborted by hard purge");
                            }
                        }
                        drop(permit);
                        if queue.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                            queue.quiesced.notify_waiters();
                        }
                    });
                }
                Claim::Deferred | Claim::Gone => {
                    // Nothing was sent; the token goes back and the permit
                    // is released immediately.
                    bucket.give_back();
                    drop(permit);
                }
            }
        }
    }
}
