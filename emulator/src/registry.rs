//! Process-wide queue registry and task name tombstones
//!
//! The registry maps fully qualified queue names to running queues and keeps
//! the set of every task name ever issued. Name-space operations (create,
//! delete) serialize on the registry's own locks; everything per-queue goes
//! through the queue's lock, so slow queues never block unrelated RPCs.

use shared::api::{PayloadType, Queue as WireQueue, Task as WireTask};
use shared::names;
use shared::EmulatorError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::dispatcher::HttpDispatcher;
use crate::queue::TaskQueue;

/// Registry of queues plus the tombstone set of issued task names.
pub struct QueueRegistry {
    queues: RwLock<HashMap<String, Arc<TaskQueue>>>,
    /// Every task name the emulator has ever issued. Names stay here for the
    /// process lifetime so completed tasks cannot be recreated, unless a
    /// hard-reset purge clears a queue's entries.
    tombstones: Mutex<HashSet<String>>,
    dispatcher: Arc<HttpDispatcher>,
    hard_reset_on_purge: bool,
}

impl QueueRegistry {
    pub fn new(dispatcher: Arc<HttpDispatcher>, hard_reset_on_purge: bool) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            tombstones: Mutex::new(HashSet::new()),
            dispatcher,
            hard_reset_on_purge,
        }
    }

    /// Creates a queue under the given parent.
    pub async fn create_queue(
        &self,
        parent: &str,
        queue: WireQueue,
    ) -> Result<WireQueue, EmulatorError> {
        names::validate_location_name(parent)?;
        if queue.name.is_empty() {
            return Err(EmulatorError::InvalidArgument(
                "queue name is required".to_string(),
            ));
        }
        names::validate_queue_name(&queue.name)?;
        if !queue.name.starts_with(&format!("{}/queues/", parent)) {
            return Err(EmulatorError::InvalidArgument(format!(
                "queue name '{}' does not belong to parent '{}'",
                queue.name, parent
            )));
        }

        let rate_limits = queue.rate_limits.clone().unwrap_or_default();
        validate_rate_limits(&rate_limits)?;
        let retry_config = queue.retry_config.clone().unwrap_or_default();
        validate_retry_config(&retry_config)?;

        let mut queues = self.queues.write().await;
        if queues.contains_key(&queue.name) {
            return Err(EmulatorError::AlreadyExists(format!(
                "queue '{}' already exists",
                queue.name
            )));
        }

        let task_queue = TaskQueue::start(
            queue.name.clone(),
            rate_limits,
            retry_config,
            queue.app_engine_routing_override.clone(),
            self.dispatcher.clone(),
        );
        let snapshot = task_queue.to_wire().await;
        queues.insert(queue.name.clone(), task_queue);
        info!(queue = %queue.name, "Queue created");
        Ok(snapshot)
    }

    /// Creates a queue with default configuration from its fully qualified
    /// name; used for the `initial_queues` startup list.
    pub async fn create_queue_from_name(&self, name: &str) -> Result<WireQueue, EmulatorError> {
        names::validate_queue_name(name)?;
        let parent = match name.rfind("/queues/") {
            Some(idx) => &name[..idx],
            None => name,
        };
        self.create_queue(
            parent,
            WireQueue {
                name: name.to_string(),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn get_queue(&self, name: &str) -> Result<WireQueue, EmulatorError> {
        let queue = self.lookup(name).await?;
        Ok(queue.to_wire().await)
    }

    /// Snapshot of every queue under the parent, ordered by name.
    pub async fn list_queues(&self, parent: &str) -> Result<Vec<WireQueue>, EmulatorError> {
        names::validate_location_name(parent)?;
        let prefix = format!("{}/queues/", parent);
        let queues: Vec<Arc<TaskQueue>> = {
            let map = self.queues.read().await;
            map.values()
                .filter(|queue| queue.name().starts_with(&prefix))
                .cloned()
                .collect()
        };
        let mut snapshots = Vec::with_capacity(queues.len());
        for queue in queues {
            snapshots.push(queue.to_wire().await);
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }

    pub async fn pause_queue(&self, name: &str) -> Result<WireQueue, EmulatorError> {
        let queue = self.lookup(name).await?;
        queue.pause().await;
        Ok(queue.to_wire().await)
    }

    pub async fn resume_queue(&self, name: &str) -> Result<WireQueue, EmulatorError> {
        let queue = self.lookup(name).await?;
        queue.resume().await;
        Ok(queue.to_wire().await)
    }

    /// Purges a queue's tasks. With hard reset enabled this waits for
    /// quiescence and forgets the queue's tombstoned task names, so names
    /// can be reused.
    pub async fn purge_queue(&self, name: &str) -> Result<WireQueue, EmulatorError> {
        let queue = self.lookup(name).await?;
        if self.hard_reset_on_purge {
            queue.purge_hard().await;
            let prefix = format!("{}/tasks/", name);
            let mut tombstones = self.tombstones.lock().await;
            tombstones.retain(|task_name| !task_name.starts_with(&prefix));
        } else {
            queue.purge().await;
        }
        Ok(queue.to_wire().await)
    }

    /// Purges the queue, stops its dispatch loop and removes it.
    pub async fn delete_queue(&self, name: &str) -> Result<(), EmulatorError> {
        names::validate_queue_name(name)?;
        let queue = {
            let mut queues = self.queues.write().await;
            queues.remove(name)
        };
        match queue {
            Some(queue) => {
                queue.shutdown().await;
                info!(queue = %name, "Queue deleted");
                Ok(())
            }
            None => Err(EmulatorError::NotFound(format!(
                "queue '{}' does not exist",
                name
            ))),
        }
    }

    /// Validates and stores a task, assigning a name when the client did not
    /// provide one.
    pub async fn create_task(
        &self,
        queue_name: &str,
        mut task: WireTask,
    ) -> Result<WireTask, EmulatorError> {
        names::validate_queue_name(queue_name)?;
        let queue = self.lookup(queue_name).await?;

        validate_payload(&task)?;

        if task.name.is_empty() {
            task.name = names::task_path(queue_name, &names::generate_task_id());
        } else {
            names::validate_task_name(&task.name)?;
            if names::task_parent(&task.name) != queue_name {
                return Err(EmulatorError::InvalidArgument(format!(
                    "task name '{}' does not belong to queue '{}'",
                    task.name, queue_name
                )));
            }
        }

        {
            let mut tombstones = self.tombstones.lock().await;
            if !tombstones.insert(task.name.clone()) {
                return Err(EmulatorError::AlreadyExists(format!(
                    "task '{}' already exists or was recently deleted",
                    task.name
                )));
            }
        }

        let stored = queue.create_task(task).await;
        debug!(task = %stored.name, "Task created");
        Ok(stored)
    }

    pub async fn get_task(&self, task_name: &str) -> Result<WireTask, EmulatorError> {
        names::validate_task_name(task_name)?;
        let queue = self.lookup(names::task_parent(task_name)).await?;
        queue.get_task(task_name).await.ok_or_else(|| {
            EmulatorError::NotFound(format!("task '{}' does not exist", task_name))
        })
    }

    pub async fn list_tasks(&self, queue_name: &str) -> Result<Vec<WireTask>, EmulatorError> {
        names::validate_queue_name(queue_name)?;
        let queue = self.lookup(queue_name).await?;
        Ok(queue.list_tasks().await)
    }

    pub async fn delete_task(&self, task_name: &str) -> Result<(), EmulatorError> {
        names::validate_task_name(task_name)?;
        let queue = self.lookup(names::task_parent(task_name)).await?;
        queue.delete_task(task_name).await
    }

    pub async fn run_task(&self, task_name: &str) -> Result<WireTask, EmulatorError> {
        names::validate_task_name(task_name)?;
        let queue = self.lookup(names::task_parent(task_name)).await?;
        queue.run_task(task_name).await
    }

    /// Stops every queue's dispatch loop; used for graceful shutdown.
    pub async fn shutdown_all(&self) {
        let queues: Vec<Arc<TaskQueue>> = {
            let mut map = self.queues.write().await;
            map.drain().map(|(_, queue)| queue).collect()
        };
        futures_util::future::join_all(queues.iter().map(|queue| queue.shutdown())).await;
        info!("All dispatch loops stopped");
    }

    async fn lookup(&self, name: &str) -> Result<Arc<TaskQueue>, EmulatorError> {
        let queues = self.queues.read().await;
        queues
            .get(name)
            .cloned()
            .ok_or_else(|| EmulatorError::NotFound(format!("queue '{}' does not exist", name)))
    }
}

fn validate_rate_limits(limits: &shared::api::RateLimits) -> Result<(), EmulatorError> {
    if !limits.max_dispatches_per_second.is_finite() || limits.max_dispatches_per_second <= 0.0 {
        return Err(EmulatorError::InvalidArgument(
            "maxDispatchesPerSecond must be positive".to_string(),
        ));
    }
    if limits.max_burst_size < 1 {
        return Err(EmulatorError::InvalidArgument(
            "maxBurstSize must be at least 1".to_string(),
        ));
    }
    if limits.max_concurrent_dispatches < 1 {
        return Err(EmulatorError::InvalidArgument(
            "maxConcurrentDispatches must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_retry_config(config: &shared::api::RetryConfig) -> Result<(), EmulatorError> {
    if config.max_attempts < -1 || config.max_attempts == 0 {
        return Err(EmulatorError::InvalidArgument(
            "maxAttempts must be positive, or -1 for unlimited".to_string(),
        ));
    }
    if config.min_backoff < 0.0 || config.max_backoff < 0.0 {
        return Err(EmulatorError::InvalidArgument(
            "backoff durations cannot be negative".to_string(),
        ));
    }
    if config.min_backoff > config.max_backoff {
        return Err(EmulatorError::InvalidArgument(
            "minBackoff cannot exceed maxBackoff".to_string(),
        ));
    }
    if config.max_doublings < 0 {
        return Err(EmulatorError::InvalidArgument(
            "maxDoublings cannot be negative".to_string(),
        ));
    }
    if let Some(duration) = config.max_retry_duration {
        if duration < 0.0 {
            return Err(EmulatorError::InvalidArgument(
                "maxRetryDuration cannot be negative".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_payload(task: &WireTask) -> Result<(), EmulatorError> {
    match &task.payload {
        None => Err(EmulatorError::InvalidArgument(
            "task requires an httpRequest or appEngineHttpRequest payload".to_string(),
        )),
        Some(PayloadType::HttpRequest(http)) => {
            let url = Url::parse(&http.url).map_err(|e| {
                EmulatorError::InvalidArgument(format!("invalid task URL '{}': {}", http.url, e))
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(EmulatorError::InvalidArgument(format!(
                    "task URL '{}' must use http or https",
                    http.url
                )));
            }
            validate_body(&http.body)
        }
        Some(PayloadType::AppEngineHttpRequest(app_engine)) => {
            if !app_engine.relative_uri.is_empty() && !app_engine.relative_uri.starts_with('/') {
                return Err(EmulatorError::InvalidArgument(format!(
                    "relativeUri '{}' must start with '/'",
                    app_engine.relative_uri
                )));
            }
            validate_body(&app_engine.body)
        }
    }
}

fn validate_body(body: &str) -> Result<(), EmulatorError> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    if body.is_empty() {
        return Ok(());
    }
    STANDARD
        .decode(body)
        .map(|_| ())
        .map_err(|e| EmulatorError::InvalidArgument(format!("task body is not valid base64: {}", e)))
}
