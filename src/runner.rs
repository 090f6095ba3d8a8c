//! Background task execution with staged progress.
//!
//! ## Stage loop
//! ```text
//! start_task(user, name, duration) ──► register token ──► spawn ──► return task id
//!
//! spawned:
//!   for stage in STAGES {
//!     ├─► cancelled?            → publish Cancelled(0%), exit
//!     ├─► publish Running(pct)  (Completed(100%) on the last stage)
//!     └─► sleep(step) ⟂ cancel  → publish Cancelled(0%), exit
//!   }
//!   on exit (any path, panics included): remove from registry
//! ```
//!
//! `step = duration_secs * 1000 / STAGES.len()` milliseconds. There is no sleep
//! after the last stage, so a completed task can no longer be cancelled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::events::{ProgressEvent, TaskStatus};
use crate::hub::EventHub;

/// Stage labels, in execution order.
pub const STAGES: [&str; 5] = [
    "Initializing...",
    "Processing data...",
    "Validating results...",
    "Generating report...",
    "Finalizing...",
];

/// Message carried by the terminal event of a cancelled task.
pub const CANCELLED_MESSAGE: &str = "Task was cancelled";

/// Percentage reported after finishing stage `index` (0-based) of `total`.
pub fn stage_percentage(index: usize, total: usize) -> u8 {
    let total = total.max(1);
    let pct = ((index + 1) * 100 + total / 2) / total;
    pct.min(100) as u8
}

/// Pause between two consecutive stages.
pub fn stage_interval(estimated_duration_seconds: u64, stages: usize) -> Duration {
    let stages = stages.max(1) as u64;
    Duration::from_millis(estimated_duration_seconds.saturating_mul(1000) / stages)
}

struct RunningTask {
    user_id: String,
    task_name: String,
    token: CancellationToken,
}

type TaskTable = Mutex<HashMap<String, RunningTask>>;

fn lock(tasks: &TaskTable) -> MutexGuard<'_, HashMap<String, RunningTask>> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a task from the registry when its execution ends, however it ends.
struct RegistryGuard {
    tasks: Arc<TaskTable>,
    idle: Arc<Notify>,
    task_id: String,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        let mut tasks = lock(&self.tasks);
        tasks.remove(&self.task_id);
        let now_idle = tasks.is_empty();
        drop(tasks);

        debug!("Task {} removed from registry", self.task_id);
        if now_idle {
            self.idle.notify_waiters();
        }
    }
}

/// Everything one spawned execution needs.
struct Execution {
    hub: Arc<EventHub>,
    task_id: String,
    user_id: String,
    task_name: String,
    step: Duration,
    token: CancellationToken,
}

impl Execution {
    async fn run(self) -> TaskStatus {
        let total = STAGES.len();

        for (index, label) in STAGES.iter().enumerate() {
            if self.token.is_cancelled() {
                return self.cancel();
            }

            let last = index + 1 == total;
            let status = if last {
                TaskStatus::Completed
            } else {
                TaskStatus::Running
            };
            self.publish(stage_percentage(index, total), status, label);

            if last {
                break;
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => return self.cancel(),
                _ = tokio::time::sleep(self.step) => {}
            }
        }

        info!("Task {} completed for user {}", self.task_id, self.user_id);
        TaskStatus::Completed
    }

    fn cancel(&self) -> TaskStatus {
        self.publish(0, TaskStatus::Cancelled, CANCELLED_MESSAGE);
        info!("Task {} cancelled for user {}", self.task_id, self.user_id);
        TaskStatus::Cancelled
    }

    fn publish(&self, pct: u8, status: TaskStatus, message: &str) {
        let event = ProgressEvent::new(&self.task_id, &self.user_id, &self.task_name, pct, status)
            .with_message(message);
        self.hub.publish(event);
    }
}

/// Starts, tracks and cancels background tasks.
pub struct TaskRunner {
    hub: Arc<EventHub>,
    tasks: Arc<TaskTable>,
    idle: Arc<Notify>,
    shutdown: CancellationToken,
}

impl TaskRunner {
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self {
            hub,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            idle: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start `task_name` for `user_id` in the background and return its id
    /// immediately. Must be called from within a tokio runtime.
    pub fn start_task(
        &self,
        user_id: &str,
        task_name: &str,
        estimated_duration_seconds: u64,
    ) -> Result<String, EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }

        let token = self.shutdown.child_token();
        let task_id = {
            let mut tasks = lock(&self.tasks);
            let task_id = loop {
                let candidate = new_task_id();
                if !tasks.contains_key(&candidate) {
                    break candidate;
                }
            };
            tasks.insert(
                task_id.clone(),
                RunningTask {
                    user_id: user_id.to_string(),
                    task_name: task_name.to_string(),
                    token: token.clone(),
                },
            );
            task_id
        };

        let guard = RegistryGuard {
            tasks: Arc::clone(&self.tasks),
            idle: Arc::clone(&self.idle),
            task_id: task_id.clone(),
        };
        let execution = Execution {
            hub: Arc::clone(&self.hub),
            task_id: task_id.clone(),
            user_id: user_id.to_string(),
            task_name: task_name.to_string(),
            step: stage_interval(estimated_duration_seconds, STAGES.len()),
            token,
        };

        tokio::spawn(async move {
            let _guard = guard;
            execution.run().await
        });

        info!(
            "Started task {} for user {}: {}",
            task_id, user_id, task_name
        );
        Ok(task_id)
    }

    /// Request cancellation of a running task owned by `user_id`.
    ///
    /// The task emits its cancellation event and leaves the registry on its own.
    pub fn cancel_task(&self, user_id: &str, task_id: &str) -> Result<(), EngineError> {
        let tasks = lock(&self.tasks);
        match tasks.get(task_id) {
            Some(task) if task.user_id == user_id => {
                task.token.cancel();
                debug!("Cancellation requested for task {} ({})", task_id, task.task_name);
                Ok(())
            }
            _ => Err(EngineError::TaskNotFound {
                task_id: task_id.to_string(),
            }),
        }
    }

    /// Sorted ids of the tasks currently running for `user_id`.
    pub fn running_tasks(&self, user_id: &str) -> Vec<String> {
        let tasks = lock(&self.tasks);
        let mut ids: Vec<String> = tasks
            .iter()
            .filter(|(_, task)| task.user_id == user_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn running_task_count(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Cancel every running task and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait until no task is registered, up to `grace`. Returns `true` if the
    /// registry drained in time.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if lock(&self.tasks).is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }
}

fn new_task_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
