use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task id used by synthetic heartbeat events.
pub const HEARTBEAT_TASK_ID: &str = "heartbeat";
/// Task name used by synthetic heartbeat events.
pub const HEARTBEAT_TASK_NAME: &str = "System";

/// Lifecycle state carried by a [`ProgressEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Cancelled,
    Heartbeat,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Heartbeat => "heartbeat",
        }
    }

    /// True for the statuses that end a task's event sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

/// One progress update for a task, as stored in history and sent to clients.
///
/// `event_id` is the decimal form of the per-user sequence number assigned when
/// the event is appended to history. Events that were never stored (drafts and
/// heartbeats) carry the id of the last stored event the receiver has seen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub event_id: String,
    pub task_id: String,
    pub user_id: String,
    pub task_name: String,
    pub progress_percentage: u8,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl ProgressEvent {
    /// Create an unstamped event; the hub assigns `event_id` on publish.
    pub fn new(
        task_id: &str,
        user_id: &str,
        task_name: &str,
        progress_percentage: u8,
        status: TaskStatus,
    ) -> Self {
        Self {
            event_id: String::new(),
            task_id: task_id.to_string(),
            user_id: user_id.to_string(),
            task_name: task_name.to_string(),
            progress_percentage: progress_percentage.min(100),
            status,
            timestamp: Utc::now(),
            message: None,
        }
    }

    /// Synthetic liveness event. Never persisted.
    pub fn heartbeat(user_id: &str, cursor: u64, message: &str) -> Self {
        Self::new(
            HEARTBEAT_TASK_ID,
            user_id,
            HEARTBEAT_TASK_NAME,
            0,
            TaskStatus::Heartbeat,
        )
        .with_event_id(cursor)
        .with_message(message)
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }

    pub fn with_event_id(mut self, sequence: u64) -> Self {
        self.event_id = sequence.to_string();
        self
    }

    /// Sequence number encoded in `event_id`, if it is one.
    pub fn sequence(&self) -> Option<u64> {
        self.event_id.parse().ok()
    }

    pub fn is_heartbeat(&self) -> bool {
        self.status == TaskStatus::Heartbeat
    }
}
