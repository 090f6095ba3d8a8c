//! Per-user event hub: history buffer plus live fan-out.
//!
//! Each user gets a [`UserChannel`] holding their [`UserHistory`] and a
//! `broadcast` sender. Stream sessions hold the receiving side; dropping a
//! session drops its receiver, which is the whole deregistration story.
//!
//! ```text
//! TaskRunner ── publish(event) ──► UserChannel(user)
//!                                    ├─ lock history
//!                                    ├─ append (assign sequence, trim to capacity)
//!                                    ├─ sender.send(event) ──► receiver S1, S2, ...
//!                                    └─ unlock
//!
//! StreamSession ── attach(user, resume) ──► UserChannel(user)
//!                                    ├─ lock history
//!                                    ├─ backlog = resume_after(resume)
//!                                    ├─ receiver = sender.subscribe()
//!                                    └─ unlock
//! ```
//!
//! Because `publish` and `attach` take the same per-user lock, an event lands
//! in an attaching session's backlog or in its receiver, never both and never
//! neither. Different users never contend on the same lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::broadcast;

use crate::events::ProgressEvent;
use crate::history::UserHistory;

struct UserChannel {
    history: Mutex<UserHistory>,
    sender: broadcast::Sender<ProgressEvent>,
}

impl UserChannel {
    fn history(&self) -> MutexGuard<'_, UserHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What a stream session starts from.
pub struct Attachment {
    /// Stored events the client missed, oldest first.
    pub backlog: Vec<ProgressEvent>,
    /// Sequence of the newest stored event at attach time.
    pub cursor: u64,
    /// Live events published after the attach.
    pub receiver: broadcast::Receiver<ProgressEvent>,
}

pub struct EventHub {
    users: RwLock<HashMap<String, Arc<UserChannel>>>,
    history_capacity: usize,
    channel_capacity: usize,
}

impl EventHub {
    pub fn new(history_capacity: usize, channel_capacity: usize) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            history_capacity: history_capacity.max(1),
            channel_capacity: channel_capacity.max(1),
        }
    }

    fn channel(&self, user_id: &str) -> Arc<UserChannel> {
        {
            let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(channel) = users.get(user_id) {
                return Arc::clone(channel);
            }
        }

        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let channel = users.entry(user_id.to_string()).or_insert_with(|| {
            let (sender, _rx) = broadcast::channel(self.channel_capacity);
            Arc::new(UserChannel {
                history: Mutex::new(UserHistory::new(self.history_capacity)),
                sender,
            })
        });
        Arc::clone(channel)
    }

    fn existing(&self, user_id: &str) -> Option<Arc<UserChannel>> {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        users.get(user_id).cloned()
    }

    /// Append `event` to its user's history and push it to every live session
    /// of that user. Returns the stored (stamped) event.
    pub fn publish(&self, event: ProgressEvent) -> ProgressEvent {
        let channel = self.channel(&event.user_id);
        let mut history = channel.history();
        let stored = history.append(event);

        // No receivers is not an error: nobody is watching right now.
        let delivered = channel.sender.send(stored.clone()).unwrap_or(0);
        drop(history);

        tracing::debug!(
            user_id = %stored.user_id,
            task_id = %stored.task_id,
            event_id = %stored.event_id,
            status = stored.status.as_str(),
            delivered,
            "Published progress event"
        );
        stored
    }

    /// Register a live receiver for `user_id` and collect the backlog after
    /// `last_event_id`, atomically with respect to `publish`.
    pub fn attach(&self, user_id: &str, last_event_id: Option<&str>) -> Attachment {
        let channel = self.channel(user_id);
        let history = channel.history();

        let backlog = match last_event_id {
            Some(id) if !id.is_empty() => history.resume_after(id),
            _ => Vec::new(),
        };
        let cursor = history.last_sequence();
        let receiver = channel.sender.subscribe();
        drop(history);

        Attachment {
            backlog,
            cursor,
            receiver,
        }
    }

    /// Stored events for `user_id` after `last_event_id`; see [`UserHistory::replay_after`].
    pub fn replay_after(&self, user_id: &str, last_event_id: &str) -> Vec<ProgressEvent> {
        self.existing(user_id)
            .map(|channel| channel.history().replay_after(last_event_id))
            .unwrap_or_default()
    }

    /// Stored events for `user_id` with a sequence greater than `sequence`.
    pub fn events_since(&self, user_id: &str, sequence: u64) -> Vec<ProgressEvent> {
        self.existing(user_id)
            .map(|channel| channel.history().events_since(sequence))
            .unwrap_or_default()
    }

    /// Number of live sessions currently attached for `user_id`.
    pub fn subscriber_count(&self, user_id: &str) -> usize {
        self.existing(user_id)
            .map(|channel| channel.sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn history_len(&self, user_id: &str) -> usize {
        self.existing(user_id)
            .map(|channel| channel.history().len())
            .unwrap_or(0)
    }
}
