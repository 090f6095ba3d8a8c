//! Per-connection stream driver: backlog, then live events, then heartbeats.
//!
//! ## Phases
//! ```text
//! Attaching(user, resume)         registers the live receiver and snapshots the
//!   │                             backlog under the user's hub lock
//!   ▼
//! ReplayingBacklog ──► each missed event, oldest first
//!   │                 ──► heartbeat "Connection established"
//!   ▼
//! Streaming ──► loop select {
//!   │             cancelled            → Closed
//!   │             live event           → emit (dropped if not newer than cursor)
//!   │             lagged               → re-read history after cursor
//!   │             idle for interval    → heartbeat "Connection alive"
//!   │           }
//!   ▼
//! Closed ──► receiver released, stream ends
//! ```
//!
//! The cancellation token is checked first on every poll; once it fires the
//! session yields nothing more. Dropping the session (client went away) drops
//! its receiver, which removes it from the user's subscriber set.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::events::ProgressEvent;
use crate::hub::EventHub;

pub const CONNECTION_ESTABLISHED: &str = "Connection established";
pub const CONNECTION_ALIVE: &str = "Connection alive";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Receiver registered and backlog captured; nothing yielded yet.
    Attaching,
    ReplayingBacklog,
    Streaming,
    Closed,
}

enum Wake {
    Cancelled,
    Message(Result<ProgressEvent, RecvError>),
    Idle,
}

pub struct StreamSession {
    user_id: String,
    hub: Arc<EventHub>,
    phase: Phase,
    /// Backlog while replaying; history re-read after a lag while streaming.
    pending: VecDeque<ProgressEvent>,
    receiver: Option<broadcast::Receiver<ProgressEvent>>,
    /// Newest stored sequence this session has accounted for.
    cursor: u64,
    last_emit: Instant,
    heartbeat_interval: Duration,
    token: CancellationToken,
    /// Cancels a linked token when the session goes away.
    _link: Option<DropGuard>,
}

impl StreamSession {
    /// Attach to `user_id`'s events, resuming after `last_event_id` if given.
    pub fn attach(
        hub: Arc<EventHub>,
        user_id: &str,
        last_event_id: Option<&str>,
        heartbeat_interval: Duration,
        token: CancellationToken,
    ) -> Self {
        let attachment = hub.attach(user_id, last_event_id);

        if let Some(id) = last_event_id.filter(|id| !id.is_empty()) {
            if id.parse::<u64>().is_err() {
                debug!("Ignoring malformed resume point {:?} for user {}", id, user_id);
            }
            debug!(
                "Replaying {} missed events for user {} after {}",
                attachment.backlog.len(),
                user_id,
                id
            );
        }

        Self {
            user_id: user_id.to_string(),
            hub,
            phase: Phase::Attaching,
            pending: attachment.backlog.into(),
            receiver: Some(attachment.receiver),
            cursor: attachment.cursor,
            last_emit: Instant::now(),
            heartbeat_interval: heartbeat_interval.max(Duration::from_millis(1)),
            token,
            _link: None,
        }
    }

    /// Tie `guard` to the session's lifetime.
    pub fn with_drop_guard(mut self, guard: DropGuard) -> Self {
        self._link = Some(guard);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Next event to deliver, or `None` once the session is closed.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        if self.token.is_cancelled() {
            self.close();
        }

        if self.phase == Phase::Attaching {
            self.phase = Phase::ReplayingBacklog;
        }

        match self.phase {
            Phase::Attaching | Phase::ReplayingBacklog => {
                if let Some(event) = self.pending.pop_front() {
                    return Some(self.emitted(event));
                }
                self.phase = Phase::Streaming;
                let hello = ProgressEvent::heartbeat(&self.user_id, self.cursor, CONNECTION_ESTABLISHED);
                Some(self.emitted(hello))
            }
            Phase::Streaming => {
                let next = self.next_live().await;
                if next.is_none() {
                    self.close();
                }
                next
            }
            Phase::Closed => None,
        }
    }

    async fn next_live(&mut self) -> Option<ProgressEvent> {
        loop {
            while let Some(event) = self.pending.pop_front() {
                if self.advance(&event) {
                    return Some(self.emitted(event));
                }
            }

            let deadline = self.last_emit + self.heartbeat_interval;
            let wake = {
                let receiver = self.receiver.as_mut()?;
                let token = &self.token;
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Wake::Cancelled,
                    msg = receiver.recv() => Wake::Message(msg),
                    _ = sleep_until(deadline) => Wake::Idle,
                }
            };

            match wake {
                Wake::Cancelled => return None,
                Wake::Message(Ok(event)) => {
                    if self.advance(&event) {
                        return Some(self.emitted(event));
                    }
                    debug!(
                        "Skipping already delivered event {} for user {}",
                        event.event_id, self.user_id
                    );
                }
                Wake::Message(Err(RecvError::Lagged(skipped))) => {
                    warn!(
                        "Stream for user {} lagged by {} events, resyncing from history",
                        self.user_id, skipped
                    );
                    self.pending = self.hub.events_since(&self.user_id, self.cursor).into();
                }
                Wake::Message(Err(RecvError::Closed)) => return None,
                Wake::Idle => {
                    let beat = ProgressEvent::heartbeat(&self.user_id, self.cursor, CONNECTION_ALIVE);
                    return Some(self.emitted(beat));
                }
            }
        }
    }

    /// Move the cursor past `event` if it is newer than anything delivered.
    fn advance(&mut self, event: &ProgressEvent) -> bool {
        match event.sequence() {
            Some(seq) if seq > self.cursor => {
                self.cursor = seq;
                true
            }
            _ => false,
        }
    }

    fn emitted(&mut self, event: ProgressEvent) -> ProgressEvent {
        self.last_emit = Instant::now();
        event
    }

    fn close(&mut self) {
        if self.phase != Phase::Closed {
            self.phase = Phase::Closed;
            self.pending.clear();
            self.receiver = None;
            info!("Stream closed for user {}", self.user_id);
        }
    }

    /// Adapt the session into a `Stream` that ends when the session closes.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        futures::stream::unfold(self, |mut session| async move {
            session.next_event().await.map(|event| (event, session))
        })
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if self.phase != Phase::Closed {
            debug!("Stream for user {} dropped by its consumer", self.user_id);
        }
    }
}
