//! Active-user tracking with expiring sessions.
//!
//! - Runs a purge every `sweep_interval` (see [`SessionTracker::spawn_sweeper`])
//! - A user counts as active while their last activity is within `timeout`
//! - `active_count` purges before counting, so it never reports stale users

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct SessionTracker {
    sessions: Mutex<HashMap<String, Instant>>,
    timeout: Duration,
    sweep_interval: Duration,
}

impl SessionTracker {
    pub fn new(timeout: Duration, sweep_interval: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout,
            sweep_interval: sweep_interval.max(Duration::from_millis(1)),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record activity for `user_id` now.
    pub fn register(&self, user_id: &str) {
        self.sessions().insert(user_id.to_string(), Instant::now());
    }

    /// Purge stale sessions and return how many users remain active.
    pub fn active_count(&self) -> usize {
        let mut sessions = self.sessions();
        Self::purge(&mut sessions, self.timeout);
        sessions.len()
    }

    /// Drop every session whose last activity is older than the timeout.
    /// Returns the number of sessions removed.
    pub fn purge_expired(&self) -> usize {
        let mut sessions = self.sessions();
        Self::purge(&mut sessions, self.timeout)
    }

    fn purge(sessions: &mut HashMap<String, Instant>, timeout: Duration) -> usize {
        let before = sessions.len();
        let now = Instant::now();
        sessions.retain(|_, last_seen| now.duration_since(*last_seen) <= timeout);
        before - sessions.len()
    }

    /// Start the periodic purge. The loop exits when `token` is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                "[Sessions] Sweeping inactive sessions every {:?}",
                tracker.sweep_interval
            );

            let mut ticker = interval(tracker.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the first sweep waits a full period.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = tracker.purge_expired();
                        if removed > 0 {
                            debug!("[Sessions] Purged {} inactive sessions", removed);
                        }
                    }
                }
            }

            debug!("[Sessions] Sweeper stopped");
        })
    }
}
