use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::hub::EventHub;
use crate::runner::TaskRunner;
use crate::session::SessionTracker;
use crate::stream::StreamSession;

/// The notification engine: task runner, per-user event hub and session
/// tracker behind one handle.
pub struct ProgressEngine {
    config: EngineConfig,
    hub: Arc<EventHub>,
    runner: TaskRunner,
    sessions: Arc<SessionTracker>,
    shutdown: CancellationToken,
}

impl ProgressEngine {
    pub fn new(config: EngineConfig) -> Self {
        let hub = Arc::new(EventHub::new(config.history_capacity, config.channel_capacity));
        let sessions = Arc::new(SessionTracker::new(
            config.session_timeout,
            config.session_sweep_interval,
        ));
        Self {
            runner: TaskRunner::new(Arc::clone(&hub)),
            hub,
            sessions,
            shutdown: CancellationToken::new(),
            config,
        }
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Start a staged task for `user_id`; returns its id without waiting.
    pub fn start_task(
        &self,
        user_id: &str,
        task_name: &str,
        estimated_duration_seconds: u64,
    ) -> Result<String, EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        self.runner.start_task(user_id, task_name, estimated_duration_seconds)
    }

    pub fn cancel_task(&self, user_id: &str, task_id: &str) -> Result<(), EngineError> {
        self.runner.cancel_task(user_id, task_id)
    }

    pub fn running_tasks(&self, user_id: &str) -> Vec<String> {
        self.runner.running_tasks(user_id)
    }

    /// Open a stream session for `user_id`, resuming after `last_event_id`.
    ///
    /// The session ends when `token` or the engine's shutdown token fires.
    pub fn open_stream(
        &self,
        user_id: &str,
        last_event_id: Option<&str>,
        token: CancellationToken,
    ) -> StreamSession {
        self.sessions.register(user_id);

        match last_event_id {
            Some(id) if !id.is_empty() => info!("User {} reconnected, last event ID: {}", user_id, id),
            _ => info!("User {} connected to progress stream", user_id),
        }

        let linked = self.link(token);
        let guard = linked.clone().drop_guard();
        StreamSession::attach(
            Arc::clone(&self.hub),
            user_id,
            last_event_id,
            self.config.heartbeat_interval,
            linked,
        )
        .with_drop_guard(guard)
    }

    /// Child of the shutdown token that also fires when `token` does. The
    /// forwarding task ends once the returned token is cancelled, which the
    /// session's drop guard guarantees.
    fn link(&self, token: CancellationToken) -> CancellationToken {
        let linked = self.shutdown.child_token();
        let forward = linked.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => forward.cancel(),
                _ = forward.cancelled() => {}
            }
        });
        linked
    }

    pub fn register_activity(&self, user_id: &str) {
        self.sessions.register(user_id);
    }

    pub fn active_user_count(&self) -> usize {
        self.sessions.active_count()
    }

    /// Token that fires when the engine shuts down. Transports derive per-
    /// connection tokens from it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the periodic session sweep. It stops on shutdown.
    pub fn start_background(&self) -> JoinHandle<()> {
        self.sessions.spawn_sweeper(self.shutdown.child_token())
    }

    /// Close every stream, cancel every running task and wait up to `grace`
    /// for the tasks to report their cancellation.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        info!("Shutting down progress engine");
        self.shutdown.cancel();
        self.runner.shutdown();

        let drained = self.runner.wait_idle(grace).await;
        if drained {
            info!("All tasks stopped");
        } else {
            tracing::warn!(
                "{} tasks still running after {:?}",
                self.runner.running_task_count(),
                grace
            );
        }
        drained
    }
}

impl Default for ProgressEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
