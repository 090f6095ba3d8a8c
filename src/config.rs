//! Engine and server settings.
//!
//! Defaults mirror the behavior clients rely on (50 events of history, 30s
//! heartbeats, 5 minute sessions swept every minute). The server reads
//! overrides from the environment.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::history::DEFAULT_HISTORY_CAPACITY;

/// Floor for timer periods read from the environment; a zero period would spin.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Stored events kept per user for resumption.
    pub history_capacity: usize,
    /// Idle time after which a stream emits a heartbeat.
    pub heartbeat_interval: Duration,
    /// A user is active while their last activity is within this window.
    pub session_timeout: Duration,
    /// How often stale sessions are purged in the background.
    pub session_sweep_interval: Duration,
    /// Ring size of each user's live broadcast channel.
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            heartbeat_interval: Duration::from_secs(30),
            session_timeout: Duration::from_secs(5 * 60),
            session_sweep_interval: Duration::from_secs(60),
            channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `TASK_HISTORY_CAPACITY`, `HEARTBEAT_INTERVAL_SECS`,
    /// `SESSION_TIMEOUT_SECS`, `SESSION_SWEEP_SECS` and `CHANNEL_CAPACITY`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            history_capacity: parse_or(&lookup, "TASK_HISTORY_CAPACITY", defaults.history_capacity)?
                .max(1),
            heartbeat_interval: secs_or(&lookup, "HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?
                .max(MIN_INTERVAL),
            session_timeout: secs_or(&lookup, "SESSION_TIMEOUT_SECS", defaults.session_timeout)?,
            session_sweep_interval: secs_or(&lookup, "SESSION_SWEEP_SECS", defaults.session_sweep_interval)?
                .max(MIN_INTERVAL),
            channel_capacity: parse_or(&lookup, "CHANNEL_CAPACITY", defaults.channel_capacity)?.max(1),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub engine: EngineConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            port: parse_or(&lookup, "PORT", 3001)?,
            engine: EngineConfig::from_lookup(lookup)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
    }
}

fn secs_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(_) => parse_or(lookup, key, 0u64).map(Duration::from_secs),
    }
}
