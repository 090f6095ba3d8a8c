//! Real-time task progress notifications.
//!
//! A [`ProgressEngine`] runs staged background tasks for users, keeps the last
//! events of every user in a bounded history, and fans new events out to any
//! number of live [`StreamSession`]s per user. Sessions resume from a
//! `Last-Event-ID`, send heartbeats while idle and deregister when dropped.
//! [`api::router`] exposes the engine over HTTP with server-sent events.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod history;
pub mod hub;
pub mod runner;
pub mod session;
pub mod stream;

pub use config::{EngineConfig, ServerConfig};
pub use engine::ProgressEngine;
pub use error::{ConfigError, EngineError};
pub use events::{ProgressEvent, TaskStatus};
pub use stream::StreamSession;
