//! Durable queue seam for purge jobs.
//!
//! At-least-once delivery: a received message stays invisible for the
//! caller's visibility window and reappears unless deleted.  Receivers
//! long-poll up to [`LONG_POLL`].

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryQueue;
pub use postgres::PgQueue;

/// Upper bound on a single `receive` long-poll.
pub const LONG_POLL: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("SQL: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub body: String,
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn send(&self, body: &str) -> Result<(), QueueError>;

    /// Long-poll for the next visible message; `None` after an idle poll.
    /// The message stays hidden for `visibility` and is redelivered if not
    /// deleted in time.
    async fn receive(&self, visibility: Duration) -> Result<Option<QueueMessage>, QueueError>;

    async fn delete(&self, id: &str) -> Result<(), QueueError>;
}
