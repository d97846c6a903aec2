//! Postgres-backed durable queue.
//!
//! Dequeue claims one visible row with `FOR UPDATE SKIP LOCKED` and pushes
//! its `visible_at` past the visibility window in the same statement, so
//! competing workers never double-claim and a crashed worker's message
//! simply becomes visible again.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::time::Instant;

use super::{Queue, QueueError, QueueMessage, LONG_POLL};

/// Idle pause between dequeue attempts within one long-poll.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn try_receive(&self, visibility: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let row = sqlx::query(
            "WITH picked AS (
                 SELECT job_id FROM purge_jobs
                 WHERE visible_at <= now()
                 ORDER BY job_id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE purge_jobs
             SET visible_at = now() + make_interval(secs => $1)
             WHERE job_id IN (SELECT job_id FROM picked)
             RETURNING job_id, body::text",
        )
        .bind(visibility.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| {
            let id: i64 = row.get("job_id");
            QueueMessage { id: id.to_string(), body: row.get("body") }
        }))
    }
}

#[async_trait]
impl Queue for PgQueue {
    async fn send(&self, body: &str) -> Result<(), QueueError> {
        sqlx::query("INSERT INTO purge_jobs (body) VALUES ($1::jsonb)")
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn receive(&self, visibility: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let deadline = Instant::now() + LONG_POLL;
        loop {
            if let Some(message) = self.try_receive(visibility).await? {
                return Ok(Some(message));
            }
            if Instant::now() + POLL_INTERVAL > deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn delete(&self, id: &str) -> Result<(), QueueError> {
        let job_id: i64 = id
            .parse()
            .map_err(|_| QueueError::Other(format!("bad job id {id:?}")))?;
        sqlx::query("DELETE FROM purge_jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
