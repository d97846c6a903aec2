//! In-memory queue used by the test suites.  Same visibility semantics as
//! the Postgres adapter, with a short poll so tests stay fast.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Queue, QueueError, QueueMessage};

struct Entry {
    id: u64,
    body: String,
    visible_at: Instant,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: Vec<Entry>,
}

#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    /// Long-poll bound; shortened by tests.
    long_poll: Option<Duration>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue whose idle `receive` returns after `long_poll`.
    pub fn with_long_poll(long_poll: Duration) -> Self {
        Self { long_poll: Some(long_poll), ..Self::default() }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_receive(&self, visibility: Duration) -> Option<QueueMessage> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.iter_mut().find(|e| e.visible_at <= now)?;
        entry.visible_at = now + visibility;
        Some(QueueMessage { id: entry.id.to_string(), body: entry.body.clone() })
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn send(&self, body: &str) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push(Entry {
                id,
                body: body.to_owned(),
                visible_at: Instant::now(),
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, visibility: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let deadline = Instant::now() + self.long_poll.unwrap_or(super::LONG_POLL);
        loop {
            if let Some(message) = self.try_receive(visibility) {
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(Duration::from_millis(50));
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    async fn delete(&self, id: &str) -> Result<(), QueueError> {
        let id: u64 = id
            .parse()
            .map_err(|_| QueueError::Other(format!("bad job id {id:?}")))?;
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|e| e.id != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receive_hides_then_redelivers() {
        let queue = MemoryQueue::with_long_poll(Duration::from_millis(50));
        queue.send("job-1").await.unwrap();

        let first = queue
            .receive(Duration::from_millis(80))
            .await
            .unwrap()
            .expect("message available");
        assert_eq!(first.body, "job-1");

        // Hidden inside the visibility window.
        assert!(queue.receive(Duration::from_millis(80)).await.unwrap().is_none());

        // Redelivered once the window lapses without a delete.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let again = queue
            .receive(Duration::from_millis(80))
            .await
            .unwrap()
            .expect("redelivery");
        assert_eq!(again.id, first.id);

        queue.delete(&again.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(queue.receive(Duration::from_millis(80)).await.unwrap().is_none());
        assert!(queue.is_empty());
    }
}
