//! Domain core: validation, quotas, ID minting, cache/store read-through,
//! and side-effect orchestration.
//!
//! Synchronous request paths return as soon as the minimum durable (or
//! recoverable) action is taken; everything else — cache writes, bus
//! publishes, batcher handoffs, purge enqueues — runs on spawned tasks
//! whose failures are logged and reconciled by later loads.

mod account;
mod draw;
mod keys;
mod load;
mod undo;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;
use wv_core::StrokeIdMinter;
use wv_protocol::Provider;

use crate::batch::{CounterUpdate, StrokeBatcherHandle};
use crate::cache::CacheBus;
use crate::error::ServiceError;
use crate::queue::Queue;
use crate::store::Store;

/// The authenticated identity a request acts as.  `key_version` is the
/// connection-local view, kept current by the state pump.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub provider: Provider,
    pub provider_id: String,
    pub key_version: u32,
}

pub struct Service {
    store: Arc<dyn Store>,
    cache: Arc<dyn CacheBus>,
    queue: Arc<dyn Queue>,
    strokes: StrokeBatcherHandle,
    counters: mpsc::Sender<CounterUpdate>,
    minter: StrokeIdMinter,
}

impl Service {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn CacheBus>,
        queue: Arc<dyn Queue>,
        strokes: StrokeBatcherHandle,
        counters: mpsc::Sender<CounterUpdate>,
    ) -> Self {
        Self {
            store,
            cache,
            queue,
            strokes,
            counters,
            minter: StrokeIdMinter::new(),
        }
    }

    /// Serialize and publish on the bus; failures are logged, never fatal.
    pub(crate) async fn publish_json<T: Serialize>(&self, channel: &str, value: &T) {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %channel, error = %e, "unserializable bus payload");
                return;
            }
        };
        if let Err(e) = self.cache.publish(channel, &payload).await {
            warn!(channel = %channel, error = %e, "bus publish failed");
        }
    }

    /// Enqueue a purge job; failures are logged, never fatal.
    pub(crate) async fn enqueue_purge(&self, job: &wv_protocol::PurgeJob) {
        let body = match serde_json::to_string(job) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "unserializable purge job");
                return;
            }
        };
        if let Err(e) = self.queue.send(&body).await {
            warn!(user_id = %job.user_id, error = %e, "purge enqueue failed");
        }
    }

    /// Cached per-user stroke count, reseeded from the store on a miss.
    /// The store value is *used* for the current check before seeding, so
    /// the missing-counter sentinel never masquerades as a count.
    pub(crate) async fn user_stroke_count(&self, user: &AuthUser) -> Result<u64, ServiceError> {
        match self.cache.user_strokes(&user.id).await {
            Ok(Some(count)) => return Ok(count),
            Ok(None) => {}
            Err(e) => warn!(user_id = %user.id, error = %e, "counter read failed; using store"),
        }
        let stored = self
            .store
            .get_user(user.provider, &user.provider_id)
            .await?
            .ok_or(ServiceError::Unauthenticated)?;
        let count = stored.stroke_count;
        if let Err(e) = self.cache.seed_user_strokes(&user.id, count).await {
            warn!(user_id = %user.id, error = %e, "counter seed failed");
        }
        Ok(count)
    }
}
