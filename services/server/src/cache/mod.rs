//! Cache/bus seam.
//!
//! One backend provides both the hot-page cache and the pub/sub bus the
//! instances fan out over.  The page cache keeps two distinct
//! responsibilities even though one adapter may fuse them:
//!
//! - an *ordered index* of stroke IDs scored by the UUIDv7 millisecond
//!   (ties break byte-lexically, which for UUIDv7 equals time order), and
//! - a *keyed blob store* mapping stroke ID to its wire JSON.
//!
//! Bus deliveries are pushed into the mpsc sender handed to the adapter at
//! construction; the Hub owns the receiving end.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use thiserror::Error;

pub use self::redis::RedisCacheBus;
pub use memory::{MemoryBroker, MemoryCacheBus};

/// TTL on the page-complete marker.
pub const PAGE_COMPLETE_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("cache call timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// A message delivered on a subscribed bus channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEvent {
    pub channel: String,
    pub payload: String,
}

/// One entry for a batched index write-back.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub stroke_id: String,
    pub score_ms: u64,
    pub json: String,
}

#[async_trait]
pub trait CacheBus: Send + Sync {
    // -- bus ---------------------------------------------------------------

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError>;
    /// Idempotent; deliveries arrive on the constructor's mpsc sender.
    async fn subscribe(&self, channel: &str) -> Result<(), CacheError>;
    async fn unsubscribe(&self, channel: &str) -> Result<(), CacheError>;

    // -- page cache --------------------------------------------------------

    /// Insert one stroke into the ordered index and the blob store, and
    /// refresh the page-complete TTL if the marker is set.
    async fn index_insert(
        &self,
        page_key: &str,
        stroke_id: &str,
        score_ms: u64,
        stroke_json: &str,
    ) -> Result<(), CacheError>;

    /// Batched variant used by the load write-back path.
    async fn index_insert_batch(
        &self,
        page_key: &str,
        entries: &[IndexEntry],
    ) -> Result<(), CacheError>;

    async fn index_remove(&self, page_key: &str, stroke_id: &str) -> Result<(), CacheError>;

    /// Stroke JSON blobs ordered newest first, at most `limit`.  IDs whose
    /// blob has gone missing are skipped.
    async fn newest_strokes(&self, page_key: &str, limit: usize) -> Result<Vec<String>, CacheError>;

    /// Cardinality of the ordered index; this *is* the page stroke count.
    async fn page_stroke_count(&self, page_key: &str) -> Result<u64, CacheError>;

    async fn set_page_complete(&self, page_key: &str) -> Result<(), CacheError>;
    async fn is_page_complete(&self, page_key: &str) -> Result<bool, CacheError>;

    /// Drop index, blobs and completeness for each page, so the next load
    /// rebuilds them from the store.
    async fn invalidate_pages(&self, page_keys: &[String]) -> Result<(), CacheError>;

    // -- user counters -----------------------------------------------------

    async fn incr_user_strokes(&self, user_id: &str, delta: i64) -> Result<(), CacheError>;
    /// Seed only if absent, so a concurrent increment is never clobbered.
    async fn seed_user_strokes(&self, user_id: &str, count: u64) -> Result<(), CacheError>;
    /// `None` means the counter is missing — callers must reseed from the
    /// store, never treat the miss as zero.
    async fn user_strokes(&self, user_id: &str) -> Result<Option<u64>, CacheError>;
    async fn remove_user_strokes(&self, user_id: &str) -> Result<(), CacheError>;
}
