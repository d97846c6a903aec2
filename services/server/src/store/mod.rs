//! Durable store seam.
//!
//! The store holds user rows and stroke rows and is shared by every server
//! instance.  The trait is the narrow contract the engine consumes; the
//! Postgres adapter is production, the in-memory adapter backs the test
//! suites.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use wv_protocol::{KeyEnvelope, Layer, Provider, StrokeRecord};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQL: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("store call timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// A durable user row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Server-minted opaque id, stable for the account's lifetime.
    pub id: String,
    pub provider: Provider,
    pub provider_id: String,
    pub username: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub stroke_count: u64,
    pub key_version: u32,
    /// Present iff the user has set up client-side encryption.
    pub envelope: Option<KeyEnvelope>,
}

/// Result of a conditional stroke delete.  A missing row and a row owned
/// by someone else are indistinguishable on purpose: the caller learns
/// nothing about strokes it does not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotOwner,
}

/// Narrows a per-user stroke operation to one layer, e.g. the historical
/// private layer `Private#4` orphaned by a key replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSelector {
    pub layer: Layer,
    pub layer_id: String,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch the user for `(provider, provider_id)`, creating the row with
    /// a fresh server id on first login.  Refreshes the display name.
    async fn get_or_create_user(
        &self,
        provider: Provider,
        provider_id: &str,
        username: &str,
    ) -> Result<User, StoreError>;

    async fn get_user(&self, provider: Provider, provider_id: &str)
        -> Result<Option<User>, StoreError>;

    /// Newest `limit` stroke records for a page, newest first.
    async fn newest_page_strokes(
        &self,
        page_key: &str,
        limit: usize,
    ) -> Result<Vec<StrokeRecord>, StoreError>;

    /// Persist a batch of strokes.  Returns the subset that was *not*
    /// persisted so the caller can retry or drop it.
    async fn batch_write_strokes(
        &self,
        records: Vec<StrokeRecord>,
    ) -> Result<Vec<StrokeRecord>, StoreError>;

    /// Delete a stroke only if `user_id` owns it.  The store condition is
    /// the ownership authority; callers must not pre-check.
    async fn delete_stroke_if_owner(
        &self,
        page_key: &str,
        stroke_id: &str,
        user_id: &str,
    ) -> Result<DeleteOutcome, StoreError>;

    async fn delete_user(&self, provider: Provider, provider_id: &str) -> Result<(), StoreError>;

    /// Delete up to `limit` strokes owned by `user_id` (optionally only in
    /// one layer).  Returns how many rows went away; callers paginate by
    /// looping while the batch comes back full.
    async fn delete_user_strokes_batch(
        &self,
        user_id: &str,
        layer: Option<&LayerSelector>,
        limit: usize,
    ) -> Result<u64, StoreError>;

    async fn list_user_page_keys(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    async fn count_user_strokes(
        &self,
        user_id: &str,
        layer: Option<&LayerSelector>,
    ) -> Result<u64, StoreError>;

    /// Set (`Some`) or clear (`None`) the encryption envelope.  Bumps
    /// `key_version` iff `bump_version`; returns the version after the
    /// write.  The envelope fields change atomically together.
    async fn set_envelope(
        &self,
        provider: Provider,
        provider_id: &str,
        envelope: Option<&KeyEnvelope>,
        bump_version: bool,
    ) -> Result<u32, StoreError>;

    /// Atomically move the durable stroke counter.  A no-op when the user
    /// row is gone, so late counter flushes cannot resurrect deleted
    /// accounts.  The counter never drops below zero.
    async fn increment_stroke_count(
        &self,
        provider: Provider,
        provider_id: &str,
        delta: i64,
    ) -> Result<(), StoreError>;
}
