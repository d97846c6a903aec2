//! UUIDv7 stroke ID minting.
//!
//! Stroke IDs double as ordering keys: the millisecond timestamp lives in
//! the high bits, so byte-lexical order equals time order.  A shared
//! [`ContextV7`] keeps IDs monotone within this process even when several
//! are minted in the same millisecond.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use uuid::{ContextV7, Timestamp, Uuid};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RemintError {
    #[error("stroke id is not a UUID")]
    NotAUuid,
    #[error("stroke id is not version 7")]
    NotV7,
    #[error("stroke id timestamp is in the future")]
    FutureTimestamp,
}

/// Mints monotone UUIDv7 stroke IDs.
pub struct StrokeIdMinter {
    ctx: Mutex<ContextV7>,
}

impl StrokeIdMinter {
    pub fn new() -> Self {
        Self { ctx: Mutex::new(ContextV7::new()) }
    }

    /// Mint a fresh ID at the current wall-clock time.
    pub fn mint(&self) -> Uuid {
        Uuid::new_v7(Timestamp::now(&self.ctx))
    }

    /// Re-mint an ID for a redo: a *new* UUIDv7 anchored at the original
    /// ID's embedded timestamp, so the stroke returns to its old position
    /// in the page order.  A future-dated original is malicious input and
    /// is rejected rather than rebased.
    pub fn remint(&self, original: &str) -> Result<Uuid, RemintError> {
        let original: Uuid = original.parse().map_err(|_| RemintError::NotAUuid)?;
        if original.get_version_num() != 7 {
            return Err(RemintError::NotV7);
        }
        let ts = original.get_timestamp().ok_or(RemintError::NotV7)?;
        let (secs, nanos) = ts.to_unix();
        let embedded_ms = secs * 1000 + u64::from(nanos) / 1_000_000;
        if embedded_ms > unix_ms_now() {
            return Err(RemintError::FutureTimestamp);
        }
        Ok(Uuid::new_v7(Timestamp::from_unix(&self.ctx, secs, nanos)))
    }
}

impl Default for StrokeIdMinter {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since the Unix epoch embedded in a UUIDv7, used as the
/// cached page index score.  `None` for non-v7 IDs.
pub fn embedded_unix_ms(id: &Uuid) -> Option<u64> {
    if id.get_version_num() != 7 {
        return None;
    }
    let (secs, nanos) = id.get_timestamp()?.to_unix();
    Some(secs * 1000 + u64::from(nanos) / 1_000_000)
}

fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
