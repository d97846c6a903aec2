//! Load: cache read, page-complete short-circuit, store fallback, merge,
//! and write-back.

use tracing::warn;
use uuid::Uuid;
use wv_core::{embedded_unix_ms, validate_page_key, LOAD_CAP};
use wv_protocol::{PageRef, Stroke};

use crate::cache::{CacheBus as _, IndexEntry};
use crate::error::ServiceError;
use crate::store::Store as _;

use super::Service;

impl Service {
    /// Load a page's strokes, oldest to newest, capped to the newest
    /// [`LOAD_CAP`].
    pub async fn load(&self, page: &PageRef) -> Result<Vec<Stroke>, ServiceError> {
        validate_page_key(page.layer, &page.page_key).map_err(|_| ServiceError::InvalidRequest)?;
        self.load_validated(&page.page_key).await
    }

    /// Load with the page key already validated; also the cache-warming
    /// step for draws on pages not yet marked complete.
    pub(crate) async fn load_validated(&self, page_key: &str) -> Result<Vec<Stroke>, ServiceError> {
        let (mut cached, cache_ok) = match self.cache.newest_strokes(page_key, LOAD_CAP).await {
            Ok(blobs) => {
                // Entries that fail to decode are skipped, not fatal.
                let strokes: Vec<Stroke> = blobs
                    .iter()
                    .filter_map(|blob| serde_json::from_str(blob).ok())
                    .collect();
                (strokes, true)
            }
            Err(e) => {
                warn!(page = %page_key, error = %e, "cache read failed; loading from store");
                (Vec::new(), false)
            }
        };
        cached.reverse();

        if cache_ok {
            match self.cache.is_page_complete(page_key).await {
                Ok(true) => return Ok(cached),
                Ok(false) => {}
                Err(e) => warn!(page = %page_key, error = %e, "completeness read failed"),
            }
        }

        let mut stored_records = self.store.newest_page_strokes(page_key, LOAD_CAP).await?;
        stored_records.reverse();

        let write_back: Vec<IndexEntry> = stored_records
            .iter()
            .filter_map(|record| {
                let id: Uuid = record.stroke.id.parse().ok()?;
                let score_ms = embedded_unix_ms(&id)?;
                let json = serde_json::to_string(&record.stroke).ok()?;
                Some(IndexEntry { stroke_id: record.stroke.id.clone(), score_ms, json })
            })
            .collect();

        let both_empty = cached.is_empty() && stored_records.is_empty();
        let stored: Vec<Stroke> = stored_records.into_iter().map(|r| r.stroke).collect();
        let merged = cap_newest(merge_by_id(cached, stored), LOAD_CAP);

        if !write_back.is_empty() {
            if let Err(e) = self.cache.index_insert_batch(page_key, &write_back).await {
                warn!(page = %page_key, error = %e, "cache write-back failed");
            }
        }
        if both_empty {
            if let Err(e) = self.cache.set_page_complete(page_key).await {
                warn!(page = %page_key, error = %e, "page-complete marker write failed");
            }
        }
        Ok(merged)
    }
}

/// Two-pointer merge of two ID-ascending stroke lists; equal IDs coalesce
/// (the first list wins).  UUIDv7 makes lexical ID order time order.
pub(crate) fn merge_by_id(a: Vec<Stroke>, b: Vec<Stroke>) -> Vec<Stroke> {
    let mut merged = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => match x.id.cmp(&y.id) {
                std::cmp::Ordering::Less => merged.push(a.next().unwrap()),
                std::cmp::Ordering::Greater => merged.push(b.next().unwrap()),
                std::cmp::Ordering::Equal => {
                    merged.push(a.next().unwrap());
                    b.next();
                }
            },
            (Some(_), None) => merged.push(a.next().unwrap()),
            (None, Some(_)) => merged.push(b.next().unwrap()),
            (None, None) => break,
        }
    }
    merged
}

/// Keep the newest `cap` entries of an oldest-first list.
pub(crate) fn cap_newest(mut strokes: Vec<Stroke>, cap: usize) -> Vec<Stroke> {
    if strokes.len() > cap {
        strokes.split_off(strokes.len() - cap)
    } else {
        strokes
    }
}
