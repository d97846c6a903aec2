//! In-memory cache/bus used by the test suites.
//!
//! A [`MemoryBroker`] plays the part of the shared Redis deployment: it
//! owns the cache data *and* the channel subscriptions.  Tests attach
//! several [`MemoryCacheBus`] handles (one per simulated instance) to one
//! broker to exercise cross-instance fan-out.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{BusEvent, CacheBus, CacheError, IndexEntry, PAGE_COMPLETE_TTL_SECS};

#[derive(Default)]
struct PageCache {
    /// Ordered index: (score, stroke ID); ties break lexically on the ID.
    index: BTreeSet<(u64, String)>,
    blobs: HashMap<String, String>,
}

#[derive(Default)]
struct CacheData {
    pages: HashMap<String, PageCache>,
    complete_until: HashMap<String, Instant>,
    counters: HashMap<String, i64>,
}

#[derive(Default)]
struct Subscriptions {
    by_channel: HashMap<String, Vec<(u64, mpsc::UnboundedSender<BusEvent>)>>,
}

/// The shared backend; one per simulated deployment.
#[derive(Default)]
pub struct MemoryBroker {
    data: Mutex<CacheData>,
    subs: Mutex<Subscriptions>,
    next_instance: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// One instance's handle onto the broker.
pub struct MemoryCacheBus {
    broker: Arc<MemoryBroker>,
    instance: u64,
    bus_tx: mpsc::UnboundedSender<BusEvent>,
}

impl MemoryCacheBus {
    pub fn attach(broker: &Arc<MemoryBroker>, bus_tx: mpsc::UnboundedSender<BusEvent>) -> Self {
        Self {
            broker: Arc::clone(broker),
            instance: broker.next_instance.fetch_add(1, Ordering::SeqCst),
            bus_tx,
        }
    }
}

#[async_trait]
impl CacheBus for MemoryCacheBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError> {
        let subs = self.broker.subs.lock().unwrap();
        if let Some(entries) = subs.by_channel.get(channel) {
            for (_, tx) in entries {
                let _ = tx.send(BusEvent {
                    channel: channel.to_owned(),
                    payload: payload.to_owned(),
                });
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), CacheError> {
        let mut subs = self.broker.subs.lock().unwrap();
        let entries = subs.by_channel.entry(channel.to_owned()).or_default();
        if !entries.iter().any(|(id, _)| *id == self.instance) {
            entries.push((self.instance, self.bus_tx.clone()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), CacheError> {
        let mut subs = self.broker.subs.lock().unwrap();
        if let Some(entries) = subs.by_channel.get_mut(channel) {
            entries.retain(|(id, _)| *id != self.instance);
            if entries.is_empty() {
                subs.by_channel.remove(channel);
            }
        }
        Ok(())
    }

    async fn index_insert(
        &self,
        page_key: &str,
        stroke_id: &str,
        score_ms: u64,
        stroke_json: &str,
    ) -> Result<(), CacheError> {
        let mut data = self.broker.data.lock().unwrap();
        let page = data.pages.entry(page_key.to_owned()).or_default();
        page.index.insert((score_ms, stroke_id.to_owned()));
        page.blobs.insert(stroke_id.to_owned(), stroke_json.to_owned());
        // Refresh the completeness TTL if the marker is live.
        if let Some(deadline) = data.complete_until.get_mut(page_key) {
            *deadline = Instant::now() + Duration::from_secs(PAGE_COMPLETE_TTL_SECS);
        }
        Ok(())
    }

    async fn index_insert_batch(
        &self,
        page_key: &str,
        entries: &[IndexEntry],
    ) -> Result<(), CacheError> {
        let mut data = self.broker.data.lock().unwrap();
        let page = data.pages.entry(page_key.to_owned()).or_default();
        for entry in entries {
            page.index.insert((entry.score_ms, entry.stroke_id.clone()));
            page.blobs.insert(entry.stroke_id.clone(), entry.json.clone());
        }
        Ok(())
    }

    async fn index_remove(&self, page_key: &str, stroke_id: &str) -> Result<(), CacheError> {
        let mut data = self.broker.data.lock().unwrap();
        if let Some(page) = data.pages.get_mut(page_key) {
            page.index.retain(|(_, id)| id != stroke_id);
            page.blobs.remove(stroke_id);
        }
        Ok(())
    }

    async fn newest_strokes(&self, page_key: &str, limit: usize) -> Result<Vec<String>, CacheError> {
        let data = self.broker.data.lock().unwrap();
        let Some(page) = data.pages.get(page_key) else {
            return Ok(Vec::new());
        };
        Ok(page
            .index
            .iter()
            .rev()
            .take(limit)
            .filter_map(|(_, id)| page.blobs.get(id).cloned())
            .collect())
    }

    async fn page_stroke_count(&self, page_key: &str) -> Result<u64, CacheError> {
        let data = self.broker.data.lock().unwrap();
        Ok(data.pages.get(page_key).map_or(0, |p| p.index.len() as u64))
    }

    async fn set_page_complete(&self, page_key: &str) -> Result<(), CacheError> {
        let mut data = self.broker.data.lock().unwrap();
        data.complete_until.insert(
            page_key.to_owned(),
            Instant::now() + Duration::from_secs(PAGE_COMPLETE_TTL_SECS),
        );
        Ok(())
    }

    async fn is_page_complete(&self, page_key: &str) -> Result<bool, CacheError> {
        let data = self.broker.data.lock().unwrap();
        Ok(data
            .complete_until
            .get(page_key)
            .is_some_and(|deadline| *deadline > Instant::now()))
    }

    async fn invalidate_pages(&self, page_keys: &[String]) -> Result<(), CacheError> {
        let mut data = self.broker.data.lock().unwrap();
        for page_key in page_keys {
            data.pages.remove(page_key);
            data.complete_until.remove(page_key);
        }
        Ok(())
    }

    async fn incr_user_strokes(&self, user_id: &str, delta: i64) -> Result<(), CacheError> {
        let mut data = self.broker.data.lock().unwrap();
        *data.counters.entry(user_id.to_owned()).or_insert(0) += delta;
        Ok(())
    }

    async fn seed_user_strokes(&self, user_id: &str, count: u64) -> Result<(), CacheError> {
        let mut data = self.broker.data.lock().unwrap();
        data.counters.entry(user_id.to_owned()).or_insert(count as i64);
        Ok(())
    }

    async fn user_strokes(&self, user_id: &str) -> Result<Option<u64>, CacheError> {
        let data = self.broker.data.lock().unwrap();
        Ok(data
            .counters
            .get(user_id)
            .map(|v| u64::try_from(*v).unwrap_or(0)))
    }

    async fn remove_user_strokes(&self, user_id: &str) -> Result<(), CacheError> {
        let mut data = self.broker.data.lock().unwrap();
        data.counters.remove(user_id);
        Ok(())
    }
}
