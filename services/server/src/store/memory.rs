//! In-memory store used by the test suites.
//!
//! Mirrors the Postgres adapter's observable behavior, including the
//! newest-first text ordering of stroke IDs and the conditional counter
//! update.  Failure injection hooks let batcher tests exercise the
//! unprocessed-subset and error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;
use wv_protocol::{KeyEnvelope, Provider, StrokeRecord};

use super::{DeleteOutcome, LayerSelector, Store, StoreError, User};

#[derive(Default)]
struct State {
    users: HashMap<(Provider, String), User>,
    strokes: HashMap<(String, String), StrokeRecord>,
    unprocessed_once: Vec<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_batch_writes: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` batch writes fail outright.
    pub fn fail_next_batch_writes(&self, n: u32) {
        self.fail_batch_writes.store(n, Ordering::SeqCst);
    }

    /// Report these stroke IDs as unprocessed on the next batch write.
    pub fn set_unprocessed_once(&self, stroke_ids: Vec<String>) {
        self.state.lock().unwrap().unprocessed_once = stroke_ids;
    }

    pub fn stroke_count(&self) -> usize {
        self.state.lock().unwrap().strokes.len()
    }

    pub fn contains_stroke(&self, page_key: &str, stroke_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .strokes
            .contains_key(&(page_key.to_owned(), stroke_id.to_owned()))
    }

    fn matches(record: &StrokeRecord, user_id: &str, layer: Option<&LayerSelector>) -> bool {
        if record.stroke.user_id != user_id {
            return false;
        }
        match layer {
            Some(selector) => record.layer == selector.layer && record.layer_id == selector.layer_id,
            None => true,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_or_create_user(
        &self,
        provider: Provider,
        provider_id: &str,
        username: &str,
    ) -> Result<User, StoreError> {
        let mut state = self.state.lock().unwrap();
        let user = state
            .users
            .entry((provider, provider_id.to_owned()))
            .or_insert_with(|| User {
                id: Uuid::new_v4().to_string(),
                provider,
                provider_id: provider_id.to_owned(),
                username: username.to_owned(),
                created_at: chrono::Utc::now(),
                stroke_count: 0,
                key_version: 0,
                envelope: None,
            });
        user.username = username.to_owned();
        Ok(user.clone())
    }

    async fn get_user(
        &self,
        provider: Provider,
        provider_id: &str,
    ) -> Result<Option<User>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.users.get(&(provider, provider_id.to_owned())).cloned())
    }

    async fn newest_page_strokes(
        &self,
        page_key: &str,
        limit: usize,
    ) -> Result<Vec<StrokeRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut records: Vec<StrokeRecord> = state
            .strokes
            .values()
            .filter(|r| r.page_key == page_key)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.stroke.id.cmp(&a.stroke.id));
        records.truncate(limit);
        Ok(records)
    }

    async fn batch_write_strokes(
        &self,
        records: Vec<StrokeRecord>,
    ) -> Result<Vec<StrokeRecord>, StoreError> {
        if self
            .fail_batch_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Other("injected batch failure".to_owned()));
        }
        let mut state = self.state.lock().unwrap();
        let unprocessed_ids = std::mem::take(&mut state.unprocessed_once);
        let mut unprocessed = Vec::new();
        for record in records {
            if unprocessed_ids.contains(&record.stroke.id) {
                unprocessed.push(record);
                continue;
            }
            state
                .strokes
                .entry((record.page_key.clone(), record.stroke.id.clone()))
                .or_insert(record);
        }
        Ok(unprocessed)
    }

    async fn delete_stroke_if_owner(
        &self,
        page_key: &str,
        stroke_id: &str,
        user_id: &str,
    ) -> Result<DeleteOutcome, StoreError> {
        let mut state = self.state.lock().unwrap();
        let key = (page_key.to_owned(), stroke_id.to_owned());
        match state.strokes.get(&key) {
            Some(record) if record.stroke.user_id == user_id => {
                state.strokes.remove(&key);
                Ok(DeleteOutcome::Deleted)
            }
            _ => Ok(DeleteOutcome::NotOwner),
        }
    }

    async fn delete_user(&self, provider: Provider, provider_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.users.remove(&(provider, provider_id.to_owned()));
        Ok(())
    }

    async fn delete_user_strokes_batch(
        &self,
        user_id: &str,
        layer: Option<&LayerSelector>,
        limit: usize,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let doomed: Vec<(String, String)> = state
            .strokes
            .iter()
            .filter(|(_, r)| Self::matches(r, user_id, layer))
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            state.strokes.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn list_user_page_keys(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut pages: Vec<String> = state
            .strokes
            .values()
            .filter(|r| r.stroke.user_id == user_id)
            .map(|r| r.page_key.clone())
            .collect();
        pages.sort();
        pages.dedup();
        Ok(pages)
    }

    async fn count_user_strokes(
        &self,
        user_id: &str,
        layer: Option<&LayerSelector>,
    ) -> Result<u64, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .strokes
            .values()
            .filter(|r| Self::matches(r, user_id, layer))
            .count() as u64)
    }

    async fn set_envelope(
        &self,
        provider: Provider,
        provider_id: &str,
        envelope: Option<&KeyEnvelope>,
        bump_version: bool,
    ) -> Result<u32, StoreError> {
        let mut state = self.state.lock().unwrap();
        let user = state
            .users
            .get_mut(&(provider, provider_id.to_owned()))
            .ok_or_else(|| StoreError::Other("user not found".to_owned()))?;
        user.envelope = envelope.cloned();
        if bump_version {
            user.key_version += 1;
        }
        Ok(user.key_version)
    }

    async fn increment_stroke_count(
        &self,
        provider: Provider,
        provider_id: &str,
        delta: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(user) = state.users.get_mut(&(provider, provider_id.to_owned())) {
            user.stroke_count = user.stroke_count.saturating_add_signed(delta);
        }
        Ok(())
    }
}
