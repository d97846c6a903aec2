//! Draw / redo: validation, quota, ID minting, and asynchronous
//! side-effect dispatch.

use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;
use wv_core::{
    embedded_unix_ms, validate_page_key, validate_private_nonce, validate_public_content,
    PAGE_STROKE_QUOTA, USER_STROKE_QUOTA,
};
use wv_protocol::{page_channel, DrawRequest, Layer, ServerMessage, Stroke, StrokeEvent, StrokeRecord};

use crate::batch::PendingStroke;
use crate::cache::CacheBus as _;
use crate::error::ServiceError;

use super::{AuthUser, Service};

impl Service {
    /// Validate, quota-check, and mint an ID for a stroke.  Returns the ID
    /// as soon as the stroke is accepted; persistence, cache insert, and
    /// fan-out run asynchronously.
    pub async fn draw(
        self: &Arc<Self>,
        user: &AuthUser,
        request: DrawRequest,
        is_redo: bool,
    ) -> Result<String, ServiceError> {
        match request.layer {
            Layer::Private => {
                validate_page_key(Layer::Private, &request.page_key)
                    .map_err(|_| ServiceError::InvalidRequest)?;
                // The client must have encrypted against the *current* key.
                if request.layer_id != user.key_version.to_string() {
                    return Err(ServiceError::StrokeEncryptedWithOldKey);
                }
                validate_private_nonce(Layer::Private, &request.stroke.nonce)
                    .map_err(|_| ServiceError::InvalidRequest)?;
            }
            Layer::Public => {
                validate_page_key(Layer::Public, &request.page_key)
                    .map_err(|_| ServiceError::InvalidRequest)?;
                if !request.layer_id.is_empty() {
                    return Err(ServiceError::InvalidRequest);
                }
                validate_private_nonce(Layer::Public, &request.stroke.nonce)
                    .map_err(|_| ServiceError::InvalidRequest)?;
                validate_public_content(&request.stroke.content)
                    .map_err(|_| ServiceError::InvalidRequest)?;
            }
        }

        let user_count = self.user_stroke_count(user).await?;
        if user_count >= USER_STROKE_QUOTA {
            return Err(ServiceError::UserQuotaExceeded);
        }

        // The page count is the cached index cardinality; a page not yet
        // marked complete is loaded first so the index is trustworthy.
        let complete = self
            .cache
            .is_page_complete(&request.page_key)
            .await
            .unwrap_or(false);
        if !complete {
            self.load_validated(&request.page_key).await?;
        }
        let page_count = self.cache.page_stroke_count(&request.page_key).await?;
        if page_count >= PAGE_STROKE_QUOTA {
            return Err(ServiceError::PageQuotaExceeded);
        }

        let id = if is_redo {
            self.minter
                .remint(&request.stroke.id)
                .map_err(|_| ServiceError::InvalidRequest)?
        } else {
            self.minter.mint()
        };

        let stroke = Stroke {
            id: id.to_string(),
            user_id: user.id.clone(),
            nonce: request.stroke.nonce,
            content: request.stroke.content,
        };
        let record = StrokeRecord {
            page_key: request.page_key,
            layer: request.layer,
            layer_id: request.layer_id,
            stroke,
        };
        let pending = PendingStroke {
            record,
            provider: user.provider,
            provider_id: user.provider_id.clone(),
        };

        let service = Arc::clone(self);
        let user_id = user.id.clone();
        tokio::spawn(async move {
            service.draw_side_effects(&user_id, pending).await;
        });

        Ok(id.to_string())
    }

    async fn draw_side_effects(&self, user_id: &str, pending: PendingStroke) {
        if let Err(e) = self.cache.incr_user_strokes(user_id, 1).await {
            warn!(user_id = %user_id, error = %e, "counter increment failed");
        }

        let record = pending.record.clone();
        if !self.strokes.enqueue(pending).await {
            warn!(stroke_id = %record.stroke.id, "stroke batcher unavailable");
        }

        let score = record
            .stroke
            .id
            .parse::<Uuid>()
            .ok()
            .and_then(|id| embedded_unix_ms(&id));
        match (score, serde_json::to_string(&record.stroke)) {
            (Some(score_ms), Ok(json)) => {
                if let Err(e) = self
                    .cache
                    .index_insert(&record.page_key, &record.stroke.id, score_ms, &json)
                    .await
                {
                    warn!(page = %record.page_key, error = %e, "cache insert failed");
                }
            }
            _ => warn!(stroke_id = %record.stroke.id, "stroke not cacheable"),
        }

        let event = ServerMessage::NewStroke(StrokeEvent {
            page_key: record.page_key.clone(),
            layer: record.layer,
            layer_id: record.layer_id.clone(),
            stroke: record.stroke,
        });
        self.publish_json(&page_channel(&record.page_key), &event)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{fixture, login, settle, Fixture};
    use super::*;
    use crate::cache::CacheBus;
    use crate::store::Store;
    use wv_protocol::Provider;
    use wv_test_utils::fixtures;

    fn public_draw(page_key: &str, content: String) -> DrawRequest {
        DrawRequest {
            stroke: Stroke {
                id: String::new(),
                user_id: String::new(),
                nonce: String::new(),
                content,
            },
            page_key: page_key.to_owned(),
            user_stroke_id: 1,
            layer: Layer::Public,
            layer_id: String::new(),
        }
    }

    fn private_draw(page_key: &str, layer_id: &str) -> DrawRequest {
        DrawRequest {
            stroke: Stroke {
                id: String::new(),
                user_id: String::new(),
                nonce: fixtures::nonce(3),
                content: "b3BhcXVl".to_owned(),
            },
            page_key: page_key.to_owned(),
            user_stroke_id: 1,
            layer: Layer::Private,
            layer_id: layer_id.to_owned(),
        }
    }

    async fn drawn_id(f: &Fixture, auth: &AuthUser, page: &str) -> String {
        f.service
            .draw(auth, public_draw(page, fixtures::stroke_content()), false)
            .await
            .expect("draw")
    }

    #[tokio::test(start_paused = true)]
    async fn draw_returns_a_v7_id_and_fans_out(){
        let mut f = fixture().await;
        let (_, auth) = login(&f, "g-1").await;
        f.cache.subscribe(&page_channel("example.com/a")).await.unwrap();

        let id = drawn_id(&f, &auth, "example.com/a").await;
        let parsed: Uuid = id.parse().expect("uuid");
        assert_eq!(parsed.get_version_num(), 7);
        assert_eq!(id.len(), 36);

        settle().await;
        // Cache insert and counter moved.
        assert_eq!(f.cache.page_stroke_count("example.com/a").await.unwrap(), 1);
        assert_eq!(f.cache.user_strokes(&auth.id).await.unwrap(), Some(1));

        // Exactly one new_stroke on the page channel.
        let event = f.bus_rx.try_recv().expect("publish");
        assert_eq!(event.channel, page_channel("example.com/a"));
        let msg: ServerMessage = serde_json::from_str(&event.payload).expect("frame");
        match msg {
            ServerMessage::NewStroke(e) => {
                assert_eq!(e.stroke.id, id);
                assert_eq!(e.stroke.user_id, auth.id, "server stamps the author");
            }
            other => panic!("expected new_stroke, got {other:?}"),
        }
        assert!(f.bus_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn draw_ids_from_one_author_sort_in_mint_order() {
        let f = fixture().await;
        let (_, auth) = login(&f, "g-1").await;
        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(drawn_id(&f, &auth, "example.com/a").await);
        }
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test(start_paused = true)]
    async fn public_draw_rejects_bad_content_and_layer_id() {
        let f = fixture().await;
        let (_, auth) = login(&f, "g-1").await;

        let bad = f
            .service
            .draw(&auth, public_draw("example.com/a", "bm90LWpzb24=".to_owned()), false)
            .await
            .unwrap_err();
        assert_eq!(bad.kind(), "InvalidRequest");

        let mut tagged = public_draw("example.com/a", fixtures::stroke_content());
        tagged.layer_id = "3".to_owned();
        let err = f.service.draw(&auth, tagged, false).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");
    }

    #[tokio::test(start_paused = true)]
    async fn private_draw_gates_on_the_current_key_version() {
        let mut f = fixture().await;
        let (user, _) = login(&f, "g-1").await;
        f.store
            .set_envelope(Provider::Google, "g-1", Some(&fixtures::key_envelope(1)), true)
            .await
            .expect("set envelope");
        let auth = AuthUser {
            id: user.id.clone(),
            provider: user.provider,
            provider_id: user.provider_id.clone(),
            key_version: 1,
        };
        let page = fixtures::private_page_key(9);

        let stale = f
            .service
            .draw(&auth, private_draw(&page, "0"), false)
            .await
            .unwrap_err();
        assert_eq!(stale.kind(), "StrokeEncryptedWithOldKey");
        settle().await;
        assert_eq!(f.cache.user_strokes(&user.id).await.unwrap(), None, "no counter move");
        assert!(f.bus_rx.try_recv().is_err(), "no fan-out");
        assert_eq!(f.store.stroke_count(), 0, "nothing persisted");

        let id = f
            .service
            .draw(&auth, private_draw(&page, "1"), false)
            .await
            .expect("current key version draws");
        assert!(!id.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn page_quota_is_enforced_from_the_cached_index() {
        let f = fixture().await;
        let (_, auth) = login(&f, "g-1").await;

        // Fill the page index to the quota without going through draw.
        let entries: Vec<crate::cache::IndexEntry> = (0..PAGE_STROKE_QUOTA)
            .map(|i| crate::cache::IndexEntry {
                stroke_id: format!("s-{i:05}"),
                score_ms: i,
                json: "{}".to_owned(),
            })
            .collect();
        f.cache.index_insert_batch("example.com/full", &entries).await.unwrap();
        f.cache.set_page_complete("example.com/full").await.unwrap();

        let err = f
            .service
            .draw(&auth, public_draw("example.com/full", fixtures::stroke_content()), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "PageQuotaExceeded");

        // One below the quota still draws.
        let entries: Vec<crate::cache::IndexEntry> = (0..PAGE_STROKE_QUOTA - 1)
            .map(|i| crate::cache::IndexEntry {
                stroke_id: format!("s-{i:05}"),
                score_ms: i,
                json: "{}".to_owned(),
            })
            .collect();
        f.cache.index_insert_batch("example.com/almost", &entries).await.unwrap();
        f.cache.set_page_complete("example.com/almost").await.unwrap();
        f.service
            .draw(&auth, public_draw("example.com/almost", fixtures::stroke_content()), false)
            .await
            .expect("999 strokes leave room for one more");
    }

    #[tokio::test(start_paused = true)]
    async fn user_quota_uses_the_stored_count_on_a_cache_miss() {
        let f = fixture().await;
        let (_, auth) = login(&f, "g-2").await;
        // The stored count is over quota but the cache has no entry; the
        // path must reseed from the store and refuse, never treat the
        // miss as zero.
        f.store
            .increment_stroke_count(Provider::Google, "g-2", USER_STROKE_QUOTA as i64)
            .await
            .expect("seed stored count");

        let err = f
            .service
            .draw(&auth, public_draw("example.com/a", fixtures::stroke_content()), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "UserQuotaExceeded");
        assert_eq!(
            f.cache.user_strokes(&auth.id).await.unwrap(),
            Some(USER_STROKE_QUOTA),
            "the miss was reseeded from the store"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn redo_reuses_the_original_timestamp_and_rejects_the_future() {
        let f = fixture().await;
        let (_, auth) = login(&f, "g-1").await;
        let original = drawn_id(&f, &auth, "example.com/a").await;

        let mut redo = public_draw("example.com/a", fixtures::stroke_content());
        redo.stroke.id = original.clone();
        let reminted = f.service.draw(&auth, redo, true).await.expect("redo");
        assert_ne!(reminted, original);
        let a: Uuid = original.parse().unwrap();
        let b: Uuid = reminted.parse().unwrap();
        assert_eq!(embedded_unix_ms(&a), embedded_unix_ms(&b));

        // A future-dated redo is malicious input.
        let future = Uuid::new_v7(uuid::Timestamp::from_unix(
            uuid::ContextV7::new(),
            chrono::Utc::now().timestamp() as u64 + 3600,
            0,
        ));
        let mut bad = public_draw("example.com/a", fixtures::stroke_content());
        bad.stroke.id = future.to_string();
        let err = f.service.draw(&auth, bad, true).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");
    }
}
