//! Undo: best-effort batcher cancel, conditional store delete, then
//! asynchronous cache removal, fan-out and counter correction.

use std::sync::Arc;

use tracing::warn;
use wv_core::validate_page_key;
use wv_protocol::{page_channel, ServerMessage, StrokeDeleteEvent, UndoRequest};

use crate::batch::CounterUpdate;
use crate::cache::CacheBus as _;
use crate::error::ServiceError;
use crate::store::{DeleteOutcome, Store as _};

use super::{AuthUser, Service};

impl Service {
    /// Delete a stroke the caller owns.  Ownership is decided by the
    /// store's conditional delete (or by the batcher's owner check when
    /// the stroke was still buffered) — never by trusting the request.
    pub async fn undo(
        self: &Arc<Self>,
        user: &AuthUser,
        request: UndoRequest,
    ) -> Result<(), ServiceError> {
        validate_page_key(request.layer, &request.page_key)
            .map_err(|_| ServiceError::InvalidRequest)?;

        // A stroke drawn moments ago may still sit in the write buffer.
        let cancelled = self.strokes.cancel(&request.stroke_id, &user.id).await;
        if !cancelled {
            match self
                .store
                .delete_stroke_if_owner(&request.page_key, &request.stroke_id, &user.id)
                .await?
            {
                DeleteOutcome::Deleted => {}
                DeleteOutcome::NotOwner => return Err(ServiceError::NotOwner),
            }
        }

        let service = Arc::clone(self);
        let user = user.clone();
        tokio::spawn(async move {
            service.undo_side_effects(&user, request, cancelled).await;
        });
        Ok(())
    }

    async fn undo_side_effects(&self, user: &AuthUser, request: UndoRequest, cancelled: bool) {
        if let Err(e) = self
            .cache
            .index_remove(&request.page_key, &request.stroke_id)
            .await
        {
            warn!(page = %request.page_key, error = %e, "cache removal failed");
        }

        let event = ServerMessage::DeleteStroke(StrokeDeleteEvent {
            page_key: request.page_key.clone(),
            layer: request.layer,
            layer_id: request.layer_id.clone(),
            stroke_id: request.stroke_id.clone(),
            user_id: user.id.clone(),
        });
        self.publish_json(&page_channel(&request.page_key), &event)
            .await;

        if let Err(e) = self.cache.incr_user_strokes(&user.id, -1).await {
            warn!(user_id = %user.id, error = %e, "counter decrement failed");
        }
        // A cancelled-in-buffer stroke never reached the store, so its +1
        // was never emitted; only a store delete needs the durable -1.
        if !cancelled {
            let update = CounterUpdate {
                provider: user.provider,
                provider_id: user.provider_id.clone(),
                delta: -1,
            };
            if self.counters.send(update).await.is_err() {
                warn!("counter batcher gone; dropping decrement");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{fixture, login, settle};
    use super::*;
    use crate::cache::CacheBus;
    use crate::store::Store;
    use wv_protocol::{DrawRequest, Layer, Stroke};
    use wv_test_utils::fixtures;

    fn draw_request(page: &str) -> DrawRequest {
        DrawRequest {
            stroke: Stroke {
                id: String::new(),
                user_id: String::new(),
                nonce: String::new(),
                content: fixtures::stroke_content(),
            },
            page_key: page.to_owned(),
            user_stroke_id: 1,
            layer: Layer::Public,
            layer_id: String::new(),
        }
    }

    fn undo_request(page: &str, stroke_id: &str) -> UndoRequest {
        UndoRequest {
            page_key: page.to_owned(),
            layer: Layer::Public,
            layer_id: String::new(),
            stroke_id: stroke_id.to_owned(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn undo_of_a_buffered_stroke_cancels_without_a_store_write() {
        let f = fixture().await;
        let (_, auth) = login(&f, "g-1").await;

        let id = f.service.draw(&auth, draw_request("example.com/a"), false).await.expect("draw");
        settle().await; // side effects ran; stroke is buffered, not flushed

        f.service.undo(&auth, undo_request("example.com/a", &id)).await.expect("undo");
        settle().await;

        assert_eq!(f.store.stroke_count(), 0, "never persisted");
        assert_eq!(f.cache.page_stroke_count("example.com/a").await.unwrap(), 0);
        assert_eq!(f.cache.user_strokes(&auth.id).await.unwrap(), Some(0), "+1 then -1");

        // Let the batcher tick; the cancelled stroke must not resurface.
        tokio::time::sleep(std::time::Duration::from_millis(600)).await;
        assert_eq!(f.store.stroke_count(), 0);
        let user = f.store.get_user(auth.provider, &auth.provider_id).await.unwrap().unwrap();
        assert_eq!(user.stroke_count, 0, "no durable counter drift");
    }

    #[tokio::test(start_paused = true)]
    async fn undo_of_a_persisted_stroke_deletes_and_decrements_once() {
        let f = fixture().await;
        let (_, auth) = login(&f, "g-1").await;

        let id = f.service.draw(&auth, draw_request("example.com/a"), false).await.expect("draw");
        settle().await;
        tokio::time::sleep(std::time::Duration::from_millis(600)).await; // flush
        assert!(f.store.contains_stroke("example.com/a", &id));

        f.service.undo(&auth, undo_request("example.com/a", &id)).await.expect("undo");
        settle().await;
        assert!(!f.store.contains_stroke("example.com/a", &id));
        assert_eq!(f.cache.page_stroke_count("example.com/a").await.unwrap(), 0);

        // Counter batcher saw +1 then -1; after its tick the durable count
        // is back to zero.
        tokio::time::sleep(crate::batch::counters::FLUSH_INTERVAL).await;
        let user = f.store.get_user(auth.provider, &auth.provider_id).await.unwrap().unwrap();
        assert_eq!(user.stroke_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn undo_by_a_non_owner_changes_nothing() {
        let mut f = fixture().await;
        let (_, author) = login(&f, "g-author").await;
        let (_, intruder) = login(&f, "g-intruder").await;

        let id = f.service.draw(&author, draw_request("example.com/a"), false).await.expect("draw");
        settle().await;
        tokio::time::sleep(std::time::Duration::from_millis(600)).await;
        while f.bus_rx.try_recv().is_ok() {}

        let err = f
            .service
            .undo(&intruder, undo_request("example.com/a", &id))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotOwner");
        settle().await;

        assert!(f.store.contains_stroke("example.com/a", &id), "stroke survives");
        assert_eq!(f.cache.page_stroke_count("example.com/a").await.unwrap(), 1);
        assert!(f.bus_rx.try_recv().is_err(), "no delete_stroke fan-out");

        // The author still can.
        f.service.undo(&author, undo_request("example.com/a", &id)).await.expect("undo");
        assert!(!f.store.contains_stroke("example.com/a", &id));
    }

    #[tokio::test(start_paused = true)]
    async fn undo_rejects_a_bad_page_key() {
        let f = fixture().await;
        let (_, auth) = login(&f, "g-1").await;
        let err = f
            .service
            .undo(&auth, undo_request("www.example.com", "s-1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");
    }
}
