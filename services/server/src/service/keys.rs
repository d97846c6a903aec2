//! Encryption envelope lifecycle.
//!
//! Three distinct paths share the envelope shape:
//! - *create/replace* (`is_new = true`) bumps the key version; replacing
//!   an existing envelope orphans the previous private layer's
//!   ciphertexts, which are queued for purge;
//! - *rotate* (`is_new = false`) re-encrypts the DEKs under a new KEK —
//!   ciphertexts stay valid, the version does not move;
//! - *delete* clears the envelope and queues the current private layer
//!   for purge.

use std::sync::Arc;

use wv_core::validate_envelope;
use wv_protocol::{
    private_layer_tag, KeyEnvelope, PurgeJob, UserKeysUpdated, USER_KEYS_UPDATED_CHANNEL,
};

use crate::error::ServiceError;
use crate::store::{Store as _, User};

use super::Service;

impl Service {
    /// Set a new envelope (`is_new = true`) or rotate the KEK of the
    /// existing one (`is_new = false`).  Returns the resulting key
    /// version.
    pub async fn set_encryption_keys(
        self: &Arc<Self>,
        user: &User,
        envelope: KeyEnvelope,
        is_new: bool,
    ) -> Result<u32, ServiceError> {
        validate_envelope(&envelope).map_err(|_| ServiceError::InvalidRequest)?;
        let had_envelope = user.envelope.is_some();
        if !is_new && !had_envelope {
            // Nothing to rotate.
            return Err(ServiceError::InvalidRequest);
        }
        let previous_version = user.key_version;
        let new_version = self
            .store
            .set_envelope(user.provider, &user.provider_id, Some(&envelope), is_new)
            .await?;

        let service = Arc::clone(self);
        let user_id = user.id.clone();
        let provider = user.provider;
        let provider_id = user.provider_id.clone();
        tokio::spawn(async move {
            service
                .publish_json(
                    USER_KEYS_UPDATED_CHANNEL,
                    &UserKeysUpdated {
                        user_id: user_id.clone(),
                        key_version: new_version,
                        keys_deleted: false,
                    },
                )
                .await;
            // Replacement generates new DEKs, so ciphertexts written under
            // the previous version can never be decrypted again.
            if is_new && had_envelope {
                service
                    .enqueue_purge(&PurgeJob {
                        user_id,
                        provider,
                        provider_id,
                        delete_all: false,
                        layer: Some(private_layer_tag(previous_version)),
                    })
                    .await;
            }
        });
        Ok(new_version)
    }

    /// Clear the envelope and queue the now-undecryptable private layer
    /// for purge.  Returns the version the deleted envelope had.
    pub async fn delete_encryption_keys(self: &Arc<Self>, user: &User) -> Result<u32, ServiceError> {
        let previous_version = user.key_version;
        self.store
            .set_envelope(user.provider, &user.provider_id, None, false)
            .await?;

        let service = Arc::clone(self);
        let user_id = user.id.clone();
        let provider = user.provider;
        let provider_id = user.provider_id.clone();
        tokio::spawn(async move {
            service
                .publish_json(
                    USER_KEYS_UPDATED_CHANNEL,
                    &UserKeysUpdated {
                        user_id: user_id.clone(),
                        key_version: previous_version,
                        keys_deleted: true,
                    },
                )
                .await;
            service
                .enqueue_purge(&PurgeJob {
                    user_id,
                    provider,
                    provider_id,
                    delete_all: false,
                    layer: Some(private_layer_tag(previous_version)),
                })
                .await;
        });
        Ok(previous_version)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{fixture, login, settle};
    use super::*;
    use crate::cache::CacheBus;
    use crate::queue::Queue;
    use crate::store::Store;
    use wv_protocol::ServerMessage;
    use wv_test_utils::fixtures;

    #[tokio::test(start_paused = true)]
    async fn first_envelope_bumps_the_version_and_purges_nothing() {
        let mut f = fixture().await;
        let (user, _) = login(&f, "g-1").await;
        f.cache.subscribe(USER_KEYS_UPDATED_CHANNEL).await.unwrap();

        let version = f
            .service
            .set_encryption_keys(&user, fixtures::key_envelope(1), true)
            .await
            .expect("set");
        assert_eq!(version, 1);
        settle().await;

        let event = f.bus_rx.try_recv().expect("keys-updated publish");
        let update: UserKeysUpdated = serde_json::from_str(&event.payload).expect("payload");
        assert_eq!(update.key_version, 1);
        assert!(!update.keys_deleted);
        assert!(f.queue.is_empty(), "no prior layer to purge");
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_queues_the_previous_private_layer() {
        let f = fixture().await;
        let (user, _) = login(&f, "g-1").await;
        f.service
            .set_encryption_keys(&user, fixtures::key_envelope(1), true)
            .await
            .expect("create");
        settle().await;
        let user = f.store.get_user(user.provider, &user.provider_id).await.unwrap().unwrap();

        let version = f
            .service
            .set_encryption_keys(&user, fixtures::key_envelope(2), true)
            .await
            .expect("replace");
        assert_eq!(version, 2);
        settle().await;

        assert_eq!(f.queue.len(), 1);
        let message = f
            .queue
            .receive(std::time::Duration::from_secs(1))
            .await
            .unwrap()
            .expect("queued job");
        let job: PurgeJob = serde_json::from_str(&message.body).expect("job");
        assert!(!job.delete_all);
        assert_eq!(job.layer.as_deref(), Some("Private#1"));
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_keeps_the_version_and_requires_an_envelope() {
        let f = fixture().await;
        let (user, _) = login(&f, "g-1").await;

        let err = f
            .service
            .set_encryption_keys(&user, fixtures::key_envelope(1), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest", "cannot rotate nothing");

        f.service
            .set_encryption_keys(&user, fixtures::key_envelope(1), true)
            .await
            .expect("create");
        let user = f.store.get_user(user.provider, &user.provider_id).await.unwrap().unwrap();
        let version = f
            .service
            .set_encryption_keys(&user, fixtures::key_envelope(7), false)
            .await
            .expect("rotate");
        assert_eq!(version, 1, "rotation does not bump");
        settle().await;
        assert!(f.queue.is_empty(), "rotation never purges");
    }

    #[tokio::test(start_paused = true)]
    async fn envelope_shape_is_validated() {
        let f = fixture().await;
        let (user, _) = login(&f, "g-1").await;
        let mut envelope = fixtures::key_envelope(1);
        envelope.encrypted_dek1 = "dG9vLXNob3J0".to_owned();
        let err = f
            .service
            .set_encryption_keys(&user, envelope, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_keys_publishes_and_purges_the_current_layer() {
        let mut f = fixture().await;
        let (user, _) = login(&f, "g-1").await;
        f.cache.subscribe(USER_KEYS_UPDATED_CHANNEL).await.unwrap();
        f.service
            .set_encryption_keys(&user, fixtures::key_envelope(1), true)
            .await
            .expect("create");
        settle().await;
        while f.bus_rx.try_recv().is_ok() {}
        let user = f.store.get_user(user.provider, &user.provider_id).await.unwrap().unwrap();

        let version = f.service.delete_encryption_keys(&user).await.expect("delete");
        assert_eq!(version, 1);
        settle().await;

        let stored = f.store.get_user(user.provider, &user.provider_id).await.unwrap().unwrap();
        assert!(stored.envelope.is_none());
        assert_eq!(stored.key_version, 1, "version survives the clear");

        let event = f.bus_rx.try_recv().expect("keys-updated publish");
        let update: UserKeysUpdated = serde_json::from_str(&event.payload).expect("payload");
        assert!(update.keys_deleted);
        assert_eq!(update.key_version, 1);

        let message = f
            .queue
            .receive(std::time::Duration::from_secs(1))
            .await
            .unwrap()
            .expect("queued job");
        let job: PurgeJob = serde_json::from_str(&message.body).expect("job");
        assert_eq!(job.layer.as_deref(), Some("Private#1"));
    }

    // Guards against frames other than keys_updated leaking onto the
    // user-keys-updated channel.
    #[tokio::test(start_paused = true)]
    async fn keys_updated_channel_payload_is_not_a_push_frame() {
        let mut f = fixture().await;
        let (user, _) = login(&f, "g-1").await;
        f.cache.subscribe(USER_KEYS_UPDATED_CHANNEL).await.unwrap();
        f.service
            .set_encryption_keys(&user, fixtures::key_envelope(1), true)
            .await
            .expect("set");
        settle().await;
        let event = f.bus_rx.try_recv().expect("publish");
        assert!(serde_json::from_str::<ServerMessage>(&event.payload).is_err());
    }
}
