//! Account deletion: synchronous user-row delete, then bus teardown and a
//! delete-all purge job.

use std::sync::Arc;

use wv_protocol::{PurgeJob, UserDeleted, USER_DELETED_CHANNEL};

use crate::error::ServiceError;
use crate::store::{Store as _, User};

use super::Service;

impl Service {
    pub async fn delete_account(self: &Arc<Self>, user: &User) -> Result<(), ServiceError> {
        self.store.delete_user(user.provider, &user.provider_id).await?;

        let service = Arc::clone(self);
        let user_id = user.id.clone();
        let provider = user.provider;
        let provider_id = user.provider_id.clone();
        tokio::spawn(async move {
            // Live connections of this user tear down on this signal.
            service
                .publish_json(USER_DELETED_CHANNEL, &UserDeleted { user_id: user_id.clone() })
                .await;
            service
                .enqueue_purge(&PurgeJob {
                    user_id,
                    provider,
                    provider_id,
                    delete_all: true,
                    layer: None,
                })
                .await;
        });
        Ok(())
    }
}
