use thiserror::Error;
use wv_protocol::error_kinds;

/// Domain errors surfaced to clients.  `Display` of every variant except
/// `Transport` is the frozen wire string; use [`ServiceError::kind`] when
/// filling `*_response.error`.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Unauthenticated")]
    Unauthenticated,
    #[error("InvalidRequest")]
    InvalidRequest,
    #[error("UserQuotaExceeded")]
    UserQuotaExceeded,
    #[error("PageQuotaExceeded")]
    PageQuotaExceeded,
    #[error("StrokeEncryptedWithOldKey")]
    StrokeEncryptedWithOldKey,
    #[error("NotOwner")]
    NotOwner,
    /// Upstream cache/store/queue failure.  The cause is for logs only;
    /// clients see the generic kind.
    #[error("TransportError: {0}")]
    Transport(String),
}

impl ServiceError {
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Unauthenticated => error_kinds::UNAUTHENTICATED,
            ServiceError::InvalidRequest => error_kinds::INVALID_REQUEST,
            ServiceError::UserQuotaExceeded => error_kinds::USER_QUOTA_EXCEEDED,
            ServiceError::PageQuotaExceeded => error_kinds::PAGE_QUOTA_EXCEEDED,
            ServiceError::StrokeEncryptedWithOldKey => error_kinds::STROKE_ENCRYPTED_WITH_OLD_KEY,
            ServiceError::NotOwner => error_kinds::NOT_OWNER,
            ServiceError::Transport(_) => error_kinds::TRANSPORT_ERROR,
        }
    }
}

impl From<crate::store::StoreError> for ServiceError {
    fn from(err: crate::store::StoreError) -> Self {
        ServiceError::Transport(err.to_string())
    }
}

impl From<crate::cache::CacheError> for ServiceError {
    fn from(err: crate::cache::CacheError) -> Self {
        ServiceError::Transport(err.to_string())
    }
}

impl From<crate::queue::QueueError> for ServiceError {
    fn from(err: crate::queue::QueueError) -> Self {
        ServiceError::Transport(err.to_string())
    }
}
