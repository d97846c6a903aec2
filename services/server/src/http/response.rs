use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use wv_protocol::{error_kinds, HttpErrorEnvelope};

use crate::error::ServiceError;

pub type HttpResponse = Response;
pub type HttpResult<T = Response> = Result<T, HttpResponse>;

pub(crate) fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> HttpResponse {
    (
        status,
        Json(HttpErrorEnvelope { code: code.into(), message: message.into() }),
    )
        .into_response()
}

pub fn unauthenticated() -> HttpResponse {
    json_error(
        StatusCode::UNAUTHORIZED,
        error_kinds::UNAUTHENTICATED,
        "missing or invalid bearer token",
    )
}

pub fn internal_error(err: impl std::fmt::Display) -> HttpResponse {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        error_kinds::TRANSPORT_ERROR,
        err.to_string(),
    )
}

/// Map a domain error onto the REST surface.
pub fn service_error(err: &ServiceError) -> HttpResponse {
    let status = match err {
        ServiceError::Unauthenticated => StatusCode::UNAUTHORIZED,
        ServiceError::InvalidRequest => StatusCode::BAD_REQUEST,
        ServiceError::NotOwner => StatusCode::FORBIDDEN,
        ServiceError::UserQuotaExceeded | ServiceError::PageQuotaExceeded => {
            StatusCode::TOO_MANY_REQUESTS
        }
        ServiceError::StrokeEncryptedWithOldKey => StatusCode::CONFLICT,
        ServiceError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(status, err.kind(), err.kind())
}
