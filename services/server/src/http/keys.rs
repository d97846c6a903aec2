use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use wv_protocol::{KeysResponse, SetKeysRequest};

use crate::state::AppState;

use super::account::require_user;
use super::response::{service_error, HttpResponse};

/// `POST /me/encryption-keys` — create a new envelope or replace the
/// existing one (bumps the key version; a replacement queues the previous
/// private layer for purge).
pub async fn create_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SetKeysRequest>,
) -> HttpResponse {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state
        .service
        .set_encryption_keys(&user, request.envelope, true)
        .await
    {
        Ok(key_version) => Json(KeysResponse { success: true, key_version }).into_response(),
        Err(e) => service_error(&e),
    }
}

/// `PUT /me/encryption-keys` — rotate the KEK only: re-encrypted DEKs,
/// same version.  Fails without an existing envelope.
pub async fn rotate_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SetKeysRequest>,
) -> HttpResponse {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state
        .service
        .set_encryption_keys(&user, request.envelope, false)
        .await
    {
        Ok(key_version) => Json(KeysResponse { success: true, key_version }).into_response(),
        Err(e) => service_error(&e),
    }
}

/// `DELETE /me/encryption-keys` — clear the envelope and queue the now
/// undecryptable private layer for purge.
pub async fn delete_keys(State(state): State<AppState>, headers: HeaderMap) -> HttpResponse {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state.service.delete_encryption_keys(&user).await {
        Ok(key_version) => Json(KeysResponse { success: true, key_version }).into_response(),
        Err(e) => service_error(&e),
    }
}
