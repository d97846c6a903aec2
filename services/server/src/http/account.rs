use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use tracing::info;

use crate::auth::extract_bearer;
use crate::state::AppState;
use crate::store::{Store as _, User};

use super::login::account_response;
use super::response::{internal_error, service_error, unauthenticated, HttpResponse, HttpResult};

/// Resolve the bearer token to a live user row; 401 when either step
/// fails.
pub(crate) async fn require_user(state: &AppState, headers: &HeaderMap) -> HttpResult<User> {
    let claims = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .and_then(|token| state.auth.verify(token))
        .ok_or_else(unauthenticated)?;
    match state.store.get_user(claims.provider, &claims.provider_id).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(unauthenticated()),
        Err(e) => Err(internal_error(e)),
    }
}

/// `GET /me` — the account envelope, without a token.
pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> HttpResponse {
    match require_user(&state, &headers).await {
        Ok(user) => Json(account_response(&user, None)).into_response(),
        Err(response) => response,
    }
}

/// `DELETE /me` — delete the account; strokes are purged asynchronously.
pub async fn delete_me(State(state): State<AppState>, headers: HeaderMap) -> HttpResponse {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state.service.delete_account(&user).await {
        Ok(()) => {
            info!(user_id = %user.id, "account deleted");
            "OK".into_response()
        }
        Err(e) => service_error(&e),
    }
}
