use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use tracing::{info, warn};
use wv_protocol::{AccountResponse, KeyEnvelope, LoginRequest};

use crate::identity::IdentityError;
use crate::state::AppState;
use crate::store::{Store as _, User};

use super::response::{internal_error, unauthenticated, HttpResponse};

/// `POST /login` — exchange an OAuth code for an account envelope and a
/// session token.
pub async fn login(State(state): State<AppState>, Json(request): Json<LoginRequest>) -> HttpResponse {
    let identity = match state.identity.exchange(request.provider, &request.code).await {
        Ok(identity) => identity,
        Err(IdentityError::Denied) => return unauthenticated(),
        Err(e) => {
            warn!(provider = %request.provider, error = %e, "identity exchange failed");
            return internal_error(e);
        }
    };

    let user = match state
        .store
        .get_or_create_user(request.provider, &identity.provider_id, &identity.username)
        .await
    {
        Ok(user) => user,
        Err(e) => return internal_error(e),
    };
    let token = match state.auth.issue(&user) {
        Ok(token) => token,
        Err(e) => return internal_error(e),
    };
    info!(user_id = %user.id, provider = %user.provider, "login");
    Json(account_response(&user, Some(token))).into_response()
}

/// Build the account envelope shared by `/login` and `GET /me`.
pub(crate) fn account_response(user: &User, token: Option<String>) -> AccountResponse {
    AccountResponse {
        id: user.id.clone(),
        username: user.username.clone(),
        provider: user.provider,
        token,
        key_version: user.key_version,
        envelope: user.envelope.clone().unwrap_or_else(KeyEnvelope::default),
    }
}
