pub mod auth;
pub mod batch;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod hub;
pub mod identity;
pub mod purge;
pub mod queue;
pub mod service;
pub mod state;
pub mod store;
pub mod ws;

pub use state::{build_state, AppState};

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .route("/login", post(http::login::login))
        .route("/me", get(http::account::me).delete(http::account::delete_me))
        .route(
            "/me/encryption-keys",
            post(http::keys::create_keys)
                .put(http::keys::rotate_keys)
                .delete(http::keys::delete_keys),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}
