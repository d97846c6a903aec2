use std::env;
use std::sync::Arc;

use server::cache::RedisCacheBus;
use server::config::Config;
use server::identity::OAuthIdentityProvider;
use server::queue::PgQueue;
use server::store::PgStore;
use server::{build_router, build_state, db};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = Arc::new(Config::from_env().expect("invalid configuration"));
    let shutdown = CancellationToken::new();

    info!("connecting to database...");
    let pool = db::connect_and_migrate(&config.database_url)
        .await
        .expect("failed to prepare Postgres");
    info!("migrations applied");

    info!("connecting to redis...");
    let (bus_tx, bus_rx) = mpsc::unbounded_channel();
    let cache = RedisCacheBus::connect(&config.redis_url, bus_tx, shutdown.clone())
        .await
        .expect("failed to connect to Redis");

    let store = Arc::new(PgStore::new(pool.clone()));
    let queue = Arc::new(PgQueue::new(pool));
    let identity = Arc::new(OAuthIdentityProvider::new(config.oauth.clone()));

    let state = build_state(
        Arc::clone(&config),
        store,
        Arc::new(cache),
        queue,
        identity,
        bus_rx,
        shutdown.clone(),
    );
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %config.bind_addr, "server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .expect("server error");
    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT), then cancels the process-wide
/// token so pumps close their sockets and the batchers drain.
async fn shutdown_signal(shutdown: CancellationToken) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
    shutdown.cancel();
}
