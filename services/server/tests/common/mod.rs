//! Integration scaffolding: full servers over the in-memory adapters,
//! bound to ephemeral ports.  A shared [`TestEnv`] plays the role of the
//! deployment's Redis + store + queue, so several servers attached to one
//! env behave like separate instances of one cluster.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use server::cache::{CacheBus, MemoryBroker, MemoryCacheBus};
use server::config::Config;
use server::identity::{ExternalIdentity, IdentityError, IdentityProvider, OAuthConfig};
use server::queue::{MemoryQueue, Queue};
use server::store::{MemoryStore, Store, User};
use server::{build_router, build_state, AppState};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wv_protocol::Provider;

pub struct TestEnv {
    pub broker: Arc<MemoryBroker>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            broker: MemoryBroker::new(),
            store: Arc::new(MemoryStore::new()),
            queue: Arc::new(MemoryQueue::with_long_poll(std::time::Duration::from_millis(100))),
        }
    }
}

/// Resolves any code to a deterministic identity; `"deny"` is refused.
/// Stands in for the external OAuth exchange.
pub struct StaticIdentity;

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn exchange(
        &self,
        _provider: Provider,
        code: &str,
    ) -> Result<ExternalIdentity, IdentityError> {
        if code == "deny" {
            return Err(IdentityError::Denied);
        }
        Ok(ExternalIdentity {
            provider_id: code.to_owned(),
            username: format!("user-{code}"),
        })
    }
}

pub struct TestServer {
    pub addr: std::net::SocketAddr,
    pub state: AppState,
    pub shutdown: CancellationToken,
}

impl TestServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Create (or fetch) a user and a session token for it.
    pub async fn login_user(&self, provider_id: &str) -> (User, String) {
        let user = self
            .state
            .store
            .get_or_create_user(Provider::Google, provider_id, "tester")
            .await
            .expect("create user");
        let token = self.state.auth.issue(&user).expect("issue token");
        (user, token)
    }
}

pub async fn spawn_server(env: &TestEnv) -> TestServer {
    spawn_server_with(env, Vec::new()).await
}

pub async fn spawn_server_with(env: &TestEnv, allowed_origins: Vec<String>) -> TestServer {
    let config = Arc::new(Config {
        bind_addr: "127.0.0.1:0".to_owned(),
        database_url: String::new(),
        redis_url: String::new(),
        jwt_secret: "integration-test-secret".to_owned(),
        allowed_origins,
        oauth: OAuthConfig {
            google_client_id: String::new(),
            google_client_secret: String::new(),
            github_client_id: String::new(),
            github_client_secret: String::new(),
            redirect_url: String::new(),
        },
    });

    let (bus_tx, bus_rx) = mpsc::unbounded_channel();
    let cache = Arc::new(MemoryCacheBus::attach(&env.broker, bus_tx));
    let shutdown = CancellationToken::new();
    let state = build_state(
        config,
        Arc::clone(&env.store) as Arc<dyn Store>,
        cache as Arc<dyn CacheBus>,
        Arc::clone(&env.queue) as Arc<dyn Queue>,
        Arc::new(StaticIdentity),
        bus_rx,
        shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let router = build_router(state.clone());
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
            .expect("test server error");
    });
    TestServer { addr, state, shutdown }
}
