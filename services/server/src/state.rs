//! Shared application state and engine wiring.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenAuthority;
use crate::batch::{spawn_counter_batcher, spawn_stroke_batcher};
use crate::cache::{BusEvent, CacheBus};
use crate::config::Config;
use crate::hub::{spawn_hub, HubHandle};
use crate::identity::IdentityProvider;
use crate::purge::spawn_purge_worker;
use crate::queue::Queue;
use crate::service::Service;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub service: Arc<Service>,
    pub hub: HubHandle,
    pub auth: Arc<TokenAuthority>,
    pub identity: Arc<dyn IdentityProvider>,
    pub shutdown: CancellationToken,
}

/// Wire the engine over a set of adapters: batchers, hub, purge worker,
/// service.  `bus_rx` must be the delivery stream of `cache`.  Adapters
/// are parameters so the test suites run the same wiring over the
/// in-memory implementations.
pub fn build_state(
    config: Arc<Config>,
    store: Arc<dyn Store>,
    cache: Arc<dyn CacheBus>,
    queue: Arc<dyn Queue>,
    identity: Arc<dyn IdentityProvider>,
    bus_rx: mpsc::UnboundedReceiver<BusEvent>,
    shutdown: CancellationToken,
) -> AppState {
    let counters = spawn_counter_batcher(Arc::clone(&store), shutdown.clone());
    let strokes = spawn_stroke_batcher(Arc::clone(&store), counters.clone(), shutdown.clone());
    let (hub, _hub_task) = spawn_hub(Arc::clone(&cache), bus_rx, shutdown.clone());
    spawn_purge_worker(
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&queue),
        counters.clone(),
        shutdown.clone(),
    );
    let service = Arc::new(Service::new(
        Arc::clone(&store),
        cache,
        queue,
        strokes,
        counters,
    ));
    let auth = Arc::new(TokenAuthority::new(&config.jwt_secret));
    AppState { config, store, service, hub, auth, identity, shutdown }
}
