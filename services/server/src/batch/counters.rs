//! Counter batcher.
//!
//! Aggregates `(provider, provider_id, delta)` updates into a map of
//! signed sums and flushes them as atomic store increments.  Increments
//! are conditional on user existence at the store, so a flush landing
//! after an account deletion is a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wv_protocol::Provider;

use crate::store::Store;

/// Flush at least this often.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(60);
/// Flush early once this many users have pending deltas.
pub const MAP_LIMIT: usize = 100;
/// Deadline on a single store increment.
const OP_TIMEOUT: Duration = Duration::from_secs(5);
const INPUT_QUEUE: usize = 1024;

/// One stroke-count delta for a user, keyed by provider identity.
#[derive(Debug, Clone)]
pub struct CounterUpdate {
    pub provider: Provider,
    pub provider_id: String,
    pub delta: i64,
}

pub fn spawn_counter_batcher(
    store: Arc<dyn Store>,
    shutdown: CancellationToken,
) -> mpsc::Sender<CounterUpdate> {
    let (tx, rx) = mpsc::channel(INPUT_QUEUE);
    tokio::spawn(run(store, rx, shutdown));
    tx
}

async fn run(
    store: Arc<dyn Store>,
    mut rx: mpsc::Receiver<CounterUpdate>,
    shutdown: CancellationToken,
) {
    let mut sums: HashMap<(Provider, String), i64> = HashMap::new();
    let mut tick = tokio::time::interval(FLUSH_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;

    loop {
        tokio::select! {
            Some(update) = rx.recv() => {
                *sums.entry((update.provider, update.provider_id)).or_insert(0) += update.delta;
                if sums.len() >= MAP_LIMIT {
                    flush(&*store, &mut sums).await;
                }
            }
            _ = tick.tick() => {
                if !sums.is_empty() {
                    flush(&*store, &mut sums).await;
                }
            }
            _ = shutdown.cancelled() => {
                if !sums.is_empty() {
                    flush(&*store, &mut sums).await;
                }
                break;
            }
        }
    }
    info!("counter batcher stopped");
}

async fn flush(store: &dyn Store, sums: &mut HashMap<(Provider, String), i64>) {
    for ((provider, provider_id), delta) in sums.drain() {
        if delta == 0 {
            continue;
        }
        let outcome = tokio::time::timeout(
            OP_TIMEOUT,
            store.increment_stroke_count(provider, &provider_id, delta),
        )
        .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(provider = %provider, provider_id = %provider_id, delta, error = %e,
                    "dropping counter delta after store failure");
            }
            Err(_) => {
                warn!(provider = %provider, provider_id = %provider_id, delta,
                    "dropping counter delta after store timeout");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn deltas_aggregate_and_flush_on_the_tick() {
        let store = Arc::new(MemoryStore::new());
        store
            .get_or_create_user(Provider::Google, "g-1", "alice")
            .await
            .expect("create");
        let shutdown = CancellationToken::new();
        let tx = spawn_counter_batcher(Arc::clone(&store) as Arc<dyn Store>, shutdown);

        for delta in [1, 1, 1, -1] {
            tx.send(CounterUpdate {
                provider: Provider::Google,
                provider_id: "g-1".to_owned(),
                delta,
            })
            .await
            .expect("send");
        }

        // Nothing lands before the interval.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let user = store.get_user(Provider::Google, "g-1").await.unwrap().unwrap();
        assert_eq!(user.stroke_count, 0);

        tokio::time::sleep(FLUSH_INTERVAL).await;
        let user = store.get_user(Provider::Google, "g-1").await.unwrap().unwrap();
        assert_eq!(user.stroke_count, 2, "one aggregated +2 increment");
    }

    #[tokio::test(start_paused = true)]
    async fn map_limit_forces_an_early_flush() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..MAP_LIMIT {
            store
                .get_or_create_user(Provider::Github, &format!("gh-{i}"), "user")
                .await
                .expect("create");
        }
        let shutdown = CancellationToken::new();
        let tx = spawn_counter_batcher(Arc::clone(&store) as Arc<dyn Store>, shutdown);

        for i in 0..MAP_LIMIT {
            tx.send(CounterUpdate {
                provider: Provider::Github,
                provider_id: format!("gh-{i}"),
                delta: 1,
            })
            .await
            .expect("send");
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        let user = store.get_user(Provider::Github, "gh-0").await.unwrap().unwrap();
        assert_eq!(user.stroke_count, 1, "flushed well before the 60 s tick");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_sums() {
        let store = Arc::new(MemoryStore::new());
        store
            .get_or_create_user(Provider::Google, "g-1", "alice")
            .await
            .expect("create");
        let shutdown = CancellationToken::new();
        let tx = spawn_counter_batcher(Arc::clone(&store) as Arc<dyn Store>, shutdown.clone());

        tx.send(CounterUpdate {
            provider: Provider::Google,
            provider_id: "g-1".to_owned(),
            delta: 5,
        })
        .await
        .expect("send");
        tokio::time::sleep(Duration::from_millis(1)).await;

        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let user = store.get_user(Provider::Google, "g-1").await.unwrap().unwrap();
        assert_eq!(user.stroke_count, 5);
    }
}
