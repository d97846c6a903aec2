//! Purge worker: drains the durable queue of stroke-deletion jobs.
//!
//! Deletion is paginated and throttled so one large job cannot starve the
//! store.  The queue message is deleted only after the store work
//! succeeds; on failure or timeout it stays hidden until the visibility
//! window lapses and is redelivered.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use wv_protocol::{parse_layer_tag, PurgeJob};

use crate::batch::CounterUpdate;
use crate::cache::CacheBus;
use crate::queue::Queue;
use crate::store::{LayerSelector, Store, StoreError};

/// Queue message visibility while a job runs.
pub const VISIBILITY: Duration = Duration::from_secs(300);
/// Per-job deadline, kept under the visibility window so a hung job is
/// redelivered rather than double-run.
const JOB_DEADLINE: Duration = Duration::from_secs(290);
/// Rows deleted per inner batch.
const DELETE_BATCH: usize = 25;
/// Pause between inner batches.
const BATCH_PAUSE: Duration = Duration::from_millis(50);

pub fn spawn_purge_worker(
    store: Arc<dyn Store>,
    cache: Arc<dyn CacheBus>,
    queue: Arc<dyn Queue>,
    counter_tx: mpsc::Sender<CounterUpdate>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run(store, cache, queue, counter_tx, shutdown))
}

async fn run(
    store: Arc<dyn Store>,
    cache: Arc<dyn CacheBus>,
    queue: Arc<dyn Queue>,
    counter_tx: mpsc::Sender<CounterUpdate>,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            received = queue.receive(VISIBILITY) => received,
            _ = shutdown.cancelled() => break,
        };
        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "queue receive failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let job: PurgeJob = match serde_json::from_str(&message.body) {
            Ok(job) => job,
            Err(e) => {
                // Poison message; redelivery cannot fix it.
                error!(error = %e, body = %message.body, "dropping undecodable purge job");
                if let Err(e) = queue.delete(&message.id).await {
                    warn!(error = %e, "failed to drop poison message");
                }
                continue;
            }
        };

        let outcome = tokio::time::timeout(
            JOB_DEADLINE,
            handle_job(&*store, &*cache, &counter_tx, &job),
        )
        .await;
        match outcome {
            Ok(Ok(())) => {
                if let Err(e) = queue.delete(&message.id).await {
                    warn!(error = %e, "purge done but message delete failed");
                }
            }
            Ok(Err(e)) => {
                warn!(user_id = %job.user_id, error = %e, "purge failed; leaving for redelivery");
            }
            Err(_) => {
                warn!(user_id = %job.user_id, "purge deadline hit; leaving for redelivery");
            }
        }
    }
    info!("purge worker stopped");
}

async fn handle_job(
    store: &dyn Store,
    cache: &dyn CacheBus,
    counter_tx: &mpsc::Sender<CounterUpdate>,
    job: &PurgeJob,
) -> Result<(), StoreError> {
    if job.delete_all {
        // Pages are captured up front so the cache can be invalidated
        // after the rows are gone.
        let pages = store.list_user_page_keys(&job.user_id).await?;
        delete_paginated(store, &job.user_id, None).await?;
        if let Err(e) = cache.invalidate_pages(&pages).await {
            warn!(user_id = %job.user_id, error = %e, "page invalidation failed");
        }
        if let Err(e) = cache.remove_user_strokes(&job.user_id).await {
            warn!(user_id = %job.user_id, error = %e, "counter removal failed");
        }
        info!(user_id = %job.user_id, pages = pages.len(), "purged all strokes");
        return Ok(());
    }

    let Some(tag) = job.layer.as_deref() else {
        warn!(user_id = %job.user_id, "layer purge without a layer tag; nothing to do");
        return Ok(());
    };
    let Some((layer, layer_id)) = parse_layer_tag(tag) else {
        warn!(user_id = %job.user_id, tag = %tag, "unparseable layer tag; nothing to do");
        return Ok(());
    };
    let selector = LayerSelector { layer, layer_id };

    // Count first so the durable counter can be corrected by exactly the
    // number of rows this job removes.
    let count = store.count_user_strokes(&job.user_id, Some(&selector)).await?;
    delete_paginated(store, &job.user_id, Some(&selector)).await?;
    if count > 0 {
        let update = CounterUpdate {
            provider: job.provider,
            provider_id: job.provider_id.clone(),
            delta: -(count as i64),
        };
        if counter_tx.send(update).await.is_err() {
            warn!("counter batcher gone; dropping purge decrement");
        }
    }
    info!(user_id = %job.user_id, tag = %tag, rows = count, "purged layer");
    Ok(())
}

async fn delete_paginated(
    store: &dyn Store,
    user_id: &str,
    layer: Option<&LayerSelector>,
) -> Result<(), StoreError> {
    loop {
        let deleted = store
            .delete_user_strokes_batch(user_id, layer, DELETE_BATCH)
            .await?;
        if (deleted as usize) < DELETE_BATCH {
            return Ok(());
        }
        tokio::time::sleep(BATCH_PAUSE).await;
    }
}
