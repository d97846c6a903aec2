//! Stroke write batcher.
//!
//! One serialized loop with three inputs: buffered writes, cancellations,
//! and a flush tick.  The buffer is indexed by stroke ID so a cancel is
//! O(1) via swap-with-last.  Every row the store confirms persisted emits
//! a `+1` to the counter batcher keyed by the author's provider identity.
//!
//! Deletes are deliberately *not* batched: the undo path needs the store's
//! conditional ownership check, which batch writes cannot express.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wv_protocol::{Provider, StrokeRecord};

use crate::store::Store;

use super::CounterUpdate;

/// Flush when the buffer reaches this many strokes.
pub const BUFFER_LIMIT: usize = 25;
/// Flush at least this often.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
/// Deadline on one store batch write.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(3);
/// A row that fails this many flushes is dropped with an error log; the
/// cache still has it and the next load reconciles.
const MAX_ATTEMPTS: u8 = 3;
const INPUT_QUEUE: usize = 256;

/// A stroke awaiting persistence, with the provider identity the counter
/// update is keyed by.
#[derive(Debug, Clone)]
pub struct PendingStroke {
    pub record: StrokeRecord,
    pub provider: Provider,
    pub provider_id: String,
}

struct Buffered {
    pending: PendingStroke,
    attempts: u8,
}

struct CancelRequest {
    stroke_id: String,
    user_id: String,
    reply: oneshot::Sender<bool>,
}

#[derive(Clone)]
pub struct StrokeBatcherHandle {
    write_tx: mpsc::Sender<PendingStroke>,
    cancel_tx: mpsc::Sender<CancelRequest>,
}

impl StrokeBatcherHandle {
    /// Hand a stroke to the batcher.  Returns false if the batcher is gone
    /// (shutdown); callers log and move on.
    pub async fn enqueue(&self, pending: PendingStroke) -> bool {
        self.write_tx.send(pending).await.is_ok()
    }

    /// Cancel a still-buffered write.  True iff the stroke was in the
    /// buffer *and* owned by `user_id`; false means the caller must fall
    /// through to the store's conditional delete.
    pub async fn cancel(&self, stroke_id: &str, user_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let request = CancelRequest {
            stroke_id: stroke_id.to_owned(),
            user_id: user_id.to_owned(),
            reply,
        };
        if self.cancel_tx.send(request).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

pub fn spawn_stroke_batcher(
    store: Arc<dyn Store>,
    counter_tx: mpsc::Sender<CounterUpdate>,
    shutdown: CancellationToken,
) -> StrokeBatcherHandle {
    let (write_tx, write_rx) = mpsc::channel(INPUT_QUEUE);
    let (cancel_tx, cancel_rx) = mpsc::channel(INPUT_QUEUE);
    tokio::spawn(run(store, counter_tx, write_rx, cancel_rx, shutdown));
    StrokeBatcherHandle { write_tx, cancel_tx }
}

async fn run(
    store: Arc<dyn Store>,
    counter_tx: mpsc::Sender<CounterUpdate>,
    mut write_rx: mpsc::Receiver<PendingStroke>,
    mut cancel_rx: mpsc::Receiver<CancelRequest>,
    shutdown: CancellationToken,
) {
    let mut buffer: Vec<Buffered> = Vec::with_capacity(BUFFER_LIMIT);
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut tick = tokio::time::interval(FLUSH_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;

    loop {
        tokio::select! {
            Some(pending) = write_rx.recv() => {
                let id = pending.record.stroke.id.clone();
                index.insert(id, buffer.len());
                buffer.push(Buffered { pending, attempts: 0 });
                if buffer.len() >= BUFFER_LIMIT {
                    flush(&*store, &counter_tx, &mut buffer, &mut index).await;
                }
            }
            Some(request) = cancel_rx.recv() => {
                let cancelled = cancel_buffered(&mut buffer, &mut index, &request);
                let _ = request.reply.send(cancelled);
            }
            _ = tick.tick() => {
                if !buffer.is_empty() {
                    flush(&*store, &counter_tx, &mut buffer, &mut index).await;
                }
            }
            _ = shutdown.cancelled() => {
                if !buffer.is_empty() {
                    flush(&*store, &counter_tx, &mut buffer, &mut index).await;
                }
                break;
            }
        }
    }
    info!("stroke batcher stopped");
}

fn cancel_buffered(
    buffer: &mut Vec<Buffered>,
    index: &mut HashMap<String, usize>,
    request: &CancelRequest,
) -> bool {
    let Some(&pos) = index.get(&request.stroke_id) else {
        // Possibly a late cancel for an already-persisted stroke; the
        // store's conditional delete covers that path.
        return false;
    };
    if buffer[pos].pending.record.stroke.user_id != request.user_id {
        return false;
    }
    index.remove(&request.stroke_id);
    buffer.swap_remove(pos);
    if let Some(moved) = buffer.get(pos) {
        index.insert(moved.pending.record.stroke.id.clone(), pos);
    }
    debug!(stroke_id = %request.stroke_id, "cancelled buffered stroke");
    true
}

async fn flush(
    store: &dyn Store,
    counter_tx: &mpsc::Sender<CounterUpdate>,
    buffer: &mut Vec<Buffered>,
    index: &mut HashMap<String, usize>,
) {
    let records: Vec<StrokeRecord> = buffer.iter().map(|b| b.pending.record.clone()).collect();
    let total = records.len();
    let outcome =
        tokio::time::timeout(FLUSH_TIMEOUT, store.batch_write_strokes(records)).await;

    let unprocessed_ids: Option<HashSet<String>> = match outcome {
        Ok(Ok(unprocessed)) => {
            Some(unprocessed.into_iter().map(|r| r.stroke.id).collect())
        }
        Ok(Err(e)) => {
            warn!(error = %e, rows = total, "stroke flush failed");
            None
        }
        Err(_) => {
            warn!(rows = total, "stroke flush timed out");
            None
        }
    };

    index.clear();
    let drained: Vec<Buffered> = std::mem::take(buffer);
    for mut entry in drained {
        let persisted = unprocessed_ids
            .as_ref()
            .is_some_and(|ids| !ids.contains(&entry.pending.record.stroke.id));
        if persisted {
            let update = CounterUpdate {
                provider: entry.pending.provider,
                provider_id: entry.pending.provider_id.clone(),
                delta: 1,
            };
            if counter_tx.send(update).await.is_err() {
                warn!("counter batcher gone; dropping increment");
            }
            continue;
        }
        entry.attempts += 1;
        if entry.attempts >= MAX_ATTEMPTS {
            error!(
                stroke_id = %entry.pending.record.stroke.id,
                attempts = entry.attempts,
                "dropping stroke after repeated flush failures"
            );
            continue;
        }
        index.insert(entry.pending.record.stroke.id.clone(), buffer.len());
        buffer.push(entry);
    }
}
