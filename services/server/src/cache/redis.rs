//! Redis cache/bus adapter.
//!
//! Commands run on a [`ConnectionManager`]; pub/sub runs on a dedicated
//! connection owned by a pump task that serializes subscription changes
//! and message delivery.  Key layout per page:
//!
//! - `page:{key}:idx`  — ZSET, member = stroke ID, score = UUIDv7 ms
//! - `page:{key}:data` — HASH, stroke ID -> wire JSON
//! - `page:{key}:complete` — marker with TTL
//!
//! and `user:{id}:strokes` for the cached per-user counter.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{BusEvent, CacheBus, CacheError, IndexEntry, PAGE_COMPLETE_TTL_SECS};

/// Per-call deadline on every cache round trip.
const CALL_DEADLINE: Duration = Duration::from_secs(5);

enum SubCmd {
    Subscribe(String),
    Unsubscribe(String),
}

pub struct RedisCacheBus {
    manager: ConnectionManager,
    sub_tx: mpsc::UnboundedSender<SubCmd>,
}

impl RedisCacheBus {
    /// Connect both the command path and the pub/sub path, spawning the
    /// pub/sub pump.  Deliveries go to `bus_tx`.
    pub async fn connect(
        redis_url: &str,
        bus_tx: mpsc::UnboundedSender<BusEvent>,
        shutdown: CancellationToken,
    ) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        let pubsub = client.get_async_pubsub().await?;
        let (sub_tx, sub_rx) = mpsc::unbounded_channel();
        tokio::spawn(pubsub_pump(pubsub, sub_rx, bus_tx, shutdown));
        Ok(Self { manager, sub_tx })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

async fn pubsub_pump(
    mut pubsub: redis::aio::PubSub,
    mut sub_rx: mpsc::UnboundedReceiver<SubCmd>,
    bus_tx: mpsc::UnboundedSender<BusEvent>,
    shutdown: CancellationToken,
) {
    enum Wake {
        Delivery(redis::Msg),
        Command(SubCmd),
        Stop,
    }

    loop {
        // `on_message` mutably borrows the connection, so the borrow is
        // scoped to a single wake-up; subscription changes run on the
        // owned connection between wake-ups.  `Msg` is self-contained and
        // safe to carry out of the scope.
        let wake = {
            let mut stream = pubsub.on_message();
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(msg) => Wake::Delivery(msg),
                    None => {
                        warn!("pub/sub stream ended");
                        Wake::Stop
                    }
                },
                cmd = sub_rx.recv() => match cmd {
                    Some(cmd) => Wake::Command(cmd),
                    None => Wake::Stop,
                },
                _ = shutdown.cancelled() => Wake::Stop,
            }
        };
        match wake {
            Wake::Delivery(msg) => {
                let channel = msg.get_channel_name().to_owned();
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        let _ = bus_tx.send(BusEvent { channel, payload });
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "undecodable bus payload"),
                }
            }
            Wake::Command(cmd) => {
                let result = match &cmd {
                    SubCmd::Subscribe(channel) => pubsub.subscribe(channel).await,
                    SubCmd::Unsubscribe(channel) => pubsub.unsubscribe(channel).await,
                };
                if let Err(e) = result {
                    warn!(error = %e, "pub/sub command failed");
                }
            }
            Wake::Stop => break,
        }
    }
    info!("pub/sub pump stopped");
}

fn idx_key(page_key: &str) -> String {
    format!("page:{page_key}:idx")
}

fn data_key(page_key: &str) -> String {
    format!("page:{page_key}:data")
}

fn complete_key(page_key: &str) -> String {
    format!("page:{page_key}:complete")
}

fn counter_key(user_id: &str) -> String {
    format!("user:{user_id}:strokes")
}

async fn with_deadline<T, F>(fut: F) -> Result<T, CacheError>
where
    F: Future<Output = Result<T, CacheError>>,
{
    tokio::time::timeout(CALL_DEADLINE, fut)
        .await
        .map_err(|_| CacheError::Timeout)?
}

#[async_trait]
impl CacheBus for RedisCacheBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError> {
        let mut conn = self.conn();
        with_deadline(async move {
            conn.publish::<_, _, ()>(channel, payload).await?;
            Ok(())
        })
        .await
    }

    async fn subscribe(&self, channel: &str) -> Result<(), CacheError> {
        self.sub_tx
            .send(SubCmd::Subscribe(channel.to_owned()))
            .map_err(|_| CacheError::Other("pub/sub pump gone".to_owned()))
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), CacheError> {
        self.sub_tx
            .send(SubCmd::Unsubscribe(channel.to_owned()))
            .map_err(|_| CacheError::Other("pub/sub pump gone".to_owned()))
    }

    async fn index_insert(
        &self,
        page_key: &str,
        stroke_id: &str,
        score_ms: u64,
        stroke_json: &str,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let (idx, data, complete) = (idx_key(page_key), data_key(page_key), complete_key(page_key));
        let stroke_id = stroke_id.to_owned();
        let stroke_json = stroke_json.to_owned();
        with_deadline(async move {
            redis::pipe()
                .zadd(&idx, &stroke_id, score_ms)
                .hset(&data, &stroke_id, &stroke_json)
                // Refresh the completeness TTL; a no-op when unset.
                .expire(&complete, PAGE_COMPLETE_TTL_SECS as i64)
                .query_async::<_, ()>(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn index_insert_batch(
        &self,
        page_key: &str,
        entries: &[IndexEntry],
    ) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let (idx, data) = (idx_key(page_key), data_key(page_key));
        let mut pipe = redis::pipe();
        for entry in entries {
            pipe.zadd(&idx, &entry.stroke_id, entry.score_ms)
                .hset(&data, &entry.stroke_id, &entry.json);
        }
        with_deadline(async move {
            pipe.query_async::<_, ()>(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn index_remove(&self, page_key: &str, stroke_id: &str) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let (idx, data) = (idx_key(page_key), data_key(page_key));
        let stroke_id = stroke_id.to_owned();
        with_deadline(async move {
            redis::pipe()
                .zrem(&idx, &stroke_id)
                .hdel(&data, &stroke_id)
                .query_async::<_, ()>(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn newest_strokes(&self, page_key: &str, limit: usize) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn();
        let (idx, data) = (idx_key(page_key), data_key(page_key));
        with_deadline(async move {
            let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
            let ids: Vec<String> = conn.zrevrange(&idx, 0, stop).await?;
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let blobs: Vec<Option<String>> = redis::cmd("HMGET")
                .arg(&data)
                .arg(&ids)
                .query_async(&mut conn)
                .await?;
            Ok(blobs.into_iter().flatten().collect())
        })
        .await
    }

    async fn page_stroke_count(&self, page_key: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn();
        let idx = idx_key(page_key);
        with_deadline(async move {
            let count: u64 = conn.zcard(&idx).await?;
            Ok(count)
        })
        .await
    }

    async fn set_page_complete(&self, page_key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let key = complete_key(page_key);
        with_deadline(async move {
            conn.set_ex::<_, _, ()>(&key, 1, PAGE_COMPLETE_TTL_SECS).await?;
            Ok(())
        })
        .await
    }

    async fn is_page_complete(&self, page_key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn();
        let key = complete_key(page_key);
        with_deadline(async move {
            let set: bool = conn.exists(&key).await?;
            Ok(set)
        })
        .await
    }

    async fn invalidate_pages(&self, page_keys: &[String]) -> Result<(), CacheError> {
        if page_keys.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = page_keys
            .iter()
            .flat_map(|p| [idx_key(p), data_key(p), complete_key(p)])
            .collect();
        let mut conn = self.conn();
        with_deadline(async move {
            conn.del::<_, ()>(keys).await?;
            Ok(())
        })
        .await
    }

    async fn incr_user_strokes(&self, user_id: &str, delta: i64) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let key = counter_key(user_id);
        with_deadline(async move {
            conn.incr::<_, _, ()>(&key, delta).await?;
            Ok(())
        })
        .await
    }

    async fn seed_user_strokes(&self, user_id: &str, count: u64) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let key = counter_key(user_id);
        with_deadline(async move {
            conn.set_nx::<_, _, ()>(&key, count).await?;
            Ok(())
        })
        .await
    }

    async fn user_strokes(&self, user_id: &str) -> Result<Option<u64>, CacheError> {
        let mut conn = self.conn();
        let key = counter_key(user_id);
        with_deadline(async move {
            let value: Option<i64> = conn.get(&key).await?;
            Ok(value.map(|v| u64::try_from(v).unwrap_or(0)))
        })
        .await
    }

    async fn remove_user_strokes(&self, user_id: &str) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let key = counter_key(user_id);
        with_deadline(async move {
            conn.del::<_, ()>(&key).await?;
            Ok(())
        })
        .await
    }
}
