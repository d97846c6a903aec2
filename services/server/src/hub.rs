//! Hub: owns the connection set, the subscription index, and the bus
//! fan-in for this instance.
//!
//! All maps are mutated exclusively by the hub loop; everything else
//! talks to it over the command channel.  Fan-out never blocks on a slow
//! connection: outbound queues are bounded and `try_send`-only, and a
//! full queue closes that connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wv_protocol::{
    page_channel, page_key_of_channel, UserDeleted, UserKeysUpdated, USER_DELETED_CHANNEL,
    USER_KEYS_UPDATED_CHANNEL,
};

use crate::cache::{BusEvent, CacheBus};
use crate::error::ServiceError;

/// Connections per user per instance; the next one is refused.
pub const MAX_CONNS_PER_USER: usize = 3;
/// Distinct page subscriptions per connection.
pub const MAX_SUBSCRIPTIONS: usize = 50;
/// Outbound frames queued per connection before it is closed as too slow.
pub const OUTBOUND_QUEUE: usize = 128;

const COMMAND_QUEUE: usize = 1024;

/// User-level updates delivered to a connection's state pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserEvent {
    KeysUpdated { key_version: u32, keys_deleted: bool },
}

/// A connection as the hub sees it.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    pub id: u64,
    pub user_id: String,
    /// Outbound frame queue, drained by the connection's write pump.
    pub out: mpsc::Sender<Message>,
    /// User-level events, drained by the connection's state pump.
    pub events: mpsc::UnboundedSender<UserEvent>,
    /// Cancelling tears the connection down.
    pub cancel: CancellationToken,
}

enum HubCommand {
    Register { conn: ConnHandle, reply: oneshot::Sender<bool> },
    Unregister { conn_id: u64 },
    Subscribe { conn_id: u64, page_key: String, reply: oneshot::Sender<Result<(), ServiceError>> },
    Unsubscribe { conn_id: u64, page_key: String },
    Bus(BusEvent),
}

#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Register a connection; false when the per-user cap is hit or the
    /// hub is gone.
    pub async fn register(&self, conn: ConnHandle) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(HubCommand::Register { conn, reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Drop a connection and release its subscriptions.  Idempotent.
    pub async fn unregister(&self, conn_id: u64) {
        let _ = self.tx.send(HubCommand::Unregister { conn_id }).await;
    }

    pub async fn subscribe(&self, conn_id: u64, page_key: String) -> Result<(), ServiceError> {
        let (reply, rx) = oneshot::channel();
        let command = HubCommand::Subscribe { conn_id, page_key, reply };
        if self.tx.send(command).await.is_err() {
            return Err(ServiceError::Transport("hub gone".to_owned()));
        }
        rx.await
            .unwrap_or_else(|_| Err(ServiceError::Transport("hub gone".to_owned())))
    }

    pub async fn unsubscribe(&self, conn_id: u64, page_key: String) {
        let _ = self.tx.send(HubCommand::Unsubscribe { conn_id, page_key }).await;
    }
}

/// Spawn the hub loop.  `bus_rx` is the cache adapter's delivery stream.
pub fn spawn_hub(
    cache: Arc<dyn CacheBus>,
    mut bus_rx: mpsc::UnboundedReceiver<BusEvent>,
    shutdown: CancellationToken,
) -> (HubHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let bus_tx = tx.clone();
    let bus_shutdown = shutdown.clone();
    // Bus deliveries enter the same serialized command stream.
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = bus_rx.recv() => {
                    let Some(event) = event else { break };
                    if bus_tx.send(HubCommand::Bus(event)).await.is_err() {
                        break;
                    }
                }
                _ = bus_shutdown.cancelled() => break,
            }
        }
    });
    let hub = Hub {
        cache,
        conns: HashMap::new(),
        users: HashMap::new(),
        pages: HashMap::new(),
        globals_attached: false,
    };
    let handle = HubHandle { tx };
    let task = tokio::spawn(hub.run(rx, shutdown));
    (handle, task)
}

struct ConnEntry {
    handle: ConnHandle,
    pages: HashSet<String>,
}

struct Hub {
    cache: Arc<dyn CacheBus>,
    conns: HashMap<u64, ConnEntry>,
    users: HashMap<String, HashSet<u64>>,
    pages: HashMap<String, HashSet<u64>>,
    globals_attached: bool,
}

impl Hub {
    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command).await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
        info!("hub stopped");
    }

    async fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { conn, reply } => {
                let _ = reply.send(self.register(conn));
            }
            HubCommand::Unregister { conn_id } => self.unregister(conn_id).await,
            HubCommand::Subscribe { conn_id, page_key, reply } => {
                let _ = reply.send(self.subscribe(conn_id, page_key).await);
            }
            HubCommand::Unsubscribe { conn_id, page_key } => {
                self.unsubscribe(conn_id, &page_key).await;
            }
            HubCommand::Bus(event) => self.fan_out(event),
        }
    }

    fn register(&mut self, conn: ConnHandle) -> bool {
        let slots = self.users.entry(conn.user_id.clone()).or_default();
        if slots.len() >= MAX_CONNS_PER_USER {
            debug!(user_id = %conn.user_id, "connection cap hit");
            return false;
        }
        slots.insert(conn.id);
        self.conns.insert(conn.id, ConnEntry { handle: conn, pages: HashSet::new() });
        true
    }

    async fn unregister(&mut self, conn_id: u64) {
        let Some(entry) = self.conns.remove(&conn_id) else {
            return;
        };
        for page_key in entry.pages {
            self.drop_page_subscription(conn_id, &page_key).await;
        }
        if let Some(slots) = self.users.get_mut(&entry.handle.user_id) {
            slots.remove(&conn_id);
            if slots.is_empty() {
                self.users.remove(&entry.handle.user_id);
            }
        }
    }

    async fn subscribe(&mut self, conn_id: u64, page_key: String) -> Result<(), ServiceError> {
        let Some(entry) = self.conns.get_mut(&conn_id) else {
            // The connection closed while the command was queued.
            return Err(ServiceError::Transport("connection gone".to_owned()));
        };
        if entry.pages.contains(&page_key) {
            return Ok(());
        }
        if entry.pages.len() >= MAX_SUBSCRIPTIONS {
            return Err(ServiceError::InvalidRequest);
        }
        entry.pages.insert(page_key.clone());

        let subscribers = self.pages.entry(page_key.clone()).or_default();
        let first_on_instance = subscribers.is_empty();
        subscribers.insert(conn_id);

        if first_on_instance {
            if !self.globals_attached {
                self.cache.subscribe(USER_DELETED_CHANNEL).await?;
                self.cache.subscribe(USER_KEYS_UPDATED_CHANNEL).await?;
                self.globals_attached = true;
            }
            self.cache.subscribe(&page_channel(&page_key)).await?;
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, conn_id: u64, page_key: &str) {
        let Some(entry) = self.conns.get_mut(&conn_id) else {
            return;
        };
        if entry.pages.remove(page_key) {
            self.drop_page_subscription(conn_id, page_key).await;
        }
    }

    /// Remove one connection from a page's subscriber set, detaching from
    /// the bus channel when the instance has no subscribers left.
    async fn drop_page_subscription(&mut self, conn_id: u64, page_key: &str) {
        let Some(subscribers) = self.pages.get_mut(page_key) else {
            return;
        };
        subscribers.remove(&conn_id);
        if subscribers.is_empty() {
            self.pages.remove(page_key);
            if let Err(e) = self.cache.unsubscribe(&page_channel(page_key)).await {
                warn!(page = %page_key, error = %e, "channel detach failed");
            }
        }
    }

    fn fan_out(&mut self, event: BusEvent) {
        if let Some(page_key) = page_key_of_channel(&event.channel) {
            let Some(subscribers) = self.pages.get(page_key) else {
                return;
            };
            for conn_id in subscribers {
                let Some(entry) = self.conns.get(conn_id) else {
                    continue;
                };
                // Forward the envelope verbatim; the payload *is* the push
                // frame.
                match entry.handle.out.try_send(Message::Text(event.payload.clone())) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // The connection's pumps unregister on cancel,
                        // which releases its subscription entries.
                        warn!(conn_id, page = %page_key, "outbound queue full; closing");
                        entry.handle.cancel.cancel();
                    }
                    // Raced a close; publish is a no-op for that socket.
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
            return;
        }

        match event.channel.as_str() {
            USER_DELETED_CHANNEL => {
                let Ok(payload) = serde_json::from_str::<UserDeleted>(&event.payload) else {
                    warn!("undecodable user-deleted payload");
                    return;
                };
                if let Some(conn_ids) = self.users.get(&payload.user_id) {
                    for conn_id in conn_ids {
                        if let Some(entry) = self.conns.get(conn_id) {
                            entry.handle.cancel.cancel();
                        }
                    }
                }
            }
            USER_KEYS_UPDATED_CHANNEL => {
                let Ok(payload) = serde_json::from_str::<UserKeysUpdated>(&event.payload) else {
                    warn!("undecodable user-keys-updated payload");
                    return;
                };
                // Inbound updates are authoritative for every connection,
                // including ones on the instance that initiated the change.
                let update = UserEvent::KeysUpdated {
                    key_version: payload.key_version,
                    keys_deleted: payload.keys_deleted,
                };
                if let Some(conn_ids) = self.users.get(&payload.user_id) {
                    for conn_id in conn_ids {
                        if let Some(entry) = self.conns.get(conn_id) {
                            let _ = entry.handle.events.send(update);
                        }
                    }
                }
            }
            other => debug!(channel = %other, "message on unknown channel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryBroker, MemoryCacheBus};

    struct TestConn {
        handle: ConnHandle,
        out_rx: mpsc::Receiver<Message>,
        event_rx: mpsc::UnboundedReceiver<UserEvent>,
    }

    fn conn(id: u64, user_id: &str) -> TestConn {
        conn_with_queue(id, user_id, OUTBOUND_QUEUE)
    }

    fn conn_with_queue(id: u64, user_id: &str, queue: usize) -> TestConn {
        let (out, out_rx) = mpsc::channel(queue);
        let (events, event_rx) = mpsc::unbounded_channel();
        TestConn {
            handle: ConnHandle {
                id,
                user_id: user_id.to_owned(),
                out,
                events,
                cancel: CancellationToken::new(),
            },
            out_rx,
            event_rx,
        }
    }

    struct World {
        hub: HubHandle,
        cache: Arc<MemoryCacheBus>,
        shutdown: CancellationToken,
    }

    fn world() -> World {
        let broker = MemoryBroker::new();
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let cache = Arc::new(MemoryCacheBus::attach(&broker, bus_tx));
        let shutdown = CancellationToken::new();
        let (hub, _task) = spawn_hub(
            Arc::clone(&cache) as Arc<dyn CacheBus>,
            bus_rx,
            shutdown.clone(),
        );
        World { hub, cache, shutdown }
    }

    fn text(message: Message) -> String {
        match message {
            Message::Text(text) => text.to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fourth_connection_for_a_user_is_refused_until_a_slot_frees() {
        let w = world();
        let conns: Vec<TestConn> = (0..3).map(|i| conn(i, "u-1")).collect();
        for c in &conns {
            assert!(w.hub.register(c.handle.clone()).await);
        }
        let fourth = conn(3, "u-1");
        assert!(!w.hub.register(fourth.handle.clone()).await);

        let other_user = conn(4, "u-2");
        assert!(w.hub.register(other_user.handle.clone()).await, "cap is per user");

        w.hub.unregister(0).await;
        assert!(w.hub.register(fourth.handle.clone()).await, "slot freed");
        w.shutdown.cancel();
    }

    #[tokio::test]
    async fn subscribed_connections_receive_page_events_verbatim() {
        let w = world();
        let mut a = conn(1, "u-1");
        let mut b = conn(2, "u-2");
        assert!(w.hub.register(a.handle.clone()).await);
        assert!(w.hub.register(b.handle.clone()).await);
        w.hub.subscribe(1, "example.com/a".to_owned()).await.expect("subscribe a");
        w.hub.subscribe(2, "example.com/a".to_owned()).await.expect("subscribe b");
        // Double-subscribe is idempotent.
        w.hub.subscribe(1, "example.com/a".to_owned()).await.expect("resubscribe");

        w.cache
            .publish(&page_channel("example.com/a"), "the-envelope")
            .await
            .unwrap();
        let frame_a = tokio::time::timeout(std::time::Duration::from_secs(1), a.out_rx.recv())
            .await
            .expect("delivery a")
            .expect("open");
        let frame_b = tokio::time::timeout(std::time::Duration::from_secs(1), b.out_rx.recv())
            .await
            .expect("delivery b")
            .expect("open");
        assert_eq!(text(frame_a), "the-envelope");
        assert_eq!(text(frame_b), "the-envelope");
        assert!(a.out_rx.try_recv().is_err(), "exactly one per connection");

        // Unsubscribed connections stop receiving.
        w.hub.unsubscribe(1, "example.com/a".to_owned()).await;
        w.cache
            .publish(&page_channel("example.com/a"), "second")
            .await
            .unwrap();
        let frame_b = tokio::time::timeout(std::time::Duration::from_secs(1), b.out_rx.recv())
            .await
            .expect("delivery b")
            .expect("open");
        assert_eq!(text(frame_b), "second");
        assert!(a.out_rx.try_recv().is_err());
        w.shutdown.cancel();
    }

    #[tokio::test]
    async fn channel_attach_and_detach_follow_the_subscriber_count() {
        let w = world();
        let a = conn(1, "u-1");
        let b = conn(2, "u-2");
        assert!(w.hub.register(a.handle.clone()).await);
        assert!(w.hub.register(b.handle.clone()).await);
        w.hub.subscribe(1, "example.com/a".to_owned()).await.expect("subscribe");
        w.hub.subscribe(2, "example.com/a".to_owned()).await.expect("subscribe");

        // Detach only once the last subscriber leaves: publish after one
        // unsubscribe still reaches the other.
        w.hub.unsubscribe(1, "example.com/a".to_owned()).await;
        w.cache.publish(&page_channel("example.com/a"), "x").await.unwrap();
        let mut b = b;
        assert!(
            tokio::time::timeout(std::time::Duration::from_secs(1), b.out_rx.recv())
                .await
                .is_ok()
        );

        // After the last one, the instance detaches; nothing is delivered
        // even to the hub (drop is at the broker).
        w.hub.unsubscribe(2, "example.com/a".to_owned()).await;
        tokio::task::yield_now().await;
        w.cache.publish(&page_channel("example.com/a"), "y").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(b.out_rx.try_recv().is_err());
        w.shutdown.cancel();
    }

    #[tokio::test]
    async fn subscription_cap_is_fifty_distinct_pages() {
        let w = world();
        let c = conn(1, "u-1");
        assert!(w.hub.register(c.handle.clone()).await);
        for i in 0..MAX_SUBSCRIPTIONS {
            w.hub
                .subscribe(1, format!("example.com/p{i}"))
                .await
                .unwrap_or_else(|_| panic!("subscription {i} within cap"));
        }
        let err = w.hub.subscribe(1, "example.com/one-too-many".to_owned()).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");
        // Re-subscribing an existing page is still fine.
        w.hub.subscribe(1, "example.com/p0".to_owned()).await.expect("idempotent");
        w.shutdown.cancel();
    }

    #[tokio::test]
    async fn slow_consumer_overflow_closes_the_connection() {
        let w = world();
        let c = conn_with_queue(1, "u-1", 2);
        assert!(w.hub.register(c.handle.clone()).await);
        w.hub.subscribe(1, "example.com/a".to_owned()).await.expect("subscribe");

        for i in 0..3 {
            w.cache
                .publish(&page_channel("example.com/a"), &format!("m{i}"))
                .await
                .unwrap();
        }
        tokio::time::timeout(std::time::Duration::from_secs(1), c.handle.cancel.cancelled())
            .await
            .expect("overflowing connection is cancelled");
        w.shutdown.cancel();
    }

    #[tokio::test]
    async fn user_deleted_tears_down_and_keys_updated_reaches_the_state_pump() {
        let w = world();
        let mut a = conn(1, "u-1");
        let b = conn(2, "u-1");
        let other = conn(3, "u-2");
        for c in [&a, &b, &other] {
            assert!(w.hub.register(c.handle.clone()).await);
        }
        // Attach the global channels via any page subscription.
        w.hub.subscribe(1, "example.com/a".to_owned()).await.expect("subscribe");

        w.cache
            .publish(
                USER_KEYS_UPDATED_CHANNEL,
                &serde_json::to_string(&UserKeysUpdated {
                    user_id: "u-1".to_owned(),
                    key_version: 6,
                    keys_deleted: false,
                })
                .unwrap(),
            )
            .await
            .unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(1), a.event_rx.recv())
            .await
            .expect("event")
            .expect("open");
        assert_eq!(event, UserEvent::KeysUpdated { key_version: 6, keys_deleted: false });

        w.cache
            .publish(
                USER_DELETED_CHANNEL,
                &serde_json::to_string(&UserDeleted { user_id: "u-1".to_owned() }).unwrap(),
            )
            .await
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), a.handle.cancel.cancelled())
            .await
            .expect("first connection cancelled");
        tokio::time::timeout(std::time::Duration::from_secs(1), b.handle.cancel.cancelled())
            .await
            .expect("second connection cancelled");
        assert!(!other.handle.cancel.is_cancelled(), "other users unaffected");
        w.shutdown.cancel();
    }
}
