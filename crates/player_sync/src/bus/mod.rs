//! Cross-process messaging between the hub and its nodes.
//!
//! The [`MessageBus`] owns the channel registry and the handler table.
//! Inbound messages are routed by `(channel family, message type)` and run
//! on a per-node lane: one node's messages complete in the order they
//! arrived, while different nodes never wait on each other. Outbound traffic
//! goes through the [`NodeSender`] seam, which the transport layer
//! implements.

mod channels;
mod handlers;

pub use channels::{
    ChannelFamily, ChannelRegistry, CORE_CHANNEL, ECONOMY_CHANNEL, PVP_CHANNEL, RANKUP_CHANNEL,
    SESSION_CHANNEL,
};
pub use handlers::{register_player_handlers, HandlerSettings};

use crate::error::BusError;
use crate::protocol::{self, Response};
use crate::types::PlayerId;
use crate::wire::{WireMessage, WireReader};
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

/// Delivers raw channel payloads to connected nodes.
///
/// Implemented by the transport; the bus never talks to sockets directly.
pub trait NodeSender: Send + Sync + std::fmt::Debug {
    /// Queues `payload` for `node` on `channel`.
    fn send_to_node(
        &self,
        node: &str,
        channel: &str,
        payload: Vec<u8>,
    ) -> BoxFuture<'_, Result<(), String>>;

    /// Names of the nodes currently connected.
    fn connected_nodes(&self) -> Vec<String>;
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Cloneable handle for sending, shared by the bus and running handlers.
#[derive(Clone, Debug)]
pub struct Outbound {
    sender: Arc<dyn NodeSender>,
}

impl Outbound {
    pub fn new(sender: Arc<dyn NodeSender>) -> Self {
        Self { sender }
    }

    pub async fn send(&self, node: &str, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.sender
            .send_to_node(node, channel, payload)
            .await
            .map_err(|reason| {
                warn!("❌ Failed to send on {} to node {}: {}", channel, node, reason);
                BusError::Send {
                    node: node.to_string(),
                    reason,
                }
            })
    }

    /// Sends `payload` to every connected node. A failing node is logged and
    /// skipped; it never stops delivery to the others.
    pub async fn broadcast(&self, channel: &str, payload: Vec<u8>) -> BroadcastReport {
        let nodes = self.sender.connected_nodes();
        let deliveries = nodes
            .iter()
            .map(|node| self.send(node, channel, payload.clone()));

        let mut report = BroadcastReport::default();
        for result in join_all(deliveries).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(_) => report.failed += 1,
            }
        }

        debug!(
            "📡 Broadcast on {} reached {} node(s), {} failed",
            channel, report.delivered, report.failed
        );
        report
    }
}

/// An inbound message handed to a handler.
#[derive(Debug)]
pub struct InboundMessage {
    pub source_node: String,
    pub channel: String,
    pub family: ChannelFamily,
    pub message_type: String,
    /// Positioned on the first field after the type tag.
    pub reader: WireReader,
    pub outbound: Outbound,
}

impl InboundMessage {
    /// Sends a response back to the node this message came from, on the
    /// channel the response type travels on.
    pub async fn respond(&self, response: &Response) -> Result<(), BusError> {
        let payload = response.encode()?;
        self.outbound
            .send(&self.source_node, response.channel(), payload)
            .await
    }
}

/// Boxed async message handler.
pub type MessageHandler =
    Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, Result<(), BusError>> + Send + Sync>;

/// Boxed async callback run when a node's link goes away.
pub type DisconnectHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

enum LaneJob {
    Dispatch(BoxFuture<'static, ()>),
    /// Last job of a link; the lane retires afterwards if nothing is queued.
    Disconnect(BoxFuture<'static, ()>),
}

struct Lane {
    id: u64,
    jobs: mpsc::UnboundedSender<LaneJob>,
}

type Lanes = Arc<DashMap<String, Lane>>;

#[derive(Debug, Default)]
struct BusCounters {
    received: AtomicU64,
    dispatched: AtomicU64,
    ignored: AtomicU64,
    malformed: AtomicU64,
    handler_failures: AtomicU64,
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub received: u64,
    pub dispatched: u64,
    pub ignored: u64,
    pub malformed: u64,
    pub handler_failures: u64,
}

/// Routes inbound channel messages to handlers and sends messages out.
pub struct MessageBus {
    registry: ChannelRegistry,
    handlers: RwLock<HashMap<(ChannelFamily, String), MessageHandler>>,
    disconnect_handlers: RwLock<Vec<DisconnectHandler>>,
    lanes: Lanes,
    next_lane_id: AtomicU64,
    outbound: Outbound,
    counters: Arc<BusCounters>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("channels", &self.registry.registered())
            .field("handlers", &"[handlers]")
            .field("lanes", &self.lanes.len())
            .field("outbound", &self.outbound)
            .finish()
    }
}

impl MessageBus {
    /// Creates a bus with no channels registered and no handlers.
    pub fn new(sender: Arc<dyn NodeSender>) -> Self {
        Self {
            registry: ChannelRegistry::new(),
            handlers: RwLock::new(HashMap::new()),
            disconnect_handlers: RwLock::new(Vec::new()),
            lanes: Arc::new(DashMap::new()),
            next_lane_id: AtomicU64::new(0),
            outbound: Outbound::new(sender),
            counters: Arc::new(BusCounters::default()),
        }
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Registers the five default channels.
    pub fn register_channels(&self) {
        for (name, family, accepted) in ChannelRegistry::default_channels() {
            self.registry.register(name, family, &accepted);
        }
        info!("✅ Channel messaging ready");
    }

    pub fn unregister_channels(&self) {
        self.registry.clear();
        info!("🔌 All channels unregistered");
    }

    pub fn is_registered(&self) -> bool {
        !self.registry.registered().is_empty()
    }

    /// Registers `handler` for `message_type` on every channel of `family`.
    /// A later registration for the same key replaces the earlier one.
    pub async fn on<F, Fut>(&self, family: ChannelFamily, message_type: &str, handler: F)
    where
        F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(
            move |message: InboundMessage| -> BoxFuture<'static, Result<(), BusError>> {
                Box::pin(handler(message))
            },
        );
        let key = (family, message_type.to_string());
        self.handlers.write().await.insert(key, handler);
        info!("📝 Registered handler for {}:{}", family, message_type);
    }

    /// Registers a callback run with the node name once a node's link
    /// closes, after every message already received from it.
    pub async fn on_disconnect<F, Fut>(&self, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: DisconnectHandler =
            Arc::new(move |node: String| -> BoxFuture<'static, ()> { Box::pin(handler(node)) });
        self.disconnect_handlers.write().await.push(handler);
    }

    /// Routes one inbound message.
    ///
    /// Messages on unregistered channels, with types the channel does not
    /// accept, or without a handler are ignored. A payload whose type tag
    /// cannot be decoded is dropped. Otherwise the handler is queued on the
    /// source node's lane behind that node's earlier messages.
    ///
    /// # Returns
    ///
    /// A receiver that resolves once the handler has finished, or `None` if
    /// the message was not dispatched.
    pub async fn on_message(
        &self,
        source_node: &str,
        channel: &str,
        raw: Vec<u8>,
    ) -> Option<oneshot::Receiver<()>> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if !self.registry.is_registered(channel) {
            debug!("Ignoring message on unregistered channel {} from {}", channel, source_node);
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let (message_type, reader) = match WireReader::split_tag(raw) {
            Ok(split) => split,
            Err(e) => {
                warn!("⚠️ Dropping malformed message on {} from {}: {}", channel, source_node, e);
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let Some(family) = self.registry.route(channel, &message_type) else {
            debug!("Ignoring {} on {} from {}", message_type, channel, source_node);
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let handler = self
            .handlers
            .read()
            .await
            .get(&(family, message_type.clone()))
            .cloned();
        let Some(handler) = handler else {
            debug!("No handler for {}:{}", family, message_type);
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let message = InboundMessage {
            source_node: source_node.to_string(),
            channel: channel.to_string(),
            family,
            message_type,
            reader,
            outbound: self.outbound.clone(),
        };

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        let counters = self.counters.clone();
        let source = message.source_node.clone();
        let label = format!("{}:{}", family, message.message_type);

        let (done, finished) = oneshot::channel();

        let task = async move {
            match handler(message).await {
                Ok(()) => {}
                Err(BusError::Wire(e)) => {
                    warn!("⚠️ Dropping malformed {} from {}: {}", label, source, e);
                    counters.malformed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!("❌ Handler {} failed for message from {}: {}", label, source, e);
                    counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            let _ = done.send(());
        };
        self.enqueue(source_node, LaneJob::Dispatch(Box::pin(task)));
        Some(finished)
    }

    /// Runs the disconnect callbacks for `node` behind the messages already
    /// queued for it. The returned receiver resolves when they are done.
    pub async fn node_disconnected(&self, node: &str) -> oneshot::Receiver<()> {
        let handlers = self.disconnect_handlers.read().await.clone();
        let (done, finished) = oneshot::channel();
        let name = node.to_string();

        let task = async move {
            for handler in handlers {
                handler(name.clone()).await;
            }
            let _ = done.send(());
        };
        self.enqueue(node, LaneJob::Disconnect(Box::pin(task)));
        debug!("Queued disconnect of node {}", node);
        finished
    }

    /// Number of nodes with a live dispatch lane.
    pub fn active_lanes(&self) -> usize {
        self.lanes.len()
    }

    fn enqueue(&self, node: &str, job: LaneJob) {
        let lane = self.lanes.entry(node.to_string()).or_insert_with(|| {
            let id = self.next_lane_id.fetch_add(1, Ordering::Relaxed);
            Lane {
                id,
                jobs: spawn_lane(
                    node.to_string(),
                    id,
                    Arc::downgrade(&self.lanes),
                    self.counters.clone(),
                ),
            }
        });
        if lane.jobs.send(job).is_err() {
            error!("❌ Dispatch lane of node {} is gone, message dropped", node);
        }
    }

    /// Sends `message` to one node.
    pub async fn send(&self, node: &str, channel: &str, message: &WireMessage) -> Result<(), BusError> {
        self.ensure_registered(channel)?;
        let payload = message.encode()?;
        self.outbound.send(node, channel, payload).await
    }

    /// Sends `message` to every connected node.
    pub async fn broadcast(&self, channel: &str, message: &WireMessage) -> Result<BroadcastReport, BusError> {
        self.ensure_registered(channel)?;
        let payload = message.encode()?;
        Ok(self.outbound.broadcast(channel, payload).await)
    }

    /// Broadcasts `PLAYER_UPDATE(uuid, kind)` on the core channel.
    pub async fn notify_player_update(
        &self,
        player: PlayerId,
        kind: &str,
    ) -> Result<BroadcastReport, BusError> {
        self.broadcast(CORE_CHANNEL, &protocol::player_update(player, kind))
            .await
    }

    /// Broadcasts `MAINTENANCE("START" | "END")` on the core channel.
    pub async fn notify_maintenance(&self, starting: bool) -> Result<BroadcastReport, BusError> {
        let report = self
            .broadcast(CORE_CHANNEL, &protocol::maintenance(starting))
            .await?;
        info!(
            "🛠️ Maintenance {} announced to {} node(s)",
            if starting { "start" } else { "end" },
            report.delivered
        );
        Ok(report)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            received: self.counters.received.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            ignored: self.counters.ignored.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
        }
    }

    fn ensure_registered(&self, channel: &str) -> Result<(), BusError> {
        if self.registry.is_registered(channel) {
            Ok(())
        } else {
            warn!("❌ Refusing to send on unregistered channel {}", channel);
            Err(BusError::ChannelNotRegistered(channel.to_string()))
        }
    }
}

/// Runs a node's jobs one at a time. Each job gets its own task so a
/// panicking handler does not take the lane down with it. The worker ends
/// once its lane is retired or the bus is dropped.
fn spawn_lane(
    node: String,
    id: u64,
    lanes: Weak<DashMap<String, Lane>>,
    counters: Arc<BusCounters>,
) -> mpsc::UnboundedSender<LaneJob> {
    let (sender, mut jobs) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            let (task, retire) = match job {
                LaneJob::Dispatch(task) => (task, false),
                LaneJob::Disconnect(task) => (task, true),
            };

            if let Err(e) = tokio::spawn(task).await {
                error!("❌ Handler task for node {} panicked: {}", node, e);
                counters.handler_failures.fetch_add(1, Ordering::Relaxed);
            }

            // Enqueueing holds the shard lock, so nothing can slip in
            // between the emptiness check and the removal.
            if retire {
                if let Some(lanes) = lanes.upgrade() {
                    lanes.remove_if(&node, |_, lane| lane.id == id && jobs.is_empty());
                }
            }
        }
        debug!("Dispatch lane of node {} closed", node);
    });

    sender
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::wire::FieldKind;
    use std::sync::Mutex;

    /// Records every payload and fails for nodes listed in `failing`.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSender {
        pub nodes: Vec<String>,
        pub failing: Vec<String>,
        pub sent: Mutex<Vec<(String, String, Vec<u8>)>>,
    }

    impl RecordingSender {
        pub fn with_nodes(nodes: &[&str]) -> Self {
            Self {
                nodes: nodes.iter().map(|n| n.to_string()).collect(),
                ..Self::default()
            }
        }

        pub fn sent(&self) -> Vec<(String, String, Vec<u8>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl NodeSender for RecordingSender {
        fn send_to_node(
            &self,
            node: &str,
            channel: &str,
            payload: Vec<u8>,
        ) -> BoxFuture<'_, Result<(), String>> {
            let node = node.to_string();
            let channel = channel.to_string();
            Box::pin(async move {
                if self.failing.contains(&node) {
                    return Err("link closed".to_string());
                }
                self.sent.lock().unwrap().push((node, channel, payload));
                Ok(())
            })
        }

        fn connected_nodes(&self) -> Vec<String> {
            self.nodes.clone()
        }
    }

    fn bus_with(sender: RecordingSender) -> (Arc<RecordingSender>, MessageBus) {
        let sender = Arc::new(sender);
        let bus = MessageBus::new(sender.clone());
        bus.register_channels();
        (sender, bus)
    }

    #[tokio::test]
    async fn test_dispatches_to_handler_by_family_and_type() {
        let (sender, bus) = bus_with(RecordingSender::with_nodes(&["lobby"]));
        bus.on(ChannelFamily::Core, protocol::PING, |mut message: InboundMessage| async move {
            let timestamp = message.reader.read_i64()?;
            message
                .respond(&Response::Pong {
                    sender_tag: "hub".to_string(),
                    timestamp,
                })
                .await
        })
        .await;

        let raw = protocol::Request::Ping { timestamp: 99 }.encode().unwrap();
        let task = bus.on_message("lobby", CORE_CHANNEL, raw).await.unwrap();
        task.await.unwrap();

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "lobby");
        assert_eq!(sent[0].1, CORE_CHANNEL);
        assert_eq!(
            Response::decode(&sent[0].2).unwrap(),
            Response::Pong {
                sender_tag: "hub".to_string(),
                timestamp: 99
            }
        );
        assert_eq!(bus.stats().dispatched, 1);
    }

    #[tokio::test]
    async fn test_ignores_unregistered_and_unaccepted_messages() {
        let (_sender, bus) = bus_with(RecordingSender::default());
        bus.on(ChannelFamily::Core, protocol::PING, |_message: InboundMessage| async {
            Ok::<(), BusError>(())
        })
            .await;

        let ping = protocol::Request::Ping { timestamp: 1 }.encode().unwrap();
        assert!(bus.on_message("n", "bungeecord:main", ping.clone()).await.is_none());
        assert!(bus.on_message("n", ECONOMY_CHANNEL, ping.clone()).await.is_none());

        bus.unregister_channels();
        assert!(!bus.is_registered());
        assert!(bus.on_message("n", CORE_CHANNEL, ping).await.is_none());
        assert_eq!(bus.stats().ignored, 3);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let (_sender, bus) = bus_with(RecordingSender::default());
        bus.on(ChannelFamily::Core, protocol::PING, |mut message: InboundMessage| async move {
            message.reader.read_i64()?;
            Ok::<(), BusError>(())
        })
        .await;

        assert!(bus.on_message("n", CORE_CHANNEL, vec![0x00]).await.is_none());

        let mut truncated = protocol::Request::Ping { timestamp: 5 }.encode().unwrap();
        truncated.truncate(truncated.len() - 3);
        let task = bus.on_message("n", CORE_CHANNEL, truncated).await.unwrap();
        task.await.unwrap();

        assert_eq!(bus.stats().malformed, 2);
    }

    /// Registers a PING handler that sleeps `timestamp` milliseconds, then
    /// records `(node, timestamp)`.
    async fn sleepy_ping(bus: &MessageBus) -> Arc<Mutex<Vec<(String, i64)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        bus.on(ChannelFamily::Core, protocol::PING, move |mut message: InboundMessage| {
            let log = log.clone();
            async move {
                let timestamp = message.reader.read_i64()?;
                tokio::time::sleep(std::time::Duration::from_millis(timestamp as u64)).await;
                log.lock().unwrap().push((message.source_node.clone(), timestamp));
                Ok::<(), BusError>(())
            }
        })
        .await;
        seen
    }

    fn ping(timestamp: i64) -> Vec<u8> {
        protocol::Request::Ping { timestamp }.encode().unwrap()
    }

    #[tokio::test]
    async fn test_messages_from_one_node_complete_in_arrival_order() {
        let (_sender, bus) = bus_with(RecordingSender::default());
        let seen = sleepy_ping(&bus).await;

        let mut pending = Vec::new();
        for timestamp in [60, 0, 20, 5] {
            pending.push(bus.on_message("lobby", CORE_CHANNEL, ping(timestamp)).await.unwrap());
        }
        for done in pending {
            done.await.unwrap();
        }

        let order: Vec<i64> = seen.lock().unwrap().iter().map(|(_, t)| *t).collect();
        assert_eq!(order, [60, 0, 20, 5]);
    }

    #[tokio::test]
    async fn test_nodes_do_not_wait_on_each_other() {
        let (_sender, bus) = bus_with(RecordingSender::default());
        let seen = sleepy_ping(&bus).await;

        let slow = bus.on_message("survival", CORE_CHANNEL, ping(300)).await.unwrap();
        let fast = bus.on_message("lobby", CORE_CHANNEL, ping(0)).await.unwrap();

        fast.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), [("lobby".to_string(), 0)]);

        slow.await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(bus.active_lanes(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_runs_after_queued_messages_and_retires_lane() {
        let (_sender, bus) = bus_with(RecordingSender::default());
        let seen = sleepy_ping(&bus).await;

        let log = seen.clone();
        bus.on_disconnect(move |node: String| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push((node, -1));
            }
        })
        .await;

        bus.on_message("lobby", CORE_CHANNEL, ping(40)).await.unwrap();
        bus.node_disconnected("lobby").await.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            [("lobby".to_string(), 40), ("lobby".to_string(), -1)]
        );

        for _ in 0..50 {
            if bus.active_lanes() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(bus.active_lanes(), 0);

        // A node that comes back gets a fresh lane.
        bus.on_message("lobby", CORE_CHANNEL, ping(0)).await.unwrap().await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_broadcast_survives_failing_node() {
        let sender = RecordingSender {
            failing: vec!["broken".to_string()],
            ..RecordingSender::with_nodes(&["a", "broken", "b"])
        };
        let (sender, bus) = bus_with(sender);

        let player = PlayerId::new();
        let report = bus.notify_player_update(player, "gems").await.unwrap();
        assert_eq!(report, BroadcastReport { delivered: 2, failed: 1 });

        let sent = sender.sent();
        assert_eq!(sent.len(), 2);
        let decoded = WireMessage::decode(&sent[0].2, &[FieldKind::Str, FieldKind::Str]).unwrap();
        assert_eq!(decoded.message_type, protocol::PLAYER_UPDATE);
        assert_eq!(decoded.fields[1].as_str(), Some("gems"));
    }

    #[tokio::test]
    async fn test_send_requires_registered_channel() {
        let sender = Arc::new(RecordingSender::with_nodes(&["a"]));
        let bus = MessageBus::new(sender.clone());

        let result = bus.send("a", CORE_CHANNEL, &protocol::maintenance(true)).await;
        assert!(matches!(result, Err(BusError::ChannelNotRegistered(_))));

        bus.register_channels();
        bus.send("a", CORE_CHANNEL, &protocol::maintenance(true)).await.unwrap();
        let report = bus.notify_maintenance(false).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(sender.sent().len(), 2);
    }
}
