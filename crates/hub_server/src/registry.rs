//! Tracks connected nodes and queues outbound frames to them.

use crate::frame::encode_frame;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use player_sync::NodeSender;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// One live node connection.
#[derive(Debug, Clone)]
pub struct NodeLink {
    pub link_id: u64,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::UnboundedSender<Message>,
}

impl NodeLink {
    /// Queues a WebSocket message for this node's writer task.
    pub fn queue(&self, message: Message) -> Result<(), String> {
        self.sender
            .send(message)
            .map_err(|_| "node link closed".to_string())
    }
}

/// Map from node name to its link. A node that reconnects under the same
/// name replaces its previous link.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    links: DashMap<String, NodeLink>,
    next_link_id: AtomicU64,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` and returns the link plus the receiving end of its
    /// outbound queue.
    pub fn register(
        &self,
        name: &str,
        remote_addr: SocketAddr,
    ) -> (NodeLink, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let link = NodeLink {
            link_id: self.next_link_id.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            connected_at: Utc::now(),
            sender,
        };

        if let Some(previous) = self.links.insert(name.to_string(), link.clone()) {
            warn!(
                "⚠️ Node {} reconnected from {}, dropping link from {}",
                name, remote_addr, previous.remote_addr
            );
            let _ = previous.queue(Message::Close(None));
        }

        info!("🔌 Node {} linked from {}", name, remote_addr);
        (link, receiver)
    }

    /// Removes `name` if it is still served by `link_id`.
    pub fn unregister(&self, name: &str, link_id: u64) -> bool {
        let removed = self
            .links
            .remove_if(name, |_, link| link.link_id == link_id)
            .is_some();
        if removed {
            info!("👋 Node {} unlinked", name);
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<NodeLink> {
        self.links.get(name).map(|entry| entry.value().clone())
    }

    pub fn node_count(&self) -> usize {
        self.links.len()
    }

    /// Asks every writer task to close its socket and forgets all links.
    pub fn close_all(&self) {
        let count = self.links.len();
        for entry in self.links.iter() {
            let _ = entry.value().queue(Message::Close(None));
        }
        self.links.clear();
        if count > 0 {
            info!("🔌 Closed {} node link(s)", count);
        }
    }
}

impl NodeSender for NodeRegistry {
    fn send_to_node(
        &self,
        node: &str,
        channel: &str,
        payload: Vec<u8>,
    ) -> BoxFuture<'_, Result<(), String>> {
        let result = self
            .get(node)
            .ok_or_else(|| format!("Node {} not connected", node))
            .and_then(|link| {
                let frame = encode_frame(channel, &payload).map_err(|e| e.to_string())?;
                link.queue(Message::binary(frame))
            });
        if result.is_ok() {
            debug!("Queued {} byte(s) on {} for {}", payload.len(), channel, node);
        }
        Box::pin(async move { result })
    }

    fn connected_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.links.iter().map(|entry| entry.key().clone()).collect();
        nodes.sort();
        nodes
    }
}
