//! WebSocket listener that links nodes to the message bus.

use crate::error::HubError;
use crate::frame::decode_frame;
use crate::registry::NodeRegistry;
use futures::{SinkExt, StreamExt};
use player_sync::MessageBus;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Listener settings.
#[derive(Debug, Clone)]
pub struct HubServerConfig {
    pub bind_address: SocketAddr,
    /// How long a node has to announce its name after the WebSocket
    /// handshake.
    pub handshake_timeout: Duration,
    pub backlog: i32,
}

impl Default for HubServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 25590)),
            handshake_timeout: Duration::from_secs(10),
            backlog: 1024,
        }
    }
}

/// Accepts node connections and feeds their frames into the bus.
pub struct HubServer {
    config: HubServerConfig,
    bus: Arc<MessageBus>,
    registry: Arc<NodeRegistry>,
    shutdown_sender: broadcast::Sender<()>,
}

impl HubServer {
    /// `registry` must be the sender the bus was built with, so responses
    /// reach the nodes this server accepts.
    pub fn new(config: HubServerConfig, bus: Arc<MessageBus>, registry: Arc<NodeRegistry>) -> Self {
        let (shutdown_sender, _) = broadcast::channel(1);
        Self {
            config,
            bus,
            registry,
            shutdown_sender,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Binds the configured address.
    pub fn bind(&self) -> Result<TcpListener, HubError> {
        let address = self.config.bind_address;
        let domain = if address.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| HubError::Network(format!("Socket creation failed: {e}")))?;
        socket.set_reuse_address(true).ok();
        socket
            .bind(&address.into())
            .map_err(|e| HubError::Network(format!("Bind to {address} failed: {e}")))?;
        socket
            .listen(self.config.backlog)
            .map_err(|e| HubError::Network(format!("Listen failed: {e}")))?;

        let std_listener: StdTcpListener = socket.into();
        std_listener
            .set_nonblocking(true)
            .map_err(|e| HubError::Network(format!("Failed to set non-blocking: {e}")))?;
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| HubError::Network(format!("Tokio listener creation failed: {e}")))?;

        info!("✅ Hub listener bound on {}", address);
        Ok(listener)
    }

    /// Binds and serves until [`shutdown`](Self::shutdown) is called.
    pub async fn start(&self) -> Result<(), HubError> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Runs the accept loop on `listener` until shutdown, then closes every
    /// node link.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), HubError> {
        let mut shutdown_receiver = self.shutdown_sender.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let bus = self.bus.clone();
                        let registry = self.registry.clone();
                        let timeout = self.config.handshake_timeout;
                        tokio::spawn(async move {
                            handle_connection(stream, addr, bus, registry, timeout).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                _ = shutdown_receiver.recv() => {
                    info!("Shutdown signal received, stopping hub listener");
                    break;
                }
            }
        }

        self.registry.close_all();
        info!("Hub listener stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_sender.send(());
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    bus: Arc<MessageBus>,
    registry: Arc<NodeRegistry>,
    handshake_timeout: Duration,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    let (mut ws_sink, mut ws_receiver) = ws_stream.split();

    let node = match tokio::time::timeout(handshake_timeout, ws_receiver.next()).await {
        Ok(Some(Ok(Message::Text(name)))) if !name.trim().is_empty() => name.trim().to_string(),
        Ok(Some(Ok(other))) => {
            warn!("❌ Connection from {} did not announce a node name ({:?})", addr, other);
            let _ = ws_sink.send(Message::Close(None)).await;
            return;
        }
        Ok(Some(Err(e))) => {
            error!("WebSocket error from {} before handshake: {}", addr, e);
            return;
        }
        Ok(None) => return,
        Err(_) => {
            warn!("⚠️ Node at {} missed the handshake deadline", addr);
            let _ = ws_sink.send(Message::Close(None)).await;
            return;
        }
    };

    let (link, mut outbound) = registry.register(&node, addr);

    let writer_node = node.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = ws_sink.send(message).await {
                debug!("Write to node {} failed: {}", writer_node, e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Binary(frame)) => match decode_frame(frame.to_vec()) {
                Ok((channel, payload)) => {
                    bus.on_message(&node, &channel, payload).await;
                }
                Err(e) => warn!("⚠️ Dropping bad frame from node {}: {}", node, e),
            },
            Ok(Message::Ping(data)) => {
                let _ = link.queue(Message::Pong(data));
            }
            Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!("Node {} requested close", node);
                break;
            }
            Ok(Message::Text(_)) => {
                warn!("Ignoring text frame from node {} after handshake", node);
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                error!("WebSocket error for node {}: {}", node, e);
                break;
            }
        }
    }

    // A link replaced by a reconnect leaves the node's sessions alone.
    if registry.unregister(&node, link.link_id) {
        bus.node_disconnected(&node).await;
    }
    let _ = link.queue(Message::Close(None));
    drop(link);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use player_sync::*;
    use tokio_tungstenite::connect_async;

    async fn running_hub() -> (Arc<HubServer>, SocketAddr, Arc<PlayerCache>) {
        let database = Arc::new(MemoryDatabase::new());
        let supervisor = ConnectionSupervisor::connect(
            MemoryConnector::new(database),
            SupervisorConfig::default(),
        )
        .await
        .unwrap();
        let store: Arc<dyn PlayerStore> = Arc::new(MemoryPlayerStore::new(supervisor));
        let cache = Arc::new(PlayerCache::new(store));

        let registry = Arc::new(NodeRegistry::new());
        let bus = Arc::new(MessageBus::new(registry.clone()));
        register_player_handlers(&bus, cache.clone(), HandlerSettings::default())
            .await
            .unwrap();
        bus.register_channels();

        let config = HubServerConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..HubServerConfig::default()
        };
        let server = Arc::new(HubServer::new(config, bus, registry));
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();

        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });

        (server, addr, cache)
    }

    #[tokio::test]
    async fn test_ping_round_trip_over_websocket() {
        let (server, addr, _cache) = running_hub().await;
        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();

        ws.send(Message::text("lobby-1")).await.unwrap();
        let ping = Request::Ping { timestamp: 31337 }.encode().unwrap();
        ws.send(Message::binary(encode_frame(CORE_CHANNEL, &ping).unwrap()))
            .await
            .unwrap();

        let reply = loop {
            match ws.next().await {
                Some(Ok(Message::Binary(frame))) => break frame,
                Some(Ok(_)) => continue,
                other => panic!("connection ended early: {:?}", other),
            }
        };
        let (channel, payload) = decode_frame(reply.to_vec()).unwrap();
        assert_eq!(channel, CORE_CHANNEL);
        assert_eq!(
            Response::decode(&payload).unwrap(),
            Response::Pong {
                sender_tag: "hub".to_string(),
                timestamp: 31337
            }
        );
        assert_eq!(server.registry().connected_nodes(), vec!["lobby-1".to_string()]);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_session_start_over_websocket() {
        let (server, addr, cache) = running_hub().await;
        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        ws.send(Message::text("survival")).await.unwrap();

        let player = PlayerId::new();
        let start = Request::SessionStart {
            player,
            username: "Notch".to_string(),
        }
        .encode()
        .unwrap();
        ws.send(Message::binary(encode_frame(SESSION_CHANNEL, &start).unwrap()))
            .await
            .unwrap();

        // Same link, so the lookup is answered after the start has run.
        let get = Request::GetPlayerData { player }.encode().unwrap();
        ws.send(Message::binary(encode_frame(CORE_CHANNEL, &get).unwrap()))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap();
        let Some(Ok(Message::Binary(frame))) = reply else {
            panic!("expected a binary reply");
        };
        let (_, payload) = decode_frame(frame.to_vec()).unwrap();
        let Response::PlayerData(data) = Response::decode(&payload).unwrap() else {
            panic!("expected player data");
        };
        assert_eq!(data.last_server, "survival");
        assert_eq!(data.username, "Notch");
        assert!(data.is_online);
        assert!(cache.contains(player));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_node_and_ends_its_sessions() {
        let (server, addr, cache) = running_hub().await;
        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        ws.send(Message::text("minigames")).await.unwrap();

        let player = PlayerId::new();
        let start = Request::SessionStart {
            player,
            username: "Grumm".to_string(),
        }
        .encode()
        .unwrap();
        ws.send(Message::binary(encode_frame(SESSION_CHANNEL, &start).unwrap()))
            .await
            .unwrap();

        for _ in 0..50 {
            if server.registry().node_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.registry().node_count(), 1);

        ws.close(None).await.unwrap();
        for _ in 0..50 {
            if server.registry().node_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.registry().node_count(), 0);

        for _ in 0..50 {
            if !cache.contains(player) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!cache.contains(player));
        assert!(!cache.get(player).await.unwrap().unwrap().online);

        server.shutdown();
    }
}
