use futures::{SinkExt, StreamExt};
use hub_server::*;
use player_sync::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type NodeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_hub() -> (Arc<HubServer>, SocketAddr) {
    let database = Arc::new(MemoryDatabase::new());
    let supervisor = ConnectionSupervisor::connect(
        MemoryConnector::new(database),
        SupervisorConfig::default(),
    )
    .await
    .expect("memory store connects");
    let store: Arc<dyn PlayerStore> = Arc::new(MemoryPlayerStore::new(supervisor));
    let cache = Arc::new(PlayerCache::new(store));

    let registry = Arc::new(NodeRegistry::new());
    let bus = Arc::new(MessageBus::new(registry.clone()));
    register_player_handlers(&bus, cache, HandlerSettings::default())
        .await
        .expect("handlers register");
    bus.register_channels();

    let server = Arc::new(HubServer::new(
        HubServerConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..HubServerConfig::default()
        },
        bus,
        registry,
    ));
    let listener = server.bind().expect("bind");
    let addr = listener.local_addr().unwrap();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (server, addr)
}

async fn join(addr: SocketAddr, name: &str) -> NodeSocket {
    let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.expect("connect");
    ws.send(Message::text(name.to_string())).await.unwrap();
    ws
}

async fn wait_for_nodes(server: &HubServer, count: usize) {
    for _ in 0..100 {
        if server.registry().node_count() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} linked node(s)", count);
}

async fn next_frame(ws: &mut NodeSocket) -> (String, Vec<u8>) {
    let wait = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(frame))) => return decode_frame(frame.to_vec()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("link ended: {:?}", other),
            }
        }
    });
    wait.await.expect("frame within deadline")
}

#[tokio::test]
async fn test_coin_update_is_broadcast_to_all_nodes() {
    let (server, addr) = start_hub().await;
    let mut lobby = join(addr, "lobby").await;
    let mut skyblock = join(addr, "skyblock").await;
    wait_for_nodes(&server, 2).await;

    let player = PlayerId::new();
    let start = Request::SessionStart {
        player,
        username: "Jeb".to_string(),
    };
    lobby
        .send(Message::binary(
            encode_frame(SESSION_CHANNEL, &start.encode().unwrap()).unwrap(),
        ))
        .await
        .unwrap();

    let update = Request::UpdateCoins { player, coins: 9.5 };
    lobby
        .send(Message::binary(
            encode_frame(ECONOMY_CHANNEL, &update.encode().unwrap()).unwrap(),
        ))
        .await
        .unwrap();

    for ws in [&mut lobby, &mut skyblock] {
        let (channel, payload) = next_frame(ws).await;
        assert_eq!(channel, CORE_CHANNEL);
        let message = WireMessage::decode(&payload, &[FieldKind::Str, FieldKind::Str]).unwrap();
        assert_eq!(message.message_type, "PLAYER_UPDATE");
        assert_eq!(message.fields[0].as_str(), Some(player.to_string().as_str()));
        assert_eq!(message.fields[1].as_str(), Some("coins"));
    }

    server.shutdown();
}

#[tokio::test]
async fn test_shutdown_closes_node_links() {
    let (server, addr) = start_hub().await;
    let mut node = join(addr, "factions").await;
    wait_for_nodes(&server, 1).await;

    server.shutdown();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match node.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "node link was not closed");
    assert_eq!(server.registry().node_count(), 0);
}

async fn send_request(ws: &mut NodeSocket, channel: &str, request: Request) {
    let frame = encode_frame(channel, &request.encode().unwrap()).unwrap();
    ws.send(Message::binary(frame)).await.unwrap();
}

async fn player_data(ws: &mut NodeSocket, player: PlayerId) -> PlayerDataResponse {
    send_request(ws, CORE_CHANNEL, Request::GetPlayerData { player }).await;
    let (_, payload) = next_frame(ws).await;
    match Response::decode(&payload).unwrap() {
        Response::PlayerData(data) => data,
        other => panic!("unexpected response {:?}", other),
    }
}

#[tokio::test]
async fn test_reconnect_keeps_sessions_of_replaced_link() {
    let (server, addr) = start_hub().await;
    let mut first = join(addr, "lobby").await;
    wait_for_nodes(&server, 1).await;

    let player = PlayerId::new();
    send_request(
        &mut first,
        SESSION_CHANNEL,
        Request::SessionStart {
            player,
            username: "Grian".to_string(),
        },
    )
    .await;
    assert!(player_data(&mut first, player).await.is_online);

    let mut second = join(addr, "lobby").await;
    let replaced = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(replaced.is_ok(), "replaced link was not closed");

    let data = player_data(&mut second, player).await;
    assert!(data.is_online);
    assert_eq!(data.last_server, "lobby");
    assert_eq!(server.registry().node_count(), 1);

    server.shutdown();
}
