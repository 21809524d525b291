use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gamework::config::ServerConfig;
use gamework::error::ErrorCode;
use gamework::signaling::{
    Body, CreateRoomRequest, Envelope, PeerId, RendezvousServer, RoomRegistry, RoomState,
    ServerStats, server_peer_id,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn peer(id: &str) -> PeerId {
    PeerId::parse(id).unwrap()
}

async fn start_server(config: ServerConfig) -> (String, RoomRegistry, ServerStats) {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        health_addr: None,
        ..config
    };
    let server = RendezvousServer::bind(config).await.unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    let registry = server.registry();
    let stats = server.stats();
    tokio::spawn(server.run());
    (url, registry, stats)
}

async fn send_text(client: &mut Client, text: &str) {
    client.send(Message::text(text.to_string())).await.unwrap();
}

async fn send(client: &mut Client, envelope: &Envelope) {
    send_text(client, &envelope.encode().unwrap()).await;
}

/// Next envelope from the server, skipping control frames
async fn next_envelope(client: &mut Client) -> Envelope {
    loop {
        let msg = client.next().await.expect("connection closed").unwrap();
        if let Message::Text(text) = msg {
            return Envelope::decode(text.as_str()).unwrap();
        }
    }
}

fn create_room(from: PeerId) -> Envelope {
    Envelope::new(
        from,
        None,
        Body::CreateRoomRequest(CreateRoomRequest::default()),
    )
}

fn error_code(envelope: &Envelope) -> ErrorCode {
    match &envelope.body {
        Body::Error(reply) => reply.code,
        other => panic!("expected Error, got {}", other.action()),
    }
}

#[tokio::test]
async fn malformed_envelope_keeps_the_connection_open() {
    let (url, registry, _stats) = start_server(ServerConfig::default()).await;
    let (mut client, _) = connect_async(&url).await.unwrap();

    send_text(&mut client, "{garbage").await;
    let reply = next_envelope(&mut client).await;
    assert_eq!(error_code(&reply), ErrorCode::ProtocolError);
    assert_eq!(reply.from, server_peer_id());
    assert_eq!(reply.to, None);

    send(&mut client, &create_room(peer("host"))).await;
    let reply = next_envelope(&mut client).await;
    assert!(matches!(
        reply.body,
        Body::CreateRoom(ref created) if created.host_id == peer("host")
    ));
    assert_eq!(reply.to, Some(peer("host")));
    assert_eq!(registry.room_count(), 1);
}

#[tokio::test]
async fn sender_must_match_the_bound_peer() {
    let (url, registry, _stats) = start_server(ServerConfig::default()).await;
    let (mut client, _) = connect_async(&url).await.unwrap();

    send(&mut client, &create_room(peer("host"))).await;
    assert!(matches!(
        next_envelope(&mut client).await.body,
        Body::CreateRoom(_)
    ));

    send(
        &mut client,
        &Envelope::new(peer("mallory"), None, Body::CloseRoomRequest),
    )
    .await;
    let reply = next_envelope(&mut client).await;
    assert_eq!(error_code(&reply), ErrorCode::ProtocolError);
    assert_eq!(reply.to, Some(peer("host")));
    assert_eq!(registry.room_count(), 1);

    send(
        &mut client,
        &Envelope::new(peer("host"), None, Body::CloseRoomRequest),
    )
    .await;
    let reply = next_envelope(&mut client).await;
    assert!(matches!(
        reply.body,
        Body::RoomUpdate(ref update) if update.state == RoomState::Closed
    ));
}

#[tokio::test]
async fn server_peer_id_is_reserved() {
    let (url, registry, _stats) = start_server(ServerConfig::default()).await;
    let (mut client, _) = connect_async(&url).await.unwrap();

    send(&mut client, &create_room(server_peer_id())).await;
    let reply = next_envelope(&mut client).await;
    assert_eq!(error_code(&reply), ErrorCode::ProtocolError);
    assert_eq!(reply.to, None);
    assert_eq!(registry.room_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_peer_is_dropped_after_pong_timeout() {
    let config = ServerConfig {
        ping_interval: Duration::from_secs(5),
        pong_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    };
    let (url, registry, stats) = start_server(config).await;
    let (mut client, _) = connect_async(&url).await.unwrap();

    send(&mut client, &create_room(peer("host"))).await;
    assert!(matches!(
        next_envelope(&mut client).await.body,
        Body::CreateRoom(_)
    ));
    assert_eq!(stats.connection_count(), 1);

    // The client stops reading, so pings go unanswered
    timeout(Duration::from_secs(120), async {
        while stats.connection_count() > 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
    .await
    .expect("server kept the silent connection");
    assert_eq!(registry.room_count(), 0);
    drop(client);
}
