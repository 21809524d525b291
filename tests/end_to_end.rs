use std::sync::Arc;
use std::time::Duration;

use gamework::channel::{ChannelEvent, SignalingChannel};
use gamework::config::{ChannelConfig, RegistryConfig, ServerConfig, SessionConfig};
use gamework::error::ErrorCode;
use gamework::session::{ActionRequest, GameRules, SessionCoordinator, SessionEvent, SessionHandle};
use gamework::signaling::{CodeSource, JoinCode, PeerId, RendezvousServer, RoomRegistry};
use gamework::transport::memory::MemoryNetwork;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Marks on a nine-cell board; a cell can be taken once
struct Board;

impl Board {
    fn cell(action: &ActionRequest) -> Option<usize> {
        let cell = action.input.get("position")?.as_u64()? as usize;
        (cell < 9).then_some(cell)
    }
}

impl GameRules for Board {
    fn initial_state(&self) -> Value {
        json!({ "board": vec![Value::Null; 9] })
    }

    fn is_valid(&self, state: &Value, action: &ActionRequest) -> bool {
        action.action == "Move"
            && Self::cell(action).is_some_and(|cell| state["board"][cell].is_null())
    }

    fn apply(&self, state: &Value, action: &ActionRequest) -> Value {
        let mut next = state.clone();
        if let Some(cell) = Self::cell(action) {
            next["board"][cell] = Value::String(action.from.to_string());
        }
        next
    }
}

fn peer(id: &str) -> PeerId {
    PeerId::parse(id).unwrap()
}

async fn start_server() -> (String, RoomRegistry) {
    let codes: CodeSource = Arc::new(|| JoinCode::parse("AB12CD").unwrap());
    let registry = RoomRegistry::with_code_source(RegistryConfig::default(), codes);
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        health_addr: None,
        ..ServerConfig::default()
    };
    let server = RendezvousServer::with_registry(config, registry.clone())
        .await
        .unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    tokio::spawn(server.run());
    (url, registry)
}

async fn start_peer(
    url: &str,
    id: &str,
    network: &MemoryNetwork,
) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
    let (channel, mut signals) = SignalingChannel::connect(ChannelConfig::new(url));
    let opened = timeout(WAIT, signals.recv()).await.unwrap();
    assert!(matches!(opened, Some(ChannelEvent::Opened)));

    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let (mut coordinator, events) = SessionCoordinator::new(
        peer(id),
        SessionConfig::default(),
        Box::new(Board),
        network.factory(transport_tx),
        Arc::new(channel),
    );
    coordinator.handle_channel(ChannelEvent::Opened).await;
    (coordinator.spawn(signals, transport_rx), events)
}

/// Skip events until one matches
async fn expect_event(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    matches: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("session ended");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

fn state_at(version: u64) -> impl Fn(&SessionEvent) -> bool {
    move |event| matches!(event, SessionEvent::StateUpdated(state) if state.version == version)
}

#[tokio::test]
async fn two_peers_play_through_the_rendezvous() {
    let (url, registry) = start_server().await;
    let network = MemoryNetwork::new();

    let (host, mut host_events) = start_peer(&url, "host", &network).await;
    let (guest, mut guest_events) = start_peer(&url, "guest", &network).await;

    host.create_room().await.unwrap();
    let created = expect_event(&mut host_events, |e| {
        matches!(e, SessionEvent::RoomCreated { .. })
    })
    .await;
    let SessionEvent::RoomCreated { join_code, .. } = created else {
        unreachable!()
    };
    assert_eq!(join_code.as_str(), "AB12CD");
    assert_eq!(registry.room_count(), 1);

    guest
        .join_room(JoinCode::parse("ab12cd").unwrap())
        .await
        .unwrap();
    let joined = expect_event(&mut guest_events, |e| {
        matches!(e, SessionEvent::RoomJoined { .. })
    })
    .await;
    assert!(matches!(
        joined,
        SessionEvent::RoomJoined { host, ref peers, .. }
            if host == peer("host") && peers.len() == 2
    ));

    expect_event(&mut host_events, |e| {
        *e == SessionEvent::PeerConnected(peer("guest"))
    })
    .await;
    expect_event(&mut guest_events, state_at(0)).await;

    // Guest moves first
    guest
        .submit_action("Move", json!({ "position": 4 }))
        .await
        .unwrap();
    expect_event(&mut host_events, state_at(1)).await;
    expect_event(&mut guest_events, state_at(1)).await;

    let host_state = host.state().await.unwrap();
    let guest_state = guest.state().await.unwrap();
    assert_eq!(host_state.version, 1);
    assert_eq!(guest_state.version, 1);
    assert_eq!(host_state.payload, guest_state.payload);
    assert_eq!(guest_state.payload["board"][4], "guest");

    // Out of turn
    guest
        .submit_action("Move", json!({ "position": 0 }))
        .await
        .unwrap();
    let rejected = expect_event(&mut guest_events, |e| {
        matches!(e, SessionEvent::ActionRejected { .. })
    })
    .await;
    assert!(matches!(
        rejected,
        SessionEvent::ActionRejected {
            code: ErrorCode::InvalidAction,
            ..
        }
    ));

    host.submit_action("Move", json!({ "position": 0 }))
        .await
        .unwrap();
    expect_event(&mut guest_events, state_at(2)).await;
    assert_eq!(guest.state().await.unwrap().payload["board"][0], "host");

    host.close_room().await.unwrap();
    expect_event(&mut guest_events, |e| *e == SessionEvent::RoomClosed).await;
    expect_event(&mut host_events, |e| *e == SessionEvent::RoomClosed).await;

    host.shutdown().await;
    guest.shutdown().await;
}

#[tokio::test]
async fn unknown_join_code_is_reported() {
    let (url, _registry) = start_server().await;
    let network = MemoryNetwork::new();
    let (guest, mut guest_events) = start_peer(&url, "guest", &network).await;

    guest
        .join_room(JoinCode::parse("ZZZZZZ").unwrap())
        .await
        .unwrap();
    let error = expect_event(&mut guest_events, |e| {
        matches!(e, SessionEvent::SignalingError { .. })
    })
    .await;
    assert!(matches!(
        error,
        SessionEvent::SignalingError {
            code: ErrorCode::RoomNotFound,
            ..
        }
    ));
}
