use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, error, info, warn};

use super::envelope::{Body, Envelope, server_peer_id};
use super::registry::RoomRegistry;
use super::room::{PeerLink, outbound};
use super::types::{ConnectionId, OutboundMessage, PeerId};
use crate::config::ServerConfig;
use crate::error::ErrorCode;

/// Live connection counter shared with the health endpoint
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    connections: Arc<AtomicUsize>,
}

impl ServerStats {
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    fn track(&self) -> ConnectionGuard {
        self.connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard(self.connections.clone())
    }
}

struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct RendezvousServer {
    listener: TcpListener,
    registry: RoomRegistry,
    config: ServerConfig,
    stats: ServerStats,
}

impl RendezvousServer {
    /// Bind the WebSocket listener
    pub async fn bind(config: ServerConfig) -> std::io::Result<Self> {
        let registry = RoomRegistry::new(config.registry.clone());
        Self::with_registry(config, registry).await
    }

    pub async fn with_registry(
        config: ServerConfig,
        registry: RoomRegistry,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!("Rendezvous server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            registry,
            config,
            stats: ServerStats::default(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> RoomRegistry {
        self.registry.clone()
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.clone()
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> std::io::Result<()> {
        tokio::spawn(sweep_loop(
            self.registry.clone(),
            self.config.sweep_interval,
            self.config.room_max_age,
        ));

        let next_id = AtomicU64::new(1);
        let keepalive = Keepalive {
            ping_interval: self.config.ping_interval,
            pong_timeout: self.config.pong_timeout,
        };

        loop {
            let (stream, addr) = self.listener.accept().await?;
            let registry = self.registry.clone();
            let guard = self.stats.track();
            let id = ConnectionId(next_id.fetch_add(1, Ordering::Relaxed));

            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = handle_connection(stream, addr, id, registry, keepalive).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

async fn sweep_loop(registry: RoomRegistry, every: Duration, max_age: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let removed = registry.sweep(max_age).await;
        if removed > 0 {
            info!("Sweep removed {} abandoned rooms", removed);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Keepalive {
    ping_interval: Duration,
    pong_timeout: Duration,
}

/// Per-connection state owned by its handler task
struct Connection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<OutboundMessage>,
    peer: Option<PeerId>,
}

impl Connection {
    fn link(&self) -> PeerLink {
        PeerLink {
            connection: self.id,
            tx: self.tx.clone(),
        }
    }

    fn send(&self, envelope: &Envelope) {
        match outbound(envelope) {
            Ok(msg) => {
                let _ = self.tx.send(msg);
            }
            Err(e) => warn!("Failed to encode {}: {}", envelope.body.action(), e),
        }
    }

    fn send_error(&self, to: Option<PeerId>, code: ErrorCode, message: impl Into<String>) {
        self.send(&Envelope::error(to.or(self.peer), code, message));
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    id: ConnectionId,
    registry: RoomRegistry,
    keepalive: Keepalive,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    info!("WebSocket connection {} from {}", id, addr);

    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();

    let mut conn = Connection { id, tx, peer: None };
    let mut ping_interval = tokio::time::interval(keepalive.ping_interval);
    let mut waiting_for_pong = false;
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    let ws_msg = Message::Text(msg.into_inner());
                    if ws_tx.send(ws_msg).await.is_err() {
                        break;
                    }
                }
                Some(ctrl_msg) = ctrl_rx.recv() => {
                    if ws_tx.send(ctrl_msg).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    });

    // First tick fires immediately
    ping_interval.tick().await;

    loop {
        let pong_timeout = async {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ping_interval.tick() => {
                if waiting_for_pong {
                    warn!("No Pong received, disconnecting {}", addr);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
                waiting_for_pong = true;
                pong_deadline = Some(tokio::time::Instant::now() + keepalive.pong_timeout);
                debug!("Ping sent to {}", addr);
            }

            _ = pong_timeout => {
                warn!("Pong timeout, disconnecting {}", addr);
                break;
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => {
                        handle_text_message(text.as_str(), &mut conn, &registry).await;
                    }
                    Message::Pong(_) => {
                        waiting_for_pong = false;
                        pong_deadline = None;
                        debug!("Pong received from {}", addr);
                    }
                    Message::Close(_) => {
                        info!("Close received from {}", addr);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some(peer_id) = conn.peer {
        if let Err(e) = registry.disconnect(peer_id, conn.id).await {
            debug!("Disconnect of {} after close: {}", peer_id, e);
        }
    }

    send_task.abort();
    info!("WebSocket disconnected: {} ({})", addr, id);

    Ok(())
}

async fn handle_text_message(text: &str, conn: &mut Connection, registry: &RoomRegistry) {
    let envelope = match Envelope::decode(text) {
        Ok(e) => e,
        Err(e) => {
            conn.send_error(None, ErrorCode::ProtocolError, format!("Invalid message: {}", e));
            return;
        }
    };

    let from = envelope.from;
    if from == server_peer_id() {
        conn.send_error(None, ErrorCode::ProtocolError, "peer id is reserved");
        return;
    }
    if let Some(bound) = conn.peer {
        if bound != from {
            conn.send_error(
                Some(bound),
                ErrorCode::ProtocolError,
                format!("connection is bound to peer {}", bound),
            );
            return;
        }
    }

    match &envelope.body {
        Body::CreateRoomRequest(request) => {
            match registry
                .create_room(from, conn.link(), request.max_peers)
                .await
            {
                Ok(created) => {
                    conn.peer = Some(from);
                    conn.send(&Envelope::from_server(from, Body::CreateRoom(created)));
                }
                Err(e) => conn.send_error(Some(from), e.code(), e.to_string()),
            }
        }

        Body::JoinRoomRequest(request) => {
            // The room actor sends the JoinRoom reply itself
            match registry.join_room(request.join_code, from, conn.link()).await {
                Ok(_) => conn.peer = Some(from),
                Err(e) => conn.send_error(Some(from), e.code(), e.to_string()),
            }
        }

        Body::CloseRoomRequest => {
            if let Err(e) = registry.close_room(from).await {
                conn.send_error(Some(from), e.code(), e.to_string());
            }
        }

        body if body.is_relay() => {
            if conn.peer.is_none() {
                conn.send_error(Some(from), ErrorCode::RoomNotFound, "join a room first");
                return;
            }
            let message = match outbound(&envelope) {
                Ok(m) => m,
                Err(e) => {
                    conn.send_error(Some(from), ErrorCode::ProtocolError, e.to_string());
                    return;
                }
            };
            if let Err(e) = registry.relay(from, envelope.to, message).await {
                conn.send_error(Some(from), e.code(), e.to_string());
            }
        }

        other => {
            conn.send_error(
                Some(from),
                ErrorCode::ProtocolError,
                format!("unexpected action from client: {}", other.action()),
            );
        }
    }
}
