use std::error::Error;
use std::time::Duration;

use gamework::channel::{ChannelEvent, SignalingChannel};
use gamework::config::{ChannelConfig, DEFAULT_RENDEZVOUS_PORT};
use gamework::signaling::{Body, CreateRoomRequest, Envelope, JoinRoomRequest, PeerId};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait for the next envelope the server sends on this channel
async fn next_body(events: &mut UnboundedReceiver<ChannelEvent>) -> Result<Body, Box<dyn Error>> {
    loop {
        match timeout(STEP_TIMEOUT, events.recv()).await? {
            Some(ChannelEvent::Message(envelope)) => return Ok(envelope.body),
            Some(ChannelEvent::Failed(e)) => return Err(e.into()),
            Some(_) => continue,
            None => return Err("signaling channel closed".into()),
        }
    }
}

async fn open(
    url: &str,
) -> Result<(SignalingChannel, UnboundedReceiver<ChannelEvent>), Box<dyn Error>> {
    let mut config = ChannelConfig::new(url);
    config.max_reconnect_attempts = 1;
    let (channel, mut events) = SignalingChannel::connect(config);
    loop {
        match timeout(STEP_TIMEOUT, events.recv()).await? {
            Some(ChannelEvent::Opened) => return Ok((channel, events)),
            Some(ChannelEvent::Failed(e)) => return Err(e.into()),
            Some(_) => continue,
            None => return Err("signaling channel closed".into()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("ws://127.0.0.1:{}", DEFAULT_RENDEZVOUS_PORT));

    println!("Probing {}", url);

    // 1. Host opens a room
    let host_id = PeerId::generate();
    let (host, mut host_events) = open(&url).await?;
    host.send(&Envelope::new(
        host_id,
        None,
        Body::CreateRoomRequest(CreateRoomRequest::default()),
    ))?;
    let created = match next_body(&mut host_events).await? {
        Body::CreateRoom(created) => created,
        other => return Err(format!("expected CreateRoom, got {}", other.action()).into()),
    };
    println!("Room {} created, join code {}", created.room_id, created.join_code);

    // 2. Guest joins with the code
    let guest_id = PeerId::generate();
    let (guest, mut guest_events) = open(&url).await?;
    guest.send(&Envelope::new(
        guest_id,
        None,
        Body::JoinRoomRequest(JoinRoomRequest {
            join_code: created.join_code,
        }),
    ))?;
    match next_body(&mut guest_events).await? {
        Body::JoinRoom(joined) => {
            println!("Guest {} joined, {} peers", guest_id, joined.peers.len())
        }
        other => return Err(format!("expected JoinRoom, got {}", other.action()).into()),
    }

    // 3. Host must hear about it
    match next_body(&mut host_events).await? {
        Body::JoinNotification(notification) if notification.peer_id == guest_id => {
            println!("Host notified of {}. Rendezvous OK", notification.peer_id);
        }
        other => return Err(format!("expected JoinNotification, got {}", other.action()).into()),
    }

    host.send(&Envelope::new(host_id, None, Body::CloseRoomRequest))?;
    host.disconnect();
    guest.disconnect();
    Ok(())
}
