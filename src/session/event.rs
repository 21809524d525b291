use thiserror::Error;

use super::state::SessionState;
use crate::broker::BrokerError;
use crate::channel::ChannelError;
use crate::error::{ErrorCode, ProtocolError};
use crate::signaling::{JoinCode, PeerId, RoomId};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not in a room")]
    NoRoom,

    #[error("only the host can {0}")]
    NotHost(&'static str),

    #[error("no connection to peer {0}")]
    UnknownPeer(PeerId),

    #[error("pending action queue is full ({0} actions)")]
    QueueFull(usize),

    #[error("action rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("bad state payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("session has shut down")]
    Shutdown,
}

/// Notifications for the application, in the order they happened
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    RoomCreated {
        room_id: RoomId,
        join_code: JoinCode,
    },
    RoomJoined {
        room_id: RoomId,
        host: PeerId,
        peers: Vec<PeerId>,
    },
    PeerJoined(PeerId),
    /// Data channel to the peer is open
    PeerConnected(PeerId),
    PeerDisconnected {
        peer: PeerId,
        reason: String,
    },
    HostChanged(PeerId),
    /// Full local view after an accepted update
    StateUpdated(SessionState),
    ActionRejected {
        code: ErrorCode,
        reason: String,
        seq: Option<u64>,
    },
    RoomClosed,
    SignalingError {
        code: ErrorCode,
        message: String,
    },
    /// The session cannot continue
    Fatal(String),
}
