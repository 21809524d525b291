//! The peer transport seam: what a WebRTC-style library provides

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::signaling::{IceCandidate, PeerId, SessionDescription};

/// Label of the single data channel a session uses
pub const DATA_CHANNEL_LABEL: &str = "gamework";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("remote description not set")]
    RemoteDescriptionMissing,

    #[error("transport is not connected")]
    NotConnected,

    #[error("transport is closed")]
    Closed,
}

/// Generation of one transport instance, unique per factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(pub u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Notifications a transport pushes to its owner.
///
/// `peer` is the remote side and `id` the transport that raised the event.
/// Events from a transport that has since been replaced are still in flight
/// after its successor exists, so owners match on `id` as well as `peer`.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Locally gathered candidate; `None` ends gathering
    LocalCandidate {
        peer: PeerId,
        id: TransportId,
        candidate: Option<IceCandidate>,
    },
    StateChanged {
        peer: PeerId,
        id: TransportId,
        state: ConnectionState,
    },
    DataChannelOpen {
        peer: PeerId,
        id: TransportId,
        label: String,
    },
    Message {
        peer: PeerId,
        id: TransportId,
        data: Bytes,
    },
}

impl TransportEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            TransportEvent::LocalCandidate { peer, .. }
            | TransportEvent::StateChanged { peer, .. }
            | TransportEvent::DataChannelOpen { peer, .. }
            | TransportEvent::Message { peer, .. } => *peer,
        }
    }

    pub fn id(&self) -> TransportId {
        match self {
            TransportEvent::LocalCandidate { id, .. }
            | TransportEvent::StateChanged { id, .. }
            | TransportEvent::DataChannelOpen { id, .. }
            | TransportEvent::Message { id, .. } => *id,
        }
    }
}

/// Secure point-to-point channel to one remote peer
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Stamped on every event this transport raises
    fn id(&self) -> TransportId;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// `None` signals end-of-candidates
    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>)
    -> Result<(), TransportError>;

    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError>;

    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates transports wired to the owner's event stream, each with a fresh
/// `TransportId`
pub trait TransportFactory: Send + Sync {
    type Transport: PeerTransport;

    fn create(&self, local: PeerId, remote: PeerId) -> Result<Self::Transport, TransportError>;
}
