use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::envelope::{
    Body, Envelope, JoinNotification, RoomJoined, RoomState, RoomUpdate, UpdateReason,
};
use super::types::{ConnectionId, JoinCode, OutboundMessage, PeerId, RoomId, SignalingError};
use crate::error::ProtocolError;

/// Channel for outbound messages to one connection.
/// Uses OutboundMessage (Utf8Bytes) for O(1) broadcast cloning.
pub(crate) type PeerTx = mpsc::UnboundedSender<OutboundMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Host,
    Client,
}

/// Live connection a peer is reachable on
#[derive(Debug, Clone)]
pub(crate) struct PeerLink {
    pub connection: ConnectionId,
    pub tx: PeerTx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinOutcome {
    Joined,
    Rejoined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeaveOutcome {
    /// Unknown peer or a connection that has since been replaced
    Ignored,
    Left {
        new_host: Option<PeerId>,
        emptied: bool,
    },
}

#[derive(Debug)]
pub(crate) struct PeerSlot {
    pub id: PeerId,
    pub role: PeerRole,
    pub connection: ConnectionId,
    /// `None` once the connection has gone away
    tx: Option<PeerTx>,
    pending: VecDeque<OutboundMessage>,
    pub last_seen: Instant,
}

impl PeerSlot {
    fn new(id: PeerId, role: PeerRole, link: PeerLink, now: Instant) -> Self {
        Self {
            id,
            role,
            connection: link.connection,
            tx: Some(link.tx),
            pending: VecDeque::new(),
            last_seen: now,
        }
    }

    fn deliver(&mut self, msg: OutboundMessage, pending_limit: usize) -> Delivery {
        let msg = match &self.tx {
            Some(tx) => match tx.send(msg) {
                Ok(()) => return Delivery::Delivered,
                Err(mpsc::error::SendError(msg)) => {
                    debug!("Connection of peer {} went away, queueing", self.id);
                    self.tx = None;
                    msg
                }
            },
            None => msg,
        };

        if self.pending.len() >= pending_limit {
            warn!("Pending queue full for peer {}, dropping oldest", self.id);
            self.pending.pop_front();
        }
        self.pending.push_back(msg);
        Delivery::Queued
    }

    /// Swap in a new connection and flush anything queued meanwhile
    fn attach(&mut self, link: PeerLink, now: Instant) -> usize {
        self.connection = link.connection;
        self.last_seen = now;
        let mut flushed = 0;
        while let Some(msg) = self.pending.pop_front() {
            if let Err(mpsc::error::SendError(msg)) = link.tx.send(msg) {
                self.pending.push_front(msg);
                self.tx = None;
                return flushed;
            }
            flushed += 1;
        }
        self.tx = Some(link.tx);
        flushed
    }
}

pub(crate) fn outbound(envelope: &Envelope) -> Result<OutboundMessage, ProtocolError> {
    envelope.encode().map(OutboundMessage::from)
}

/// Membership and routing state of one room. Owned by the room actor.
#[derive(Debug)]
pub(crate) struct Room {
    pub id: RoomId,
    pub join_code: JoinCode,
    host: Option<PeerId>,
    /// Join order; index 0 is the oldest member
    peers: Vec<PeerSlot>,
    pub max_peers: usize,
    pub created_at: Instant,
    pub state: RoomState,
    pending_limit: usize,
}

impl Room {
    pub fn new(
        id: RoomId,
        join_code: JoinCode,
        host: PeerId,
        link: PeerLink,
        max_peers: usize,
        pending_limit: usize,
        now: Instant,
    ) -> Self {
        Self {
            id,
            join_code,
            host: Some(host),
            peers: vec![PeerSlot::new(host, PeerRole::Host, link, now)],
            max_peers: max_peers.max(1),
            created_at: now,
            state: RoomState::Open,
            pending_limit,
        }
    }

    pub fn host(&self) -> Option<PeerId> {
        self.host
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|p| p.id).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.iter().any(|p| p.id == *peer_id)
    }

    pub fn role_of(&self, peer_id: &PeerId) -> Option<PeerRole> {
        self.peers.iter().find(|p| p.id == *peer_id).map(|p| p.role)
    }

    pub fn join(
        &mut self,
        peer_id: PeerId,
        link: PeerLink,
        now: Instant,
    ) -> Result<JoinOutcome, SignalingError> {
        if self.state == RoomState::Closed {
            return Err(SignalingError::RoomNotFound(self.join_code.to_string()));
        }

        if let Some(slot) = self.peers.iter_mut().find(|p| p.id == peer_id) {
            let flushed = slot.attach(link, now);
            info!(
                "Peer {} re-attached to room {} ({} queued messages flushed)",
                peer_id, self.id, flushed
            );
            return Ok(JoinOutcome::Rejoined);
        }

        if self.peers.len() >= self.max_peers {
            return Err(SignalingError::RoomFull {
                room: self.id,
                max_peers: self.max_peers,
            });
        }

        self.peers
            .push(PeerSlot::new(peer_id, PeerRole::Client, link, now));
        Ok(JoinOutcome::Joined)
    }

    /// `connection: None` removes the peer whatever connection it is on
    pub fn leave(&mut self, peer_id: &PeerId, connection: Option<ConnectionId>) -> LeaveOutcome {
        let Some(index) = self.peers.iter().position(|p| {
            p.id == *peer_id && connection.is_none_or(|c| c == p.connection)
        }) else {
            return LeaveOutcome::Ignored;
        };

        let removed = self.peers.remove(index);
        let mut new_host = None;

        if removed.role == PeerRole::Host {
            match self.peers.first_mut() {
                Some(oldest) => {
                    oldest.role = PeerRole::Host;
                    self.host = Some(oldest.id);
                    new_host = Some(oldest.id);
                    info!("Host of room {} reassigned {} -> {}", self.id, removed.id, oldest.id);
                }
                None => self.host = None,
            }
        }

        let emptied = self.peers.is_empty();
        if emptied {
            self.state = RoomState::Closed;
        }
        LeaveOutcome::Left { new_host, emptied }
    }

    /// Tear the room down; only the current host may do this.
    /// Every member (host included) receives a final `RoomUpdate`.
    pub fn close(&mut self, requester: &PeerId) -> Result<Vec<PeerId>, SignalingError> {
        if self.host != Some(*requester) {
            return Err(SignalingError::NotHost(*requester));
        }

        self.state = RoomState::Closed;
        self.host = None;
        let members = self.peer_ids();
        let update = RoomUpdate {
            room_id: self.id,
            host_id: None,
            peers: Vec::new(),
            state: RoomState::Closed,
            reason: UpdateReason::Closed,
        };
        for id in &members {
            self.send_envelope(Envelope::from_server(*id, Body::RoomUpdate(update.clone())));
        }
        self.peers.clear();
        Ok(members)
    }

    pub fn send_to(
        &mut self,
        to: &PeerId,
        msg: OutboundMessage,
    ) -> Result<Delivery, SignalingError> {
        let limit = self.pending_limit;
        let slot = self
            .peers
            .iter_mut()
            .find(|p| p.id == *to)
            .ok_or(SignalingError::UnknownRecipient(*to))?;
        Ok(slot.deliver(msg, limit))
    }

    pub fn broadcast(&mut self, except: Option<&PeerId>, msg: &OutboundMessage) {
        let limit = self.pending_limit;
        for slot in self.peers.iter_mut() {
            if Some(&slot.id) == except {
                continue;
            }
            slot.deliver(msg.clone(), limit);
        }
    }

    /// Encode and deliver a server-originated envelope to its recipient
    pub fn send_envelope(&mut self, envelope: Envelope) {
        let Some(to) = envelope.to else {
            return;
        };
        match outbound(&envelope) {
            Ok(msg) => {
                if let Err(e) = self.send_to(&to, msg) {
                    debug!("Dropping {} for {}: {}", envelope.body.action(), to, e);
                }
            }
            Err(e) => warn!("Failed to encode {}: {}", envelope.body.action(), e),
        }
    }

    /// Send a `RoomUpdate` to every member except `except`
    pub fn announce(&mut self, reason: UpdateReason, except: Option<&PeerId>) {
        let update = self.update(reason);
        for id in self.peer_ids() {
            if Some(&id) == except {
                continue;
            }
            self.send_envelope(Envelope::from_server(id, Body::RoomUpdate(update.clone())));
        }
    }

    pub fn notify_host_of_join(&mut self, peer_id: PeerId) {
        if let Some(host) = self.host {
            self.send_envelope(Envelope::from_server(
                host,
                Body::JoinNotification(JoinNotification { peer_id }),
            ));
        }
    }

    pub fn update(&self, reason: UpdateReason) -> RoomUpdate {
        RoomUpdate {
            room_id: self.id,
            host_id: self.host,
            peers: self.peer_ids(),
            state: self.state,
            reason,
        }
    }

    pub fn joined_reply(&self) -> Option<RoomJoined> {
        Some(RoomJoined {
            room_id: self.id,
            join_code: self.join_code,
            host_id: self.host?,
            peers: self.peer_ids(),
            max_peers: self.max_peers,
        })
    }
}
