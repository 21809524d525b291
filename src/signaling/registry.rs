use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::actor::{RoomHandle, RoomStats};
use super::envelope::RoomCreated;
use super::room::{JoinOutcome, LeaveOutcome, PeerLink, Room};
use super::types::{ConnectionId, JoinCode, OutboundMessage, PeerId, RoomId, SignalingError};
use crate::config::RegistryConfig;

const MAX_CODE_ATTEMPTS: usize = 64;

/// Produces candidate join codes; collisions are retried
pub type CodeSource = Arc<dyn Fn() -> JoinCode + Send + Sync>;

struct RoomEntry {
    handle: RoomHandle,
    join_code: JoinCode,
}

struct RegistryInner {
    rooms: DashMap<RoomId, RoomEntry>,
    codes: DashMap<JoinCode, RoomId>,
    memberships: DashMap<PeerId, RoomId>,
    config: RegistryConfig,
    code_source: CodeSource,
}

/// In-memory directory of rooms and peers.
///
/// Each room is driven by its own actor task, so control operations on one
/// room are serialized while different rooms proceed independently.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

impl RoomRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_code_source(config, Arc::new(JoinCode::generate))
    }

    pub fn with_code_source(config: RegistryConfig, code_source: CodeSource) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                rooms: DashMap::new(),
                codes: DashMap::new(),
                memberships: DashMap::new(),
                config,
                code_source,
            }),
        }
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn room_of(&self, peer_id: &PeerId) -> Option<RoomId> {
        self.inner.memberships.get(peer_id).map(|r| *r.value())
    }

    pub fn room_for_code(&self, code: &JoinCode) -> Option<RoomId> {
        self.inner.codes.get(code).map(|r| *r.value())
    }

    fn handle(&self, room_id: &RoomId) -> Option<RoomHandle> {
        self.inner.rooms.get(room_id).map(|e| e.handle.clone())
    }

    pub(crate) async fn create_room(
        &self,
        host: PeerId,
        link: PeerLink,
        max_peers: Option<usize>,
    ) -> Result<RoomCreated, SignalingError> {
        if self.room_of(&host).is_some() {
            self.leave_room(host, None).await?;
        }

        let config = &self.inner.config;
        let max_peers = max_peers
            .unwrap_or(config.default_max_peers)
            .clamp(1, config.max_peers_limit.max(1));
        let room_id = RoomId::generate();
        let join_code = self.reserve_code(room_id)?;

        let room = Room::new(
            room_id,
            join_code,
            host,
            link,
            max_peers,
            config.pending_limit,
            Instant::now(),
        );
        let handle = RoomHandle::spawn(room);
        self.inner
            .rooms
            .insert(room_id, RoomEntry { handle, join_code });
        self.inner.memberships.insert(host, room_id);

        info!("Room created: {} ({}) by peer {}", room_id, join_code, host);
        Ok(RoomCreated {
            room_id,
            join_code,
            host_id: host,
            max_peers,
        })
    }

    fn reserve_code(&self, room_id: RoomId) -> Result<JoinCode, SignalingError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = (self.inner.code_source)();
            match self.inner.codes.entry(code) {
                Entry::Vacant(slot) => {
                    slot.insert(room_id);
                    return Ok(code);
                }
                Entry::Occupied(_) => debug!("Join code {} in use, retrying", code),
            }
        }
        Err(SignalingError::Internal(
            "could not allocate a unique join code".to_string(),
        ))
    }

    pub(crate) async fn join_room(
        &self,
        code: JoinCode,
        peer_id: PeerId,
        link: PeerLink,
    ) -> Result<JoinOutcome, SignalingError> {
        let room_id = self
            .room_for_code(&code)
            .ok_or_else(|| SignalingError::RoomNotFound(code.to_string()))?;

        if let Some(current) = self.room_of(&peer_id) {
            if current != room_id {
                self.leave_room(peer_id, None).await?;
            }
        }

        let handle = self
            .handle(&room_id)
            .ok_or_else(|| SignalingError::RoomNotFound(code.to_string()))?;
        let outcome = handle.join(peer_id, link).await?;
        self.inner.memberships.insert(peer_id, room_id);
        Ok(outcome)
    }

    pub async fn close_room(&self, peer_id: PeerId) -> Result<(), SignalingError> {
        let room_id = self
            .room_of(&peer_id)
            .ok_or(SignalingError::NotInRoom(peer_id))?;
        let handle = self
            .handle(&room_id)
            .ok_or(SignalingError::NotInRoom(peer_id))?;

        let members = handle.close(peer_id).await?;
        for member in members {
            self.inner
                .memberships
                .remove_if(&member, |_, room| *room == room_id);
        }
        self.remove_room(&room_id);
        Ok(())
    }

    /// Route an already-encoded relay message within the sender's room
    pub async fn relay(
        &self,
        from: PeerId,
        to: Option<PeerId>,
        message: OutboundMessage,
    ) -> Result<(), SignalingError> {
        let room_id = self
            .room_of(&from)
            .ok_or(SignalingError::NotInRoom(from))?;
        let handle = self
            .handle(&room_id)
            .ok_or(SignalingError::NotInRoom(from))?;
        handle.relay(from, to, message).await
    }

    /// Drop a peer whose connection closed. Stale connection ids are ignored.
    pub(crate) async fn disconnect(
        &self,
        peer_id: PeerId,
        connection: ConnectionId,
    ) -> Result<LeaveOutcome, SignalingError> {
        self.leave_room(peer_id, Some(connection)).await
    }

    async fn leave_room(
        &self,
        peer_id: PeerId,
        connection: Option<ConnectionId>,
    ) -> Result<LeaveOutcome, SignalingError> {
        let Some(room_id) = self.room_of(&peer_id) else {
            return Ok(LeaveOutcome::Ignored);
        };
        let Some(handle) = self.handle(&room_id) else {
            self.inner.memberships.remove(&peer_id);
            return Ok(LeaveOutcome::Ignored);
        };

        let outcome = handle.leave(peer_id, connection).await?;
        if let LeaveOutcome::Left { emptied, .. } = outcome {
            self.inner
                .memberships
                .remove_if(&peer_id, |_, room| *room == room_id);
            if emptied {
                self.remove_room(&room_id);
            }
        }
        Ok(outcome)
    }

    fn remove_room(&self, room_id: &RoomId) {
        if let Some((_, entry)) = self.inner.rooms.remove(room_id) {
            self.inner
                .codes
                .remove_if(&entry.join_code, |_, room| room == room_id);
            debug!("Room {} removed from directory", room_id);
        }
    }

    pub async fn stats(&self) -> Vec<RoomStats> {
        let handles: Vec<RoomHandle> = self
            .inner
            .rooms
            .iter()
            .map(|e| e.value().handle.clone())
            .collect();

        let mut stats = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(s) = handle.inspect().await {
                stats.push(s);
            }
        }
        stats
    }

    /// Delete zero-peer rooms older than `max_age` and rooms whose actor stopped.
    /// Returns the number of rooms removed.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let entries: Vec<(RoomId, RoomHandle)> = self
            .inner
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().handle.clone()))
            .collect();

        let mut removed = 0;
        for (room_id, handle) in entries {
            let stale = match handle.inspect().await {
                Ok(stats) => stats.peers == 0 && stats.age >= max_age,
                Err(_) => true,
            };
            if stale {
                warn!("Sweeping abandoned room {}", room_id);
                self.remove_room(&room_id);
                removed += 1;
            }
        }

        let inner = &self.inner;
        inner
            .memberships
            .retain(|_, room| inner.rooms.contains_key(room));
        removed
    }
}
