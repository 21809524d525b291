use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};

use super::envelope::{Body, Envelope, RoomState, UpdateReason};
use super::room::{JoinOutcome, LeaveOutcome, PeerLink, Room};
use super::types::{ConnectionId, OutboundMessage, PeerId, RoomId, SignalingError};
use crate::error::ErrorCode;

const ROOM_COMMAND_CAPACITY: usize = 256;

/// Commands sent to a room actor
pub(crate) enum RoomCommand {
    Join {
        peer_id: PeerId,
        link: PeerLink,
        reply: oneshot::Sender<Result<JoinOutcome, SignalingError>>,
    },
    Leave {
        peer_id: PeerId,
        connection: Option<ConnectionId>,
        reply: oneshot::Sender<LeaveOutcome>,
    },
    Close {
        peer_id: PeerId,
        reply: oneshot::Sender<Result<Vec<PeerId>, SignalingError>>,
    },
    Relay {
        from: PeerId,
        to: Option<PeerId>,
        message: OutboundMessage,
    },
    Inspect {
        reply: oneshot::Sender<RoomStats>,
    },
}

/// Point-in-time view of a room, used by the sweeper and health checks
#[derive(Debug, Clone, Copy)]
pub struct RoomStats {
    pub room_id: RoomId,
    pub peers: usize,
    pub age: Duration,
    pub open: bool,
}

/// Serializes every control-plane operation of one room
pub(crate) async fn room_actor(mut room: Room, mut rx: mpsc::Receiver<RoomCommand>) {
    info!("Room {} open with code {}", room.id, room.join_code);

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RoomCommand::Join {
                peer_id,
                link,
                reply,
            } => {
                let result = room.join(peer_id, link, Instant::now());

                if let Ok(outcome) = &result {
                    // Joiner hears about the room before anyone can signal it
                    if let Some(joined) = room.joined_reply() {
                        room.send_envelope(Envelope::from_server(peer_id, Body::JoinRoom(joined)));
                    }
                    if *outcome == JoinOutcome::Joined {
                        room.notify_host_of_join(peer_id);
                        room.announce(UpdateReason::PeerJoined, Some(&peer_id));
                        info!(
                            "Peer {} joined room {} ({}/{})",
                            peer_id,
                            room.id,
                            room.len(),
                            room.max_peers
                        );
                    }
                }

                let _ = reply.send(result);
            }

            RoomCommand::Leave {
                peer_id,
                connection,
                reply,
            } => {
                let outcome = room.leave(&peer_id, connection);

                if let LeaveOutcome::Left { new_host, emptied } = outcome {
                    info!("Peer {} left room {}", peer_id, room.id);
                    if !emptied {
                        let reason = match new_host {
                            Some(_) => UpdateReason::HostReassigned,
                            None => UpdateReason::PeerLeft,
                        };
                        room.announce(reason, None);
                    }
                }

                let _ = reply.send(outcome);
                if room.state == RoomState::Closed {
                    break;
                }
            }

            RoomCommand::Close { peer_id, reply } => {
                let result = room.close(&peer_id);
                let closed = result.is_ok();
                if closed {
                    info!("Room {} closed by host {}", room.id, peer_id);
                }
                let _ = reply.send(result);
                if closed {
                    break;
                }
            }

            RoomCommand::Relay { from, to, message } => {
                if !room.contains(&from) {
                    debug!("Dropping relay from non-member {} in room {}", from, room.id);
                    continue;
                }
                match to {
                    Some(to) => {
                        if let Err(e) = room.send_to(&to, message) {
                            room.send_envelope(Envelope::error(
                                Some(from),
                                ErrorCode::ProtocolError,
                                e.to_string(),
                            ));
                        }
                    }
                    None => room.broadcast(Some(&from), &message),
                }
            }

            RoomCommand::Inspect { reply } => {
                let _ = reply.send(RoomStats {
                    room_id: room.id,
                    peers: room.len(),
                    age: room.created_at.elapsed(),
                    open: room.state == RoomState::Open,
                });
            }
        }
    }

    info!("Room {} removed", room.id);
}

/// Handle to communicate with a room actor
#[derive(Clone)]
pub(crate) struct RoomHandle {
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn spawn(room: Room) -> Self {
        let (tx, rx) = mpsc::channel(ROOM_COMMAND_CAPACITY);
        tokio::spawn(room_actor(room, rx));
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| SignalingError::RoomNotFound("room is gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| SignalingError::RoomNotFound("room is gone".to_string()))
    }

    pub async fn join(
        &self,
        peer_id: PeerId,
        link: PeerLink,
    ) -> Result<JoinOutcome, SignalingError> {
        self.request(|reply| RoomCommand::Join {
            peer_id,
            link,
            reply,
        })
        .await?
    }

    pub async fn leave(
        &self,
        peer_id: PeerId,
        connection: Option<ConnectionId>,
    ) -> Result<LeaveOutcome, SignalingError> {
        self.request(|reply| RoomCommand::Leave {
            peer_id,
            connection,
            reply,
        })
        .await
    }

    pub async fn close(&self, peer_id: PeerId) -> Result<Vec<PeerId>, SignalingError> {
        self.request(|reply| RoomCommand::Close { peer_id, reply })
            .await?
    }

    pub async fn relay(
        &self,
        from: PeerId,
        to: Option<PeerId>,
        message: OutboundMessage,
    ) -> Result<(), SignalingError> {
        self.tx
            .send(RoomCommand::Relay { from, to, message })
            .await
            .map_err(|_| SignalingError::RoomNotFound("room is gone".to_string()))
    }

    pub async fn inspect(&self) -> Result<RoomStats, SignalingError> {
        self.request(|reply| RoomCommand::Inspect { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::room::outbound;
    use crate::signaling::types::{JoinCode, SessionDescription};

    fn peer(id: &str) -> PeerId {
        PeerId::parse(id).unwrap()
    }

    fn link(n: u64) -> (PeerLink, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            PeerLink {
                connection: ConnectionId(n),
                tx,
            },
            rx,
        )
    }

    fn spawn_room() -> (RoomHandle, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (host_link, host_rx) = link(1);
        let room = Room::new(
            RoomId::generate(),
            JoinCode::parse("AB12CD").unwrap(),
            peer("host"),
            host_link,
            4,
            8,
            Instant::now(),
        );
        (RoomHandle::spawn(room), host_rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(Envelope::decode(msg.as_str()).unwrap());
        }
        out
    }

    fn offer(from: &str, to: &str) -> OutboundMessage {
        outbound(&Envelope::relay(
            peer(from),
            peer(to),
            Body::Offer(SessionDescription::offer("v=0")),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn join_replies_to_joiner_and_notifies_host() {
        let (handle, mut host_rx) = spawn_room();
        let (guest_link, mut guest_rx) = link(2);

        let outcome = handle.join(peer("guest"), guest_link).await.unwrap();
        assert_eq!(outcome, JoinOutcome::Joined);

        let guest_sees = drain(&mut guest_rx);
        assert_eq!(guest_sees.len(), 1);
        assert!(matches!(
            &guest_sees[0].body,
            Body::JoinRoom(joined) if joined.peers.len() == 2
        ));

        let host_sees = drain(&mut host_rx);
        assert!(matches!(
            &host_sees[0].body,
            Body::JoinNotification(n) if n.peer_id == peer("guest")
        ));
        assert!(matches!(
            &host_sees[1].body,
            Body::RoomUpdate(update) if update.reason == UpdateReason::PeerJoined
        ));

        let stats = handle.inspect().await.unwrap();
        assert_eq!(stats.peers, 2);
        assert!(stats.open);
    }

    #[tokio::test]
    async fn relay_to_unknown_recipient_reports_to_sender() {
        let (handle, mut host_rx) = spawn_room();
        let (guest_link, mut guest_rx) = link(2);
        handle.join(peer("guest"), guest_link).await.unwrap();
        drain(&mut host_rx);
        drain(&mut guest_rx);

        handle
            .relay(peer("host"), Some(peer("ghost")), offer("host", "ghost"))
            .await
            .unwrap();
        // Relays have no reply; a round trip orders them
        handle.inspect().await.unwrap();

        let host_sees = drain(&mut host_rx);
        assert_eq!(host_sees.len(), 1);
        assert_eq!(host_sees[0].to, Some(peer("host")));
        assert!(matches!(
            &host_sees[0].body,
            Body::Error(reply) if reply.code == ErrorCode::ProtocolError
        ));
        assert!(drain(&mut guest_rx).is_empty());
    }

    #[tokio::test]
    async fn relay_from_non_member_is_dropped() {
        let (handle, mut host_rx) = spawn_room();
        handle
            .relay(peer("ghost"), None, offer("ghost", "host"))
            .await
            .unwrap();
        handle.inspect().await.unwrap();
        assert!(drain(&mut host_rx).is_empty());
    }

    #[tokio::test]
    async fn close_stops_the_actor() {
        let (handle, mut host_rx) = spawn_room();
        let (guest_link, mut guest_rx) = link(2);
        handle.join(peer("guest"), guest_link).await.unwrap();
        drain(&mut host_rx);
        drain(&mut guest_rx);

        assert!(matches!(
            handle.close(peer("guest")).await,
            Err(SignalingError::NotHost(_))
        ));
        let members = handle.close(peer("host")).await.unwrap();
        assert_eq!(members, vec![peer("host"), peer("guest")]);

        for rx in [&mut host_rx, &mut guest_rx] {
            let seen = drain(rx);
            assert!(matches!(
                &seen[0].body,
                Body::RoomUpdate(update) if update.state == RoomState::Closed
            ));
        }
        assert!(matches!(
            handle.inspect().await,
            Err(SignalingError::RoomNotFound(_))
        ));
    }
}
