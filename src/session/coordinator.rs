use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::event::{SessionError, SessionEvent};
use super::handle::{SessionCommand, SessionHandle};
use super::message::{ActionRequest, DataMessage};
use super::rules::GameRules;
use super::state::{ApplyOutcome, SessionState, StateView};
use crate::broker::{BrokerError, BrokerState, ConnectionBroker};
use crate::channel::{ChannelEvent, SignalSink};
use crate::config::SessionConfig;
use crate::error::ErrorCode;
use crate::signaling::{
    Body, CreateRoomRequest, Envelope, JoinCode, JoinRoomRequest, PeerId, RoomCreated, RoomId,
    RoomJoined, RoomState, RoomUpdate, SessionDescription,
};
use crate::transport::{TransportEvent, TransportFactory};

/// Membership as last reported by the rendezvous server
#[derive(Debug, Clone)]
struct RoomView {
    room_id: RoomId,
    join_code: JoinCode,
    host: PeerId,
    players: Vec<PeerId>,
}

/// Drives one peer's side of a game session.
///
/// The host validates and applies actions and broadcasts the results; every
/// other peer forwards its actions to the host and mirrors the state it
/// receives. All broker and transport calls happen on the coordinator's task.
pub struct SessionCoordinator<F: TransportFactory> {
    local: PeerId,
    config: SessionConfig,
    rules: Box<dyn GameRules>,
    factory: F,
    signal: Arc<dyn SignalSink>,
    events: mpsc::UnboundedSender<SessionEvent>,
    brokers: HashMap<PeerId, ConnectionBroker<F::Transport>>,
    view: StateView,
    room: Option<RoomView>,
    /// Peers owed a snapshot instead of the next delta
    resync_pending: HashSet<PeerId>,
    pending_actions: VecDeque<ActionRequest>,
    next_seq: u64,
    resync_requested: bool,
    signaling_opened: bool,
}

impl<F: TransportFactory> SessionCoordinator<F> {
    pub fn new(
        local: PeerId,
        config: SessionConfig,
        rules: Box<dyn GameRules>,
        factory: F,
        signal: Arc<dyn SignalSink>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let view = StateView::unsynced(rules.initial_state());
        let coordinator = Self {
            local,
            config,
            rules,
            factory,
            signal,
            events,
            brokers: HashMap::new(),
            view,
            room: None,
            resync_pending: HashSet::new(),
            pending_actions: VecDeque::new(),
            next_seq: 0,
            resync_requested: false,
            signaling_opened: false,
        };
        (coordinator, events_rx)
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn host(&self) -> Option<PeerId> {
        self.room.as_ref().map(|room| room.host)
    }

    pub fn is_host(&self) -> bool {
        self.host() == Some(self.local)
    }

    /// Room peers in join order
    pub fn players(&self) -> &[PeerId] {
        self.room
            .as_ref()
            .map(|room| room.players.as_slice())
            .unwrap_or(&[])
    }

    pub fn view(&self) -> &StateView {
        &self.view
    }

    pub fn broker_state(&self, peer: &PeerId) -> Option<BrokerState> {
        self.brokers.get(peer).map(|broker| broker.state())
    }

    pub fn pending_actions(&self) -> usize {
        self.pending_actions.len()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn broker_ready(&self, peer: PeerId) -> bool {
        self.brokers.get(&peer).is_some_and(|broker| broker.is_ready())
    }

    fn require_host(&self, operation: &'static str) -> Result<(), SessionError> {
        match self.host() {
            None => Err(SessionError::NoRoom),
            Some(host) if host != self.local => Err(SessionError::NotHost(operation)),
            Some(_) => Ok(()),
        }
    }

    fn signal_server(&self, body: Body) -> Result<(), SessionError> {
        self.signal.send(&Envelope::new(self.local, None, body))?;
        Ok(())
    }

    pub fn create_room(&mut self) -> Result<(), SessionError> {
        self.signal_server(Body::CreateRoomRequest(CreateRoomRequest {
            max_peers: self.config.max_peers,
        }))
    }

    pub fn join_room(&mut self, join_code: JoinCode) -> Result<(), SessionError> {
        self.signal_server(Body::JoinRoomRequest(JoinRoomRequest { join_code }))
    }

    /// Teardown happens when the server confirms with a closed `RoomUpdate`
    pub fn close_room(&mut self) -> Result<(), SessionError> {
        self.require_host("close the room")?;
        self.signal_server(Body::CloseRoomRequest)
    }

    /// Submit a local action; returns its sequence number
    pub async fn submit_action(
        &mut self,
        action: impl Into<String>,
        input: Value,
    ) -> Result<u64, SessionError> {
        let host = self.host().ok_or(SessionError::NoRoom)?;
        self.next_seq += 1;
        let seq = self.next_seq;
        let mut request = ActionRequest::new(action, self.local, input);
        request.seq = Some(seq);

        if host == self.local {
            self.accept_action(request).await?;
        } else if self.broker_ready(host) {
            if let Err(e) = self
                .send_to(host, &DataMessage::Action(request.clone()))
                .await
            {
                warn!("Sending action to host {} failed: {}", host, e);
                self.queue_action(request)?;
            }
        } else {
            self.queue_action(request)?;
        }
        Ok(seq)
    }

    fn queue_action(&mut self, request: ActionRequest) -> Result<(), SessionError> {
        if self.pending_actions.len() >= self.config.max_pending_actions {
            return Err(SessionError::QueueFull(self.config.max_pending_actions));
        }
        debug!("Holding {} until the host is reachable", request.action);
        self.pending_actions.push_back(request);
        Ok(())
    }

    pub async fn request_resync(&mut self) -> Result<(), SessionError> {
        let host = self.host().ok_or(SessionError::NoRoom)?;
        if host == self.local {
            return Ok(());
        }
        self.send_to(host, &DataMessage::Resync).await?;
        self.resync_requested = true;
        Ok(())
    }

    /// Host only: start a new epoch from the initial state
    pub async fn restart(&mut self) -> Result<(), SessionError> {
        self.require_host("restart the game")?;
        self.view.restart(self.rules.initial_state());
        info!("Game restarted, epoch {}", self.view.epoch());
        self.emit(SessionEvent::StateUpdated(self.view.snapshot()));

        self.resync_pending.extend(self.brokers.keys().copied());
        let snapshot = self.view.snapshot();
        self.broadcast(snapshot).await;
        Ok(())
    }

    /// Host only: renegotiate the transport to `peer` from scratch
    pub async fn reconnect(&mut self, peer: PeerId) -> Result<(), SessionError> {
        self.require_host("initiate connections")?;
        if peer == self.local || !self.players().contains(&peer) {
            return Err(SessionError::UnknownPeer(peer));
        }
        self.start_broker(peer).await;
        Ok(())
    }

    /// Fail negotiations that have not connected in time; returns how many
    pub async fn sweep_handshakes(&mut self, now: Instant) -> usize {
        let timeout = self.config.handshake_timeout;
        let stalled: Vec<PeerId> = self
            .brokers
            .iter()
            .filter(|(_, broker)| broker.is_stalled(now, timeout))
            .map(|(peer, _)| *peer)
            .collect();

        for peer in &stalled {
            warn!("Handshake with {} timed out after {:?}", peer, timeout);
            if let Some(mut broker) = self.brokers.remove(peer) {
                broker.abort().await;
            }
            self.peer_lost(*peer, "handshake timed out");
        }
        stalled.len()
    }

    pub async fn handle_channel(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => {
                if self.signaling_opened {
                    if let Some(join_code) = self.room.as_ref().map(|room| room.join_code) {
                        info!("Signaling reopened, rejoining with code {}", join_code);
                        if let Err(e) = self.join_room(join_code) {
                            warn!("Rejoin failed: {}", e);
                        }
                    }
                }
                self.signaling_opened = true;
            }
            ChannelEvent::Message(envelope) => self.handle_signal(envelope).await,
            ChannelEvent::Reconnecting { attempt, delay } => {
                self.emit(SessionEvent::SignalingError {
                    code: ErrorCode::SignalingDisconnected,
                    message: format!("reconnect attempt {} in {:?}", attempt, delay),
                });
            }
            ChannelEvent::Closed => debug!("Signaling channel closed"),
            ChannelEvent::Failed(e) => {
                error!("Signaling lost for good: {}", e);
                self.emit(SessionEvent::Fatal(e.to_string()));
            }
        }
    }

    pub async fn handle_signal(&mut self, envelope: Envelope) {
        let from = envelope.from;
        match envelope.body {
            Body::CreateRoom(created) => self.on_room_created(created),
            Body::JoinRoom(joined) => self.on_room_joined(joined).await,
            Body::JoinNotification(notification) => {
                self.on_peer_joined(notification.peer_id).await
            }
            Body::RoomUpdate(update) => self.on_room_update(update).await,
            Body::Error(reply) => {
                warn!("Server error {}: {}", reply.code, reply.message);
                self.emit(SessionEvent::SignalingError {
                    code: reply.code,
                    message: reply.message,
                });
            }
            Body::Offer(offer) => self.on_offer(from, offer).await,
            Body::Answer(answer) => {
                let result = match self.brokers.get_mut(&from) {
                    Some(broker) => broker.on_remote_answer(answer).await,
                    None => {
                        debug!("Dropping answer from unknown peer {}", from);
                        return;
                    }
                };
                self.after_broker_op(from, result);
            }
            Body::IceCandidate(candidate) => {
                let result = match self.brokers.get_mut(&from) {
                    Some(broker) => broker.on_remote_ice(candidate).await,
                    None => {
                        debug!("Dropping candidate from unknown peer {}", from);
                        return;
                    }
                };
                self.after_broker_op(from, result);
            }
            other => debug!("Ignoring {} from {}", other.action(), from),
        }
    }

    fn on_room_created(&mut self, created: RoomCreated) {
        info!(
            "Hosting room {} with code {}",
            created.room_id, created.join_code
        );
        self.room = Some(RoomView {
            room_id: created.room_id,
            join_code: created.join_code,
            host: self.local,
            players: vec![self.local],
        });
        self.view = StateView::authoritative(self.rules.initial_state());
        self.resync_pending.clear();
        self.emit(SessionEvent::RoomCreated {
            room_id: created.room_id,
            join_code: created.join_code,
        });
    }

    async fn on_room_joined(&mut self, joined: RoomJoined) {
        if self
            .room
            .as_ref()
            .is_some_and(|room| room.room_id == joined.room_id)
        {
            info!("Rejoined room {}", joined.room_id);
            self.apply_membership(joined.host_id, joined.peers).await;
            return;
        }

        info!("Joined room {} hosted by {}", joined.room_id, joined.host_id);
        self.close_all_brokers().await;
        self.room = Some(RoomView {
            room_id: joined.room_id,
            join_code: joined.join_code,
            host: joined.host_id,
            players: joined.peers.clone(),
        });
        self.view = StateView::unsynced(self.rules.initial_state());
        self.resync_requested = false;
        self.emit(SessionEvent::RoomJoined {
            room_id: joined.room_id,
            host: joined.host_id,
            peers: joined.peers,
        });
    }

    async fn on_peer_joined(&mut self, peer: PeerId) {
        if !self.is_host() || peer == self.local {
            return;
        }
        if let Some(room) = self.room.as_mut() {
            if !room.players.contains(&peer) {
                room.players.push(peer);
            }
        }
        info!("Peer {} joined, negotiating", peer);
        self.emit(SessionEvent::PeerJoined(peer));

        if self.broker_ready(peer) {
            debug!("Data channel to {} survived its signaling reconnect", peer);
            return;
        }
        self.start_broker(peer).await;
    }

    async fn on_room_update(&mut self, update: RoomUpdate) {
        if self
            .room
            .as_ref()
            .is_none_or(|room| room.room_id != update.room_id)
        {
            debug!("Ignoring update for room {}", update.room_id);
            return;
        }
        match (update.state, update.host_id) {
            (RoomState::Open, Some(host)) => self.apply_membership(host, update.peers).await,
            _ => self.on_room_closed().await,
        }
    }

    async fn apply_membership(&mut self, host: PeerId, players: Vec<PeerId>) {
        let Some(room) = self.room.as_mut() else {
            return;
        };
        let previous_host = room.host;
        room.host = host;
        room.players = players;

        let players = self.players().to_vec();
        let departed: Vec<PeerId> = self
            .brokers
            .keys()
            .filter(|peer| !players.contains(peer))
            .copied()
            .collect();
        for peer in departed {
            self.close_broker(peer, "left the room").await;
        }
        self.resync_pending.retain(|peer| players.contains(peer));

        if host == previous_host {
            return;
        }
        info!("Host changed from {} to {}", previous_host, host);
        self.emit(SessionEvent::HostChanged(host));

        if host == self.local {
            self.promote().await;
        } else {
            // A client only keeps a link to the host, which will offer anew
            let stale: Vec<PeerId> = self.brokers.keys().copied().collect();
            for peer in stale {
                self.close_broker(peer, "host changed").await;
            }
        }
    }

    async fn promote(&mut self) {
        info!(
            "Taking over as host at epoch {} version {}",
            self.view.epoch(),
            self.view.version()
        );
        self.view.take_authority();

        let peers: Vec<PeerId> = self
            .players()
            .iter()
            .copied()
            .filter(|peer| *peer != self.local)
            .collect();
        for peer in peers {
            self.start_broker(peer).await;
        }

        let queued: Vec<ActionRequest> = self.pending_actions.drain(..).collect();
        for action in queued {
            if let Err(e) = self.accept_action(action).await {
                debug!("Queued action dropped on promotion: {}", e);
            }
        }
    }

    async fn on_room_closed(&mut self) {
        info!("Room closed");
        self.close_all_brokers().await;
        self.room = None;
        self.pending_actions.clear();
        self.resync_pending.clear();
        self.emit(SessionEvent::RoomClosed);
    }

    async fn on_offer(&mut self, from: PeerId, offer: SessionDescription) {
        if self.host() != Some(from) || from == self.local {
            warn!("Ignoring offer from {}, who is not the host", from);
            return;
        }

        let fresh = match self.brokers.get(&from) {
            Some(broker) => {
                !(broker.state() == BrokerState::Connected && broker.has_answered(&offer))
            }
            None => true,
        };
        if fresh {
            if let Some(mut old) = self.brokers.remove(&from) {
                old.close().await;
            }
            self.brokers
                .insert(from, ConnectionBroker::new(self.local, from));
        }

        let signal = self.signal.clone();
        let result = match self.brokers.get_mut(&from) {
            Some(broker) => {
                broker
                    .on_remote_offer(offer, &self.factory, signal.as_ref())
                    .await
            }
            None => return,
        };
        self.after_broker_op(from, result);
    }

    async fn start_broker(&mut self, peer: PeerId) {
        if let Some(mut old) = self.brokers.remove(&peer) {
            old.close().await;
        }
        self.resync_pending.insert(peer);

        let mut broker = ConnectionBroker::new(self.local, peer);
        let signal = self.signal.clone();
        match broker.initiate(&self.factory, signal.as_ref()).await {
            Ok(()) => {
                self.brokers.insert(peer, broker);
            }
            Err(e) => {
                warn!("Could not start negotiation with {}: {}", peer, e);
                self.peer_lost(peer, &e.to_string());
            }
        }
    }

    fn after_broker_op(&mut self, peer: PeerId, result: Result<(), BrokerError>) {
        if let Err(e) = result {
            warn!("Negotiation with {}: {}", peer, e);
        }
        if self
            .brokers
            .get(&peer)
            .is_some_and(|broker| broker.state().is_finished())
        {
            self.brokers.remove(&peer);
            self.peer_lost(peer, "negotiation failed");
        }
    }

    fn peer_lost(&mut self, peer: PeerId, reason: &str) {
        self.resync_pending.remove(&peer);
        self.emit(SessionEvent::PeerDisconnected {
            peer,
            reason: reason.to_string(),
        });
    }

    async fn close_broker(&mut self, peer: PeerId, reason: &str) {
        if let Some(mut broker) = self.brokers.remove(&peer) {
            debug!("Closing link to {}: {}", peer, reason);
            broker.close().await;
            self.peer_lost(peer, reason);
        }
    }

    async fn close_all_brokers(&mut self) {
        for (_, mut broker) in self.brokers.drain() {
            broker.close().await;
        }
        self.resync_pending.clear();
    }

    pub async fn handle_transport(&mut self, event: TransportEvent) {
        let peer = event.peer();
        let signal = self.signal.clone();
        let Some(broker) = self.brokers.get_mut(&peer) else {
            debug!("Dropping transport event for unknown peer {}", peer);
            return;
        };
        if broker.transport_id() != Some(event.id()) {
            debug!("Dropping event from replaced transport {} to {}", event.id(), peer);
            return;
        }

        match event {
            TransportEvent::LocalCandidate { candidate, .. } => {
                if let Err(e) = broker.on_local_candidate(candidate, signal.as_ref()) {
                    warn!("Relaying candidate to {} failed: {}", peer, e);
                }
            }
            TransportEvent::StateChanged { state, .. } => {
                let was_ready = broker.is_ready();
                let now = broker.on_transport_state(state).await;
                let ready = broker.is_ready();
                if now.is_finished() {
                    self.brokers.remove(&peer);
                    self.peer_lost(peer, &format!("transport {:?}", state).to_lowercase());
                } else if ready && !was_ready {
                    self.on_peer_ready(peer).await;
                }
            }
            TransportEvent::DataChannelOpen { label, .. } => {
                let was_ready = broker.is_ready();
                broker.on_data_channel(&label);
                if broker.is_ready() && !was_ready {
                    self.on_peer_ready(peer).await;
                }
            }
            TransportEvent::Message { data, .. } => self.on_data(peer, &data).await,
        }
    }

    async fn on_peer_ready(&mut self, peer: PeerId) {
        info!("Data channel to {} open", peer);
        self.emit(SessionEvent::PeerConnected(peer));

        if self.is_host() {
            self.resync_pending.remove(&peer);
            self.send_snapshot(peer).await;
        } else if self.host() == Some(peer) {
            self.flush_pending_actions(peer).await;
        }
    }

    async fn flush_pending_actions(&mut self, host: PeerId) {
        while let Some(action) = self.pending_actions.pop_front() {
            if let Err(e) = self
                .send_to(host, &DataMessage::Action(action.clone()))
                .await
            {
                warn!("Resending held action to {} failed: {}", host, e);
                self.pending_actions.push_front(action);
                break;
            }
        }
    }

    async fn on_data(&mut self, peer: PeerId, data: &[u8]) {
        let message = match DataMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed frame from {}: {}", peer, e);
                if self.is_host() {
                    let reply = DataMessage::Error {
                        code: ErrorCode::ProtocolError,
                        reason: e.to_string(),
                        seq: None,
                    };
                    let _ = self.send_to(peer, &reply).await;
                }
                return;
            }
        };
        debug!("Received {} frame from {}", message.kind(), peer);

        match message {
            DataMessage::Action(mut action) => {
                if !self.is_host() {
                    debug!("Ignoring action from {}, not hosting", peer);
                    return;
                }
                if action.from != peer {
                    debug!("Action claims sender {} but came from {}", action.from, peer);
                    action.from = peer;
                }
                if let Err(e) = self.accept_action(action).await {
                    debug!("Action from {} not applied: {}", peer, e);
                }
            }
            DataMessage::State(update) => self.on_state(peer, update).await,
            DataMessage::Error { code, reason, seq } => {
                self.emit(SessionEvent::ActionRejected { code, reason, seq });
            }
            DataMessage::Resync => {
                if self.is_host() {
                    self.send_snapshot(peer).await;
                }
            }
        }
    }

    async fn on_state(&mut self, peer: PeerId, update: SessionState) {
        if self.is_host() || self.host() != Some(peer) {
            warn!("Ignoring state from {}, who is not the host", peer);
            return;
        }
        match self.view.apply_update(&update, self.rules.as_ref()) {
            Ok(ApplyOutcome::Applied) => {
                self.resync_requested = false;
                self.emit(SessionEvent::StateUpdated(self.view.snapshot()));
            }
            Ok(ApplyOutcome::Stale) => {
                debug!(
                    "Discarding stale state {}/{} from {}",
                    update.epoch, update.version, peer
                );
            }
            Ok(ApplyOutcome::Gap) => {
                if !self.resync_requested {
                    info!(
                        "Missed updates before version {}, requesting snapshot",
                        update.version
                    );
                    if let Err(e) = self.request_resync().await {
                        warn!("Resync request failed: {}", e);
                    }
                }
            }
            Err(e) => {
                warn!("Unreadable state from {}: {}", peer, e);
                if let Err(e) = self.request_resync().await {
                    warn!("Resync request failed: {}", e);
                }
            }
        }
    }

    /// Validate and apply an action as host
    async fn accept_action(&mut self, action: ActionRequest) -> Result<(), SessionError> {
        if let Err(reason) = self.validate(&action) {
            info!("Rejected {} from {}: {}", action.action, action.from, reason);
            let code = ErrorCode::InvalidAction;
            if action.from == self.local {
                self.emit(SessionEvent::ActionRejected {
                    code,
                    reason: reason.clone(),
                    seq: action.seq,
                });
            } else {
                let reply = DataMessage::Error {
                    code,
                    reason: reason.clone(),
                    seq: action.seq,
                };
                if let Err(e) = self.send_to(action.from, &reply).await {
                    debug!("Could not report rejection to {}: {}", action.from, e);
                }
            }
            return Err(SessionError::Rejected(reason));
        }

        let game = self.rules.apply(self.view.game(), &action);
        let first_mover = self.view.first_mover().or(Some(action.from));
        self.view.advance(game, first_mover);
        debug!(
            "Applied {} from {}, now at version {}",
            action.action,
            action.from,
            self.view.version()
        );

        let delta =
            SessionState::delta(self.view.epoch(), self.view.version(), &action, first_mover)?;
        self.emit(SessionEvent::StateUpdated(self.view.snapshot()));
        self.broadcast(delta).await;
        Ok(())
    }

    fn validate(&self, action: &ActionRequest) -> Result<(), String> {
        let players = self.players();
        if !players.contains(&action.from) {
            return Err(format!("{} is not in the room", action.from));
        }
        if !self.config.turn_policy.permits(
            players,
            self.view.first_mover(),
            self.view.version(),
            action.from,
        ) {
            return Err("not your turn".to_string());
        }
        if !self.rules.is_valid(self.view.game(), action) {
            return Err(format!("{} is not allowed now", action.action));
        }
        Ok(())
    }

    /// Send `update` to every ready peer, or a snapshot to those owed one
    async fn broadcast(&mut self, update: SessionState) {
        let peers: Vec<PeerId> = self.brokers.keys().copied().collect();
        for peer in peers {
            if !self.broker_ready(peer) {
                self.resync_pending.insert(peer);
                continue;
            }
            let message = if self.resync_pending.remove(&peer) {
                self.view.snapshot()
            } else {
                update.clone()
            };
            if let Err(e) = self.send_to(peer, &DataMessage::State(message)).await {
                warn!("State to {} not delivered: {}", peer, e);
                self.resync_pending.insert(peer);
            }
        }
    }

    async fn send_snapshot(&mut self, peer: PeerId) {
        let snapshot = self.view.snapshot();
        if let Err(e) = self.send_to(peer, &DataMessage::State(snapshot)).await {
            warn!("Snapshot to {} not delivered: {}", peer, e);
            self.resync_pending.insert(peer);
        }
    }

    async fn send_to(&mut self, peer: PeerId, message: &DataMessage) -> Result<(), SessionError> {
        let data = message.encode()?;
        let broker = self
            .brokers
            .get_mut(&peer)
            .ok_or(SessionError::UnknownPeer(peer))?;
        let result = broker.send(data).await;
        if broker.state().is_finished() {
            self.brokers.remove(&peer);
            self.peer_lost(peer, "send failed");
        }
        Ok(result?)
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::CreateRoom { reply } => {
                let _ = reply.send(self.create_room());
            }
            SessionCommand::JoinRoom { code, reply } => {
                let _ = reply.send(self.join_room(code));
            }
            SessionCommand::CloseRoom { reply } => {
                let _ = reply.send(self.close_room());
            }
            SessionCommand::SubmitAction {
                action,
                input,
                reply,
            } => {
                let _ = reply.send(self.submit_action(action, input).await);
            }
            SessionCommand::RequestResync { reply } => {
                let _ = reply.send(self.request_resync().await);
            }
            SessionCommand::Restart { reply } => {
                let _ = reply.send(self.restart().await);
            }
            SessionCommand::Reconnect { peer, reply } => {
                let _ = reply.send(self.reconnect(peer).await);
            }
            SessionCommand::State { reply } => {
                let _ = reply.send(self.view.snapshot());
            }
            SessionCommand::Shutdown => {}
        }
    }

    /// Event loop: signaling, transport and application commands
    pub async fn run(
        mut self,
        mut signals: mpsc::UnboundedReceiver<ChannelEvent>,
        mut transport: mpsc::UnboundedReceiver<TransportEvent>,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) {
        let period = (self.config.handshake_timeout / 4).max(Duration::from_millis(100));
        let mut sweep = tokio::time::interval(period);
        sweep.tick().await;

        loop {
            tokio::select! {
                Some(event) = signals.recv() => self.handle_channel(event).await,
                Some(event) = transport.recv() => self.handle_transport(event).await,
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                _ = sweep.tick() => {
                    self.sweep_handshakes(Instant::now()).await;
                }
            }
        }

        info!("Session for {} shutting down", self.local);
        self.close_all_brokers().await;
    }

    /// Run on a new task and return its handle
    pub fn spawn(
        self,
        signals: mpsc::UnboundedReceiver<ChannelEvent>,
        transport: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> SessionHandle
    where
        F: 'static,
        F::Transport: 'static,
    {
        let (handle, commands) = SessionHandle::channel();
        tokio::spawn(self.run(signals, transport, commands));
        handle
    }
}
