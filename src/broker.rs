//! Per-peer negotiation state machine
//!
//! A broker owns the transport towards one remote peer and walks it through
//! offer/answer. Remote ICE candidates that arrive before the remote
//! description is set are buffered and flushed in arrival order, each exactly
//! once. Only the session coordinator task calls into a broker, so transport
//! calls for a peer are never concurrent.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, SignalSink};
use crate::signaling::{Body, Envelope, IceCandidate, PeerId, SessionDescription};
use crate::transport::{
    ConnectionState, DATA_CHANNEL_LABEL, PeerTransport, TransportError, TransportFactory,
    TransportId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Idle,
    CreatingOffer,
    OfferSent,
    AwaitingAnswer,
    OfferReceived,
    AnswerSent,
    RemoteSet,
    Connected,
    Failed,
    Closed,
}

impl BrokerState {
    /// No further negotiation or traffic is possible
    pub fn is_finished(self) -> bool {
        matches!(self, BrokerState::Failed | BrokerState::Closed)
    }

    fn remote_is_set(self) -> bool {
        matches!(self, BrokerState::RemoteSet | BrokerState::Connected)
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("{operation} is not valid in state {state:?}")]
    InvalidState {
        state: BrokerState,
        operation: &'static str,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Signaling(#[from] ChannelError),
}

pub struct ConnectionBroker<T> {
    local: PeerId,
    remote: PeerId,
    state: BrokerState,
    transport: Option<T>,
    pending_candidates: VecDeque<Option<IceCandidate>>,
    end_of_candidates: bool,
    channel_open: bool,
    started_at: Option<Instant>,
    remote_offer: Option<SessionDescription>,
}

impl<T: PeerTransport> ConnectionBroker<T> {
    pub fn new(local: PeerId, remote: PeerId) -> Self {
        Self {
            local,
            remote,
            state: BrokerState::Idle,
            transport: None,
            pending_candidates: VecDeque::new(),
            end_of_candidates: false,
            channel_open: false,
            started_at: None,
            remote_offer: None,
        }
    }

    pub fn remote(&self) -> PeerId {
        self.remote
    }

    pub fn state(&self) -> BrokerState {
        self.state
    }

    /// Connected with the data channel open
    pub fn is_ready(&self) -> bool {
        self.state == BrokerState::Connected && self.channel_open
    }

    /// Id of the live transport, if negotiation has created one
    pub fn transport_id(&self) -> Option<TransportId> {
        self.transport.as_ref().map(|transport| transport.id())
    }

    /// This exact offer was already answered
    pub fn has_answered(&self, offer: &SessionDescription) -> bool {
        self.remote_offer.as_ref() == Some(offer)
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Negotiation started more than `timeout` ago and never connected
    pub fn is_stalled(&self, now: Instant, timeout: Duration) -> bool {
        !matches!(
            self.state,
            BrokerState::Connected | BrokerState::Failed | BrokerState::Closed
        ) && self
            .started_at
            .is_some_and(|started| now.saturating_duration_since(started) >= timeout)
    }

    /// Initiator side: create the transport and send an offer
    pub async fn initiate<F>(
        &mut self,
        factory: &F,
        sink: &dyn SignalSink,
    ) -> Result<(), BrokerError>
    where
        F: TransportFactory<Transport = T>,
    {
        self.expect(&[BrokerState::Idle], "initiate")?;
        self.started_at = Some(Instant::now());
        self.transition(BrokerState::CreatingOffer);
        let result = self.send_offer(factory, sink).await;
        self.guard(result).await
    }

    async fn send_offer<F>(&mut self, factory: &F, sink: &dyn SignalSink) -> Result<(), BrokerError>
    where
        F: TransportFactory<Transport = T>,
    {
        let transport = self.transport.insert(factory.create(self.local, self.remote)?);
        transport.create_data_channel(DATA_CHANNEL_LABEL).await?;
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;

        sink.send(&Envelope::relay(self.local, self.remote, Body::Offer(offer)))?;
        self.transition(BrokerState::OfferSent);
        self.transition(BrokerState::AwaitingAnswer);
        Ok(())
    }

    /// Responder side; a repeated offer on a connected broker is a no-op
    pub async fn on_remote_offer<F>(
        &mut self,
        offer: SessionDescription,
        factory: &F,
        sink: &dyn SignalSink,
    ) -> Result<(), BrokerError>
    where
        F: TransportFactory<Transport = T>,
    {
        if self.state == BrokerState::Connected && self.has_answered(&offer) {
            debug!("Ignoring duplicate offer from {}", self.remote);
            return Ok(());
        }
        self.expect(&[BrokerState::Idle], "on_remote_offer")?;
        self.started_at = Some(Instant::now());
        self.transition(BrokerState::OfferReceived);
        let result = self.send_answer(offer, factory, sink).await;
        self.guard(result).await
    }

    async fn send_answer<F>(
        &mut self,
        offer: SessionDescription,
        factory: &F,
        sink: &dyn SignalSink,
    ) -> Result<(), BrokerError>
    where
        F: TransportFactory<Transport = T>,
    {
        self.remote_offer = Some(offer.clone());
        let transport = self.transport.insert(factory.create(self.local, self.remote)?);
        transport.set_remote_description(offer).await?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;

        sink.send(&Envelope::relay(self.local, self.remote, Body::Answer(answer)))?;
        self.transition(BrokerState::AnswerSent);
        self.transition(BrokerState::RemoteSet);
        self.flush_candidates().await
    }

    pub async fn on_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), BrokerError> {
        self.expect(
            &[BrokerState::AwaitingAnswer, BrokerState::OfferSent],
            "on_remote_answer",
        )?;
        let result = self.accept_answer(answer).await;
        self.guard(result).await
    }

    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), BrokerError> {
        self.transport()?.set_remote_description(answer).await?;
        self.transition(BrokerState::RemoteSet);
        self.flush_candidates().await
    }

    /// Buffer or apply a remote candidate; `None` ends the candidate stream
    pub async fn on_remote_ice(
        &mut self,
        candidate: Option<IceCandidate>,
    ) -> Result<(), BrokerError> {
        if self.state.is_finished() {
            debug!("Dropping candidate from {} in state {:?}", self.remote, self.state);
            return Ok(());
        }
        if self.end_of_candidates {
            debug!("Ignoring candidate from {} after end-of-candidates", self.remote);
            return Ok(());
        }
        if candidate.is_none() {
            self.end_of_candidates = true;
        }

        if !self.state.remote_is_set() {
            self.pending_candidates.push_back(candidate);
            return Ok(());
        }
        let result = self.apply_candidate(candidate).await;
        self.guard(result).await
    }

    async fn apply_candidate(&self, candidate: Option<IceCandidate>) -> Result<(), BrokerError> {
        Ok(self.transport()?.add_ice_candidate(candidate).await?)
    }

    async fn flush_candidates(&mut self) -> Result<(), BrokerError> {
        if !self.pending_candidates.is_empty() {
            debug!(
                "Flushing {} buffered candidates for {}",
                self.pending_candidates.len(),
                self.remote
            );
        }
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Relay a locally gathered candidate to the remote peer
    pub fn on_local_candidate(
        &self,
        candidate: Option<IceCandidate>,
        sink: &dyn SignalSink,
    ) -> Result<(), BrokerError> {
        if self.state.is_finished() {
            return Ok(());
        }
        sink.send(&Envelope::relay(
            self.local,
            self.remote,
            Body::IceCandidate(candidate),
        ))?;
        Ok(())
    }

    pub async fn on_transport_state(&mut self, state: ConnectionState) -> BrokerState {
        match state {
            ConnectionState::Connected => match self.state {
                BrokerState::RemoteSet => {
                    self.transition(BrokerState::Connected);
                    info!("Peer connection {} -> {} established", self.local, self.remote);
                }
                BrokerState::Connected => {}
                other => warn!(
                    "Transport to {} reported connected in state {:?}",
                    self.remote, other
                ),
            },
            ConnectionState::Failed | ConnectionState::Disconnected => {
                if !self.state.is_finished() {
                    warn!("Transport to {} {:?}", self.remote, state);
                    self.fail().await;
                }
            }
            ConnectionState::Closed => {
                if !self.state.is_finished() {
                    self.transition(BrokerState::Closed);
                    self.transport = None;
                }
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
        self.state
    }

    pub fn on_data_channel(&mut self, label: &str) {
        if label == DATA_CHANNEL_LABEL {
            self.channel_open = true;
        } else {
            debug!("Ignoring data channel {:?} from {}", label, self.remote);
        }
    }

    pub async fn send(&mut self, data: Bytes) -> Result<(), BrokerError> {
        if !self.is_ready() {
            return Err(BrokerError::InvalidState {
                state: self.state,
                operation: "send",
            });
        }
        let result = match self.transport() {
            Ok(transport) => transport.send(data).await.map_err(BrokerError::from),
            Err(e) => Err(e),
        };
        self.guard(result).await
    }

    /// Give up on the negotiation, closing the transport
    pub async fn abort(&mut self) {
        if !self.state.is_finished() {
            self.fail().await;
        }
    }

    pub async fn close(&mut self) {
        if self.state == BrokerState::Closed {
            return;
        }
        self.transition(BrokerState::Closed);
        self.channel_open = false;
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("Closing transport to {}: {}", self.remote, e);
            }
        }
    }

    fn transport(&self) -> Result<&T, BrokerError> {
        self.transport
            .as_ref()
            .ok_or(BrokerError::Transport(TransportError::Closed))
    }

    fn expect(&self, allowed: &[BrokerState], operation: &'static str) -> Result<(), BrokerError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(BrokerError::InvalidState {
                state: self.state,
                operation,
            })
        }
    }

    fn transition(&mut self, next: BrokerState) {
        debug!(
            "Broker {} -> {}: {:?} -> {:?}",
            self.local, self.remote, self.state, next
        );
        self.state = next;
    }

    async fn guard<R>(&mut self, result: Result<R, BrokerError>) -> Result<R, BrokerError> {
        if let Err(e) = &result {
            warn!("Negotiation with {} failed: {}", self.remote, e);
            self.fail().await;
        }
        result
    }

    async fn fail(&mut self) {
        self.transition(BrokerState::Failed);
        self.channel_open = false;
        if let Some(transport) = self.transport.take() {
            let _ = transport.close().await;
        }
    }
}
