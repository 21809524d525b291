//! In-process transport for local play and tests.
//!
//! Two `MemoryTransport`s facing each other connect once both sides have set
//! local and remote descriptions and applied at least one remote candidate.
//! Like a real peer connection, candidates are refused until the remote
//! description is set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    ConnectionState, DATA_CHANNEL_LABEL, PeerTransport, TransportError, TransportEvent,
    TransportFactory, TransportId,
};
use crate::signaling::{IceCandidate, PeerId, SessionDescription};

const CANDIDATES_PER_END: u16 = 2;

struct LinkEnd {
    id: TransportId,
    events: mpsc::UnboundedSender<TransportEvent>,
    local_set: bool,
    remote_set: bool,
    label: Option<String>,
    applied: Vec<Option<IceCandidate>>,
    connected: bool,
}

impl LinkEnd {
    fn ready(&self) -> bool {
        self.local_set && self.remote_set && self.applied.iter().any(Option::is_some)
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

/// Switchboard shared by every transport of one process
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    links: Arc<Mutex<HashMap<(PeerId, PeerId), LinkEnd>>>,
    sessions: Arc<AtomicU64>,
    transports: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose transports report to `events`
    pub fn factory(&self, events: mpsc::UnboundedSender<TransportEvent>) -> MemoryFactory {
        MemoryFactory {
            network: self.clone(),
            events,
        }
    }

    /// Remote candidates applied by `local`'s transport towards `remote`, in order
    pub fn applied_candidates(&self, local: PeerId, remote: PeerId) -> Vec<Option<IceCandidate>> {
        self.lock()
            .get(&(local, remote))
            .map(|end| end.applied.clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, local: PeerId, remote: PeerId) -> bool {
        self.lock()
            .get(&(local, remote))
            .is_some_and(|end| end.connected)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(PeerId, PeerId), LinkEnd>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` on the end owned by transport `id`; a replaced end counts as closed
    fn with_end<T>(
        &self,
        id: TransportId,
        local: PeerId,
        remote: PeerId,
        f: impl FnOnce(&mut LinkEnd) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut links = self.lock();
        let end = links
            .get_mut(&(local, remote))
            .filter(|end| end.id == id)
            .ok_or(TransportError::Closed)?;
        f(end)
    }

    fn try_connect(&self, local: PeerId, remote: PeerId) {
        let mut links = self.lock();
        let ready = match (links.get(&(local, remote)), links.get(&(remote, local))) {
            (Some(a), Some(b)) => a.ready() && b.ready() && !a.connected,
            _ => false,
        };
        if !ready {
            return;
        }

        let label = [(local, remote), (remote, local)]
            .iter()
            .find_map(|key| links.get(key).and_then(|end| end.label.clone()))
            .unwrap_or_else(|| DATA_CHANNEL_LABEL.to_string());

        for (me, other) in [(local, remote), (remote, local)] {
            if let Some(end) = links.get_mut(&(me, other)) {
                end.connected = true;
                end.emit(TransportEvent::StateChanged {
                    peer: other,
                    id: end.id,
                    state: ConnectionState::Connected,
                });
                end.emit(TransportEvent::DataChannelOpen {
                    peer: other,
                    id: end.id,
                    label: label.clone(),
                });
            }
        }
        debug!("Memory link {} <-> {} connected", local, remote);
    }
}

pub struct MemoryFactory {
    network: MemoryNetwork,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportFactory for MemoryFactory {
    type Transport = MemoryTransport;

    fn create(&self, local: PeerId, remote: PeerId) -> Result<MemoryTransport, TransportError> {
        let id = TransportId(self.network.transports.fetch_add(1, Ordering::Relaxed));
        self.network.lock().insert(
            (local, remote),
            LinkEnd {
                id,
                events: self.events.clone(),
                local_set: false,
                remote_set: false,
                label: None,
                applied: Vec::new(),
                connected: false,
            },
        );
        Ok(MemoryTransport {
            id,
            local,
            remote,
            network: self.network.clone(),
        })
    }
}

pub struct MemoryTransport {
    id: TransportId,
    local: PeerId,
    remote: PeerId,
    network: MemoryNetwork,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::offer(format!(
            "memory-offer {}>{} session {}",
            self.local,
            self.remote,
            self.network.sessions.fetch_add(1, Ordering::Relaxed)
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.network.with_end(self.id, self.local, self.remote, |end| {
            if !end.remote_set {
                return Err(TransportError::RemoteDescriptionMissing);
            }
            Ok(SessionDescription::answer(format!(
                "memory-answer {}>{}",
                self.local, self.remote
            )))
        })
    }

    async fn set_local_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.network.with_end(self.id, self.local, self.remote, |end| {
            end.local_set = true;
            for n in 0..CANDIDATES_PER_END {
                let mut candidate = IceCandidate::new(format!(
                    "candidate:{} 1 udp {} 127.0.0.1 {} typ host ufrag {}",
                    n,
                    2_130_706_431 - u32::from(n),
                    50_000 + n,
                    self.local
                ));
                candidate.sdp_mid = Some("0".to_string());
                candidate.sdp_m_line_index = Some(0);
                end.emit(TransportEvent::LocalCandidate {
                    peer: self.remote,
                    id: self.id,
                    candidate: Some(candidate),
                });
            }
            end.emit(TransportEvent::LocalCandidate {
                peer: self.remote,
                id: self.id,
                candidate: None,
            });
            Ok(())
        })?;
        self.network.try_connect(self.local, self.remote);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.network.with_end(self.id, self.local, self.remote, |end| {
            end.remote_set = true;
            Ok(())
        })?;
        self.network.try_connect(self.local, self.remote);
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        candidate: Option<IceCandidate>,
    ) -> Result<(), TransportError> {
        self.network.with_end(self.id, self.local, self.remote, |end| {
            if !end.remote_set {
                return Err(TransportError::RemoteDescriptionMissing);
            }
            end.applied.push(candidate);
            Ok(())
        })?;
        self.network.try_connect(self.local, self.remote);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError> {
        self.network.with_end(self.id, self.local, self.remote, |end| {
            end.label = Some(label.to_string());
            Ok(())
        })
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        let links = self.network.lock();
        let mine = links
            .get(&(self.local, self.remote))
            .filter(|end| end.id == self.id)
            .ok_or(TransportError::Closed)?;
        if !mine.connected {
            return Err(TransportError::NotConnected);
        }
        let theirs = links
            .get(&(self.remote, self.local))
            .ok_or(TransportError::NotConnected)?;
        theirs.emit(TransportEvent::Message {
            peer: self.local,
            id: theirs.id,
            data,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut links = self.network.lock();
        let key = (self.local, self.remote);
        if links.get(&key).is_none_or(|end| end.id != self.id) {
            return Ok(());
        }
        let was_connected = links.remove(&key).is_some_and(|end| end.connected);
        if let Some(theirs) = links.get_mut(&(self.remote, self.local)) {
            if was_connected && theirs.connected {
                theirs.connected = false;
                theirs.emit(TransportEvent::StateChanged {
                    peer: self.local,
                    id: theirs.id,
                    state: ConnectionState::Disconnected,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn candidates_are_refused_before_remote_description() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = network.factory(tx).create(peer("a"), peer("b")).unwrap();

        let result = transport
            .add_ice_candidate(Some(IceCandidate::new("candidate:0")))
            .await;
        assert!(matches!(result, Err(TransportError::RemoteDescriptionMissing)));
    }

    #[tokio::test]
    async fn local_description_emits_candidates_then_sentinel() {
        let network = MemoryNetwork::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = network.factory(tx).create(peer("a"), peer("b")).unwrap();
        let offer = transport.create_offer().await.unwrap();
        transport.set_local_description(offer).await.unwrap();

        let mut candidates = Vec::new();
        while let Ok(TransportEvent::LocalCandidate { candidate, .. }) = rx.try_recv() {
            candidates.push(candidate);
        }
        assert_eq!(candidates.len(), 3);
        assert!(candidates[0].is_some());
        assert!(candidates[2].is_none());
    }

    #[tokio::test]
    async fn pair_connects_and_exchanges_bytes() {
        let network = MemoryNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = network.factory(a_tx).create(peer("a"), peer("b")).unwrap();
        let b = network.factory(b_tx).create(peer("b"), peer("a")).unwrap();

        a.create_data_channel(DATA_CHANNEL_LABEL).await.unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert!(a.send(Bytes::from_static(b"early")).await.is_err());

        a.add_ice_candidate(Some(IceCandidate::new("candidate:b"))).await.unwrap();
        b.add_ice_candidate(Some(IceCandidate::new("candidate:a"))).await.unwrap();
        assert!(network.is_connected(peer("a"), peer("b")));

        a.send(Bytes::from_static(b"hello")).await.unwrap();

        let mut got_message = false;
        while let Ok(event) = b_rx.try_recv() {
            if let TransportEvent::Message { peer: from, data, .. } = event {
                assert_eq!(from, peer("a"));
                assert_eq!(&data[..], b"hello");
                got_message = true;
            }
        }
        assert!(got_message);

        let mut saw_open = false;
        while let Ok(event) = a_rx.try_recv() {
            if let TransportEvent::DataChannelOpen { label, .. } = event {
                assert_eq!(label, DATA_CHANNEL_LABEL);
                saw_open = true;
            }
        }
        assert!(saw_open);

        a.close().await.unwrap();
        assert!(matches!(
            b_rx.try_recv(),
            Ok(TransportEvent::StateChanged {
                state: ConnectionState::Disconnected,
                id,
                ..
            }) if id == b.id()
        ));
    }

    #[tokio::test]
    async fn replaced_transport_cannot_touch_its_successor() {
        let network = MemoryNetwork::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory = network.factory(tx);
        let old = factory.create(peer("a"), peer("b")).unwrap();
        let new = factory.create(peer("a"), peer("b")).unwrap();
        assert_ne!(old.id(), new.id());

        let offer = old.create_offer().await.unwrap();
        assert!(matches!(
            old.set_local_description(offer.clone()).await,
            Err(TransportError::Closed)
        ));
        old.close().await.unwrap();

        new.set_local_description(offer).await.unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.id(), new.id());
        assert_eq!(event.peer(), peer("b"));
    }
}
