//! Client side of the signaling link, with exponential-backoff reconnect

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::error::ProtocolError;
use crate::signaling::Envelope;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("signaling channel is not open")]
    NotOpen,

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    ReconnectScheduled { attempt: u32, delay: Duration },
}

/// What the channel reports to its owner, in arrival order
#[derive(Debug)]
pub enum ChannelEvent {
    Opened,
    Message(Envelope),
    Reconnecting { attempt: u32, delay: Duration },
    /// Closed on request
    Closed,
    /// Gave up; the channel will not reconnect
    Failed(ChannelError),
}

/// Backoff schedule: attempt n waits `base * 2^(n-1)`
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.reconnect_interval, config.max_reconnect_attempts)
    }

    /// Schedules the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<(u32, Duration)> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        let factor = 1u32 << (self.attempt - 1).min(20);
        Some((self.attempt, self.base.saturating_mul(factor)))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Anything that can carry an envelope to the rendezvous server
pub trait SignalSink: Send + Sync {
    fn send(&self, envelope: &Envelope) -> Result<(), ChannelError>;
}

struct Shared {
    state: Mutex<ChannelState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    stop: watch::Sender<bool>,
}

impl Shared {
    fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn attach(&self, tx: Option<mpsc::UnboundedSender<Message>>) {
        *self.outgoing.lock().unwrap_or_else(|e| e.into_inner()) = tx;
    }
}

/// Cloneable handle to a signaling link driven by a background task
#[derive(Clone)]
pub struct SignalingChannel {
    shared: Arc<Shared>,
}

impl SignalingChannel {
    /// Spawn the connection driver; events arrive on the returned receiver
    pub fn connect(config: ChannelConfig) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (stop, stop_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: Mutex::new(ChannelState::Connecting),
            outgoing: Mutex::new(None),
            stop,
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(drive(config, shared.clone(), events_tx, stop_rx));

        (Self { shared }, events_rx)
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Fails with `NotOpen` unless the link is up; nothing is queued
    pub fn send(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        let text = envelope.encode()?;
        let outgoing = self.shared.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        let tx = outgoing.as_ref().ok_or(ChannelError::NotOpen)?;
        tx.send(Message::Text(text.into()))
            .map_err(|_| ChannelError::NotOpen)
    }

    /// Close the link and cancel any scheduled reconnect
    pub fn disconnect(&self) {
        self.shared.stop.send_replace(true);
    }
}

impl SignalSink for SignalingChannel {
    fn send(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        SignalingChannel::send(self, envelope)
    }
}

async fn drive(
    config: ChannelConfig,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut policy = ReconnectPolicy::from_config(&config);

    loop {
        if *stop_rx.borrow() {
            break;
        }
        shared.set_state(ChannelState::Connecting);
        debug!("Connecting to {}", config.url);

        let connected = tokio::select! {
            result = connect_async(config.url.as_str()) => result,
            _ = stop_rx.changed() => break,
        };

        match connected {
            Ok((ws_stream, _)) => {
                policy.reset();
                let (mut ws_tx, mut ws_rx) = ws_stream.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
                shared.attach(Some(tx));
                shared.set_state(ChannelState::Open);
                info!("Signaling channel open to {}", config.url);
                let _ = events.send(ChannelEvent::Opened);

                let requested = loop {
                    tokio::select! {
                        Some(msg) = rx.recv() => {
                            if let Err(e) = ws_tx.send(msg).await {
                                warn!("Signaling send failed: {}", e);
                                break false;
                            }
                        }
                        incoming = ws_rx.next() => match incoming {
                            Some(Ok(Message::Text(text))) => match Envelope::decode(text.as_str()) {
                                Ok(envelope) => {
                                    let _ = events.send(ChannelEvent::Message(envelope));
                                }
                                Err(e) => warn!("Dropping malformed envelope: {}", e),
                            },
                            Some(Ok(Message::Close(_))) | None => break false,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("Signaling receive failed: {}", e);
                                break false;
                            }
                        },
                        _ = stop_rx.changed() => {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            break true;
                        }
                    }
                };

                shared.attach(None);
                if requested {
                    break;
                }
                warn!("Signaling channel to {} closed unexpectedly", config.url);
            }
            Err(e) => warn!("Signaling connect to {} failed: {}", config.url, e),
        }

        let Some((attempt, delay)) = policy.next_delay() else {
            shared.set_state(ChannelState::Disconnected);
            let attempts = policy.attempt();
            warn!("Giving up on {} after {} attempts", config.url, attempts);
            let _ = events.send(ChannelEvent::Failed(ChannelError::ReconnectExhausted {
                attempts,
            }));
            return;
        };

        shared.set_state(ChannelState::ReconnectScheduled { attempt, delay });
        info!("Reconnect attempt {} in {:?}", attempt, delay);
        let _ = events.send(ChannelEvent::Reconnecting { attempt, delay });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_rx.changed() => break,
        }
    }

    shared.set_state(ChannelState::Disconnected);
    info!("Signaling channel to {} closed", config.url);
    let _ = events.send(ChannelEvent::Closed);
}
