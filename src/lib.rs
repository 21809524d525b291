//! GameWork: rendezvous signaling and host-authoritative peer-to-peer sessions
//!
//! The [`signaling`] module is the server side: a WebSocket rendezvous that
//! groups peers into rooms and relays negotiation messages between them. The
//! client side is layered on top of it: [`channel`] keeps the signaling link
//! up, [`broker`] negotiates one transport per remote peer, and [`session`]
//! runs the game over the resulting data channels.

pub mod broker;
pub mod channel;
pub mod config;
pub mod error;
pub mod session;
pub mod signaling;
pub mod transport;

pub use broker::{BrokerError, BrokerState, ConnectionBroker};
pub use channel::{ChannelError, ChannelEvent, ChannelState, SignalSink, SignalingChannel};
pub use config::{ChannelConfig, ConfigError, RegistryConfig, ServerConfig, SessionConfig};
pub use error::{ErrorCode, ProtocolError};
pub use session::{SessionCoordinator, SessionError, SessionEvent, SessionHandle};
