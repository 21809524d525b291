//! WebSocket rendezvous server and the signaling wire format

mod actor;
mod envelope;
pub mod health;
mod registry;
mod room;
mod server;
mod types;

pub use actor::RoomStats;
pub use envelope::{
    Body, CreateRoomRequest, Envelope, EnvelopeKind, ErrorReply, JoinNotification,
    JoinRoomRequest, RoomCreated, RoomJoined, RoomState, RoomUpdate, UpdateReason,
    server_peer_id,
};
pub use registry::{CodeSource, RoomRegistry};
pub use room::PeerRole;
pub use server::{RendezvousServer, ServerStats};
pub use types::{
    ConnectionId, IceCandidate, JOIN_CODE_LEN, JoinCode, OutboundMessage, PeerId, RoomId,
    SdpType, SessionDescription, SignalingError,
};
