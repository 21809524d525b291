use std::fmt;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Utf8Bytes;

use crate::error::{ErrorCode, ProtocolError};

/// Rendezvous server errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("room {room} is full ({max_peers} peers)")]
    RoomFull { room: RoomId, max_peers: usize },

    #[error("peer {0} is not the host of its room")]
    NotHost(PeerId),

    #[error("peer {0} is not in a room")]
    NotInRoom(PeerId),

    #[error("unknown recipient: {0}")]
    UnknownRecipient(PeerId),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SignalingError {
    /// Wire code reported to the requester
    pub fn code(&self) -> ErrorCode {
        match self {
            SignalingError::RoomNotFound(_) | SignalingError::NotInRoom(_) => {
                ErrorCode::RoomNotFound
            }
            SignalingError::RoomFull { .. } => ErrorCode::RoomFull,
            SignalingError::NotHost(_) => ErrorCode::NotHost,
            SignalingError::UnknownRecipient(_) | SignalingError::Internal(_) => {
                ErrorCode::ProtocolError
            }
        }
    }
}

const JOIN_CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const JOIN_CODE_LEN: usize = 6;
const PEER_ID_MAX_LEN: usize = 32;
const ROOM_ID_LEN: usize = 13;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

fn random_hex_suffix(prefix: &[u8; 5]) -> [u8; ROOM_ID_LEN] {
    let mut bytes = [0u8; ROOM_ID_LEN];
    bytes[..5].copy_from_slice(prefix);

    let value: u32 = rand::rng().random();
    for i in 0..8 {
        let nibble = ((value >> (28 - i * 4)) & 0xF) as usize;
        bytes[5 + i] = HEX_CHARS[nibble];
    }
    bytes
}

/// Join code: six uppercase alphanumerics, case-insensitive on input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JoinCode {
    bytes: [u8; JOIN_CODE_LEN],
}

impl JoinCode {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut bytes = [0u8; JOIN_CODE_LEN];
        for byte in &mut bytes {
            *byte = JOIN_CODE_CHARS[rng.random_range(0..JOIN_CODE_CHARS.len())];
        }
        Self { bytes }
    }

    pub fn parse(input: &str) -> Result<Self, ProtocolError> {
        let src = input.trim().as_bytes();
        if src.len() != JOIN_CODE_LEN {
            return Err(ProtocolError::invalid(
                "joinCode",
                format!("expected {} characters, got {}", JOIN_CODE_LEN, src.len()),
            ));
        }
        let mut bytes = [0u8; JOIN_CODE_LEN];
        for (dst, &c) in bytes.iter_mut().zip(src) {
            if !c.is_ascii_alphanumeric() {
                return Err(ProtocolError::invalid(
                    "joinCode",
                    "only letters and digits are allowed",
                ));
            }
            *dst = c.to_ascii_uppercase();
        }
        Ok(Self { bytes })
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }
}

impl fmt::Display for JoinCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for JoinCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JoinCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        JoinCode::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Peer ID chosen by the client: 1-32 chars of `[A-Za-z0-9_-]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    bytes: [u8; PEER_ID_MAX_LEN],
    len: u8,
}

impl PeerId {
    /// "peer_" + 8 hex
    pub fn generate() -> Self {
        let suffix = random_hex_suffix(b"peer_");
        let mut bytes = [0u8; PEER_ID_MAX_LEN];
        bytes[..ROOM_ID_LEN].copy_from_slice(&suffix);
        Self {
            bytes,
            len: ROOM_ID_LEN as u8,
        }
    }

    pub fn parse(input: &str) -> Result<Self, ProtocolError> {
        let src = input.as_bytes();
        if src.is_empty() || src.len() > PEER_ID_MAX_LEN {
            return Err(ProtocolError::invalid(
                "peerId",
                format!("length must be 1..={}", PEER_ID_MAX_LEN),
            ));
        }
        if !src
            .iter()
            .all(|c| c.is_ascii_alphanumeric() || *c == b'_' || *c == b'-')
        {
            return Err(ProtocolError::invalid(
                "peerId",
                "only letters, digits, '_' and '-' are allowed",
            ));
        }
        let mut bytes = [0u8; PEER_ID_MAX_LEN];
        bytes[..src.len()].copy_from_slice(src);
        Ok(Self {
            bytes,
            len: src.len() as u8,
        })
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Room ID: 13-byte fixed array ("room_" + 8 hex), assigned by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomId {
    bytes: [u8; ROOM_ID_LEN],
}

impl RoomId {
    pub fn generate() -> Self {
        Self {
            bytes: random_hex_suffix(b"room_"),
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let src = s.as_bytes();
        if src.len() != ROOM_ID_LEN || !s.is_ascii() {
            return Err(serde::de::Error::custom(format!("invalid room id: {}", s)));
        }
        let mut bytes = [0u8; ROOM_ID_LEN];
        bytes.copy_from_slice(src);
        Ok(RoomId { bytes })
    }
}

/// Server-side identity of one WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP blob exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Wrapper for outbound WebSocket messages using tungstenite's Utf8Bytes.
#[derive(Debug, Clone)]
pub struct OutboundMessage(Utf8Bytes);

impl OutboundMessage {
    pub fn new(s: impl Into<Utf8Bytes>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Utf8Bytes::from(s))
    }
}
