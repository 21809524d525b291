use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{IceCandidate, JoinCode, PeerId, RoomId, SdpType, SessionDescription};
use crate::error::{ErrorCode, ProtocolError};

/// Top-level `type` of a signaling envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    RoomControl,
    Relay,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::RoomControl => "RoomControl",
            EnvelopeKind::Relay => "Relay",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateReason {
    PeerJoined,
    PeerLeft,
    HostReassigned,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_peers: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreated {
    pub room_id: RoomId,
    pub join_code: JoinCode,
    pub host_id: PeerId,
    pub max_peers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub join_code: JoinCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoined {
    pub room_id: RoomId,
    pub join_code: JoinCode,
    pub host_id: PeerId,
    /// Current members in join order, the joiner included
    pub peers: Vec<PeerId>,
    pub max_peers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinNotification {
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdate {
    pub room_id: RoomId,
    pub host_id: Option<PeerId>,
    pub peers: Vec<PeerId>,
    pub state: RoomState,
    pub reason: UpdateReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OfferPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<PeerId>,
    offer: SessionDescription,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnswerPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<PeerId>,
    answer: SessionDescription,
}

#[derive(Debug, Serialize, Deserialize)]
struct IcePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<PeerId>,
    /// `null` marks end-of-candidates
    candidate: Option<IceCandidate>,
}

/// Typed body of an envelope, one variant per `(type, action)` pair
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    CreateRoomRequest(CreateRoomRequest),
    CreateRoom(RoomCreated),
    JoinRoomRequest(JoinRoomRequest),
    JoinRoom(RoomJoined),
    JoinNotification(JoinNotification),
    CloseRoomRequest,
    RoomUpdate(RoomUpdate),
    Error(ErrorReply),
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(Option<IceCandidate>),
}

impl Body {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Body::Offer(_) | Body::Answer(_) | Body::IceCandidate(_) => EnvelopeKind::Relay,
            _ => EnvelopeKind::RoomControl,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Body::CreateRoomRequest(_) => "CreateRoomRequest",
            Body::CreateRoom(_) => "CreateRoom",
            Body::JoinRoomRequest(_) => "JoinRoomRequest",
            Body::JoinRoom(_) => "JoinRoom",
            Body::JoinNotification(_) => "JoinNotification",
            Body::CloseRoomRequest => "CloseRoomRequest",
            Body::RoomUpdate(_) => "RoomUpdate",
            Body::Error(_) => "Error",
            Body::Offer(_) => "offer",
            Body::Answer(_) => "answer",
            Body::IceCandidate(_) => "ice_candidate",
        }
    }

    pub fn is_relay(&self) -> bool {
        self.kind() == EnvelopeKind::Relay
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    action: String,
    from: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<PeerId>,
    #[serde(default)]
    payload: Value,
}

/// A validated signaling message
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub from: PeerId,
    /// `None` means broadcast to the sender's room
    pub to: Option<PeerId>,
    pub body: Body,
}

impl Envelope {
    pub fn new(from: PeerId, to: Option<PeerId>, body: Body) -> Self {
        Self { from, to, body }
    }

    /// Relay message addressed to a single peer
    pub fn relay(from: PeerId, to: PeerId, body: Body) -> Self {
        Self::new(from, Some(to), body)
    }

    /// Message originated by the rendezvous server
    pub fn from_server(to: PeerId, body: Body) -> Self {
        Self::new(server_peer_id(), Some(to), body)
    }

    /// Server error reply; `to` is unset when the connection has no peer yet
    pub fn error(to: Option<PeerId>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            server_peer_id(),
            to,
            Body::Error(ErrorReply {
                code,
                message: message.into(),
            }),
        )
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope = serde_json::from_str(text)?;
        let mut to = wire.to;

        let body = match (wire.kind, wire.action.as_str()) {
            (EnvelopeKind::RoomControl, "CreateRoomRequest") => {
                Body::CreateRoomRequest(parse_payload(wire.payload)?)
            }
            (EnvelopeKind::RoomControl, "CreateRoom") => {
                Body::CreateRoom(parse_payload(wire.payload)?)
            }
            (EnvelopeKind::RoomControl, "JoinRoomRequest") => {
                Body::JoinRoomRequest(parse_payload(wire.payload)?)
            }
            (EnvelopeKind::RoomControl, "JoinRoom") => Body::JoinRoom(parse_payload(wire.payload)?),
            (EnvelopeKind::RoomControl, "JoinNotification") => {
                Body::JoinNotification(parse_payload(wire.payload)?)
            }
            (EnvelopeKind::RoomControl, "CloseRoomRequest") => Body::CloseRoomRequest,
            (EnvelopeKind::RoomControl, "RoomUpdate") => {
                Body::RoomUpdate(parse_payload(wire.payload)?)
            }
            (EnvelopeKind::RoomControl, "Error") => Body::Error(parse_payload(wire.payload)?),
            (EnvelopeKind::Relay, "offer") => {
                let payload: OfferPayload = parse_payload(wire.payload)?;
                expect_sdp(&payload.offer, SdpType::Offer, "offer")?;
                to = to.or(payload.to);
                Body::Offer(payload.offer)
            }
            (EnvelopeKind::Relay, "answer") => {
                let payload: AnswerPayload = parse_payload(wire.payload)?;
                expect_sdp(&payload.answer, SdpType::Answer, "answer")?;
                to = to.or(payload.to);
                Body::Answer(payload.answer)
            }
            (EnvelopeKind::Relay, "ice_candidate") => {
                let payload: IcePayload = parse_payload(wire.payload)?;
                to = to.or(payload.to);
                Body::IceCandidate(payload.candidate)
            }
            (kind, action) => {
                return Err(ProtocolError::UnknownAction {
                    kind: kind.as_str(),
                    action: action.to_string(),
                });
            }
        };

        Ok(Self {
            from: wire.from,
            to,
            body,
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let to = self.to;
        let payload = match &self.body {
            Body::CreateRoomRequest(p) => serde_json::to_value(p)?,
            Body::CreateRoom(p) => serde_json::to_value(p)?,
            Body::JoinRoomRequest(p) => serde_json::to_value(p)?,
            Body::JoinRoom(p) => serde_json::to_value(p)?,
            Body::JoinNotification(p) => serde_json::to_value(p)?,
            Body::CloseRoomRequest => Value::Object(Default::default()),
            Body::RoomUpdate(p) => serde_json::to_value(p)?,
            Body::Error(p) => serde_json::to_value(p)?,
            Body::Offer(offer) => serde_json::to_value(OfferPayload {
                to,
                offer: offer.clone(),
            })?,
            Body::Answer(answer) => serde_json::to_value(AnswerPayload {
                to,
                answer: answer.clone(),
            })?,
            Body::IceCandidate(candidate) => serde_json::to_value(IcePayload {
                to,
                candidate: candidate.clone(),
            })?,
        };

        let wire = WireEnvelope {
            kind: self.body.kind(),
            action: self.body.action().to_string(),
            from: self.from,
            to,
            payload,
        };
        Ok(serde_json::to_string(&wire)?)
    }
}

/// Sender id used on server-originated envelopes
pub fn server_peer_id() -> PeerId {
    PeerId::parse("server").unwrap_or_else(|_| PeerId::generate())
}

fn parse_payload<T: DeserializeOwned>(payload: Value) -> Result<T, ProtocolError> {
    let payload = match payload {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    Ok(serde_json::from_value(payload)?)
}

fn expect_sdp(
    description: &SessionDescription,
    expected: SdpType,
    field: &'static str,
) -> Result<(), ProtocolError> {
    if description.kind != expected {
        return Err(ProtocolError::invalid(
            field,
            format!("expected sdp type {:?}, got {:?}", expected, description.kind),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::parse(id).unwrap()
    }

    #[test]
    fn parse_create_room_request_without_payload() {
        let json = r#"{"type":"RoomControl","action":"CreateRoomRequest","from":"host"}"#;
        let env = Envelope::decode(json).unwrap();
        assert_eq!(env.from, peer("host"));
        assert_eq!(env.body, Body::CreateRoomRequest(CreateRoomRequest::default()));
    }

    #[test]
    fn parse_join_room_request_normalizes_code() {
        let json = r#"{"type":"RoomControl","action":"JoinRoomRequest","from":"guest","payload":{"joinCode":"ab12cd"}}"#;
        let env = Envelope::decode(json).unwrap();
        match env.body {
            Body::JoinRoomRequest(req) => assert_eq!(req.join_code.as_str(), "AB12CD"),
            other => panic!("Expected JoinRoomRequest, got {:?}", other),
        }
    }

    #[test]
    fn parse_relay_takes_recipient_from_payload() {
        let json = r#"{"type":"Relay","action":"offer","from":"host","payload":{"to":"guest","offer":{"type":"offer","sdp":"v=0"}}}"#;
        let env = Envelope::decode(json).unwrap();
        assert_eq!(env.to, Some(peer("guest")));
        assert_eq!(env.body, Body::Offer(SessionDescription::offer("v=0")));
    }

    #[test]
    fn parse_null_candidate_as_end_of_candidates() {
        let json = r#"{"type":"Relay","action":"ice_candidate","from":"host","to":"guest","payload":{"candidate":null}}"#;
        let env = Envelope::decode(json).unwrap();
        assert_eq!(env.body, Body::IceCandidate(None));
    }

    #[test]
    fn reject_offer_carrying_answer_sdp() {
        let json = r#"{"type":"Relay","action":"offer","from":"host","to":"guest","payload":{"offer":{"type":"answer","sdp":"v=0"}}}"#;
        assert!(matches!(
            Envelope::decode(json),
            Err(ProtocolError::InvalidField { field: "offer", .. })
        ));
    }

    #[test]
    fn reject_unknown_action() {
        let json = r#"{"type":"Relay","action":"CreateRoomRequest","from":"host"}"#;
        assert!(matches!(
            Envelope::decode(json),
            Err(ProtocolError::UnknownAction { kind: "Relay", .. })
        ));
    }

    #[test]
    fn reject_malformed_json() {
        assert!(matches!(
            Envelope::decode("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        let missing_from = r#"{"type":"RoomControl","action":"CloseRoomRequest"}"#;
        assert!(Envelope::decode(missing_from).is_err());
    }

    #[test]
    fn encode_relay_mirrors_recipient_into_payload() {
        let env = Envelope::relay(
            peer("guest"),
            peer("host"),
            Body::IceCandidate(Some(IceCandidate::new("candidate:1"))),
        );
        let value: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "Relay");
        assert_eq!(value["action"], "ice_candidate");
        assert_eq!(value["to"], "host");
        assert_eq!(value["payload"]["to"], "host");
        assert_eq!(value["payload"]["candidate"]["candidate"], "candidate:1");
    }

    #[test]
    fn encode_error_envelope() {
        let env = Envelope::error(Some(peer("guest")), ErrorCode::RoomFull, "room is full");
        let json = env.encode().unwrap();
        assert!(json.contains("\"action\":\"Error\""));
        assert!(json.contains("RoomFull"));
        assert_eq!(Envelope::decode(&json).unwrap(), env);
    }

    #[test]
    fn unaddressed_error_omits_recipient() {
        let env = Envelope::error(None, ErrorCode::ProtocolError, "bad frame");
        let value: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value["from"], "server");
        assert!(value.get("to").is_none());
        assert_eq!(value["payload"]["code"], "ProtocolError");
    }

    #[test]
    fn room_update_survives_encoding() {
        let env = Envelope::from_server(
            peer("guest"),
            Body::RoomUpdate(RoomUpdate {
                room_id: RoomId::generate(),
                host_id: Some(peer("guest")),
                peers: vec![peer("guest"), peer("third")],
                state: RoomState::Open,
                reason: UpdateReason::HostReassigned,
            }),
        );
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }
}
