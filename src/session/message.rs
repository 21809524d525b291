use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::state::SessionState;
use crate::error::{ErrorCode, ProtocolError};
use crate::signaling::PeerId;

/// A player's request to change the game state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    pub from: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default)]
    pub input: Value,
}

impl ActionRequest {
    pub fn new(action: impl Into<String>, from: PeerId, input: Value) -> Self {
        Self {
            action: action.into(),
            from,
            seq: None,
            input,
        }
    }
}

/// Typed data-channel traffic between host and clients
#[derive(Debug, Clone, PartialEq)]
pub enum DataMessage {
    Action(ActionRequest),
    State(SessionState),
    Error {
        code: ErrorCode,
        reason: String,
        seq: Option<u64>,
    },
    /// Ask the host for a full snapshot
    Resync,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FrameKind {
    Action,
    State,
    Error,
    Resync,
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: FrameKind,
    #[serde(default)]
    payload: Value,
    /// State version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tick: Option<u64>,
    /// Action sequence number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorPayload {
    code: ErrorCode,
    reason: String,
}

impl DataMessage {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let frame = match self {
            DataMessage::Action(action) => Frame {
                kind: FrameKind::Action,
                payload: serde_json::to_value(action)?,
                tick: None,
                seq: action.seq,
            },
            DataMessage::State(state) => Frame {
                kind: FrameKind::State,
                payload: serde_json::to_value(state)?,
                tick: Some(state.version),
                seq: None,
            },
            DataMessage::Error { code, reason, seq } => Frame {
                kind: FrameKind::Error,
                payload: serde_json::to_value(ErrorPayload {
                    code: *code,
                    reason: reason.clone(),
                })?,
                tick: None,
                seq: *seq,
            },
            DataMessage::Resync => Frame {
                kind: FrameKind::Resync,
                payload: Value::Null,
                tick: None,
                seq: None,
            },
        };
        Ok(Bytes::from(serde_json::to_vec(&frame)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let frame: Frame = serde_json::from_slice(data)?;
        let message = match frame.kind {
            FrameKind::Action => {
                let mut action: ActionRequest = serde_json::from_value(frame.payload)?;
                action.seq = action.seq.or(frame.seq);
                DataMessage::Action(action)
            }
            FrameKind::State => DataMessage::State(serde_json::from_value(frame.payload)?),
            FrameKind::Error => {
                let payload: ErrorPayload = serde_json::from_value(frame.payload)?;
                DataMessage::Error {
                    code: payload.code,
                    reason: payload.reason,
                    seq: frame.seq,
                }
            }
            FrameKind::Resync => DataMessage::Resync,
        };
        Ok(message)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DataMessage::Action(_) => "action",
            DataMessage::State(_) => "state",
            DataMessage::Error { .. } => "error",
            DataMessage::Resync => "resync",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_frame_carries_seq_outside_payload() {
        let mut action = ActionRequest::new(
            "Move",
            PeerId::parse("guest").unwrap(),
            json!({ "position": 4 }),
        );
        action.seq = Some(7);

        let bytes = DataMessage::Action(action.clone()).encode().unwrap();
        let frame: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(frame["type"], "action");
        assert_eq!(frame["seq"], 7);
        assert_eq!(frame["payload"]["input"]["position"], 4);

        assert_eq!(DataMessage::decode(&bytes).unwrap(), DataMessage::Action(action));
    }

    #[test]
    fn decode_takes_seq_from_frame_when_payload_lacks_it() {
        let raw = br#"{"type":"action","seq":3,"payload":{"action":"Move","from":"guest","input":{}}}"#;
        match DataMessage::decode(raw).unwrap() {
            DataMessage::Action(action) => assert_eq!(action.seq, Some(3)),
            other => panic!("Expected action, got {:?}", other),
        }
    }

    #[test]
    fn error_and_resync_frames() {
        let raw = br#"{"type":"error","seq":2,"payload":{"code":"InvalidAction","reason":"not your turn"}}"#;
        assert_eq!(
            DataMessage::decode(raw).unwrap(),
            DataMessage::Error {
                code: ErrorCode::InvalidAction,
                reason: "not your turn".to_string(),
                seq: Some(2),
            }
        );
        assert_eq!(
            DataMessage::decode(br#"{"type":"resync"}"#).unwrap(),
            DataMessage::Resync
        );
    }

    #[test]
    fn kind_names_the_wire_type() {
        let frames: [&[u8]; 2] = [
            br#"{"type":"resync"}"#,
            br#"{"type":"error","payload":{"code":"NotHost","reason":"no"}}"#,
        ];
        for raw in frames {
            let message = DataMessage::decode(raw).unwrap();
            let wire: Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
            assert_eq!(wire["type"], message.kind());
        }
    }

    #[test]
    fn reject_unknown_frame_type() {
        assert!(DataMessage::decode(br#"{"type":"chat","payload":"hi"}"#).is_err());
        assert!(DataMessage::decode(b"\xff\xfe").is_err());
    }
}
