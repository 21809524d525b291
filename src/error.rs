//! Error taxonomy shared by the signaling and session wire protocols

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes carried in `Error` envelopes and data-channel error frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    ProtocolError,
    RoomNotFound,
    RoomFull,
    NotHost,
    InvalidAction,
    TransportFailure,
    SignalingDisconnected,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RoomNotFound => "RoomNotFound",
            ErrorCode::RoomFull => "RoomFull",
            ErrorCode::NotHost => "NotHost",
            ErrorCode::InvalidAction => "InvalidAction",
            ErrorCode::TransportFailure => "TransportFailure",
            ErrorCode::SignalingDisconnected => "SignalingDisconnected",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message failed validation at the wire boundary
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown action {action:?} for message type {kind}")]
    UnknownAction { kind: &'static str, action: String },

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ProtocolError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serializes_as_plain_name() {
        let json = serde_json::to_string(&ErrorCode::RoomFull).unwrap();
        assert_eq!(json, "\"RoomFull\"");
        let code: ErrorCode = serde_json::from_str("\"NotHost\"").unwrap();
        assert_eq!(code, ErrorCode::NotHost);
    }

    #[test]
    fn error_code_display_matches_wire_name() {
        assert_eq!(ErrorCode::InvalidAction.to_string(), "InvalidAction");
    }
}
