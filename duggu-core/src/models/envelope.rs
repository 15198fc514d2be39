//! Wire envelope shared by chat and WebRTC signaling traffic
//!
//! Every frame on a client connection is one JSON object:
//!
//! ```json
//! {"messagetype":0,"roomid":7,"user":"alice","time":"...","data":"hi","connectionid":"...","rtcpeerid":""}
//! ```
//!
//! `data` is opaque here; for `Candidate`, `Offer` and `Answer` it carries the
//! ICE candidate or session description JSON as a string.

use serde::{Deserialize, Serialize};

use super::id::RoomId;
use crate::{Error, Result};

/// Message kinds, numbered as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    Text = 0,
    JoinRoom = 1,
    LeaveRoom = 2,
    Request = 3,
    VideoCall = 4,
    Candidate = 5,
    Offer = 6,
    Answer = 7,
    DeleteChannel = 8,
}

impl MessageType {
    pub const ALL: [Self; 9] = [
        Self::Text,
        Self::JoinRoom,
        Self::LeaveRoom,
        Self::Request,
        Self::VideoCall,
        Self::Candidate,
        Self::Offer,
        Self::Answer,
        Self::DeleteChannel,
    ];

    /// Chat-level messages are fanned out to the room; signaling stays point to point.
    #[must_use]
    pub const fn is_broadcast(&self) -> bool {
        matches!(
            self,
            Self::Text | Self::JoinRoom | Self::LeaveRoom | Self::Request
        )
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::JoinRoom => "join_room",
            Self::LeaveRoom => "leave_room",
            Self::Request => "request",
            Self::VideoCall => "video_call",
            Self::Candidate => "candidate",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::DeleteChannel => "delete_channel",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as Self
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or_else(|| format!("unknown message type {value}"))
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "messagetype")]
    pub message_type: MessageType,

    #[serde(rename = "roomid", default)]
    pub room_id: RoomId,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    /// Server stamped on the way out
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub time: String,

    #[serde(default)]
    pub data: String,

    #[serde(rename = "connectionid", default)]
    pub connection_id: String,

    #[serde(rename = "rtcpeerid", default)]
    pub peer_id: String,
}

impl Envelope {
    #[must_use]
    pub const fn new(message_type: MessageType, room_id: RoomId) -> Self {
        Self {
            message_type,
            room_id,
            user: String::new(),
            time: String::new(),
            data: String::new(),
            connection_id: String::new(),
            peer_id: String::new(),
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }

    #[must_use]
    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = peer_id.into();
        self
    }

    #[must_use]
    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = connection_id.into();
        self
    }

    /// Decode a text frame
    pub fn decode(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| Error::decode(format!("malformed envelope: {e}")))
    }

    /// Encode for the wire
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Caller-only error reply, `{"error": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: String,
}

impl ErrorMessage {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_message_type_round_trips() {
        for message_type in MessageType::ALL {
            let envelope = Envelope::new(message_type, RoomId::new(7))
                .with_user("alice")
                .with_data("payload")
                .with_connection_id("conn-1")
                .with_peer_id("peer-1");

            let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn test_wire_field_names() {
        let envelope = Envelope::new(MessageType::Text, RoomId::new(7)).with_data("hi");
        let value: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();

        assert_eq!(value["messagetype"], 0);
        assert_eq!(value["roomid"], 7);
        assert_eq!(value["data"], "hi");
        assert_eq!(value["connectionid"], "");
        assert_eq!(value["rtcpeerid"], "");
        // empty optional fields are omitted
        assert!(value.get("user").is_none());
        assert!(value.get("time").is_none());
    }

    #[test]
    fn test_decode_minimal_join() {
        let envelope = Envelope::decode(r#"{"messagetype":1,"roomid":7,"user":"alice"}"#).unwrap();
        assert_eq!(envelope.message_type, MessageType::JoinRoom);
        assert_eq!(envelope.room_id, RoomId::new(7));
        assert_eq!(envelope.user, "alice");
        assert!(envelope.data.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"roomid":7}"#).is_err());
        assert!(Envelope::decode(r#"{"messagetype":9,"roomid":7}"#).is_err());
        assert!(Envelope::decode(r#"{"messagetype":"text","roomid":7}"#).is_err());
    }

    #[test]
    fn test_broadcast_classification() {
        assert!(MessageType::Text.is_broadcast());
        assert!(MessageType::JoinRoom.is_broadcast());
        assert!(MessageType::LeaveRoom.is_broadcast());
        assert!(MessageType::Request.is_broadcast());
        assert!(!MessageType::VideoCall.is_broadcast());
        assert!(!MessageType::Candidate.is_broadcast());
        assert!(!MessageType::Offer.is_broadcast());
        assert!(!MessageType::Answer.is_broadcast());
        assert!(!MessageType::DeleteChannel.is_broadcast());
    }

    #[test]
    fn test_error_message_shape() {
        let json = serde_json::to_string(&ErrorMessage::new("room 7 does not exist")).unwrap();
        assert_eq!(json, r#"{"error":"room 7 does not exist"}"#);
    }
}
