//! Signaling wire messages.
//!
//! Every message is a JSON text frame `{"event": <name>, "data": <payload>}`.
//! Session descriptions and candidates are carried as opaque JSON values; the
//! relay only looks at `roomId`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EndpointId, RoomId};
use crate::core::error::RelayError;

/// Messages a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "room:join")]
    Join(RoomId),

    #[serde(rename = "webrtc:offer")]
    Offer {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        offer: Value,
    },

    #[serde(rename = "webrtc:answer")]
    Answer {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        answer: Value,
    },

    #[serde(rename = "webrtc:ice")]
    Ice {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        candidate: Value,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::Malformed(e.to_string()))
    }

    pub fn room(&self) -> &RoomId {
        match self {
            Self::Join(room_id)
            | Self::Offer { room_id, .. }
            | Self::Answer { room_id, .. }
            | Self::Ice { room_id, .. } => room_id,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Join(_) => "room:join",
            Self::Offer { .. } => "webrtc:offer",
            Self::Answer { .. } => "webrtc:answer",
            Self::Ice { .. } => "webrtc:ice",
        }
    }
}

/// Messages the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "room:joined")]
    Joined {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },

    #[serde(rename = "room:peer-joined")]
    PeerJoined {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        id: EndpointId,
    },

    #[serde(rename = "room:peer-left")]
    PeerLeft {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        id: EndpointId,
    },

    #[serde(rename = "webrtc:offer")]
    Offer {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        offer: Value,
    },

    #[serde(rename = "webrtc:answer")]
    Answer {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        answer: Value,
    },

    #[serde(rename = "webrtc:ice")]
    Ice {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        candidate: Value,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    /// Room a message belongs to, `None` for connection-level errors.
    pub fn room(&self) -> Option<&RoomId> {
        match self {
            Self::Joined { room_id }
            | Self::PeerJoined { room_id, .. }
            | Self::PeerLeft { room_id, .. }
            | Self::Offer { room_id, .. }
            | Self::Answer { room_id, .. }
            | Self::Ice { room_id, .. } => Some(room_id),
            Self::Error { .. } => None,
        }
    }
}

impl From<ClientMessage> for ServerMessage {
    /// Forwarded form of a client message. Payloads pass through untouched.
    fn from(msg: ClientMessage) -> Self {
        match msg {
            ClientMessage::Join(room_id) => ServerMessage::Joined { room_id },
            ClientMessage::Offer { room_id, offer } => ServerMessage::Offer { room_id, offer },
            ClientMessage::Answer { room_id, answer } => ServerMessage::Answer { room_id, answer },
            ClientMessage::Ice { room_id, candidate } => ServerMessage::Ice { room_id, candidate },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_numeric_join() {
        let msg = ClientMessage::parse(r#"{"event":"room:join","data":42}"#).unwrap();
        assert_eq!(msg, ClientMessage::Join(RoomId::new("42").unwrap()));
    }

    #[test]
    fn parses_offer_with_opaque_payload() {
        let text = r#"{"event":"webrtc:offer","data":{"roomId":"r1","offer":{"type":"offer","sdp":"v=0"}}}"#;
        match ClientMessage::parse(text).unwrap() {
            ClientMessage::Offer { room_id, offer } => {
                assert_eq!(room_id.as_str(), "r1");
                assert_eq!(offer, json!({"type": "offer", "sdp": "v=0"}));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_event() {
        let err = ClientMessage::parse(r#"{"event":"room:nuke","data":"r1"}"#).unwrap_err();
        assert!(matches!(err, RelayError::Malformed(_)));
    }

    #[test]
    fn rejects_blank_room_in_join() {
        assert!(ClientMessage::parse(r#"{"event":"room:join","data":"  "}"#).is_err());
    }

    #[test]
    fn server_message_uses_camel_case_room_id() {
        let msg = ServerMessage::Ice {
            room_id: RoomId::new("r1").unwrap(),
            candidate: json!({"candidate": "candidate:1 1 udp"}),
        };
        let value: Value = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(value["event"], "webrtc:ice");
        assert_eq!(value["data"]["roomId"], "r1");
        assert_eq!(value["data"]["candidate"]["candidate"], "candidate:1 1 udp");
    }

    #[test]
    fn forwarded_answer_keeps_payload() {
        let answer = json!({"type": "answer", "sdp": "x"});
        let forwarded: ServerMessage = ClientMessage::Answer {
            room_id: RoomId::new("r").unwrap(),
            answer: answer.clone(),
        }
        .into();
        assert_eq!(
            forwarded,
            ServerMessage::Answer {
                room_id: RoomId::new("r").unwrap(),
                answer
            }
        );
    }
}
