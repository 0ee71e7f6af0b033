//! Frames carried on the data channel.
//!
//! Control frames are JSON text (`kind: "meta" | "done"`). Chunks are binary:
//!
//! - raw:    `[payload]`
//! - tagged: `[16 bytes transfer uuid][4 bytes seq BE][payload]`
//!
//! Raw chunks are what browser peers send. Tagged chunks are opted into by
//! the `framing` field of the meta frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::config::{CHUNK_SIZE, DEFAULT_MIME};

/// Length of the tagged chunk header.
pub const TAGGED_HEADER_LEN: usize = 16 + 4;

/// What the sender announces before the first chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default = "default_mime")]
    pub mime: String,
}

fn default_mime() -> String {
    DEFAULT_MIME.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkFraming {
    #[default]
    Raw,
    Tagged,
}

impl ChunkFraming {
    fn is_raw(&self) -> bool {
        *self == ChunkFraming::Raw
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ControlFrame {
    Meta {
        #[serde(flatten)]
        descriptor: TransferDescriptor,
        #[serde(default, skip_serializing_if = "ChunkFraming::is_raw")]
        framing: ChunkFraming,
    },
    Done {
        id: String,
    },
}

impl ControlFrame {
    /// `None` for anything that is not a well-formed meta or done frame.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// One message received on, or sent to, the data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Text(String),
    Binary(Bytes),
}

/// Number of chunk frames a payload of `size` bytes is split into.
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

/// Encode a tagged chunk frame into a reusable buffer, clearing it first.
pub fn encode_tagged_chunk_into(buf: &mut BytesMut, transfer: Uuid, seq: u32, payload: &[u8]) {
    buf.clear();
    buf.reserve(TAGGED_HEADER_LEN + payload.len());
    buf.put_slice(transfer.as_bytes());
    buf.put_u32(seq);
    buf.put_slice(payload);
}

/// Split a tagged chunk into transfer id, sequence number and payload.
/// `None` if the frame is shorter than the header.
pub fn decode_tagged_chunk(frame: &Bytes) -> Option<(Uuid, u32, Bytes)> {
    if frame.len() < TAGGED_HEADER_LEN {
        return None;
    }
    let mut header = &frame[..TAGGED_HEADER_LEN];
    let mut id = [0u8; 16];
    header.copy_to_slice(&mut id);
    let seq = header.get_u32();
    Some((Uuid::from_bytes(id), seq, frame.slice(TAGGED_HEADER_LEN..)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn descriptor() -> TransferDescriptor {
        TransferDescriptor {
            id: "3f2504e0-4f89-41d3-9a0c-0305e82c3301".to_string(),
            name: "photo.jpg".to_string(),
            size: 153_600,
            mime: "image/jpeg".to_string(),
        }
    }

    #[test]
    fn meta_uses_browser_field_names() {
        let frame = ControlFrame::Meta {
            descriptor: descriptor(),
            framing: ChunkFraming::Raw,
        };
        let value: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(
            value,
            json!({
                "kind": "meta",
                "id": "3f2504e0-4f89-41d3-9a0c-0305e82c3301",
                "name": "photo.jpg",
                "size": 153600,
                "type": "image/jpeg"
            })
        );
    }

    #[test]
    fn tagged_meta_carries_framing() {
        let frame = ControlFrame::Meta {
            descriptor: descriptor(),
            framing: ChunkFraming::Tagged,
        };
        let parsed = ControlFrame::parse(&frame.encode()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn parses_browser_meta_without_type() {
        let text = r#"{"kind":"meta","id":"x","name":"a.bin","size":3}"#;
        match ControlFrame::parse(text).unwrap() {
            ControlFrame::Meta {
                descriptor,
                framing,
            } => {
                assert_eq!(descriptor.mime, DEFAULT_MIME);
                assert_eq!(framing, ChunkFraming::Raw);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_kinds_and_garbage() {
        assert!(ControlFrame::parse(r#"{"kind":"pause","id":"x"}"#).is_none());
        assert!(ControlFrame::parse("hello").is_none());
        assert!(ControlFrame::parse(r#"{"kind":"done"}"#).is_none());
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64), 1);
        assert_eq!(chunk_count(150 * 1024), 3);
    }

    #[test]
    fn tagged_chunk_layout() {
        let id = Uuid::new_v4();
        let mut buf = BytesMut::new();
        encode_tagged_chunk_into(&mut buf, id, 7, b"abc");
        let frame = buf.freeze();

        assert_eq!(frame.len(), TAGGED_HEADER_LEN + 3);
        assert_eq!(&frame[..16], id.as_bytes());
        assert_eq!(&frame[16..20], &[0, 0, 0, 7]);

        let (decoded_id, seq, payload) = decode_tagged_chunk(&frame).unwrap();
        assert_eq!((decoded_id, seq), (id, 7));
        assert_eq!(&payload[..], b"abc");
    }

    #[test]
    fn short_tagged_chunk_is_rejected() {
        assert!(decode_tagged_chunk(&Bytes::from_static(&[0u8; 19])).is_none());
    }
}
