//! Protocol messages and their binary codec.
//!
//! Every message carries a process-unique id, the sender's virtual-time
//! timestamp in milliseconds, and the sender's role; MEETING additionally
//! carries the sender's information-table size for the head-vs-head
//! tie-break. Frames are length-prefixed with tagged fixed-width fields so
//! a decoder can reject truncated or incomplete packets instead of
//! misreading them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::clustering::role::NodeRole;

/// Node identifier: the `u32` form of the node's primary IPv4 address.
pub type NodeId = u32;

/// The six message kinds of the clustering protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Claim,
    Status,
    Meeting,
    Resign,
    Inquiry,
}

impl MessageKind {
    pub fn to_wire(self) -> u8 {
        match self {
            MessageKind::Ping => 0,
            MessageKind::Claim => 1,
            MessageKind::Status => 2,
            MessageKind::Meeting => 3,
            MessageKind::Resign => 4,
            MessageKind::Inquiry => 5,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageKind::Ping),
            1 => Some(MessageKind::Claim),
            2 => Some(MessageKind::Status),
            3 => Some(MessageKind::Meeting),
            4 => Some(MessageKind::Resign),
            5 => Some(MessageKind::Inquiry),
            _ => None,
        }
    }
}

/// A clustering protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Process-unique, monotonically increasing id for duplicate suppression.
    pub id: u64,
    /// Sender's virtual time at send, milliseconds since simulation start.
    pub timestamp_ms: u64,
    /// The role the sender held when the message was built.
    pub sender_role: NodeRole,
    pub kind: MessageKind,
    /// MEETING only: the sender's information-table size.
    pub table_size: Option<u64>,
}

/// Monotonic message-id source shared by every node of one simulation run.
///
/// Ids must be unique across the whole process for the H-hop flood
/// deduplication to work; a shared atomic counter handed to each machine
/// keeps that property without a process-global.
#[derive(Clone, Default)]
pub struct MessageIdStream {
    next: Arc<AtomicU64>,
}

impl MessageIdStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Decode failures. Per-packet handlers log these and drop the frame.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame shorter than its length prefix claims, or prefix missing.
    Truncated,
    /// A tag outside the known field set, or a field repeated.
    UnexpectedField(u8),
    /// A required field was absent from the frame.
    MissingField(&'static str),
    /// Role or kind discriminant outside the wire range.
    BadDiscriminant(u8),
    /// MEETING without a table size, or a table size on another kind.
    PayloadMismatch,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "frame truncated"),
            DecodeError::UnexpectedField(tag) => write!(f, "unexpected or repeated field tag {}", tag),
            DecodeError::MissingField(name) => write!(f, "missing required field '{}'", name),
            DecodeError::BadDiscriminant(value) => write!(f, "discriminant {} out of range", value),
            DecodeError::PayloadMismatch => write!(f, "payload does not match message kind"),
        }
    }
}

impl std::error::Error for DecodeError {}

// Field tags of the wire format.
const TAG_ID: u8 = 1;
const TAG_TIMESTAMP: u8 = 2;
const TAG_ROLE: u8 = 3;
const TAG_KIND: u8 = 4;
const TAG_TABLE_SIZE: u8 = 5;

impl Message {
    /// Serialize to the length-prefixed tagged wire form.
    ///
    /// Canonical frames write tags in ascending order; `decode` of a
    /// canonical frame re-encodes byte-identically.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(32);
        body.push(TAG_ID);
        body.extend_from_slice(&self.id.to_be_bytes());
        body.push(TAG_TIMESTAMP);
        body.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        body.push(TAG_ROLE);
        body.push(self.sender_role.to_wire());
        body.push(TAG_KIND);
        body.push(self.kind.to_wire());
        if let Some(size) = self.table_size {
            body.push(TAG_TABLE_SIZE);
            body.extend_from_slice(&size.to_be_bytes());
        }

        let mut frame = Vec::with_capacity(body.len() + 2);
        frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    /// Parse a frame produced by [`encode`](Self::encode).
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        if frame.len() < 2 {
            return Err(DecodeError::Truncated);
        }
        let body_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        if frame.len() != body_len + 2 {
            return Err(DecodeError::Truncated);
        }
        let body = &frame[2..];

        let mut id: Option<u64> = None;
        let mut timestamp_ms: Option<u64> = None;
        let mut role_raw: Option<u8> = None;
        let mut kind_raw: Option<u8> = None;
        let mut table_size: Option<u64> = None;

        let mut pos = 0;
        while pos < body.len() {
            let tag = body[pos];
            pos += 1;
            match tag {
                TAG_ID => {
                    if id.is_some() {
                        return Err(DecodeError::UnexpectedField(tag));
                    }
                    id = Some(read_u64(body, &mut pos)?);
                }
                TAG_TIMESTAMP => {
                    if timestamp_ms.is_some() {
                        return Err(DecodeError::UnexpectedField(tag));
                    }
                    timestamp_ms = Some(read_u64(body, &mut pos)?);
                }
                TAG_ROLE => {
                    if role_raw.is_some() {
                        return Err(DecodeError::UnexpectedField(tag));
                    }
                    role_raw = Some(read_u8(body, &mut pos)?);
                }
                TAG_KIND => {
                    if kind_raw.is_some() {
                        return Err(DecodeError::UnexpectedField(tag));
                    }
                    kind_raw = Some(read_u8(body, &mut pos)?);
                }
                TAG_TABLE_SIZE => {
                    if table_size.is_some() {
                        return Err(DecodeError::UnexpectedField(tag));
                    }
                    table_size = Some(read_u64(body, &mut pos)?);
                }
                other => return Err(DecodeError::UnexpectedField(other)),
            }
        }

        let id = id.ok_or(DecodeError::MissingField("id"))?;
        let timestamp_ms = timestamp_ms.ok_or(DecodeError::MissingField("timestamp_ms"))?;
        let role_raw = role_raw.ok_or(DecodeError::MissingField("sender_role"))?;
        let kind_raw = kind_raw.ok_or(DecodeError::MissingField("kind"))?;

        let sender_role = NodeRole::from_wire(role_raw).ok_or(DecodeError::BadDiscriminant(role_raw))?;
        let kind = MessageKind::from_wire(kind_raw).ok_or(DecodeError::BadDiscriminant(kind_raw))?;

        // Only MEETING carries a payload, and it always does.
        match (kind, table_size) {
            (MessageKind::Meeting, None) => return Err(DecodeError::PayloadMismatch),
            (MessageKind::Meeting, Some(_)) => {}
            (_, Some(_)) => return Err(DecodeError::PayloadMismatch),
            (_, None) => {}
        }

        Ok(Message {
            id,
            timestamp_ms,
            sender_role,
            kind,
            table_size,
        })
    }
}

fn read_u8(body: &[u8], pos: &mut usize) -> Result<u8, DecodeError> {
    if *pos + 1 > body.len() {
        return Err(DecodeError::Truncated);
    }
    let value = body[*pos];
    *pos += 1;
    Ok(value)
}

fn read_u64(body: &[u8], pos: &mut usize) -> Result<u64, DecodeError> {
    if *pos + 8 > body.len() {
        return Err(DecodeError::Truncated);
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&body[*pos..*pos + 8]);
    *pos += 8;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(id: u64) -> Message {
        Message {
            id,
            timestamp_ms: 1500,
            sender_role: NodeRole::ClusterHead,
            kind: MessageKind::Ping,
            table_size: None,
        }
    }

    #[test]
    fn canonical_frames_round_trip_byte_identically() {
        let messages = [
            ping(7),
            Message {
                id: u64::MAX,
                timestamp_ms: 0,
                sender_role: NodeRole::ClusterGuest,
                kind: MessageKind::Meeting,
                table_size: Some(42),
            },
            Message {
                id: 0,
                timestamp_ms: 123_456,
                sender_role: NodeRole::Standalone,
                kind: MessageKind::Resign,
                table_size: None,
            },
        ];
        for message in messages {
            let frame = message.encode();
            let decoded = Message::decode(&frame).unwrap();
            assert_eq!(decoded, message);
            assert_eq!(decoded.encode(), frame);
        }
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let frame = ping(1).encode();
        assert_eq!(Message::decode(&frame[..1]), Err(DecodeError::Truncated));
        assert_eq!(Message::decode(&frame[..frame.len() - 1]), Err(DecodeError::Truncated));
        // Length prefix claiming more than is present.
        let mut short = frame.clone();
        short[1] += 1;
        assert_eq!(Message::decode(&short), Err(DecodeError::Truncated));
    }

    #[test]
    fn missing_fields_are_rejected() {
        // A frame with only an id field.
        let mut body = vec![1u8];
        body.extend_from_slice(&9u64.to_be_bytes());
        let mut frame = (body.len() as u16).to_be_bytes().to_vec();
        frame.extend_from_slice(&body);
        assert_eq!(Message::decode(&frame), Err(DecodeError::MissingField("timestamp_ms")));
    }

    #[test]
    fn repeated_and_unknown_tags_are_rejected() {
        let mut frame = ping(1).encode();
        // Append a second kind field.
        frame.extend_from_slice(&[4u8, 0u8]);
        let body_len = (frame.len() - 2) as u16;
        frame[..2].copy_from_slice(&body_len.to_be_bytes());
        assert_eq!(Message::decode(&frame), Err(DecodeError::UnexpectedField(4)));

        let mut frame = ping(1).encode();
        frame.extend_from_slice(&[9u8, 0u8]);
        let body_len = (frame.len() - 2) as u16;
        frame[..2].copy_from_slice(&body_len.to_be_bytes());
        assert_eq!(Message::decode(&frame), Err(DecodeError::UnexpectedField(9)));
    }

    #[test]
    fn bad_discriminants_are_rejected() {
        let mut frame = ping(1).encode();
        // Role byte sits right after the id and timestamp fields: 2 (len)
        // + 1 + 8 (id) + 1 + 8 (timestamp) + 1 (tag) = offset 21.
        frame[21] = 6;
        assert_eq!(Message::decode(&frame), Err(DecodeError::BadDiscriminant(6)));
    }

    #[test]
    fn meeting_payload_is_mandatory_and_exclusive() {
        let no_payload = Message {
            id: 3,
            timestamp_ms: 10,
            sender_role: NodeRole::ClusterHead,
            kind: MessageKind::Meeting,
            table_size: None,
        };
        assert_eq!(Message::decode(&no_payload.encode()), Err(DecodeError::PayloadMismatch));

        let stray_payload = Message {
            id: 3,
            timestamp_ms: 10,
            sender_role: NodeRole::ClusterHead,
            kind: MessageKind::Ping,
            table_size: Some(4),
        };
        assert_eq!(Message::decode(&stray_payload.encode()), Err(DecodeError::PayloadMismatch));
    }

    #[test]
    fn id_stream_is_strictly_increasing() {
        let stream = MessageIdStream::new();
        let first = stream.next_id();
        let clone = stream.clone();
        let second = clone.next_id();
        assert!(second > first);
        assert!(stream.next_id() > second);
    }
}
