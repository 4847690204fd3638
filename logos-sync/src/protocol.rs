//! Binary wire protocol for room broadcasts and relay frames.
//!
//! Every broadcast travels as a bincode-encoded [`Envelope`]:
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────────────────────────┐
//! │ sender   │ room_id  │ sent_at  │ message (tagged variant)     │
//! │ 16 bytes │ 16 bytes │ varint   │ Cursor | Selection | ...     │
//! └──────────┴──────────┴──────────┴──────────────────────────────┘
//! ```
//!
//! Decoding validates the payload before anything reaches session state:
//! a frame that parses but violates an invariant (non-finite cursor,
//! operation claiming another author or room) is rejected here.
//!
//! Reference: Patterson & Hennessy, Section 5.7 — Data Compression

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{
    json_text, now_millis, CommentAction, CursorPosition, Operation, Participant, RoomId,
    SelectionRange, UserId,
};

/// Largest encoded frame accepted from the network.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
/// Longest accepted activity kind string.
pub const MAX_ACTIVITY_KIND_LEN: usize = 64;

/// Discriminant of a broadcast message, for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Cursor = 1,
    Selection = 2,
    Operation = 3,
    Activity = 4,
    CommentHint = 5,
}

/// One variant per broadcast kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BroadcastMessage {
    /// Coalesced pointer position (high frequency).
    Cursor { position: CursorPosition, seq: u64 },
    /// Selection change; `None` clears the remote-visible selection.
    Selection { selection: Option<SelectionRange> },
    /// A persisted operation, sent only after the store accepted it.
    Operation { operation: Operation },
    /// Free-form activity ("editing text", "dragging frame").
    Activity {
        kind: String,
        #[serde(with = "json_text")]
        detail: Value,
    },
    /// Early hint that a comment changed; the comment itself arrives via
    /// the store's change feed.
    CommentHint { comment_id: Uuid, action: CommentAction },
}

impl BroadcastMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            BroadcastMessage::Cursor { .. } => MessageKind::Cursor,
            BroadcastMessage::Selection { .. } => MessageKind::Selection,
            BroadcastMessage::Operation { .. } => MessageKind::Operation,
            BroadcastMessage::Activity { .. } => MessageKind::Activity,
            BroadcastMessage::CommentHint { .. } => MessageKind::CommentHint,
        }
    }
}

/// Top-level broadcast frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: UserId,
    pub room_id: RoomId,
    pub sent_at: u64,
    pub message: BroadcastMessage,
}

impl Envelope {
    pub fn new(sender: UserId, room_id: RoomId, message: BroadcastMessage) -> Self {
        Self {
            sender,
            room_id,
            sent_at: now_millis(),
            message,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize and validate.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge(bytes.len()));
        }
        let (envelope, _): (Envelope, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Structural checks that bincode cannot express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match &self.message {
            BroadcastMessage::Cursor { position, .. } => {
                if !position.is_finite() {
                    return Err(ProtocolError::Invalid("cursor position is not finite".into()));
                }
            }
            BroadcastMessage::Selection { selection } => {
                if let Some(bounds) = selection.as_ref().and_then(|s| s.bounds) {
                    if bounds.width < 0.0 || bounds.height < 0.0 {
                        return Err(ProtocolError::Invalid("negative selection bounds".into()));
                    }
                }
            }
            BroadcastMessage::Operation { operation } => {
                if operation.user_id != self.sender {
                    return Err(ProtocolError::Invalid(format!(
                        "operation {} authored by {} but sent by {}",
                        operation.id, operation.user_id, self.sender
                    )));
                }
                if operation.room_id != self.room_id {
                    return Err(ProtocolError::Invalid(format!(
                        "operation {} belongs to room {}",
                        operation.id, operation.room_id
                    )));
                }
                if operation.operation_type.is_empty() || operation.target_type.is_empty() {
                    return Err(ProtocolError::Invalid("operation type is empty".into()));
                }
            }
            BroadcastMessage::Activity { kind, .. } => {
                if kind.is_empty() || kind.len() > MAX_ACTIVITY_KIND_LEN {
                    return Err(ProtocolError::Invalid(format!(
                        "activity kind must be 1..={MAX_ACTIVITY_KIND_LEN} bytes"
                    )));
                }
            }
            BroadcastMessage::CommentHint { .. } => {}
        }
        Ok(())
    }
}

/// Frames exchanged between a WebSocket channel and the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayFrame {
    // client → relay
    Subscribe {
        room_id: RoomId,
        user_id: UserId,
        receive_own: bool,
    },
    Track(Participant),
    Untrack,
    Publish(Vec<u8>),

    // relay → client
    Subscribed,
    PresenceSync(Vec<Participant>),
    PresenceJoin(Participant),
    PresenceLeave(UserId),
    Broadcast { sender: UserId, payload: Vec<u8> },
    Error(String),
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge(bytes.len()));
        }
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    FrameTooLarge(usize),
    Invalid(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::FrameTooLarge(n) => write!(f, "Frame of {n} bytes exceeds {MAX_FRAME_BYTES}"),
            Self::Invalid(e) => write!(f, "Invalid payload: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
