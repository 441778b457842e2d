//! Application messages: what the upper-layer service sees after fragment reassembly.
use bytes::Bytes;

use crate::{frame::OpCode, GatewayError};

/// Kind of an application message.
///
/// Every outgoing message states its kind explicitly; the framing stage never infers it
/// from the payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

impl MessageKind {
    /// The opcode the first frame of a message of this kind carries.
    pub fn opcode(self) -> OpCode {
        match self {
            Self::Text => OpCode::Text,
            Self::Binary => OpCode::Binary,
        }
    }

    /// Maps a data opcode back to a message kind.
    pub fn from_opcode(opcode: OpCode) -> Option<Self> {
        match opcode {
            OpCode::Text => Some(Self::Text),
            OpCode::Binary => Some(Self::Binary),
            _ => None,
        }
    }
}

/// A reassembled application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Whether the message is text or binary.
    pub kind: MessageKind,
    /// Concatenated payload of every frame of the message.
    pub payload: Bytes,
    /// How many frames carried the message on the wire (1 for outgoing messages).
    pub frame_count: usize,
}

impl Message {
    /// Creates a message of the given kind.
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            frame_count: 1,
        }
    }

    /// Creates a text message.
    pub fn text(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::Text, payload.into())
    }

    /// Creates a binary message.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Binary, payload)
    }

    pub fn is_text(&self) -> bool {
        self.kind == MessageKind::Text
    }

    pub fn is_binary(&self) -> bool {
        self.kind == MessageKind::Binary
    }

    /// Returns the payload as a string slice.
    ///
    /// Fails with [`GatewayError::InvalidUTF8`] when the payload is not valid UTF-8, which
    /// can only happen for binary messages or when UTF-8 checking is disabled.
    pub fn as_str(&self) -> Result<&str, GatewayError> {
        std::str::from_utf8(&self.payload).map_err(|_| GatewayError::InvalidUTF8)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
