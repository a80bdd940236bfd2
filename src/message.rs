//! The wire-agnostic message type fanned out by the hub.

use bytes::Bytes;

/// Discriminates the frame kind of a [`Message`].
///
/// `Ping` carries an empty payload by construction; there is no way to build a
/// `Ping` message with a non-empty payload through the public constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Binary,
    Ping,
}

/// An immutable, tagged byte payload.
///
/// Messages are cheap to clone: the payload is a [`bytes::Bytes`], so fanning a
/// single published message out to many clients shares the underlying
/// allocation rather than copying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    payload: Bytes,
}

impl Message {
    /// Builds a text message from any owned or borrowed string-like payload.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Text,
            payload: payload.into(),
        }
    }

    /// Builds a binary message.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Binary,
            payload: payload.into(),
        }
    }

    /// Builds a ping message. Always empty.
    pub fn ping() -> Self {
        Self {
            kind: MessageKind::Ping,
            payload: Bytes::new(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Number of bytes in the payload.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
