//! The error taxonomy. Flat by design: each variant is a leaf, type-tested by
//! tag (`matches!`) rather than by any subtype relationship, mirroring the
//! teacher's own `error.rs` (`ClientError::NotFound`-style enums).

use crate::identity::ClientId;

/// The sentinel a [`Connection`](crate::connection::Connection) returns from
/// `read`/`write` when the peer or a deadline closes the stream. The core uses
/// this to distinguish clean teardown from protocol errors.
#[derive(Debug, thiserror::Error)]
#[error("connection closed: {cause}")]
pub struct ConnectionClosed {
    pub cause: anyhow::Error,
}

impl ConnectionClosed {
    pub fn new(cause: impl Into<anyhow::Error>) -> Self {
        Self { cause: cause.into() }
    }
}

/// Errors raised by [`Client`](crate::client::Client) operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client {id} is already connected")]
    RepeatConnect { id: ClientId },

    #[error("client {id} failed to connect: {cause}")]
    ConnectFailure {
        id: ClientId,
        #[source]
        cause: anyhow::Error,
    },

    #[error("client {id} send buffer is full")]
    SendBufferOverflow { id: ClientId },

    #[error("client {id} failed to write message: {cause}")]
    Send {
        id: ClientId,
        #[source]
        cause: anyhow::Error,
    },

    #[error("client {id} failed to write ping: {cause}")]
    Ping {
        id: ClientId,
        #[source]
        cause: anyhow::Error,
    },

    #[error("client {id} read failed: {cause}")]
    Receive {
        id: ClientId,
        #[source]
        cause: anyhow::Error,
    },
}

impl ClientError {
    pub fn id(&self) -> ClientId {
        match self {
            ClientError::RepeatConnect { id }
            | ClientError::ConnectFailure { id, .. }
            | ClientError::SendBufferOverflow { id }
            | ClientError::Send { id, .. }
            | ClientError::Ping { id, .. }
            | ClientError::Receive { id, .. } => *id,
        }
    }
}

/// Errors raised by [`ClientStore`](crate::store::ClientStore) lookups.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("client {0} not found")]
pub struct NotFound(pub ClientId);

/// Errors raised by [`Hub`](crate::hub::Hub) operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("subscribe requires at least one channel")]
    SubscriptionChannelRequired,

    #[error(transparent)]
    NotFound(#[from] NotFound),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl From<ClientId> for NotFound {
    fn from(id: ClientId) -> Self {
        NotFound(id)
    }
}
