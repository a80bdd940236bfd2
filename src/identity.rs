//! Opaque 128-bit client identities.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// A 128-bit opaque value identifying one connected client.
///
/// Minted when the [`Hub`](crate::hub::Hub) accepts an HTTP upgrade request and
/// valid until the corresponding [`Client`](crate::client::Client) is removed
/// from the [`ClientStore`](crate::store::ClientStore). Equality and hashing are
/// by raw bytes; the canonical textual form is the 8-4-4-4-12 hex grouping.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub(crate) [u8; 16]);

impl ClientId {
    /// Builds a `ClientId` from raw bytes, bypassing the generator.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw 16 bytes backing this id.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid client id: {0}")]
pub struct ParseClientIdError(String);

impl FromStr for ClientId {
    type Err = ParseClientIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s).map_err(|e| ParseClientIdError(e.to_string()))?;
        Ok(Self(*uuid.as_bytes()))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({self})")
    }
}

/// Mints new [`ClientId`]s. The core consumes this as an external collaborator;
/// the default implementation backs it with UUID v4 generation.
pub trait ClientIdGenerator: Send + Sync {
    fn generate(&self) -> ClientId;
}

/// The one shipped [`ClientIdGenerator`], backed by `uuid`'s v4 generation.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV4Generator;

impl ClientIdGenerator for UuidV4Generator {
    fn generate(&self) -> ClientId {
        ClientId(*Uuid::new_v4().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = UuidV4Generator.generate();
        let rendered = id.to_string();
        let parsed: ClientId = rendered.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn canonical_form_is_hyphenated() {
        let id = ClientId::from_bytes([0u8; 16]);
        assert_eq!(id.to_string(), "00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn distinct_ids_are_unequal() {
        let gen = UuidV4Generator;
        assert_ne!(gen.generate(), gen.generate());
    }
}
