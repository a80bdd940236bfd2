//! A process-embedded WebSocket publish/subscribe hub: accept WebSocket
//! upgrades over HTTP, organize connected clients into named channels, and
//! fan messages out to them with bounded, non-blocking delivery.
//!
//! The three load-bearing pieces:
//! - [`client::Client`]: one connection's state machine and reader/writer
//!   tasks.
//! - [`store::ClientStore`]: the sharded index from client id and channel
//!   name to connected clients.
//! - [`hub::Hub`]: the façade applications embed — subscribe/publish/send,
//!   callback registration, and the HTTP surface.

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod identity;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod store;

pub use channel::ChannelName;
pub use client::Client;
pub use config::HubConfig;
pub use error::{ClientError, HubError, NotFound};
pub use hub::Hub;
pub use identity::{ClientId, ClientIdGenerator};
pub use message::{Message, MessageKind};
pub use store::ClientStore;
