//! Channel names: non-empty, compared by exact byte equality, no pattern or
//! hierarchy semantics.

/// A channel name. Heap-allocated and cheap to hash/compare; the public API
/// accepts anything `Into<ChannelName>` (`&str`, `String`).
pub type ChannelName = Box<str>;
