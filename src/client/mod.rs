//! Per-connection client state and the tasks it spawns.

mod state;

pub use state::{Client, ErrorHandler, ReceiveHandler};
