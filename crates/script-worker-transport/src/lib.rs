//! Transport layer for browser clients.
//!
//! Provides:
//! - Wire protocol between page and server (JSON, `type`-tagged)
//! - WebSocket bridge running one session per connection (feature: websocket)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use protocol::{ClientMessage, ControlMessage, ServerMessage, TransportError};
