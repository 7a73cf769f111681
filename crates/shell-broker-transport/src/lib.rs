//! Transport layer for the shell broker.
//!
//! Provides:
//! - Wire protocol (JSON + base64)
//! - `Gateway` - per-channel mapping of inbound messages to broker calls
//! - WebSocket transport (feature: websocket)

pub mod gateway;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use gateway::Gateway;
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
