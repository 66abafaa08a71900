//! WebSocket Protocol Layer
//!
//! A bare implementation of the WebSocket wire protocol on top of raw TCP
//! streams, limited to what a push-only snapshot stream needs.
//!
//! ## Architecture
//!
//! - **frame**: Encode/decode of single, unfragmented frames
//! - **handshake**: HTTP/1.1 upgrade request parsing and accept token
//! - **connection**: One upgraded peer with an exclusive send lock
//! - **hub**: Connection registry and snapshot broadcaster
//! - **handler**: Per-connection read loop (ping/pong, close)
//!
//! ## Example
//!
//! ```javascript
//! // Browser
//! const ws = new WebSocket('ws://localhost:8470');
//!
//! ws.onmessage = (event) => {
//!   const snapshot = JSON.parse(event.data);
//!   console.log('Tick', snapshot.gameTick);
//! };
//! ```

pub mod connection;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod hub;

pub use connection::{Connection, ConnectionId, IdGenerator};
pub use frame::{decode, encode_frame, encode_masked, DecodedFrame, FrameCodec, Opcode};
pub use handler::handle_connection;
pub use handshake::{accept_key, negotiate};
pub use hub::{BroadcastReport, ConnectionHub, HubConfig, HubError};
