//! # Tickcast
//!
//! Telemetry Snapshot Streaming - a bare WebSocket server that pushes periodic
//! structured snapshots from one producer to many passive subscribers on a
//! local interface.
//!
//! ## Features
//!
//! - **Raw protocol**: WebSocket handshake and framing written directly on TCP streams
//! - **Broadcast**: One serialization and one encoded frame per snapshot, fanned out to every subscriber
//! - **Backpressure**: Slow or dead subscribers are dropped, never waited on
//! - **Cooperative shutdown**: Every task observes a stop signal; stop is bounded
//!
//! ## Modules
//!
//! - [`websocket`]: Frame codec, handshake, connection registry and handler
//! - [`server`]: Listening socket and lifecycle
//! - [`producer`]: Snapshot source boundary and cadence driver
//! - [`client`]: Subscriber for consuming a stream
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tickcast::{ServerConfig, StreamServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Arc::new(StreamServer::new(ServerConfig::default()));
//!     server.start().await?;
//!
//!     // Push a snapshot to every connected subscriber
//!     let snapshot = serde_json::json!({ "gameTick": 1, "planets": {} });
//!     let report = server.broadcast(&snapshot).await;
//!     println!("Delivered to {} subscribers", report.delivered);
//!
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod demo;
pub mod error;
pub mod producer;
pub mod server;
pub mod websocket;

// Re-export top-level types for convenience
pub use client::{ReconnectPolicy, Subscriber};

pub use config::{Config, ConfigError, LoggingConfig, ProducerConfig, ServerConfig};

pub use error::{ServerError, StreamError, StreamResult};

pub use producer::{Producer, ProducerStats, SnapshotSource, SourceError, TimestampedSnapshot};

pub use server::{ServerState, StreamServer};

pub use websocket::{BroadcastReport, ConnectionHub, ConnectionId, FrameCodec, HubConfig, Opcode};
