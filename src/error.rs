//! Error types
//!
//! Defines the errors of the streaming server. Startup errors are fatal and
//! surface to the owning process; stream errors are local to one connection
//! and never leave the handler or broadcast path that produced them.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur while starting or stopping the server
#[derive(Error, Debug)]
pub enum ServerError {
    /// Listening socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// `start` was called on a server that is not stopped
    #[error("Server is already running")]
    AlreadyRunning,

    /// Any other I/O failure on the listening socket
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors local to a single connection
#[derive(Error, Debug)]
pub enum StreamError {
    /// Read or write on the underlying stream failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Upgrade request could not be parsed or was cut short
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Upgrade request did not fit in the handshake buffer
    #[error("Handshake request exceeds {0} bytes")]
    RequestTooLarge(usize),

    /// Upgrade request lacks the `Sec-WebSocket-Key` header
    #[error("Handshake request has no Sec-WebSocket-Key header")]
    MissingKey,

    /// Peer violated the framing protocol
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Write did not complete within the send timeout
    #[error("Send timed out")]
    SendTimeout,

    /// Connection was already closed
    #[error("Connection closed")]
    Closed,

    /// Snapshot could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StreamError {
    /// Handshake failure tied to a specific peer
    pub fn handshake(peer: SocketAddr, reason: impl std::fmt::Display) -> Self {
        StreamError::Handshake(format!("{}: {}", peer, reason))
    }
}

/// Result type alias for per-connection operations
pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StreamError::RequestTooLarge(4096);
        assert_eq!(err.to_string(), "Handshake request exceeds 4096 bytes");

        let err = ServerError::Bind {
            addr: "127.0.0.1:8470".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
        };
        assert_eq!(err.to_string(), "Failed to bind 127.0.0.1:8470: address in use");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        let stream_err: StreamError = io_err.into();
        assert!(matches!(stream_err, StreamError::Io(_)));
    }

    #[test]
    fn test_handshake_error_includes_peer() {
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let err = StreamError::handshake(peer, "unexpected EOF");
        assert_eq!(
            err.to_string(),
            "Handshake failed: 127.0.0.1:50000: unexpected EOF"
        );
    }
}
