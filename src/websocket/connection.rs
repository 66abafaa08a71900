//! Upgraded client connection
//!
//! Holds the write half of one peer's stream behind an exclusive lock so that
//! broadcast frames and handler-originated control replies never interleave.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};

use crate::error::{StreamError, StreamResult};

/// Unique identifier for a connection, assigned in increasing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Monotonic source of connection identifiers
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Write side of a stream, boxed so tests can substitute in-memory pipes
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One upgraded WebSocket peer
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    writer: Mutex<BoxedWriter>,
    alive: AtomicBool,
    /// Flips to `true` once, when `close` runs
    closed: watch::Sender<bool>,
}

impl Connection {
    pub fn new(id: ConnectionId, peer: SocketAddr, writer: BoxedWriter) -> Self {
        Self {
            id,
            peer,
            writer: Mutex::new(writer),
            alive: AtomicBool::new(true),
            closed: watch::Sender::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Write one encoded frame, giving up after `timeout`
    ///
    /// A timed-out or failed write leaves the connection dead; callers drop it.
    pub async fn send(&self, frame: &[u8], timeout: Duration) -> StreamResult<()> {
        if !self.is_alive() {
            return Err(StreamError::Closed);
        }

        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(frame).await?;
            writer.flush().await
        };

        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.alive.store(false, Ordering::Release);
                Err(StreamError::Io(e))
            }
            Err(_) => {
                self.alive.store(false, Ordering::Release);
                Err(StreamError::SendTimeout)
            }
        }
    }

    /// Mark dead, wake anything waiting in [`Connection::closed`] and shut
    /// down the write half
    ///
    /// Safe to call more than once; only the first call touches the stream.
    /// A connection whose last send failed is still shut down here.
    pub async fn close(&self) {
        self.alive.store(false, Ordering::Release);
        if self.closed.send_replace(true) {
            return;
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::trace!(connection_id = %self.id, error = %e, "Shutdown on close failed");
        }
    }

    /// Resolves once [`Connection::close`] has been called
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // Sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_ids_are_monotonic() {
        let ids = IdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        let c = ids.next_id();
        assert!(a < b && b < c);
        assert_eq!(a.to_string(), "conn-1");
        assert_eq!(c.to_string(), "conn-3");
    }

    #[tokio::test]
    async fn test_send_writes_bytes() {
        let (mut client, server) = duplex(1024);
        let conn = Connection::new(IdGenerator::new().next_id(), peer(), Box::new(server));

        conn.send(b"hello", Duration::from_millis(100)).await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_send_times_out_on_full_pipe() {
        let (_client, server) = duplex(8);
        let conn = Connection::new(IdGenerator::new().next_id(), peer(), Box::new(server));

        let result = conn.send(&[0u8; 64], Duration::from_millis(50)).await;
        assert!(matches!(result, Err(StreamError::SendTimeout)));
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (_client, server) = duplex(1024);
        let conn = Connection::new(IdGenerator::new().next_id(), peer(), Box::new(server));

        conn.close().await;
        conn.close().await;
        assert!(!conn.is_alive());

        let result = conn.send(b"late", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(StreamError::Closed)));
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer_fails() {
        let (client, server) = duplex(1024);
        drop(client);
        let conn = Connection::new(IdGenerator::new().next_id(), peer(), Box::new(server));

        let result = conn.send(b"hello", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(StreamError::Io(_))));
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let (_client, server) = duplex(1024);
        let conn = Arc::new(Connection::new(IdGenerator::new().next_id(), peer(), Box::new(server)));

        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.closed().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        conn.close().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed() did not resolve")
            .unwrap();

        // Already closed: resolves immediately
        tokio::time::timeout(Duration::from_millis(100), conn.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_after_failed_send_shuts_down_stream() {
        let (mut client, server) = duplex(8);
        let conn = Connection::new(IdGenerator::new().next_id(), peer(), Box::new(server));

        let result = conn.send(&[7u8; 64], Duration::from_millis(50)).await;
        assert!(matches!(result, Err(StreamError::SendTimeout)));

        conn.close().await;

        // The partial write is readable, then EOF
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut buf))
            .await
            .expect("stream was not shut down")
            .unwrap();
        assert_eq!(buf, vec![7u8; 8]);
    }
}
