//! WebSocket Connection Hub
//!
//! Registry of upgraded connections and the broadcaster that fans one encoded
//! snapshot frame out to all of them. The registry is a sharded `DashMap`, so
//! inserts from the acceptor and removals from handlers never contend on a
//! single global lock.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;

use super::connection::{Connection, ConnectionId};
use super::frame::{encode_frame, FrameCodec, Opcode, DEFAULT_MAX_PAYLOAD};

/// Close status sent to peers when the server shuts down
const CLOSE_GOING_AWAY: u16 = 1001;

/// Configuration for the connection hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Cap on an outbound payload before it is replaced by an error indicator
    pub max_payload: usize,
    /// How long a single send may take before the connection is dropped
    pub send_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            max_payload: DEFAULT_MAX_PAYLOAD,
            send_timeout: Duration::from_millis(250),
        }
    }
}

/// Outcome of one broadcast pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections that accepted the frame
    pub delivered: usize,
    /// Connections removed because the send failed
    pub dropped: usize,
}

/// Manages all upgraded connections
pub struct ConnectionHub {
    /// Active connections: ConnectionId → Connection
    connections: DashMap<ConnectionId, Arc<Connection>>,
    codec: FrameCodec,
    config: HubConfig,
}

impl ConnectionHub {
    /// Create a new connection hub
    pub fn new(config: HubConfig) -> Self {
        Self {
            connections: DashMap::new(),
            codec: FrameCodec::new(config.max_payload),
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Register a fully upgraded connection
    ///
    /// Returns an error if the connection limit has been reached. The limit is
    /// soft: the count check and the insert are separate steps, so handshakes
    /// finishing at the same moment can overshoot it by a few connections.
    pub fn register(&self, connection: Arc<Connection>) -> Result<(), HubError> {
        if self.connections.len() >= self.config.max_connections {
            return Err(HubError::TooManyConnections(self.config.max_connections));
        }

        let id = connection.id();
        let peer = connection.peer();
        self.connections.insert(id, connection);

        tracing::info!(connection_id = %id, peer = %peer, "WebSocket connected");
        Ok(())
    }

    /// Remove a connection, returning it if it was registered
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(&id).map(|(_, conn)| conn);
        if removed.is_some() {
            tracing::info!(connection_id = %id, "WebSocket disconnected");
        }
        removed
    }

    /// Get the current connection count
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Identifiers of all registered connections
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Serialize a snapshot once and send it to every connection
    ///
    /// Does nothing when no one is connected. Failures are logged and the
    /// failing connections removed; this never returns an error.
    pub async fn broadcast<T>(&self, snapshot: &T) -> BroadcastReport
    where
        T: Serialize + ?Sized,
    {
        if self.is_empty() {
            return BroadcastReport::default();
        }

        let payload = match serde_json::to_vec(snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize snapshot");
                return BroadcastReport::default();
            }
        };

        self.broadcast_payload(&payload).await
    }

    /// Send an already serialized text payload to every connection
    pub async fn broadcast_payload(&self, payload: &[u8]) -> BroadcastReport {
        // Clone the handles out so no shard lock is held across an await
        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if targets.is_empty() {
            return BroadcastReport::default();
        }

        let frame = self.codec.encode(payload, Opcode::Text);
        let timeout = self.config.send_timeout;

        let results = join_all(targets.iter().map(|conn| {
            let frame = &frame;
            async move { conn.send(frame, timeout).await }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (conn, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::debug!(
                        connection_id = %conn.id(),
                        error = %e,
                        "Broadcast send failed, dropping connection"
                    );
                    self.unregister(conn.id());
                    conn.close().await;
                    report.dropped += 1;
                }
            }
        }

        if report.delivered > 0 || report.dropped > 0 {
            tracing::trace!(
                bytes = frame.len(),
                delivered = report.delivered,
                dropped = report.dropped,
                "Broadcast snapshot"
            );
        }

        report
    }

    /// Remove and close every connection, returning how many were closed
    ///
    /// Each peer is sent a "going away" close frame first, best effort. All
    /// peers are handled at once, so this takes at most about one send timeout.
    pub async fn close_all(&self) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .ids()
            .into_iter()
            .filter_map(|id| self.unregister(id))
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let going_away = encode_frame(&CLOSE_GOING_AWAY.to_be_bytes(), Opcode::Close);
        let timeout = self.config.send_timeout;

        join_all(targets.iter().map(|conn| {
            let going_away = &going_away;
            async move {
                let _ = conn.send(going_away, timeout).await;
                conn.close().await;
            }
        }))
        .await;

        targets.len()
    }
}

/// Errors that can occur in the connection hub
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Too many connections (limit: {0})")]
    TooManyConnections(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::IdGenerator;
    use crate::websocket::frame::{decode, OVERSIZE_PAYLOAD};
    use std::net::SocketAddr;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    /// Register an in-memory connection, returning the client end of the pipe
    fn attach(hub: &ConnectionHub, ids: &IdGenerator, capacity: usize) -> (ConnectionId, DuplexStream) {
        let (client, server) = duplex(capacity);
        let conn = Arc::new(Connection::new(ids.next_id(), peer(), Box::new(server)));
        let id = conn.id();
        hub.register(conn).unwrap();
        (id, client)
    }

    async fn read_frame(client: &mut DuplexStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let frame = decode(&buf);
            if frame.is_complete() {
                return frame.payload.unwrap();
            }
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "stream closed before a full frame");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.max_payload, 1_000_000);
        assert_eq!(config.send_timeout, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let hub = ConnectionHub::new(HubConfig::default());
        let ids = IdGenerator::new();

        let (id, _client) = attach(&hub, &ids, 1024);
        assert!(hub.ids().contains(&id));
        assert_eq!(hub.connection_count(), 1);

        assert!(hub.unregister(id).is_some());
        assert!(hub.unregister(id).is_none());
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = HubConfig {
            max_connections: 2,
            ..HubConfig::default()
        };
        let hub = ConnectionHub::new(config);
        let ids = IdGenerator::new();

        let _a = attach(&hub, &ids, 64);
        let _b = attach(&hub, &ids, 64);

        let (_client, server) = duplex(64);
        let extra = Arc::new(Connection::new(ids.next_id(), peer(), Box::new(server)));
        let result = hub.register(extra);
        assert!(matches!(result, Err(HubError::TooManyConnections(2))));
    }

    #[tokio::test]
    async fn test_broadcast_empty_hub_is_noop() {
        let hub = ConnectionHub::new(HubConfig::default());
        let report = hub.broadcast(&serde_json::json!({"tick": 1})).await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let hub = ConnectionHub::new(HubConfig::default());
        let ids = IdGenerator::new();

        let mut clients: Vec<_> = (0..5).map(|_| attach(&hub, &ids, 4096).1).collect();

        let snapshot = serde_json::json!({"gameTick": 42, "planets": {}});
        let report = hub.broadcast(&snapshot).await;
        assert_eq!(report, BroadcastReport { delivered: 5, dropped: 0 });

        let expected = serde_json::to_vec(&snapshot).unwrap();
        for client in clients.iter_mut() {
            assert_eq!(read_frame(client).await, expected);
        }
    }

    #[tokio::test]
    async fn test_failed_connection_is_pruned() {
        let hub = ConnectionHub::new(HubConfig::default());
        let ids = IdGenerator::new();

        let (_good_id, mut good) = attach(&hub, &ids, 4096);
        let (bad_id, bad) = attach(&hub, &ids, 4096);
        drop(bad);

        let report = hub.broadcast(&serde_json::json!({"n": 1})).await;
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 1 });
        assert!(!hub.ids().contains(&bad_id));
        assert_eq!(hub.connection_count(), 1);

        let report = hub.broadcast(&serde_json::json!({"n": 2})).await;
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 0 });

        assert_eq!(read_frame(&mut good).await, br#"{"n":1}"#.to_vec());
    }

    #[tokio::test]
    async fn test_slow_connection_does_not_block_others() {
        let config = HubConfig {
            send_timeout: Duration::from_millis(50),
            ..HubConfig::default()
        };
        let hub = ConnectionHub::new(config);
        let ids = IdGenerator::new();

        // Too small to take the frame and never drained
        let (slow_id, _slow) = attach(&hub, &ids, 4);
        let (_fast_id, mut fast) = attach(&hub, &ids, 4096);

        let report = hub.broadcast(&serde_json::json!({"value": "abcdefgh"})).await;
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 1 });
        assert!(!hub.ids().contains(&slow_id));
        assert_eq!(read_frame(&mut fast).await, br#"{"value":"abcdefgh"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_oversized_snapshot_sends_error_indicator() {
        let config = HubConfig {
            max_payload: 16,
            ..HubConfig::default()
        };
        let hub = ConnectionHub::new(config);
        let ids = IdGenerator::new();
        let (_id, mut client) = attach(&hub, &ids, 4096);

        let report = hub.broadcast(&"x".repeat(100)).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(read_frame(&mut client).await, OVERSIZE_PAYLOAD.to_vec());
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let hub = ConnectionHub::new(HubConfig::default());
        let ids = IdGenerator::new();
        let mut clients: Vec<_> = (0..3).map(|_| attach(&hub, &ids, 1024).1).collect();

        assert_eq!(hub.close_all().await, 3);
        assert!(hub.is_empty());

        for client in clients.iter_mut() {
            let mut buf = Vec::new();
            client.read_to_end(&mut buf).await.unwrap();
            let frame = decode(&buf);
            assert_eq!(frame.opcode, Opcode::Close);
            assert_eq!(frame.payload, Some(1001u16.to_be_bytes().to_vec()));
            assert_eq!(frame.consumed, buf.len());
        }
    }

    #[tokio::test]
    async fn test_close_all_stalled_peers_bounded_by_one_timeout() {
        let send_timeout = Duration::from_millis(100);
        let hub = ConnectionHub::new(HubConfig {
            send_timeout,
            ..HubConfig::default()
        });
        let ids = IdGenerator::new();

        // One-byte pipes that nobody reads: every close frame write stalls
        let _clients: Vec<_> = (0..8).map(|_| attach(&hub, &ids, 1).1).collect();

        let started = std::time::Instant::now();
        assert_eq!(hub.close_all().await, 8);
        let elapsed = started.elapsed();

        assert!(hub.is_empty());
        assert!(
            elapsed < send_timeout * 3,
            "close_all took {:?} for 8 stalled peers",
            elapsed
        );
    }
}
