//! Streaming Server
//!
//! Owns the listening socket and the lifecycle of every connection:
//!
//! ```text
//! Stopped ──start──▶ Starting ──bind ok──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                        └──bind failed──▶ Stopped
//! ```
//!
//! Each accepted stream gets its own task for the upgrade handshake and the
//! read loop, so a slow client never stalls the accept loop. Shutdown is
//! cooperative: a watch channel tells every task to finish.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::ServerConfig;
use crate::error::{ServerError, StreamError};
use crate::websocket::{
    handle_connection, negotiate, BroadcastReport, Connection, ConnectionHub, IdGenerator,
};

/// Lifecycle state of the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Handles that exist only while the server is running
struct Running {
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Shared by the accept loop and every connection task
#[derive(Clone)]
struct AcceptContext {
    hub: Arc<ConnectionHub>,
    ids: Arc<IdGenerator>,
    config: ServerConfig,
}

/// WebSocket snapshot server
pub struct StreamServer {
    config: ServerConfig,
    hub: Arc<ConnectionHub>,
    ids: Arc<IdGenerator>,
    state: RwLock<ServerState>,
    running: Mutex<Option<Running>>,
}

impl StreamServer {
    /// Create a stopped server
    pub fn new(config: ServerConfig) -> Self {
        Self {
            hub: Arc::new(ConnectionHub::new(config.hub_config())),
            ids: Arc::new(IdGenerator::new()),
            config,
            state: RwLock::new(ServerState::Stopped),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Bound address while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Get the current connection count
    pub fn connection_count(&self) -> usize {
        self.hub.connection_count()
    }

    /// Bind the listening socket and start accepting connections
    ///
    /// A bind failure is returned to the caller and leaves the server stopped.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Stopped {
                return Err(ServerError::AlreadyRunning);
            }
            *state = ServerState::Starting;
        }

        match self.bind_and_spawn().await {
            Ok(running) => {
                let local_addr = running.local_addr;
                *self.running.lock().await = Some(running);
                *self.state.write().await = ServerState::Running;
                tracing::info!("Snapshot stream listening on ws://{}", local_addr);
                Ok(local_addr)
            }
            Err(e) => {
                *self.state.write().await = ServerState::Stopped;
                tracing::error!(error = %e, "Failed to start snapshot stream");
                Err(e)
            }
        }
    }

    async fn bind_and_spawn(&self) -> Result<Running, ServerError> {
        let addr = self.config.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let context = AcceptContext {
            hub: Arc::clone(&self.hub),
            ids: Arc::clone(&self.ids),
            config: self.config.clone(),
        };
        let accept_task = tokio::spawn(accept_loop(listener, context, shutdown_rx));

        Ok(Running {
            shutdown,
            accept_task,
            local_addr,
        })
    }

    /// Stop accepting, close every connection and wait for the accept loop
    ///
    /// The wait is bounded by the configured shutdown timeout. Stopping a
    /// server that is not running does nothing.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Running {
                return;
            }
            *state = ServerState::Stopping;
        }

        tracing::info!("Stopping snapshot stream...");

        let running = self.running.lock().await.take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            let closed = self.hub.close_all().await;

            let timeout = self.config.shutdown_timeout();
            if tokio::time::timeout(timeout, running.accept_task).await.is_err() {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Accept loop did not exit in time"
                );
            }

            // Anything that finished its handshake during shutdown
            let late = self.hub.close_all().await;
            tracing::info!(connections = closed + late, "Closed connections");
        }

        *self.state.write().await = ServerState::Stopped;
        tracing::info!("Snapshot stream stopped");
    }

    /// Serialize `snapshot` once and push it to every subscriber
    pub async fn broadcast<T>(&self, snapshot: &T) -> BroadcastReport
    where
        T: Serialize + ?Sized,
    {
        self.hub.broadcast(snapshot).await
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: AcceptContext,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "Accepted connection");
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        context.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Error accepting connection");
                }
            },
            // Reap finished connection tasks
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    tracing::debug!(pending = connections.len(), "Accept loop stopped, draining connection tasks");
    while connections.join_next().await.is_some() {}
}

/// Upgrade one accepted stream and run its handler
async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    context: AcceptContext,
    mut shutdown: watch::Receiver<bool>,
) {
    let max_request = context.config.handshake_buffer_bytes;
    let handshake = tokio::time::timeout(
        context.config.handshake_timeout(),
        negotiate(&mut stream, max_request),
    );

    let buffered = tokio::select! {
        _ = shutdown.changed() => return,
        result = handshake => match result {
            Ok(Ok(buffered)) => buffered,
            Ok(Err(e)) => {
                let e = StreamError::handshake(peer, e);
                tracing::debug!(error = %e, "Dropping connection");
                return;
            }
            Err(_) => {
                let e = StreamError::handshake(peer, "timed out");
                tracing::debug!(error = %e, "Dropping connection");
                return;
            }
        },
    };

    if *shutdown.borrow() {
        return;
    }

    if let Err(e) = stream.set_nodelay(true) {
        tracing::trace!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let (reader, writer) = stream.into_split();
    let conn = Arc::new(Connection::new(context.ids.next_id(), peer, Box::new(writer)));

    if let Err(e) = context.hub.register(Arc::clone(&conn)) {
        tracing::warn!(peer = %peer, error = %e, "Rejecting connection");
        conn.close().await;
        return;
    }

    handle_connection(conn, reader, buffered, context.hub, shutdown).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Subscriber;
    use crate::websocket::{decode, encode_masked, Opcode};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..ServerConfig::default()
        }
    }

    async fn started() -> (Arc<StreamServer>, SocketAddr) {
        let server = Arc::new(StreamServer::new(test_config()));
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    async fn wait_for_connections(server: &StreamServer, expected: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while server.connection_count() != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {} connections, have {}",
                expected,
                server.connection_count()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let server = StreamServer::new(test_config());
        assert_eq!(server.state().await, ServerState::Stopped);
        assert!(server.local_addr().await.is_none());

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.state().await, ServerState::Running);
        assert_eq!(server.local_addr().await, Some(addr));

        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));

        server.stop().await;
        assert_eq!(server.state().await, ServerState::Stopped);
        assert!(server.local_addr().await.is_none());

        // Listener is released
        assert!(TcpStream::connect(addr).await.is_err());

        // Stop is idempotent and the server can start again
        server.stop().await;
        server.start().await.unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let (first, addr) = started().await;

        let second = StreamServer::new(ServerConfig {
            port: addr.port(),
            ..ServerConfig::default()
        });
        let result = second.start().await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
        assert_eq!(second.state().await, ServerState::Stopped);

        first.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let (server, addr) = started().await;

        let mut subscribers = Vec::new();
        for _ in 0..4 {
            subscribers.push(Subscriber::connect(&addr.to_string()).await.unwrap());
        }
        wait_for_connections(&server, 4).await;

        let snapshot = json!({ "gameTick": 1, "planets": { "1": { "planetName": "Alpha" } } });
        let report = server.broadcast(&snapshot).await;
        assert_eq!(report, BroadcastReport { delivered: 4, dropped: 0 });

        let expected = serde_json::to_vec(&snapshot).unwrap();
        for subscriber in subscribers.iter_mut() {
            assert_eq!(subscriber.next_message().await.unwrap(), expected);
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_removed() {
        let (server, addr) = started().await;

        let mut stay = Subscriber::connect(&addr.to_string()).await.unwrap();
        let leave = Subscriber::connect(&addr.to_string()).await.unwrap();
        wait_for_connections(&server, 2).await;

        leave.close().await.unwrap();
        wait_for_connections(&server, 1).await;

        let report = server.broadcast(&json!({ "n": 1 })).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(stay.next_message().await.unwrap(), br#"{"n":1}"#.to_vec());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_ping_over_tcp() {
        let (server, addr) = started().await;
        let mut subscriber = Subscriber::connect(&addr.to_string()).await.unwrap();
        wait_for_connections(&server, 1).await;

        let pong = subscriber.ping(b"hb").await.unwrap();
        assert_eq!(pong, b"hb".to_vec());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_missing_key_gets_no_response() {
        let (server, addr) = started().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut response))
            .await
            .expect("server kept the connection open");
        assert!(response.is_empty());
        assert_eq!(server.connection_count(), 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_every_connection() {
        let (server, addr) = started().await;

        let mut subscribers = Vec::new();
        for _ in 0..3 {
            subscribers.push(Subscriber::connect(&addr.to_string()).await.unwrap());
        }
        wait_for_connections(&server, 3).await;

        tokio::time::timeout(Duration::from_secs(2), server.stop())
            .await
            .expect("stop exceeded its bound");
        assert_eq!(server.connection_count(), 0);

        for subscriber in subscribers.iter_mut() {
            let result = tokio::time::timeout(Duration::from_secs(1), subscriber.next_message())
                .await
                .unwrap();
            assert!(result.is_err());
        }
    }

    #[tokio::test]
    async fn test_raw_client_frames() {
        let (server, addr) = started().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
                  Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();

        let mut buf = Vec::new();
        let mut chunk = [0u8; 512];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0);
            buf.extend_from_slice(&chunk[..n]);
        }
        let head = String::from_utf8_lossy(&buf);
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        stream
            .write_all(&encode_masked(b"", Opcode::Close, [1, 2, 3, 4]))
            .await
            .unwrap();

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(decode(&rest).opcode, Opcode::Close);
        assert_eq!(server.connection_count(), 0);

        server.stop().await;
    }
}
