//! Snapshot Subscriber
//!
//! Minimal client for the snapshot stream: performs the client side of the
//! upgrade, answers pings and yields each text frame. Used by the `watch`
//! command and by the server tests.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{StreamError, StreamResult};
use crate::producer::unix_seconds;
use crate::websocket::frame::{decode, encode_masked, Opcode};
use crate::websocket::handshake::{accept_key, find_header, read_request, DEFAULT_HANDSHAKE_BUFFER};

const READ_CHUNK: usize = 16 * 1024;
const CLOSE_NORMAL: u16 = 1000;

/// Frame the caller is interested in
enum Inbound {
    Message(Vec<u8>),
    Pong(Vec<u8>),
}

/// One connection to a snapshot stream
pub struct Subscriber {
    stream: TcpStream,
    buffer: Vec<u8>,
    /// Messages that arrived while waiting for a pong
    pending: VecDeque<Vec<u8>>,
    latency_ms: Option<f64>,
    last_message_at: Option<Instant>,
}

impl Subscriber {
    /// Connect to `addr` (`host:port`) and complete the upgrade
    pub async fn connect(addr: &str) -> StreamResult<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let key = BASE64.encode(rand::random::<[u8; 16]>());
        let request = format!(
            "GET / HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n",
            addr, key
        );
        stream.write_all(request.as_bytes()).await?;

        let response = read_request(&mut stream, DEFAULT_HANDSHAKE_BUFFER).await?;
        let status = response.head.lines().next().unwrap_or_default();
        if !status.starts_with("HTTP/1.1 101") {
            return Err(StreamError::Handshake(format!("unexpected status: {}", status)));
        }

        let expected = accept_key(&key);
        match find_header(&response.head, "sec-websocket-accept") {
            Some(token) if token == expected => {}
            other => {
                return Err(StreamError::Handshake(format!(
                    "bad accept token: {:?}",
                    other
                )))
            }
        }

        tracing::debug!(addr = %addr, "Subscribed to snapshot stream");

        Ok(Self {
            stream,
            buffer: response.trailing,
            pending: VecDeque::new(),
            latency_ms: None,
            last_message_at: None,
        })
    }

    /// Latency of the last snapshot, from its `timestamp` field
    pub fn latency_ms(&self) -> Option<f64> {
        self.latency_ms
    }

    /// Time since the last message arrived
    pub fn last_update_age(&self) -> Option<Duration> {
        self.last_message_at.map(|at| at.elapsed())
    }

    /// Next text or binary payload
    ///
    /// Returns [`StreamError::Closed`] once the server closes the stream.
    pub async fn next_message(&mut self) -> StreamResult<Vec<u8>> {
        let message = match self.pending.pop_front() {
            Some(message) => message,
            None => loop {
                if let Inbound::Message(message) = self.read_inbound().await? {
                    break message;
                }
            },
        };
        self.last_message_at = Some(Instant::now());
        Ok(message)
    }

    /// Next message parsed as JSON, updating the latency estimate
    pub async fn next_snapshot<T>(&mut self) -> StreamResult<T>
    where
        T: DeserializeOwned,
    {
        let bytes = self.next_message().await?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;

        if let Some(timestamp) = value.get("timestamp").and_then(|t| t.as_f64()) {
            self.latency_ms = Some((unix_seconds() - timestamp) * 1000.0);
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Send a ping and wait for the matching pong, returning its payload
    pub async fn ping(&mut self, payload: &[u8]) -> StreamResult<Vec<u8>> {
        self.write_frame(payload, Opcode::Ping).await?;
        loop {
            match self.read_inbound().await? {
                Inbound::Pong(payload) => return Ok(payload),
                Inbound::Message(message) => self.pending.push_back(message),
            }
        }
    }

    /// Send a normal close frame and shut down the write side
    pub async fn close(mut self) -> StreamResult<()> {
        self.write_frame(&CLOSE_NORMAL.to_be_bytes(), Opcode::Close).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn write_frame(&mut self, payload: &[u8], opcode: Opcode) -> StreamResult<()> {
        let frame = encode_masked(payload, opcode, rand::random());
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    async fn read_inbound(&mut self) -> StreamResult<Inbound> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let frame = decode(&self.buffer);
            if frame.is_complete() {
                self.buffer.drain(..frame.consumed);
                let payload = frame.payload.unwrap_or_default();

                match frame.opcode {
                    Opcode::Text | Opcode::Binary => return Ok(Inbound::Message(payload)),
                    Opcode::Pong => return Ok(Inbound::Pong(payload)),
                    Opcode::Ping => self.write_frame(&payload, Opcode::Pong).await?,
                    Opcode::Close => {
                        let _ = self
                            .write_frame(&CLOSE_NORMAL.to_be_bytes(), Opcode::Close)
                            .await;
                        return Err(StreamError::Closed);
                    }
                    _ => {}
                }
                continue;
            }

            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(StreamError::Closed);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Exponential backoff between reconnection attempts
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based), or `None` once attempts run out
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = self.backoff_factor.powi(attempt as i32 - 1);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Some(Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_backoff() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), None);
        assert_eq!(policy.delay(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay(5), Some(Duration::from_secs(16)));
        assert_eq!(policy.delay(6), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay(10), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay(11), None);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to find a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = Subscriber::connect(&addr.to_string()).await;
        assert!(matches!(result, Err(StreamError::Io(_))));
    }

    #[tokio::test]
    async fn test_rejects_non_upgrade_response() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut stream, DEFAULT_HANDSHAKE_BUFFER).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let result = Subscriber::connect(&addr.to_string()).await;
        assert!(matches!(result, Err(StreamError::Handshake(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_latency_from_timestamp() {
        use crate::config::ServerConfig;
        use crate::producer::TimestampedSnapshot;
        use crate::server::StreamServer;

        let server = StreamServer::new(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        });
        let addr = server.start().await.unwrap();

        let mut subscriber = Subscriber::connect(&addr.to_string()).await.unwrap();
        while server.connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stamped = TimestampedSnapshot::now(serde_json::json!({ "gameTick": 9 }));
        server.broadcast(&stamped).await;

        let value: serde_json::Value = subscriber.next_snapshot().await.unwrap();
        assert_eq!(value["gameTick"], 9);
        let latency = subscriber.latency_ms().unwrap();
        assert!((-1000.0..1000.0).contains(&latency));
        assert!(subscriber.last_update_age().is_some());

        server.stop().await;
    }
}
