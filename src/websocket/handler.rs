//! WebSocket Connection Handler
//!
//! Drives the read side of one upgraded connection. The stream is push-only:
//! inbound traffic is limited to control frames. Pings are answered, a close
//! frame ends the connection and everything else is ignored. The loop also
//! ends as soon as the connection is closed elsewhere, e.g. when a broadcast
//! drops it.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use super::connection::Connection;
use super::frame::{encode_frame, DecodedFrame, Opcode, MAX_CONTROL_PAYLOAD};
use super::hub::ConnectionHub;
use crate::error::StreamError;

const READ_CHUNK: usize = 4096;

/// Why a handler loop ended
#[derive(Debug)]
enum Exit {
    /// Peer sent a close frame
    CloseFrame,
    /// Peer closed the TCP stream
    Eof,
    /// Server is stopping
    Shutdown,
    /// Connection was closed from the server side
    Dropped,
    Error(StreamError),
}

/// What to do after handling one frame
enum Next {
    Continue,
    Stop(Exit),
}

/// Run the read loop for `conn` until it closes or the server stops
///
/// `buffered` holds any bytes read past the end of the upgrade request. On
/// return the connection has been removed from `hub` and closed.
pub async fn handle_connection<R>(
    conn: Arc<Connection>,
    mut reader: R,
    buffered: Vec<u8>,
    hub: Arc<ConnectionHub>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let exit = read_loop(&conn, &mut reader, buffered, &hub, &mut shutdown).await;

    match &exit {
        Exit::CloseFrame => {
            tracing::debug!(connection_id = %conn.id(), "Client requested close")
        }
        Exit::Eof => tracing::debug!(connection_id = %conn.id(), "Client closed stream"),
        Exit::Shutdown => tracing::debug!(connection_id = %conn.id(), "Server stopping"),
        Exit::Dropped => tracing::debug!(connection_id = %conn.id(), "Connection dropped by server"),
        Exit::Error(e) => {
            tracing::debug!(connection_id = %conn.id(), error = %e, "Connection error")
        }
    }

    hub.unregister(conn.id());
    conn.close().await;
}

async fn read_loop<R>(
    conn: &Connection,
    reader: &mut R,
    mut buffer: Vec<u8>,
    hub: &ConnectionHub,
    shutdown: &mut watch::Receiver<bool>,
) -> Exit
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        // Drain every complete frame already buffered
        loop {
            let frame = match hub.codec().decode_checked(&buffer) {
                Ok(frame) => frame,
                Err(e) => return Exit::Error(e),
            };
            if !frame.is_complete() {
                break;
            }
            buffer.drain(..frame.consumed);

            if let Next::Stop(exit) = handle_frame(conn, frame, hub).await {
                return exit;
            }
        }

        if *shutdown.borrow() {
            return Exit::Shutdown;
        }
        if !conn.is_alive() {
            return Exit::Dropped;
        }

        tokio::select! {
            // Sender dropped counts as a stop too
            _ = shutdown.changed() => return Exit::Shutdown,
            _ = conn.closed() => return Exit::Dropped,
            read = reader.read(&mut chunk) => match read {
                Ok(0) => return Exit::Eof,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) => return Exit::Error(StreamError::Io(e)),
            },
        }
    }
}

async fn handle_frame(conn: &Connection, frame: DecodedFrame, hub: &ConnectionHub) -> Next {
    let payload = frame.payload.unwrap_or_default();
    let timeout = hub.config().send_timeout;

    if frame.opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
        return Next::Stop(Exit::Error(StreamError::Protocol(format!(
            "{:?} frame carries {} bytes, limit {}",
            frame.opcode,
            payload.len(),
            MAX_CONTROL_PAYLOAD
        ))));
    }

    match frame.opcode {
        Opcode::Ping => {
            let pong = encode_frame(&payload, Opcode::Pong);
            match conn.send(&pong, timeout).await {
                Ok(()) => Next::Continue,
                Err(e) => Next::Stop(Exit::Error(e)),
            }
        }
        Opcode::Close => {
            // Echo the status code back, best effort
            let code = payload.get(..2).unwrap_or(&[]);
            if let Err(e) = conn.send(&encode_frame(code, Opcode::Close), timeout).await {
                tracing::trace!(connection_id = %conn.id(), error = %e, "Close reply failed");
            }
            Next::Stop(Exit::CloseFrame)
        }
        other => {
            tracing::trace!(
                connection_id = %conn.id(),
                opcode = ?other,
                len = payload.len(),
                "Ignoring inbound frame"
            );
            Next::Continue
        }
    }
}
