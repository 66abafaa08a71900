//! WebSocket Upgrade Handshake
//!
//! Reads the client's HTTP/1.1 upgrade request, derives the accept token from
//! its `Sec-WebSocket-Key` and writes the `101 Switching Protocols` response.
//! A failed handshake writes nothing; the caller simply drops the stream.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{StreamError, StreamResult};

/// GUID appended to the client key before hashing (RFC 6455 section 1.3)
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default bound on the size of the upgrade request
pub const DEFAULT_HANDSHAKE_BUFFER: usize = 4096;

const KEY_HEADER: &str = "sec-websocket-key";
const REQUEST_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Compute the `Sec-WebSocket-Accept` token for a client key
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Value of the first header called `name` (case-insensitive), if non-empty
pub fn find_header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.split_once(':'))
        .find(|(header, _)| header.trim().eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

/// Find the client nonce in a raw request
pub fn find_client_key(request: &str) -> Option<&str> {
    find_header(request, KEY_HEADER)
}

/// Build the raw `101` response for an accept token
pub fn upgrade_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept
    )
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(REQUEST_TERMINATOR.len())
        .position(|window| window == REQUEST_TERMINATOR)
        .map(|pos| pos + REQUEST_TERMINATOR.len())
}

/// Upgrade request split at the end of its header block
#[derive(Debug)]
pub struct UpgradeRequest {
    pub head: String,
    /// Bytes received after the blank line
    pub trailing: Vec<u8>,
}

/// Read an HTTP request head of at most `max_bytes`
pub async fn read_request<R>(reader: &mut R, max_bytes: usize) -> StreamResult<UpgradeRequest>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(max_bytes.min(DEFAULT_HANDSHAKE_BUFFER));
    let mut chunk = vec![0u8; max_bytes.min(DEFAULT_HANDSHAKE_BUFFER).max(1)];

    loop {
        let remaining = max_bytes - buf.len();
        if remaining == 0 {
            return Err(StreamError::RequestTooLarge(max_bytes));
        }

        let limit = remaining.min(chunk.len());
        let n = reader.read(&mut chunk[..limit]).await?;
        if n == 0 {
            return Err(StreamError::Handshake(
                "connection closed before request completed".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_terminator(&buf) {
            let trailing = buf.split_off(end);
            let head = String::from_utf8(buf)
                .map_err(|_| StreamError::Handshake("request is not valid UTF-8".to_string()))?;
            return Ok(UpgradeRequest { head, trailing });
        }
    }
}

/// Run the server side of the handshake on `stream`
///
/// Returns any bytes the client sent after its request, which belong to the
/// frame stream.
pub async fn negotiate<S>(stream: &mut S, max_bytes: usize) -> StreamResult<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = read_request(stream, max_bytes).await?;
    let key = find_client_key(&request.head).ok_or(StreamError::MissingKey)?;

    let response = upgrade_response(&accept_key(key));
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    Ok(request.trailing)
}
