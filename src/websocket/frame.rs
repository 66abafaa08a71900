//! WebSocket Frame Codec
//!
//! Pure encode/decode of WebSocket frames (RFC 6455 section 5.2):
//!
//! ```text
//!  0                   1                   2                   3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |           (16/64)             |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Masking-key, if MASK set (4)      |     Payload Data      |
//! +---------------------------------------+-----------------------+
//! ```
//!
//! Outbound frames are never fragmented and never masked. Inbound frames from
//! clients are masked and are unmasked during decode.

use crate::error::{StreamError, StreamResult};

/// Default cap on a single outbound payload (bytes)
pub const DEFAULT_MAX_PAYLOAD: usize = 1_000_000;

/// Largest payload a control frame may carry (RFC 6455 section 5.5)
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Payload sent in place of a snapshot that exceeds the cap
pub const OVERSIZE_PAYLOAD: &[u8] = br#"{"error":"payload_too_large"}"#;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0F;
const LEN_MASK: u8 = 0x7F;

/// Largest length that fits in the 7-bit field
const MAX_SHORT_LEN: usize = 125;
/// Marker for a 16-bit extended length
const LEN_MARKER_16: u8 = 126;
/// Marker for a 64-bit extended length
const LEN_MARKER_64: u8 = 127;

/// Frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Opcode value reserved by the protocol
    Reserved(u8),
    /// No complete frame is available yet
    Invalid,
}

impl Opcode {
    /// Parse the low nibble of the first header byte
    pub fn from_u8(byte: u8) -> Self {
        match byte & OPCODE_MASK {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    /// Wire value of this opcode
    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Reserved(value) => value & OPCODE_MASK,
            // Never written; 0xF is reserved on the wire
            Opcode::Invalid => 0xF,
        }
    }

    /// Ping, pong and close
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// Result of decoding the front of a byte buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub opcode: Opcode,
    pub fin: bool,
    /// Unmasked payload, `None` when no complete frame was available
    pub payload: Option<Vec<u8>>,
    /// Number of bytes this frame occupied in the input
    pub consumed: usize,
}

impl DecodedFrame {
    fn incomplete() -> Self {
        Self {
            opcode: Opcode::Invalid,
            fin: false,
            payload: None,
            consumed: 0,
        }
    }

    /// Whether a full frame was decoded
    pub fn is_complete(&self) -> bool {
        self.opcode != Opcode::Invalid
    }
}

/// Parsed frame header
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    fin: bool,
    opcode: Opcode,
    mask_key: Option<[u8; 4]>,
    payload_len: u64,
    header_len: usize,
}

/// Parse the header at the front of `bytes`, or `None` if it is not fully buffered
fn parse_header(bytes: &[u8]) -> Option<FrameHeader> {
    if bytes.len() < 2 {
        return None;
    }

    let fin = bytes[0] & FIN_BIT != 0;
    let opcode = Opcode::from_u8(bytes[0]);
    let masked = bytes[1] & MASK_BIT != 0;
    let base_len = bytes[1] & LEN_MASK;

    let mut offset = 2;
    let payload_len = match base_len {
        LEN_MARKER_16 => {
            let ext = bytes.get(offset..offset + 2)?;
            offset += 2;
            u16::from_be_bytes([ext[0], ext[1]]) as u64
        }
        LEN_MARKER_64 => {
            let ext: [u8; 8] = bytes.get(offset..offset + 8)?.try_into().ok()?;
            offset += 8;
            u64::from_be_bytes(ext)
        }
        short => short as u64,
    };

    let mask_key = if masked {
        let key: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
        offset += 4;
        Some(key)
    } else {
        None
    };

    Some(FrameHeader {
        fin,
        opcode,
        mask_key,
        payload_len,
        header_len: offset,
    })
}

/// Header length for a payload of `len` bytes
pub fn header_len(len: usize, masked: bool) -> usize {
    let base = if len <= MAX_SHORT_LEN {
        2
    } else if len <= u16::MAX as usize {
        4
    } else {
        10
    };
    if masked {
        base + 4
    } else {
        base
    }
}

fn write_header(buf: &mut Vec<u8>, opcode: Opcode, mask_bit: u8, len: usize) {
    buf.push(FIN_BIT | opcode.as_u8());
    if len <= MAX_SHORT_LEN {
        buf.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        buf.push(mask_bit | LEN_MARKER_16);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(mask_bit | LEN_MARKER_64);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// XOR `data` in place with the cycling 4-byte key
fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encode a single unmasked frame with FIN set
pub fn encode_frame(payload: &[u8], opcode: Opcode) -> Vec<u8> {
    let mut buf = Vec::with_capacity(header_len(payload.len(), false) + payload.len());
    write_header(&mut buf, opcode, 0, payload.len());
    buf.extend_from_slice(payload);
    buf
}

/// Encode a single masked frame with FIN set, as a client sends it
pub fn encode_masked(payload: &[u8], opcode: Opcode, mask_key: [u8; 4]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(header_len(payload.len(), true) + payload.len());
    write_header(&mut buf, opcode, MASK_BIT, payload.len());
    buf.extend_from_slice(&mask_key);
    let start = buf.len();
    buf.extend_from_slice(payload);
    apply_mask(&mut buf[start..], mask_key);
    buf
}

/// Decode the frame at the front of `bytes`
///
/// Returns an [`Opcode::Invalid`] frame with no payload when the buffer does
/// not yet hold a complete frame. Callers treat that as "read more".
pub fn decode(bytes: &[u8]) -> DecodedFrame {
    let header = match parse_header(bytes) {
        Some(header) => header,
        None => return DecodedFrame::incomplete(),
    };

    let payload_len = match usize::try_from(header.payload_len) {
        Ok(len) => len,
        Err(_) => return DecodedFrame::incomplete(),
    };
    let end = match header.header_len.checked_add(payload_len) {
        Some(end) if end <= bytes.len() => end,
        _ => return DecodedFrame::incomplete(),
    };

    let mut payload = bytes[header.header_len..end].to_vec();
    if let Some(key) = header.mask_key {
        apply_mask(&mut payload, key);
    }

    DecodedFrame {
        opcode: header.opcode,
        fin: header.fin,
        payload: Some(payload),
        consumed: end,
    }
}

/// Frame codec bound to a payload cap
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Encode an outbound frame
    ///
    /// Payloads above the cap are replaced by [`OVERSIZE_PAYLOAD`]; this never fails.
    pub fn encode(&self, payload: &[u8], opcode: Opcode) -> Vec<u8> {
        if payload.len() > self.max_payload {
            tracing::warn!(
                payload_len = payload.len(),
                max_payload = self.max_payload,
                "Payload exceeds cap, sending error indicator instead"
            );
            return encode_frame(OVERSIZE_PAYLOAD, opcode);
        }
        encode_frame(payload, opcode)
    }

    /// Decode an inbound frame, rejecting declared lengths above the cap
    ///
    /// The length check runs on the header alone, so an oversized frame is
    /// refused before its payload is buffered.
    pub fn decode_checked(&self, bytes: &[u8]) -> StreamResult<DecodedFrame> {
        if let Some(header) = parse_header(bytes) {
            if header.payload_len > self.max_payload as u64 {
                return Err(StreamError::Protocol(format!(
                    "frame length {} exceeds cap {}",
                    header.payload_len, self.max_payload
                )));
            }
        }
        Ok(decode(bytes))
    }
}
