//! NTCB transport framing.
//!
//! Frame format:
//! ```text
//! +----------+-----------+--------+--------+--------+--------+-----------+
//! | Preamble | Recipient | Sender | Length | P.csum | H.csum |  Payload  |
//! |  "@NTC"  |  u32 LE   | u32 LE | u16 LE |   u8   |   u8   | (Length)  |
//! +----------+-----------+--------+--------+--------+--------+-----------+
//! ```
//!
//! `P.csum` is the XOR of the payload, `H.csum` the XOR of the first 15
//! header bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::checksum::xor8;
use crate::error::ProtocolError;
use crate::types::{NtcbHeader, MAX_PAYLOAD_LEN, NTCB_HEADER_SIZE, PREAMBLE};

/// Handshake request prefix sent by a terminal.
pub const HANDSHAKE_REQUEST: &[u8] = b"*>S";

/// Handshake answer payload.
pub const HANDSHAKE_ACK: &[u8] = b"*<S";

/// Try to decode an NTCB header from the buffer.
/// Returns None if there's not enough data yet.
pub fn decode_header(buf: &[u8]) -> Result<Option<NtcbHeader>, ProtocolError> {
    if buf.len() < NTCB_HEADER_SIZE {
        return Ok(None);
    }

    let mut preamble = [0u8; 4];
    preamble.copy_from_slice(&buf[0..4]);
    if preamble != PREAMBLE {
        return Err(ProtocolError::InvalidPreamble(preamble));
    }

    let expected = xor8(&buf[..NTCB_HEADER_SIZE - 1]);
    let actual = buf[NTCB_HEADER_SIZE - 1];
    if expected != actual {
        return Err(ProtocolError::HeaderChecksum { expected, actual });
    }

    Ok(Some(NtcbHeader {
        recipient: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        sender: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        payload_len: u16::from_le_bytes([buf[12], buf[13]]),
        payload_checksum: buf[14],
        header_checksum: actual,
    }))
}

impl NtcbHeader {
    /// Total frame size (header + payload).
    pub fn frame_len(&self) -> usize {
        NTCB_HEADER_SIZE + self.payload_len as usize
    }

    /// Check a received payload against the header's payload checksum.
    pub fn payload_matches(&self, payload: &[u8]) -> bool {
        xor8(payload) == self.payload_checksum
    }
}

/// A complete NTCB message pulled from a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtcbMessage {
    pub header: NtcbHeader,
    pub payload: Bytes,
    /// False when the payload checksum did not match. The payload is still
    /// usable since its length came from a trusted header.
    pub checksum_ok: bool,
}

/// Try to decode a complete NTCB message from the start of `buf`.
///
/// Returns the message and the number of bytes it occupied, or None if the
/// buffer does not hold the whole message yet.
pub fn decode_message(buf: &[u8]) -> Result<Option<(NtcbMessage, usize)>, ProtocolError> {
    let Some(header) = decode_header(buf)? else {
        return Ok(None);
    };
    let total = header.frame_len();
    if buf.len() < total {
        return Ok(None);
    }
    let payload = Bytes::copy_from_slice(&buf[NTCB_HEADER_SIZE..total]);
    let checksum_ok = header.payload_matches(&payload);
    Ok(Some((
        NtcbMessage {
            header,
            payload,
            checksum_ok,
        },
        total,
    )))
}

/// Wrap a payload in an NTCB header.
///
/// The length field is 16 bits wide: callers must keep `payload` within
/// [`MAX_PAYLOAD_LEN`] bytes.
pub fn encode(recipient: u32, sender: u32, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_PAYLOAD_LEN, "NTCB payload too long");
    let mut buf = BytesMut::with_capacity(NTCB_HEADER_SIZE + payload.len());
    buf.put_slice(&PREAMBLE);
    buf.put_u32_le(recipient);
    buf.put_u32_le(sender);
    buf.put_u16_le(payload.len() as u16);
    buf.put_u8(xor8(payload));
    let header_checksum = xor8(&buf);
    buf.put_u8(header_checksum);
    buf.put_slice(payload);
    buf.freeze()
}

/// Handshake request sent by a terminal right after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Textual device identifier (usually the IMEI). Empty if the firmware
    /// did not send one.
    pub device_id: String,
}

/// Returns true if the payload looks like a handshake request.
pub fn is_handshake(payload: &[u8]) -> bool {
    payload.starts_with(HANDSHAKE_REQUEST)
}

/// Parse a `*>S:<id>` handshake payload.
///
/// Missing prefix or identifier is tolerated and yields an empty id.
pub fn parse_handshake(payload: &[u8]) -> Handshake {
    let device_id = payload
        .strip_prefix(HANDSHAKE_REQUEST)
        .and_then(|rest| rest.strip_prefix(b":"))
        .map(|id| {
            String::from_utf8_lossy(id)
                .trim_matches(|c: char| c == '\0' || c.is_whitespace())
                .to_string()
        })
        .unwrap_or_default();
    Handshake { device_id }
}
