//! NTCB transport framing and FLEX telemetry decoding.
//!
//! This crate implements the binary protocol spoken by vehicle tracking
//! terminals: the NTCB transport header used for the handshake and
//! capability exchange, the FLEX bitmask that selects which telemetry
//! fields a terminal sends, and the `~`-prefixed streaming frames that carry
//! the records themselves.
//!
//! # NTCB Frame Format
//!
//! ```text
//! +----------+-----------+--------+--------+--------+--------+-----------+
//! | Preamble | Recipient | Sender | Length | P.csum | H.csum |  Payload  |
//! |  "@NTC"  |  u32 LE   | u32 LE | u16 LE |   u8   |   u8   | (Length)  |
//! +----------+-----------+--------+--------+--------+--------+-----------+
//! ```
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use ntcb_protocol::{
//!     encode, encode_frame, decode_message, parse_bitmask_announcement, FrameKind,
//!     FrameReassembler, StreamEvent,
//! };
//!
//! // Bitmask announcement selecting fields #1, #13 and #14 (FLEX 1.0).
//! let payload = b"*>FLEX\xB0\x0A\x0A\x45\x80\x0C\x00\x00\x00\x00\x00\x00\x00";
//! let wire = encode(1, 42, payload);
//! let (msg, _) = decode_message(&wire).unwrap().unwrap();
//! let announcement = parse_bitmask_announcement(&msg.payload).unwrap();
//! assert_eq!(announcement.layout.record_length, 10);
//!
//! // Decode a streaming `~C` frame with that layout.
//! let mut record = Vec::new();
//! record.extend_from_slice(&7u32.to_le_bytes());
//! record.extend_from_slice(&42.5f32.to_le_bytes());
//! record.extend_from_slice(&90u16.to_le_bytes());
//! let frame = encode_frame(FrameKind::Current, None, &[&record[..]]);
//!
//! let mut reassembler = FrameReassembler::with_layout(announcement.layout);
//! let mut buf = BytesMut::from(&frame[..]);
//! let Some(StreamEvent::Frame(frame)) = reassembler.decode(&mut buf).unwrap() else {
//!     panic!("expected a frame");
//! };
//! assert_eq!(frame.records[0].len(), 3);
//! ```

pub mod checksum;
pub mod codec;
pub mod error;
pub mod fields;
pub mod flex;
pub mod stream;
pub mod types;

pub use checksum::{crc8, xor8};
pub use codec::{
    decode_header, decode_message, encode, is_handshake, parse_handshake, Handshake, NtcbMessage,
    HANDSHAKE_ACK, HANDSHAKE_REQUEST,
};
pub use error::ProtocolError;
pub use fields::{
    decode_record, field_spec, DecodedField, FieldKind, FieldSpec, FieldValue, TelemetryRecord,
    FIELD_TABLE,
};
pub use flex::{
    is_bitmask_announcement, parse_bitmask_announcement, BitmaskAnnouncement, FlexDirection,
    RecordLayout,
};
pub use stream::{
    encode_ack, encode_frame, FrameReassembler, FrameRecords, ReassemblerStats, StreamEvent,
};
pub use types::{
    FlexVersion, FrameKind, NtcbHeader, FLEX_PROTOCOL_ID, FRAME_MARKER, MAX_PAYLOAD_LEN,
    MAX_STREAM_BUFFER, NTCB_HEADER_SIZE, PING_BYTE, PREAMBLE,
};
