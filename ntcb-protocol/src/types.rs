//! Shared type definitions for the NTCB/FLEX protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

/// NTCB preamble: "@NTC".
pub const PREAMBLE: [u8; 4] = *b"@NTC";

/// NTCB header size: 4 (preamble) + 4 (recipient) + 4 (sender) + 2 (length) + 1 + 1 (checksums).
pub const NTCB_HEADER_SIZE: usize = 16;

/// Largest payload an NTCB header can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// FLEX protocol identifier byte.
pub const FLEX_PROTOCOL_ID: u8 = 0xB0;

/// FLEX announcement sent by a terminal.
pub const FLEX_MARKER_FROM_DEVICE: [u8; 6] = *b"*>FLEX";

/// FLEX announcement sent by a server.
pub const FLEX_MARKER_FROM_SERVER: [u8; 6] = *b"*<FLEX";

/// Streaming frame marker ('~').
pub const FRAME_MARKER: u8 = 0x7E;

/// Keepalive byte.
pub const PING_BYTE: u8 = 0x7F;

/// Upper bound on bytes held while waiting for a frame to complete (64 KB).
pub const MAX_STREAM_BUFFER: usize = 64 * 1024;

/// Decoded NTCB transport header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtcbHeader {
    /// Identifier of the receiving side.
    pub recipient: u32,
    /// Identifier of the sending side.
    pub sender: u32,
    /// Payload length in bytes.
    pub payload_len: u16,
    /// XOR of all payload bytes.
    pub payload_checksum: u8,
    /// XOR of the preceding 15 header bytes.
    pub header_checksum: u8,
}

/// FLEX protocol / structure generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlexVersion {
    #[serde(rename = "1.0")]
    V1_0,
    #[serde(rename = "2.0")]
    V2_0,
    #[serde(rename = "3.0")]
    V3_0,
}

impl FlexVersion {
    /// Map a version byte (0x0A / 0x14 / 0x1E) to a known generation.
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x0A => Some(FlexVersion::V1_0),
            0x14 => Some(FlexVersion::V2_0),
            0x1E => Some(FlexVersion::V3_0),
            _ => None,
        }
    }

    /// Wire representation of this version.
    pub fn as_byte(self) -> u8 {
        match self {
            FlexVersion::V1_0 => 0x0A,
            FlexVersion::V2_0 => 0x14,
            FlexVersion::V3_0 => 0x1E,
        }
    }

    /// Bitmask width in bytes for this structure version.
    pub fn mask_width(self) -> usize {
        match self {
            FlexVersion::V1_0 => 9,
            FlexVersion::V2_0 => 16,
            FlexVersion::V3_0 => 32,
        }
    }

    /// Number of fields defined by this structure version.
    pub fn field_count(self) -> usize {
        match self {
            FlexVersion::V1_0 => 69,
            FlexVersion::V2_0 => 122,
            FlexVersion::V3_0 => 255,
        }
    }
}

impl fmt::Display for FlexVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlexVersion::V1_0 => "1.0",
            FlexVersion::V2_0 => "2.0",
            FlexVersion::V3_0 => "3.0",
        };
        f.write_str(s)
    }
}

/// Streaming frame type, selected by the byte following `~`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// `~A`: counted batch of current records.
    Batch,
    /// `~C`: single current record.
    Current,
    /// `~T`: single record with an out-of-order event index.
    Indexed,
    /// `~E`: counted batch of additional records.
    ExtraBatch,
    /// `~X`: single additional record with an event index.
    ExtraIndexed,
}

impl FrameKind {
    pub fn from_type_byte(value: u8) -> Option<Self> {
        match value {
            b'A' => Some(FrameKind::Batch),
            b'C' => Some(FrameKind::Current),
            b'T' => Some(FrameKind::Indexed),
            b'E' => Some(FrameKind::ExtraBatch),
            b'X' => Some(FrameKind::ExtraIndexed),
            _ => None,
        }
    }

    pub fn type_byte(self) -> u8 {
        match self {
            FrameKind::Batch => b'A',
            FrameKind::Current => b'C',
            FrameKind::Indexed => b'T',
            FrameKind::ExtraBatch => b'E',
            FrameKind::ExtraIndexed => b'X',
        }
    }

    /// True for frames carrying an explicit record count byte.
    pub fn has_count(self) -> bool {
        matches!(self, FrameKind::Batch | FrameKind::ExtraBatch)
    }

    /// True for frames carrying a 4-byte event index.
    pub fn has_event_index(self) -> bool {
        matches!(self, FrameKind::Indexed | FrameKind::ExtraIndexed)
    }

    /// True for the secondary ("additional") record set.
    pub fn is_extra(self) -> bool {
        matches!(self, FrameKind::ExtraBatch | FrameKind::ExtraIndexed)
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "~{}", self.type_byte() as char)
    }
}
