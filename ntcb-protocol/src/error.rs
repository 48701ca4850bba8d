//! Error types for the NTCB/FLEX protocol engine.

use thiserror::Error;

/// Protocol-level errors raised while framing or negotiating.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Invalid preamble in an NTCB header.
    #[error("Invalid NTCB preamble: expected '@NTC', got {0:?}")]
    InvalidPreamble([u8; 4]),

    /// NTCB header checksum did not match the first 15 header bytes.
    #[error("NTCB header checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    HeaderChecksum { expected: u8, actual: u8 },

    /// Not enough bytes to decode the structure.
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// FLEX payload does not start with a known marker.
    #[error("Invalid FLEX marker: {0:?}")]
    InvalidFlexMarker([u8; 6]),

    /// Protocol identifier byte is not FLEX.
    #[error("Unsupported protocol identifier: 0x{0:02X} (expected 0xB0)")]
    UnsupportedProtocol(u8),

    /// Structure version byte is not one of the known generations.
    #[error("Unknown FLEX structure version: 0x{0:02X}")]
    UnknownStructVersion(u8),

    /// Stream buffer grew past the reassembly ceiling.
    #[error("Stream buffer overflow: {size} bytes buffered (limit: {limit})")]
    BufferOverflow { size: usize, limit: usize },
}

impl ProtocolError {
    /// Returns true if the connection's byte stream can no longer be framed.
    ///
    /// Fatal errors tear the connection down. The rest are local to one
    /// message and may be logged and skipped by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidPreamble(_)
                | ProtocolError::HeaderChecksum { .. }
                | ProtocolError::IncompleteFrame { .. }
                | ProtocolError::BufferOverflow { .. }
        )
    }
}
