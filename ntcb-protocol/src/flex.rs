//! FLEX capability negotiation.
//!
//! Bitmask announcement payload:
//! ```text
//! +----------+-------+---------+--------+-------+-----------------+
//! |  Marker  | Proto | Version | Struct | Count |     Bitmask     |
//! | "*>FLEX" | 0xB0  |   u8    |   u8   |  u8   | 9/16/32 bytes   |
//! +----------+-------+---------+--------+-------+-----------------+
//! ```
//!
//! Bit 7 of mask byte 0 is field #1, bit 0 of mask byte 0 is field #8, and
//! so on.

use bytes::Bytes;
use serde::Serialize;

use crate::error::ProtocolError;
use crate::fields::field_spec;
use crate::types::{FlexVersion, FLEX_MARKER_FROM_DEVICE, FLEX_MARKER_FROM_SERVER, FLEX_PROTOCOL_ID};

/// Marker + protocol + version + struct version + bit count.
const ANNOUNCEMENT_PREFIX: usize = 10;

/// Which side sent the announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlexDirection {
    FromDevice,
    FromServer,
}

/// Active fields and resulting per-record size for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordLayout {
    /// Active field numbers, ascending.
    pub active_fields: Vec<u16>,
    /// Bytes per record.
    pub record_length: usize,
}

impl RecordLayout {
    /// Build a layout from ascending field numbers.
    ///
    /// The record length accumulates table widths and stops at the first
    /// field number the table does not know.
    pub fn from_fields(active_fields: Vec<u16>) -> Self {
        let record_length = active_fields
            .iter()
            .map_while(|&n| field_spec(n).map(|s| s.width))
            .sum();
        Self {
            active_fields,
            record_length,
        }
    }
}

/// A parsed bitmask announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmaskAnnouncement {
    pub direction: FlexDirection,
    /// Raw protocol version byte.
    pub protocol_version: u8,
    pub struct_version: FlexVersion,
    /// Declared field count; 0 means the full mask width.
    pub declared_bits: u8,
    pub mask: Bytes,
    pub layout: RecordLayout,
}

impl BitmaskAnnouncement {
    /// Protocol version, if it is one of the known generations.
    pub fn protocol_flex_version(&self) -> Option<FlexVersion> {
        FlexVersion::from_byte(self.protocol_version)
    }
}

/// Returns true if the payload starts with a FLEX marker.
pub fn is_bitmask_announcement(payload: &[u8]) -> bool {
    payload.starts_with(&FLEX_MARKER_FROM_DEVICE) || payload.starts_with(&FLEX_MARKER_FROM_SERVER)
}

/// Extract 1-based field numbers from a mask, MSB of byte 0 first.
///
/// Only the first `limit` bits are considered.
pub fn active_fields_from_mask(mask: &[u8], limit: usize) -> Vec<u16> {
    let mut fields = Vec::new();
    for (byte_idx, &byte) in mask.iter().enumerate() {
        for bit in 0..8 {
            let index = byte_idx * 8 + bit;
            if index >= limit {
                return fields;
            }
            if byte & (0x80 >> bit) != 0 {
                fields.push(index as u16 + 1);
            }
        }
    }
    fields
}

/// Parse a FLEX bitmask announcement payload.
pub fn parse_bitmask_announcement(payload: &[u8]) -> Result<BitmaskAnnouncement, ProtocolError> {
    if payload.len() < ANNOUNCEMENT_PREFIX {
        return Err(ProtocolError::IncompleteFrame {
            expected: ANNOUNCEMENT_PREFIX,
            actual: payload.len(),
        });
    }

    let mut marker = [0u8; 6];
    marker.copy_from_slice(&payload[0..6]);
    let direction = if marker == FLEX_MARKER_FROM_DEVICE {
        FlexDirection::FromDevice
    } else if marker == FLEX_MARKER_FROM_SERVER {
        FlexDirection::FromServer
    } else {
        return Err(ProtocolError::InvalidFlexMarker(marker));
    };

    let protocol = payload[6];
    if protocol != FLEX_PROTOCOL_ID {
        return Err(ProtocolError::UnsupportedProtocol(protocol));
    }

    let protocol_version = payload[7];
    let struct_byte = payload[8];
    let struct_version =
        FlexVersion::from_byte(struct_byte).ok_or(ProtocolError::UnknownStructVersion(struct_byte))?;
    let declared_bits = payload[9];

    let width = struct_version.mask_width();
    let end = ANNOUNCEMENT_PREFIX + width;
    if payload.len() < end {
        return Err(ProtocolError::IncompleteFrame {
            expected: end,
            actual: payload.len(),
        });
    }
    let mask = Bytes::copy_from_slice(&payload[ANNOUNCEMENT_PREFIX..end]);

    let limit = match declared_bits {
        0 => width * 8,
        n => (n as usize).min(width * 8),
    };
    let layout = RecordLayout::from_fields(active_fields_from_mask(&mask, limit));

    Ok(BitmaskAnnouncement {
        direction,
        protocol_version,
        struct_version,
        declared_bits,
        mask,
        layout,
    })
}
