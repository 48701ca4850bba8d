//! Streaming FLEX frame reassembly.
//!
//! After negotiation a terminal streams `~`-prefixed frames, each closed by
//! a CRC-8 over every preceding byte of the frame:
//!
//! ```text
//! ~A count record*count crc
//! ~C record crc
//! ~T index(u32 LE) record crc
//! ~E count record*count crc
//! ~X index(u32 LE) record crc
//! ```
//!
//! A lone `0x7F` is a keepalive. Terminals may also interleave complete NTCB
//! messages (e.g. a new bitmask announcement), recognised by their preamble.
//! Anything else outside a frame is noise and is skipped.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::checksum::crc8;
use crate::codec::{decode_message, NtcbMessage};
use crate::error::ProtocolError;
use crate::fields::{decode_record, TelemetryRecord};
use crate::flex::RecordLayout;
use crate::types::{FrameKind, FRAME_MARKER, MAX_STREAM_BUFFER, PING_BYTE, PREAMBLE};

/// Records carried by one CRC-valid frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecords {
    pub kind: FrameKind,
    /// Event index for `~T` / `~X` frames.
    pub event_index: Option<u32>,
    pub records: Vec<TelemetryRecord>,
    /// Acknowledgement the terminal expects for this frame.
    pub ack: Bytes,
}

/// Output of the reassembler.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A frame passed its CRC and was decoded.
    Frame(FrameRecords),
    /// A frame failed its CRC and was dropped.
    ///
    /// The extent comes from the negotiated layout and the frame's own count
    /// byte. A damaged count in `~A`/`~E` therefore holds decoding until up to
    /// `255 * record_length` bytes have arrived, and drops any valid frames
    /// inside that span along with the broken one.
    Corrupted {
        kind: FrameKind,
        expected: u8,
        actual: u8,
        discarded: usize,
    },
    /// A `~` followed by an unknown type byte. Only the marker was dropped.
    UnknownFrameType(u8),
    /// A frame arrived before any bitmask was negotiated. Only the marker
    /// was dropped.
    LayoutUnknown(FrameKind),
    /// A complete NTCB message found between frames.
    Ntcb(NtcbMessage),
}

/// Counters kept across calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    pub pings: u64,
    pub noise_bytes: u64,
    pub frames: u64,
    pub records: u64,
    pub crc_errors: u64,
    pub unknown_types: u64,
}

/// Incremental decoder for the FLEX stream.
///
/// Bytes are never consumed for an incomplete frame, so callers can keep
/// appending reads to the same buffer.
#[derive(Debug, Clone)]
pub struct FrameReassembler {
    layout: Option<RecordLayout>,
    max_buffer: usize,
    stats: ReassemblerStats,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReassembler {
    /// Create a reassembler with no negotiated layout.
    pub fn new() -> Self {
        Self {
            layout: None,
            max_buffer: MAX_STREAM_BUFFER,
            stats: ReassemblerStats::default(),
        }
    }

    /// Create a reassembler for an already negotiated layout.
    pub fn with_layout(layout: RecordLayout) -> Self {
        Self {
            layout: Some(layout),
            ..Self::new()
        }
    }

    /// Override the buffering ceiling.
    pub fn with_max_buffer(mut self, max_buffer: usize) -> Self {
        self.max_buffer = max_buffer;
        self
    }

    pub fn set_layout(&mut self, layout: RecordLayout) {
        self.layout = Some(layout);
    }

    pub fn layout(&self) -> Option<&RecordLayout> {
        self.layout.as_ref()
    }

    pub fn stats(&self) -> ReassemblerStats {
        self.stats
    }

    /// Pull the next event out of `buf`.
    ///
    /// Returns `Ok(None)` when more data is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<StreamEvent>, ProtocolError> {
        loop {
            let Some(&first) = buf.first() else {
                return Ok(None);
            };

            match first {
                PING_BYTE => {
                    buf.advance(1);
                    self.stats.pings += 1;
                    continue;
                }
                FRAME_MARKER => return self.decode_frame(buf),
                b if b == PREAMBLE[0] => {
                    let prefix = buf.len().min(PREAMBLE.len());
                    if buf[..prefix] != PREAMBLE[..prefix] {
                        self.skip_noise(buf, 1);
                        continue;
                    }
                    if prefix < PREAMBLE.len() {
                        return self.need_more(buf);
                    }
                    return match decode_message(buf)? {
                        Some((msg, used)) => {
                            buf.advance(used);
                            Ok(Some(StreamEvent::Ntcb(msg)))
                        }
                        None => self.need_more(buf),
                    };
                }
                _ => {
                    let skip = buf
                        .iter()
                        .position(|&b| b == FRAME_MARKER || b == PING_BYTE || b == PREAMBLE[0])
                        .unwrap_or(buf.len());
                    self.skip_noise(buf, skip);
                }
            }
        }
    }

    fn decode_frame(&mut self, buf: &mut BytesMut) -> Result<Option<StreamEvent>, ProtocolError> {
        if buf.len() < 2 {
            return self.need_more(buf);
        }

        let Some(kind) = FrameKind::from_type_byte(buf[1]) else {
            let type_byte = buf[1];
            buf.advance(1);
            self.stats.unknown_types += 1;
            return Ok(Some(StreamEvent::UnknownFrameType(type_byte)));
        };

        let Some(layout) = self.layout.as_ref() else {
            buf.advance(1);
            return Ok(Some(StreamEvent::LayoutUnknown(kind)));
        };
        let record_length = layout.record_length;

        let (count, header_len) = if kind.has_count() {
            if buf.len() < 3 {
                return self.need_more(buf);
            }
            (buf[2] as usize, 3)
        } else if kind.has_event_index() {
            (1, 6)
        } else {
            (1, 2)
        };

        let frame_len = header_len + count * record_length + 1;
        if buf.len() < frame_len {
            return self.need_more(buf);
        }

        let expected = crc8(&buf[..frame_len - 1]);
        let actual = buf[frame_len - 1];
        if expected != actual {
            buf.advance(frame_len);
            self.stats.crc_errors += 1;
            return Ok(Some(StreamEvent::Corrupted {
                kind,
                expected,
                actual,
                discarded: frame_len,
            }));
        }

        let event_index = kind
            .has_event_index()
            .then(|| u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]));

        let body = &buf[header_len..frame_len - 1];
        let records: Vec<TelemetryRecord> = (0..count)
            .map(|i| {
                let start = i * record_length;
                decode_record(&body[start..start + record_length], &layout.active_fields)
            })
            .collect();

        let ack = encode_ack(kind, count as u8, event_index);
        buf.advance(frame_len);

        self.stats.frames += 1;
        self.stats.records += records.len() as u64;

        Ok(Some(StreamEvent::Frame(FrameRecords {
            kind,
            event_index,
            records,
            ack,
        })))
    }

    fn skip_noise(&mut self, buf: &mut BytesMut, n: usize) {
        buf.advance(n);
        self.stats.noise_bytes += n as u64;
    }

    fn need_more(&self, buf: &BytesMut) -> Result<Option<StreamEvent>, ProtocolError> {
        if buf.len() > self.max_buffer {
            return Err(ProtocolError::BufferOverflow {
                size: buf.len(),
                limit: self.max_buffer,
            });
        }
        Ok(None)
    }
}

/// Build the acknowledgement for a received frame.
///
/// `count` is only written for `~A`/`~E`, `event_index` only for `~T`/`~X`.
pub fn encode_ack(kind: FrameKind, count: u8, event_index: Option<u32>) -> Bytes {
    let mut buf = BytesMut::with_capacity(7);
    buf.put_u8(FRAME_MARKER);
    buf.put_u8(kind.type_byte());
    if kind.has_count() {
        buf.put_u8(count);
    }
    if kind.has_event_index() {
        buf.put_u32_le(event_index.unwrap_or(0));
    }
    let crc = crc8(&buf);
    buf.put_u8(crc);
    buf.freeze()
}

/// Build a `~`-frame carrying already-encoded records.
///
/// Terminals produce these; the gateway only needs it for tests and
/// replay tooling.
pub fn encode_frame(kind: FrameKind, event_index: Option<u32>, records: &[&[u8]]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(FRAME_MARKER);
    buf.put_u8(kind.type_byte());
    if kind.has_count() {
        buf.put_u8(records.len() as u8);
    }
    if kind.has_event_index() {
        buf.put_u32_le(event_index.unwrap_or(0));
    }
    for record in records {
        buf.put_slice(record);
    }
    let crc = crc8(&buf);
    buf.put_u8(crc);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::fields::FieldValue;

    fn layout() -> RecordLayout {
        RecordLayout::from_fields(vec![1, 13, 14])
    }

    fn record(seq: u32, speed: f32, course: u16) -> Vec<u8> {
        let mut r = Vec::new();
        r.extend_from_slice(&seq.to_le_bytes());
        r.extend_from_slice(&speed.to_le_bytes());
        r.extend_from_slice(&course.to_le_bytes());
        r
    }

    fn drain(reassembler: &mut FrameReassembler, buf: &mut BytesMut) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = reassembler.decode(buf).unwrap() {
            events.push(event);
        }
        events
    }

    fn msg_numbers(events: &[StreamEvent]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Frame(f) => Some(f),
                _ => None,
            })
            .flat_map(|f| f.records.iter())
            .filter_map(|r| match r.get("msg_number") {
                Some(FieldValue::MsgNumber(n)) => Some(*n),
                _ => None,
            })
            .collect()
    }

    fn sample_stream() -> Vec<u8> {
        let r1 = record(1, 10.0, 90);
        let r2 = record(2, 20.0, 180);
        let r3 = record(3, 30.0, 270);
        let r4 = record(4, 40.0, 0);
        let mut stream = vec![PING_BYTE, 0x00, 0x13];
        stream.extend_from_slice(&encode_frame(FrameKind::Current, None, &[&r1[..]]));
        stream.push(PING_BYTE);
        stream.extend_from_slice(&encode_frame(FrameKind::Batch, None, &[&r2[..], &r3[..]]));
        stream.extend_from_slice(&encode_frame(FrameKind::Indexed, Some(77), &[&r4[..]]));
        stream
    }

    #[test]
    fn test_current_frame_length_13() {
        let frame = encode_frame(FrameKind::Current, None, &[&record(7, 42.5, 90)[..]]);
        assert_eq!(frame.len(), 13);
        assert_eq!(frame[12], 0x45);

        let mut r = FrameReassembler::with_layout(layout());
        let mut buf = BytesMut::from(&frame[..]);
        let events = drain(&mut r, &mut buf);
        assert_eq!(events.len(), 1);
        let StreamEvent::Frame(f) = &events[0] else {
            panic!("expected frame");
        };
        assert_eq!(f.kind, FrameKind::Current);
        let rec = &f.records[0];
        assert_eq!(rec.get("msg_number"), Some(&FieldValue::MsgNumber(7)));
        assert_eq!(rec.get("speed_kmh"), Some(&FieldValue::SpeedKmh(42.5)));
        assert_eq!(rec.get("course_deg"), Some(&FieldValue::CourseDeg(90)));
        assert_eq!(&f.ack[..], &encode_ack(FrameKind::Current, 1, None)[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_split_at_every_boundary_is_identical() {
        let stream = sample_stream();

        let mut whole = FrameReassembler::with_layout(layout());
        let mut buf = BytesMut::from(&stream[..]);
        let expected = drain(&mut whole, &mut buf);
        assert_eq!(msg_numbers(&expected), vec![1, 2, 3, 4]);

        // One byte at a time.
        let mut r = FrameReassembler::with_layout(layout());
        let mut buf = BytesMut::new();
        let mut events = Vec::new();
        for &b in &stream {
            buf.put_u8(b);
            events.extend(drain(&mut r, &mut buf));
        }
        assert_eq!(events, expected);

        // Two chunks split at every position.
        for split in 1..stream.len() {
            let mut r = FrameReassembler::with_layout(layout());
            let mut buf = BytesMut::from(&stream[..split]);
            let mut events = drain(&mut r, &mut buf);
            buf.extend_from_slice(&stream[split..]);
            events.extend(drain(&mut r, &mut buf));
            assert_eq!(events, expected, "split at {}", split);
        }
    }

    #[test]
    fn test_indexed_frame() {
        let frame = encode_frame(FrameKind::ExtraIndexed, Some(0x01020304), &[&record(9, 0.0, 1)[..]]);
        let mut r = FrameReassembler::with_layout(layout());
        let mut buf = BytesMut::from(&frame[..]);
        let Some(StreamEvent::Frame(f)) = r.decode(&mut buf).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(f.kind, FrameKind::ExtraIndexed);
        assert_eq!(f.event_index, Some(0x01020304));
        assert_eq!(f.ack.len(), 7);
        assert_eq!(&f.ack[2..6], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_extra_batch_frame_and_ack() {
        let r1 = record(1, 1.0, 1);
        let r2 = record(2, 2.0, 2);
        let r3 = record(3, 3.0, 3);
        let frame = encode_frame(FrameKind::ExtraBatch, None, &[&r1[..], &r2[..], &r3[..]]);
        assert_eq!(frame.len(), 3 + 3 * 10 + 1);

        let mut r = FrameReassembler::with_layout(layout());
        let mut buf = BytesMut::from(&frame[..]);
        let events = drain(&mut r, &mut buf);
        assert_eq!(events.len(), 1);
        let StreamEvent::Frame(f) = &events[0] else {
            panic!("expected frame");
        };
        assert_eq!(f.kind, FrameKind::ExtraBatch);
        assert_eq!(f.event_index, None);
        assert_eq!(msg_numbers(&events), vec![1, 2, 3]);
        assert_eq!(&f.ack[..], &[FRAME_MARKER, b'E', 3, 0x75]);
        assert_eq!(r.stats().records, 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_corrupted_count_byte_swallows_following_frames() {
        let mut batch = encode_frame(FrameKind::Batch, None, &[&record(1, 1.0, 1)[..]]).to_vec();
        batch[2] = 3;
        let mut stream = batch;
        for seq in 2..=4u32 {
            let rec = record(seq, seq as f32, seq as u16);
            stream.extend_from_slice(&encode_frame(FrameKind::Current, None, &[&rec[..]]));
        }
        assert_eq!(stream.len(), 53);

        // Waits for the full 34 bytes the damaged count implies.
        let mut r = FrameReassembler::with_layout(layout());
        let mut buf = BytesMut::from(&stream[..27]);
        assert!(r.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 27);

        buf.extend_from_slice(&stream[27..]);
        let events = drain(&mut r, &mut buf);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            StreamEvent::Corrupted { kind: FrameKind::Batch, discarded: 34, .. }
        ));
        // Frames 2 and 3 fell inside the discarded span; 4 is recovered.
        assert_eq!(msg_numbers(&events), vec![4]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_corrupted_batch_then_valid_frame() {
        let mut corrupted =
            encode_frame(FrameKind::Batch, None, &[&record(1, 1.0, 1)[..], &record(2, 2.0, 2)[..]]).to_vec();
        corrupted[5] ^= 0x10;
        let mut stream = corrupted.clone();
        stream.extend_from_slice(&encode_frame(FrameKind::Current, None, &[&record(3, 3.0, 3)[..]]));

        let mut r = FrameReassembler::with_layout(layout());
        let mut buf = BytesMut::from(&stream[..]);
        let events = drain(&mut r, &mut buf);

        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            StreamEvent::Corrupted { kind: FrameKind::Batch, discarded: 24, .. }
        ));
        assert_eq!(msg_numbers(&events), vec![3]);
        assert_eq!(r.stats().crc_errors, 1);
    }

    #[test]
    fn test_unknown_type_resyncs_at_marker() {
        let mut stream = vec![FRAME_MARKER, b'Z'];
        stream.extend_from_slice(&encode_frame(FrameKind::Current, None, &[&record(5, 5.0, 5)[..]]));

        let mut r = FrameReassembler::with_layout(layout());
        let mut buf = BytesMut::from(&stream[..]);
        let events = drain(&mut r, &mut buf);
        assert_eq!(events[0], StreamEvent::UnknownFrameType(b'Z'));
        assert_eq!(msg_numbers(&events), vec![5]);
    }

    #[test]
    fn test_frames_before_layout_are_not_decoded() {
        let frame = encode_frame(FrameKind::Current, None, &[&record(5, 5.0, 5)[..]]);
        let mut r = FrameReassembler::new();
        let mut buf = BytesMut::from(&frame[..]);
        let events = drain(&mut r, &mut buf);
        assert_eq!(events[0], StreamEvent::LayoutUnknown(FrameKind::Current));
        assert!(msg_numbers(&events).is_empty());
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let frame = encode_frame(FrameKind::Current, None, &[&record(5, 5.0, 5)[..]]);
        let mut r = FrameReassembler::with_layout(layout());
        let mut buf = BytesMut::from(&frame[..10]);
        assert!(r.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_interleaved_ntcb_message() {
        let ntcb = encode(1, 2, b"*>FLEX\xB0\x0A\x0A\x00\x80\x00\x00\x00\x00\x00\x00\x00\x00");
        let mut stream = vec![PING_BYTE];
        stream.extend_from_slice(&ntcb);
        stream.extend_from_slice(&encode_frame(FrameKind::Current, None, &[&record(5, 5.0, 5)[..]]));

        let mut r = FrameReassembler::with_layout(layout());
        let mut buf = BytesMut::new();
        let mut events = Vec::new();
        for &b in &stream {
            buf.put_u8(b);
            events.extend(drain(&mut r, &mut buf));
        }
        assert!(matches!(&events[0], StreamEvent::Ntcb(m) if m.header.sender == 2));
        assert_eq!(msg_numbers(&events), vec![5]);
    }

    #[test]
    fn test_lone_at_sign_is_noise() {
        let mut stream = b"@X".to_vec();
        stream.extend_from_slice(&encode_frame(FrameKind::Current, None, &[&record(6, 6.0, 6)[..]]));
        let mut r = FrameReassembler::with_layout(layout());
        let mut buf = BytesMut::from(&stream[..]);
        let events = drain(&mut r, &mut buf);
        assert_eq!(msg_numbers(&events), vec![6]);
        assert_eq!(r.stats().noise_bytes, 2);
    }

    #[test]
    fn test_buffer_ceiling() {
        let mut r = FrameReassembler::with_layout(layout()).with_max_buffer(64);
        let mut buf = BytesMut::from(&[FRAME_MARKER, b'A', 0xFF][..]);
        buf.extend_from_slice(&[0u8; 100]);
        assert!(matches!(
            r.decode(&mut buf),
            Err(ProtocolError::BufferOverflow { limit: 64, .. })
        ));
    }

    #[test]
    fn test_zero_length_records() {
        let mut r = FrameReassembler::with_layout(RecordLayout::default());
        let empty: &[u8] = &[];
        let frame = encode_frame(FrameKind::Batch, None, &[empty, empty]);
        let mut buf = BytesMut::from(&frame[..]);
        let Some(StreamEvent::Frame(f)) = r.decode(&mut buf).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(f.records.len(), 2);
        assert!(f.records[0].is_empty());
    }
}
