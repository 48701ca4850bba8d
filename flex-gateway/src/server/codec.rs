//! Tokio codec for the FLEX telemetry stream.

use bytes::BytesMut;
use log::warn;
use tokio_util::codec::Decoder;

use ntcb_protocol::{FrameReassembler, StreamEvent};

use crate::server::session::SessionError;

/// Adapts [`FrameReassembler`] to `FramedRead`.
pub struct FlexCodec {
    conn_id: u64,
    reassembler: FrameReassembler,
}

impl FlexCodec {
    pub fn new(conn_id: u64, reassembler: FrameReassembler) -> Self {
        Self {
            conn_id,
            reassembler,
        }
    }

    pub fn reassembler_mut(&mut self) -> &mut FrameReassembler {
        &mut self.reassembler
    }
}

impl Decoder for FlexCodec {
    type Item = StreamEvent;
    type Error = SessionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.reassembler.decode(src)?)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        if !src.is_empty() {
            warn!(
                "[Conn {}] Discarding {} bytes of incomplete frame at close",
                self.conn_id,
                src.len()
            );
            src.clear();
        }
        Ok(None)
    }
}
