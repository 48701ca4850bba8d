//! Device connection handling.

use std::future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;

use ntcb_protocol::{
    decode_header, encode, is_bitmask_announcement, is_handshake, parse_bitmask_announcement,
    parse_handshake, BitmaskAnnouncement, FrameReassembler, FrameRecords, NtcbHeader, NtcbMessage,
    ProtocolError, StreamEvent, HANDSHAKE_ACK, NTCB_HEADER_SIZE,
};

use crate::events::{DeviceEvent, EventBus};
use crate::metrics::GatewayMetrics;
use crate::server::codec::FlexCodec;
use crate::server::registry::{DeviceSession, SessionRegistry};

/// Errors that end a connection.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Read timeout for the handshake and the bitmask exchange.
    pub handshake_timeout: Duration,
    /// Bound on a single socket write.
    pub write_timeout: Duration,
    /// Acknowledge CRC-valid frames.
    pub ack_frames: bool,
    /// Outbound frames that may queue before senders wait.
    pub outbound_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            ack_frames: true,
            outbound_queue: 64,
        }
    }
}

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Waiting for the `*>S` handshake.
    Handshake,
    /// Waiting for the FLEX bitmask announcement.
    Negotiating,
    /// Decoding telemetry frames.
    Streaming,
    /// Session is closing.
    Closing,
}

/// Read exactly `buf.len()` bytes, mapping early EOF to `ConnectionClosed`.
async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(SessionError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

/// Read and validate a 16-byte NTCB header.
pub async fn read_header<R>(reader: &mut R) -> Result<NtcbHeader, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; NTCB_HEADER_SIZE];
    read_exact_or_closed(reader, &mut buf).await?;
    let header = decode_header(&buf)?.ok_or(ProtocolError::IncompleteFrame {
        expected: NTCB_HEADER_SIZE,
        actual: buf.len(),
    })?;
    Ok(header)
}

/// Read the payload announced by `header`.
///
/// A checksum mismatch is reported through `NtcbMessage::checksum_ok`
/// rather than as an error.
pub async fn read_payload<R>(reader: &mut R, header: NtcbHeader) -> Result<NtcbMessage, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = vec![0u8; header.payload_len as usize];
    read_exact_or_closed(reader, &mut payload).await?;
    let checksum_ok = header.payload_matches(&payload);
    Ok(NtcbMessage {
        header,
        payload: Bytes::from(payload),
        checksum_ok,
    })
}

/// Drain the outbound queue into the socket.
async fn write_loop<W>(id: u64, mut writer: W, mut rx: mpsc::Receiver<Bytes>, write_timeout: Duration)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        match timeout(write_timeout, writer.write_all(&frame)).await {
            Ok(Ok(())) => trace!("[Conn {}] Wrote {} bytes", id, frame.len()),
            Ok(Err(e)) => {
                warn!("[Conn {}] Write failed: {}", id, e);
                break;
            }
            Err(_) => {
                warn!("[Conn {}] Write timed out", id);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Resolves when an operator asks for a disconnect. Never resolves once the
/// registry entry is gone.
async fn shutdown_requested(rx: &mut Option<mpsc::Receiver<()>>) {
    let closed = match rx.as_mut() {
        Some(inner) => match inner.recv().await {
            Some(()) => return,
            None => true,
        },
        None => false,
    };
    if closed {
        *rx = None;
    }
    future::pending::<()>().await
}

/// A device connection.
pub struct Session<S> {
    /// Read half of the socket.
    reader: ReadHalf<S>,
    conn: Connection,
}

/// Everything a session owns except the read half of its socket.
struct Connection {
    /// Unique connection ID.
    id: u64,
    /// Peer address.
    addr: SocketAddr,
    /// Queue drained by the writer task.
    outbound: mpsc::Sender<Bytes>,
    writer: JoinHandle<()>,
    state: SessionState,
    config: SessionConfig,
    registry: Arc<SessionRegistry>,
    events: EventBus,
    metrics: Arc<GatewayMetrics>,
    /// Set once the session is registered.
    device_id: Option<String>,
    /// Our NTCB id, as addressed by the terminal.
    server_id: u32,
    /// The terminal's NTCB id.
    terminal_id: u32,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Create a new session and start its writer task.
    pub fn new(
        id: u64,
        addr: SocketAddr,
        stream: S,
        config: SessionConfig,
        registry: Arc<SessionRegistry>,
        events: EventBus,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, rx) = mpsc::channel(config.outbound_queue.max(1));
        let writer = tokio::spawn(write_loop(id, writer, rx, config.write_timeout));

        Self {
            reader,
            conn: Connection {
                id,
                addr,
                outbound,
                writer,
                state: SessionState::Handshake,
                config,
                registry,
                events,
                metrics,
                device_id: None,
                server_id: 0,
                terminal_id: 0,
            },
        }
    }

    /// Run the session until the device disconnects or a fatal error occurs.
    pub async fn run(self) -> Result<(), SessionError> {
        let Session { mut reader, mut conn } = self;

        conn.metrics.connection_opened();
        let result = conn.serve(&mut reader).await;
        conn.teardown().await;
        conn.metrics.connection_closed();

        // Let queued acks and replies drain before the socket closes.
        let Connection {
            outbound,
            writer,
            config,
            ..
        } = conn;
        drop(outbound);
        let _ = timeout(config.write_timeout, writer).await;

        result
    }
}

impl Connection {
    async fn serve<R>(&mut self, reader: &mut R) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let limit = self.config.handshake_timeout;

        let device_id = timeout(limit, self.handshake(reader))
            .await
            .map_err(|_| SessionError::Timeout("handshake"))??;

        let (announcement, payload) = timeout(limit, self.negotiate(reader))
            .await
            .map_err(|_| SessionError::Timeout("FLEX bitmask"))??;

        let (reassembler, shutdown_rx) = self.register(device_id, announcement, payload).await?;
        self.stream(reader, reassembler, Some(shutdown_rx)).await
    }

    async fn read_message<R>(&mut self, reader: &mut R) -> Result<NtcbMessage, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let header = read_header(reader).await?;
        let msg = read_payload(reader, header).await?;
        if !msg.checksum_ok {
            warn!(
                "[Conn {}] NTCB payload checksum mismatch (expected 0x{:02X}), continuing",
                self.id, header.payload_checksum
            );
            self.metrics.record_payload_checksum_error();
        }
        Ok(msg)
    }

    async fn send(&self, frame: Bytes) -> Result<(), SessionError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| SessionError::ConnectionClosed)
    }

    async fn send_ntcb(&self, payload: &[u8]) -> Result<(), SessionError> {
        self.send(encode(self.terminal_id, self.server_id, payload)).await
    }

    async fn handshake<R>(&mut self, reader: &mut R) -> Result<String, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let msg = self.read_message(reader).await?;
        if !is_handshake(&msg.payload) {
            warn!(
                "[Conn {}] Handshake payload has no *>S prefix ({} bytes)",
                self.id,
                msg.payload.len()
            );
        }

        self.server_id = msg.header.recipient;
        self.terminal_id = msg.header.sender;
        self.send_ntcb(HANDSHAKE_ACK).await?;

        let handshake = parse_handshake(&msg.payload);
        let device_id = if handshake.device_id.is_empty() {
            self.terminal_id.to_string()
        } else {
            handshake.device_id
        };

        info!(
            "[Conn {}] Handshake from device {} (terminal id {}, server id {})",
            self.id, device_id, self.terminal_id, self.server_id
        );
        self.state = SessionState::Negotiating;
        Ok(device_id)
    }

    async fn negotiate<R>(&mut self, reader: &mut R) -> Result<(BitmaskAnnouncement, Bytes), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let msg = self.read_message(reader).await?;
            if is_handshake(&msg.payload) {
                debug!("[Conn {}] Repeated handshake during negotiation", self.id);
                self.send_ntcb(HANDSHAKE_ACK).await?;
                continue;
            }
            let announcement = parse_bitmask_announcement(&msg.payload)?;
            return Ok((announcement, msg.payload));
        }
    }

    async fn register(
        &mut self,
        device_id: String,
        announcement: BitmaskAnnouncement,
        payload: Bytes,
    ) -> Result<(FrameReassembler, mpsc::Receiver<()>), SessionError> {
        let BitmaskAnnouncement {
            struct_version,
            layout,
            ..
        } = announcement;

        info!(
            "[Conn {}] Device {} negotiated FLEX {}: fields {:?}, record length {}",
            self.id, device_id, struct_version, layout.active_fields, layout.record_length
        );

        let session = DeviceSession::new(
            device_id.clone(),
            self.id,
            self.addr,
            self.server_id,
            self.terminal_id,
            struct_version,
            layout.clone(),
            self.outbound.clone(),
        );
        let shutdown_rx = self.registry.register(session).await;
        self.device_id = Some(device_id.clone());

        self.send_ntcb(&payload).await?;
        self.metrics.handshake_completed();
        self.events.publish(DeviceEvent::Connected {
            device_id,
            connection_id: self.id,
            peer: self.addr,
        });

        self.state = SessionState::Streaming;
        Ok((FrameReassembler::with_layout(layout), shutdown_rx))
    }

    async fn stream<R>(
        &mut self,
        reader: &mut R,
        reassembler: FrameReassembler,
        mut shutdown_rx: Option<mpsc::Receiver<()>>,
    ) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FramedRead::new(reader, FlexCodec::new(self.id, reassembler));
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown_rx) => {
                    info!("[Conn {}] Disconnect requested", self.id);
                    return Ok(());
                }
                next = frames.next() => {
                    let Some(event) = next else {
                        info!("[Conn {}] Connection closed by peer", self.id);
                        return Ok(());
                    };
                    self.handle_event(event?, frames.decoder_mut().reassembler_mut()).await?;
                }
            }
        }
    }

    async fn handle_event(
        &mut self,
        event: StreamEvent,
        reassembler: &mut FrameReassembler,
    ) -> Result<(), SessionError> {
        match event {
            StreamEvent::Frame(frame) => self.handle_frame(frame).await?,
            StreamEvent::Corrupted {
                kind,
                expected,
                actual,
                discarded,
            } => {
                warn!(
                    "[Conn {}] {} frame CRC mismatch (expected 0x{:02X}, got 0x{:02X}), dropped {} bytes",
                    self.id, kind, expected, actual, discarded
                );
                self.metrics.record_crc_error();
            }
            StreamEvent::UnknownFrameType(type_byte) => {
                warn!(
                    "[Conn {}] Unknown frame type 0x{:02X}, resynchronizing",
                    self.id, type_byte
                );
                self.metrics.record_unknown_frame();
            }
            StreamEvent::LayoutUnknown(kind) => {
                warn!("[Conn {}] {} frame before bitmask negotiation", self.id, kind);
            }
            StreamEvent::Ntcb(msg) => self.handle_message(msg, reassembler).await?,
        }
        Ok(())
    }

    async fn handle_frame(&mut self, frame: FrameRecords) -> Result<(), SessionError> {
        let device_id = self.device_id.clone().unwrap_or_default();
        debug!(
            "[Conn {}] {} frame with {} record(s)",
            self.id,
            frame.kind,
            frame.records.len()
        );
        self.metrics.record_frame(frame.records.len() as u64);

        if self.config.ack_frames {
            self.send(frame.ack).await?;
        }

        for record in frame.records {
            self.events.publish(DeviceEvent::Telemetry {
                device_id: device_id.clone(),
                frame: frame.kind,
                event_index: frame.event_index,
                record,
            });
        }
        Ok(())
    }

    /// NTCB message found between frames: a new bitmask, a repeated
    /// handshake, or a reply to an operator command.
    async fn handle_message(
        &mut self,
        msg: NtcbMessage,
        reassembler: &mut FrameReassembler,
    ) -> Result<(), SessionError> {
        if !msg.checksum_ok {
            warn!(
                "[Conn {}] NTCB payload checksum mismatch (expected 0x{:02X}), continuing",
                self.id, msg.header.payload_checksum
            );
            self.metrics.record_payload_checksum_error();
        }

        if is_bitmask_announcement(&msg.payload) {
            match parse_bitmask_announcement(&msg.payload) {
                Ok(announcement) => {
                    let device_id = self.device_id.clone().unwrap_or_default();
                    info!(
                        "[Conn {}] Device {} renegotiated FLEX {}: fields {:?}, record length {}",
                        self.id,
                        device_id,
                        announcement.struct_version,
                        announcement.layout.active_fields,
                        announcement.layout.record_length
                    );
                    reassembler.set_layout(announcement.layout.clone());
                    self.registry
                        .update_layout(
                            &device_id,
                            self.id,
                            announcement.struct_version,
                            announcement.layout,
                        )
                        .await;
                    self.send_ntcb(&msg.payload).await?;
                }
                Err(e) => {
                    warn!(
                        "[Conn {}] Ignoring bitmask update: {}; keeping current layout",
                        self.id, e
                    );
                }
            }
        } else if is_handshake(&msg.payload) {
            debug!("[Conn {}] Repeated handshake while streaming", self.id);
            self.send_ntcb(HANDSHAKE_ACK).await?;
        } else {
            let text = String::from_utf8_lossy(&msg.payload)
                .trim_end_matches('\0')
                .to_string();
            debug!("[Conn {}] Device reply: {}", self.id, text);
            self.events.publish(DeviceEvent::CommandReply {
                device_id: self.device_id.clone().unwrap_or_default(),
                text,
            });
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        debug!("[Conn {}] Closing from state {:?}", self.id, self.state);
        self.state = SessionState::Closing;

        if let Some(device_id) = self.device_id.take() {
            if self.registry.release(&device_id, self.id).await {
                debug!("[Conn {}] Unregistered device {}", self.id, device_id);
            }
            self.events.publish(DeviceEvent::Disconnected {
                device_id,
                connection_id: self.id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio::sync::broadcast;

    use ntcb_protocol::{decode_message, encode_ack, encode_frame, FieldValue, FrameKind};

    const DEVICE: &str = "123456789012345";
    const TERMINAL_ID: u32 = 0x2A;
    const SERVER_ID: u32 = 1;

    /// Fields #1, #13 and #14 with FLEX 1.0 structures.
    const BITMASK: &[u8] = b"*>FLEX\xB0\x0A\x0A\x45\x80\x0C\x00\x00\x00\x00\x00\x00\x00";

    struct Harness {
        client: DuplexStream,
        registry: Arc<SessionRegistry>,
        metrics: Arc<GatewayMetrics>,
        events: broadcast::Receiver<DeviceEvent>,
        handle: JoinHandle<Result<(), SessionError>>,
    }

    fn start(config: SessionConfig) -> Harness {
        let (client, server) = tokio::io::duplex(4096);
        let registry = Arc::new(SessionRegistry::new());
        let bus = EventBus::new();
        let events = bus.subscribe();
        let metrics = GatewayMetrics::new();
        let session = Session::new(
            1,
            "127.0.0.1:40000".parse().unwrap(),
            server,
            config,
            Arc::clone(&registry),
            bus,
            Arc::clone(&metrics),
        );
        let handle = tokio::spawn(session.run());
        Harness {
            client,
            registry,
            metrics,
            events,
            handle,
        }
    }

    async fn read_reply(client: &mut DuplexStream) -> NtcbMessage {
        let mut header = [0u8; NTCB_HEADER_SIZE];
        client.read_exact(&mut header).await.unwrap();
        let parsed = decode_header(&header).unwrap().unwrap();
        let mut wire = header.to_vec();
        wire.resize(NTCB_HEADER_SIZE + parsed.payload_len as usize, 0);
        client.read_exact(&mut wire[NTCB_HEADER_SIZE..]).await.unwrap();
        let (msg, used) = decode_message(&wire).unwrap().unwrap();
        assert_eq!(used, wire.len());
        msg
    }

    async fn next_event(rx: &mut broadcast::Receiver<DeviceEvent>) -> DeviceEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn negotiate(h: &mut Harness) {
        let hello = format!("*>S:{}", DEVICE);
        h.client
            .write_all(&encode(SERVER_ID, TERMINAL_ID, hello.as_bytes()))
            .await
            .unwrap();
        let ack = read_reply(&mut h.client).await;
        assert_eq!(&ack.payload[..], HANDSHAKE_ACK);

        h.client
            .write_all(&encode(SERVER_ID, TERMINAL_ID, BITMASK))
            .await
            .unwrap();
        let echo = read_reply(&mut h.client).await;
        assert_eq!(&echo.payload[..], BITMASK);

        match next_event(&mut h.events).await {
            DeviceEvent::Connected { device_id, .. } => assert_eq!(device_id, DEVICE),
            other => panic!("unexpected event {:?}", other),
        }
    }

    fn current_record(msg_number: u32, speed: f32, course: u16) -> Vec<u8> {
        let mut record = Vec::new();
        record.extend_from_slice(&msg_number.to_le_bytes());
        record.extend_from_slice(&speed.to_le_bytes());
        record.extend_from_slice(&course.to_le_bytes());
        record
    }

    #[tokio::test]
    async fn test_full_session() {
        let mut h = start(SessionConfig::default());

        let hello = format!("*>S:{}", DEVICE);
        h.client
            .write_all(&encode(SERVER_ID, TERMINAL_ID, hello.as_bytes()))
            .await
            .unwrap();
        let ack = read_reply(&mut h.client).await;
        assert_eq!(ack.header.recipient, TERMINAL_ID);
        assert_eq!(ack.header.sender, SERVER_ID);
        assert_eq!(&ack.payload[..], b"*<S");
        assert_eq!(h.registry.count().await, 0);

        h.client
            .write_all(&encode(SERVER_ID, TERMINAL_ID, BITMASK))
            .await
            .unwrap();
        let echo = read_reply(&mut h.client).await;
        assert_eq!(&echo.payload[..], BITMASK);

        let device = h.registry.lookup(DEVICE).await.unwrap();
        assert_eq!(device.layout.active_fields, vec![1, 13, 14]);
        assert_eq!(device.layout.record_length, 10);
        assert!(matches!(
            next_event(&mut h.events).await,
            DeviceEvent::Connected { connection_id: 1, .. }
        ));

        let record = current_record(7, 42.5, 90);
        let frame = encode_frame(FrameKind::Current, None, &[&record[..]]);
        assert_eq!(frame.len(), 13);
        h.client.write_all(&frame).await.unwrap();

        let mut frame_ack = [0u8; 3];
        h.client.read_exact(&mut frame_ack).await.unwrap();
        assert_eq!(&frame_ack[..], &encode_ack(FrameKind::Current, 1, None)[..]);

        match next_event(&mut h.events).await {
            DeviceEvent::Telemetry {
                device_id,
                frame,
                record,
                ..
            } => {
                assert_eq!(device_id, DEVICE);
                assert_eq!(frame, FrameKind::Current);
                assert_eq!(record.get("msg_number"), Some(&FieldValue::MsgNumber(7)));
                assert_eq!(record.get("speed_kmh"), Some(&FieldValue::SpeedKmh(42.5)));
                assert_eq!(record.get("course_deg"), Some(&FieldValue::CourseDeg(90)));
            }
            other => panic!("unexpected event {:?}", other),
        }

        drop(h.client);
        assert!(h.handle.await.unwrap().is_ok());
        assert!(matches!(
            next_event(&mut h.events).await,
            DeviceEvent::Disconnected { connection_id: 1, .. }
        ));
        assert_eq!(h.registry.count().await, 0);

        let s = h.metrics.snapshot();
        assert_eq!(s.connections_total, 1);
        assert_eq!(s.connections_active, 0);
        assert_eq!(s.handshakes_completed, 1);
        assert_eq!(s.records_decoded, 1);
    }

    #[tokio::test]
    async fn test_bad_header_checksum_closes_connection() {
        let mut h = start(SessionConfig::default());

        let mut wire = encode(SERVER_ID, TERMINAL_ID, b"*>S:1").to_vec();
        wire[15] ^= 0xFF;
        h.client.write_all(&wire).await.unwrap();

        let result = h.handle.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Protocol(ProtocolError::HeaderChecksum { .. }))
        ));
        assert_eq!(h.registry.count().await, 0);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let h = start(SessionConfig {
            handshake_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        });

        let result = h.handle.await.unwrap();
        assert!(matches!(result, Err(SessionError::Timeout("handshake"))));
        assert_eq!(h.metrics.snapshot().connections_active, 0);
    }

    #[tokio::test]
    async fn test_bitmask_timeout() {
        let mut h = start(SessionConfig {
            handshake_timeout: Duration::from_millis(100),
            ..SessionConfig::default()
        });

        let hello = format!("*>S:{}", DEVICE);
        h.client
            .write_all(&encode(SERVER_ID, TERMINAL_ID, hello.as_bytes()))
            .await
            .unwrap();
        let ack = read_reply(&mut h.client).await;
        assert_eq!(&ack.payload[..], HANDSHAKE_ACK);

        let result = h.handle.await.unwrap();
        assert!(matches!(result, Err(SessionError::Timeout("FLEX bitmask"))));
        assert_eq!(h.registry.count().await, 0);
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.metrics.snapshot().handshakes_completed, 0);
    }

    #[tokio::test]
    async fn test_close_inside_header_is_fatal() {
        let mut h = start(SessionConfig::default());

        let wire = encode(SERVER_ID, TERMINAL_ID, b"*>S:1");
        h.client.write_all(&wire[..8]).await.unwrap();
        drop(h.client);

        let result = h.handle.await.unwrap();
        assert!(matches!(result, Err(SessionError::ConnectionClosed)));
        assert_eq!(h.registry.count().await, 0);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_inside_bitmask_payload_is_fatal() {
        let mut h = start(SessionConfig::default());

        let hello = format!("*>S:{}", DEVICE);
        h.client
            .write_all(&encode(SERVER_ID, TERMINAL_ID, hello.as_bytes()))
            .await
            .unwrap();
        read_reply(&mut h.client).await;

        let wire = encode(SERVER_ID, TERMINAL_ID, BITMASK);
        h.client
            .write_all(&wire[..NTCB_HEADER_SIZE + 4])
            .await
            .unwrap();
        drop(h.client);

        let result = h.handle.await.unwrap();
        assert!(matches!(result, Err(SessionError::ConnectionClosed)));
        assert!(h.registry.lookup(DEVICE).await.is_none());
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.metrics.snapshot().connections_active, 0);
    }

    #[tokio::test]
    async fn test_device_id_falls_back_to_terminal_id() {
        let mut h = start(SessionConfig::default());

        h.client
            .write_all(&encode(SERVER_ID, TERMINAL_ID, b"*>S"))
            .await
            .unwrap();
        read_reply(&mut h.client).await;
        h.client
            .write_all(&encode(SERVER_ID, TERMINAL_ID, BITMASK))
            .await
            .unwrap();
        read_reply(&mut h.client).await;

        assert!(h.registry.lookup("42").await.is_some());
    }

    #[tokio::test]
    async fn test_non_bitmask_after_handshake_is_fatal() {
        let mut h = start(SessionConfig::default());

        h.client
            .write_all(&encode(SERVER_ID, TERMINAL_ID, b"*>S:1"))
            .await
            .unwrap();
        read_reply(&mut h.client).await;
        h.client
            .write_all(&encode(SERVER_ID, TERMINAL_ID, b"*>T:whatever"))
            .await
            .unwrap();

        let result = h.handle.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Protocol(ProtocolError::InvalidFlexMarker(_)))
        ));
        assert_eq!(h.registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_command_and_reply() {
        let mut h = start(SessionConfig::default());
        negotiate(&mut h).await;

        h.registry.send_command(DEVICE, "*!STATUS").await.unwrap();
        let command = read_reply(&mut h.client).await;
        assert_eq!(command.header.recipient, TERMINAL_ID);
        assert_eq!(command.header.sender, SERVER_ID);
        assert_eq!(&command.payload[..], b"*!STATUS");

        h.client
            .write_all(&encode(SERVER_ID, TERMINAL_ID, b"*@STATUS OK"))
            .await
            .unwrap();
        match next_event(&mut h.events).await {
            DeviceEvent::CommandReply { device_id, text } => {
                assert_eq!(device_id, DEVICE);
                assert_eq!(text, "*@STATUS OK");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_corrupted_frame_then_recovery() {
        let mut h = start(SessionConfig::default());
        negotiate(&mut h).await;

        let record = current_record(1, 10.0, 0);
        let mut bad = encode_frame(FrameKind::Current, None, &[&record[..]]).to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        h.client.write_all(&bad).await.unwrap();

        let record = current_record(2, 20.0, 180);
        let good = encode_frame(FrameKind::Current, None, &[&record[..]]);
        h.client.write_all(&good).await.unwrap();

        // Only the good frame is acknowledged.
        let mut frame_ack = [0u8; 3];
        h.client.read_exact(&mut frame_ack).await.unwrap();
        assert_eq!(&frame_ack[..], &encode_ack(FrameKind::Current, 1, None)[..]);

        match next_event(&mut h.events).await {
            DeviceEvent::Telemetry { record, .. } => {
                assert_eq!(record.get("msg_number"), Some(&FieldValue::MsgNumber(2)));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(h.metrics.snapshot().crc_errors, 1);
    }

    #[tokio::test]
    async fn test_renegotiation() {
        let mut h = start(SessionConfig::default());
        negotiate(&mut h).await;

        // Unknown structure version: rejected, old layout kept.
        let bad = b"*>FLEX\xB0\x0A\x63\x45\x80\x0C\x00\x00\x00\x00\x00\x00\x00";
        h.client
            .write_all(&encode(SERVER_ID, TERMINAL_ID, bad))
            .await
            .unwrap();

        // Field #1 only.
        let narrow = b"*>FLEX\xB0\x0A\x0A\x45\x80\x00\x00\x00\x00\x00\x00\x00\x00";
        h.client
            .write_all(&encode(SERVER_ID, TERMINAL_ID, narrow))
            .await
            .unwrap();
        let echo = read_reply(&mut h.client).await;
        assert_eq!(&echo.payload[..], &narrow[..]);

        let device = h.registry.lookup(DEVICE).await.unwrap();
        assert_eq!(device.layout.active_fields, vec![1]);
        assert_eq!(device.layout.record_length, 4);

        let frame = encode_frame(FrameKind::Current, None, &[&9u32.to_le_bytes()[..]]);
        h.client.write_all(&frame).await.unwrap();
        match next_event(&mut h.events).await {
            DeviceEvent::Telemetry { record, .. } => {
                assert_eq!(record.len(), 1);
                assert_eq!(record.get("msg_number"), Some(&FieldValue::MsgNumber(9)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_operator_disconnect() {
        let mut h = start(SessionConfig::default());
        negotiate(&mut h).await;

        assert!(h.registry.request_shutdown(DEVICE).await);
        assert!(h.handle.await.unwrap().is_ok());
        assert!(matches!(
            next_event(&mut h.events).await,
            DeviceEvent::Disconnected { .. }
        ));
        assert_eq!(h.registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_frames_not_acked_when_disabled() {
        let mut h = start(SessionConfig {
            ack_frames: false,
            ..SessionConfig::default()
        });
        negotiate(&mut h).await;

        let record = current_record(3, 1.0, 1);
        let frame = encode_frame(FrameKind::Current, None, &[&record[..]]);
        h.client.write_all(&frame).await.unwrap();
        assert!(matches!(
            next_event(&mut h.events).await,
            DeviceEvent::Telemetry { .. }
        ));

        // A command still goes out and is the first thing the client reads.
        h.registry.send_command(DEVICE, "*!1Y").await.unwrap();
        let command = read_reply(&mut h.client).await;
        assert_eq!(&command.payload[..], b"*!1Y");
    }
}
