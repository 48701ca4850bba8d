//! Registry of connected devices and the operator command path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, info};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use ntcb_protocol::{encode, FlexVersion, RecordLayout, MAX_PAYLOAD_LEN};

/// Errors returned to a command caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No live connection for this device.
    #[error("Device {0} is not connected")]
    DeviceNotConnected(String),

    /// The connection closed before the command could be queued.
    #[error("Connection to device {0} is closed")]
    ConnectionClosed(String),

    /// Command text is empty, not ASCII, or too long for one NTCB message.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

/// State of one negotiated device connection.
///
/// The outbound queue is drained by the connection's writer task; holding a
/// clone never gives access to the socket itself.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub device_id: String,
    pub connection_id: u64,
    pub peer: SocketAddr,
    /// Our NTCB identifier, as addressed by the terminal.
    pub server_id: u32,
    /// The terminal's NTCB identifier.
    pub terminal_id: u32,
    pub struct_version: FlexVersion,
    pub layout: RecordLayout,
    pub connected_at: Instant,
    outbound: mpsc::Sender<Bytes>,
}

impl DeviceSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: String,
        connection_id: u64,
        peer: SocketAddr,
        server_id: u32,
        terminal_id: u32,
        struct_version: FlexVersion,
        layout: RecordLayout,
        outbound: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            device_id,
            connection_id,
            peer,
            server_id,
            terminal_id,
            struct_version,
            layout,
            connected_at: Instant::now(),
            outbound,
        }
    }

    /// Summary for the control API.
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.device_id.clone(),
            connection_id: self.connection_id,
            peer: self.peer.to_string(),
            server_id: self.server_id,
            terminal_id: self.terminal_id,
            struct_version: self.struct_version,
            active_fields: self.layout.active_fields.clone(),
            record_length: self.layout.record_length,
            connected_seconds: self.connected_at.elapsed().as_secs(),
        }
    }
}

/// Serializable view of a connected device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub connection_id: u64,
    pub peer: String,
    pub server_id: u32,
    pub terminal_id: u32,
    pub struct_version: FlexVersion,
    pub active_fields: Vec<u16>,
    pub record_length: usize,
    pub connected_seconds: u64,
}

#[derive(Debug)]
struct Entry {
    session: DeviceSession,
    shutdown_tx: mpsc::Sender<()>,
}

/// Maps device id to its live session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    devices: RwLock<HashMap<String, Entry>>,
}

impl SessionRegistry {
    /// Create a new session registry.
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session, replacing any previous one for the same device.
    ///
    /// Returns a receiver that fires when an operator asks to disconnect
    /// the device. It closes when the entry is replaced or removed.
    pub async fn register(&self, session: DeviceSession) -> mpsc::Receiver<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let device_id = session.device_id.clone();
        let connection_id = session.connection_id;
        let previous = self.devices.write().await.insert(
            device_id.clone(),
            Entry {
                session,
                shutdown_tx,
            },
        );
        if let Some(prev) = previous {
            info!(
                "Device {} re-registered: connection {} replaces {}",
                device_id, connection_id, prev.session.connection_id
            );
        }
        shutdown_rx
    }

    /// Look up the live session for a device.
    pub async fn lookup(&self, device_id: &str) -> Option<DeviceSession> {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(|e| e.session.clone())
    }

    /// Remove a device's entry regardless of which connection owns it.
    #[allow(dead_code)]
    pub async fn unregister(&self, device_id: &str) -> Option<DeviceSession> {
        self.devices
            .write()
            .await
            .remove(device_id)
            .map(|e| e.session)
    }

    /// Remove a device's entry only if it still belongs to `connection_id`.
    ///
    /// Used on connection teardown so that a stale connection never removes
    /// the entry of a newer one.
    pub async fn release(&self, device_id: &str, connection_id: u64) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get(device_id) {
            Some(entry) if entry.session.connection_id == connection_id => {
                devices.remove(device_id);
                true
            }
            _ => false,
        }
    }

    /// Replace the record layout after a renegotiation.
    pub async fn update_layout(
        &self,
        device_id: &str,
        connection_id: u64,
        struct_version: FlexVersion,
        layout: RecordLayout,
    ) {
        if let Some(entry) = self.devices.write().await.get_mut(device_id) {
            if entry.session.connection_id == connection_id {
                entry.session.struct_version = struct_version;
                entry.session.layout = layout;
            }
        }
    }

    /// Ask the connection serving a device to close.
    pub async fn request_shutdown(&self, device_id: &str) -> bool {
        let target = self
            .devices
            .read()
            .await
            .get(device_id)
            .map(|e| (e.shutdown_tx.clone(), e.session.connection_id));
        match target {
            Some((tx, _)) if tx.send(()).await.is_ok() => true,
            Some((_, connection_id)) => {
                // Session task already gone; drop its route unless a newer
                // connection took over meanwhile.
                self.release(device_id, connection_id).await;
                false
            }
            None => false,
        }
    }

    /// Wrap an ASCII command in NTCB and queue it for the device.
    pub async fn send_command(&self, device_id: &str, command: &str) -> Result<(), CommandError> {
        if command.is_empty() || !command.is_ascii() {
            return Err(CommandError::InvalidCommand(command.to_string()));
        }
        if command.len() > MAX_PAYLOAD_LEN {
            return Err(CommandError::InvalidCommand(format!(
                "{} bytes exceeds the {} byte NTCB payload limit",
                command.len(),
                MAX_PAYLOAD_LEN
            )));
        }

        let session = self
            .lookup(device_id)
            .await
            .ok_or_else(|| CommandError::DeviceNotConnected(device_id.to_string()))?;

        let frame = encode(session.terminal_id, session.server_id, command.as_bytes());
        session
            .outbound
            .send(frame)
            .await
            .map_err(|_| CommandError::ConnectionClosed(device_id.to_string()))?;

        debug!(
            "[Conn {}] Queued command for {}: {}",
            session.connection_id, device_id, command
        );
        Ok(())
    }

    /// Get all connected devices.
    pub async fn get_all(&self) -> Vec<DeviceSession> {
        self.devices
            .read()
            .await
            .values()
            .map(|e| e.session.clone())
            .collect()
    }

    /// Get device count.
    pub async fn count(&self) -> usize {
        self.devices.read().await.len()
    }
}
