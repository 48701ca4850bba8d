//! Device events published to notification consumers.

use std::net::SocketAddr;

use log::{info, warn};
use serde::Serialize;
use tokio::sync::broadcast;

use ntcb_protocol::{FrameKind, TelemetryRecord};

/// Capacity of the event channel. Slow consumers lose the oldest events.
const EVENT_CAPACITY: usize = 1024;

/// Something that happened on a device connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceEvent {
    Connected {
        device_id: String,
        connection_id: u64,
        peer: SocketAddr,
    },
    Telemetry {
        device_id: String,
        frame: FrameKind,
        event_index: Option<u32>,
        record: TelemetryRecord,
    },
    /// Text the terminal sent back in an NTCB message, usually a reply to
    /// an operator command.
    CommandReply { device_id: String, text: String },
    Disconnected {
        device_id: String,
        connection_id: u64,
    },
}

/// Fan-out of device events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DeviceEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Events with no subscriber are dropped.
    pub fn publish(&self, event: DeviceEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }
}

/// Log every event. Runs until the bus is dropped.
pub async fn run_event_logger(mut rx: broadcast::Receiver<DeviceEvent>) {
    loop {
        match rx.recv().await {
            Ok(DeviceEvent::Telemetry { device_id, frame, record, .. }) => {
                let body = serde_json::to_string(&record).unwrap_or_default();
                info!("[Device {}] {} {}", device_id, frame, body);
            }
            Ok(DeviceEvent::Connected { device_id, connection_id, peer }) => {
                info!("[Device {}] Connected (conn {}, {})", device_id, connection_id, peer);
            }
            Ok(DeviceEvent::CommandReply { device_id, text }) => {
                info!("[Device {}] Reply: {}", device_id, text);
            }
            Ok(DeviceEvent::Disconnected { device_id, connection_id }) => {
                info!("[Device {}] Disconnected (conn {})", device_id, connection_id);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Event logger lagged, {} events dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
