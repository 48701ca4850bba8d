//! Gateway-wide counters.
//!
//! Counts connections, decoded telemetry and the recoverable protocol
//! faults each connection reports. Exposed through the control API and
//! logged periodically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::info;
use serde::Serialize;

/// Atomic counters shared by all connections.
pub struct GatewayMetrics {
    start_time: Instant,
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    handshakes_completed: AtomicU64,
    frames_decoded: AtomicU64,
    records_decoded: AtomicU64,
    crc_errors: AtomicU64,
    unknown_frame_types: AtomicU64,
    payload_checksum_errors: AtomicU64,
    commands_sent: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_completed: u64,
    pub frames_decoded: u64,
    pub records_decoded: u64,
    pub crc_errors: u64,
    pub unknown_frame_types: u64,
    pub payload_checksum_errors: u64,
    pub commands_sent: u64,
}

impl GatewayMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_completed(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a CRC-valid frame and the records it carried.
    pub fn record_frame(&self, records: u64) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
        self.records_decoded.fetch_add(records, Ordering::Relaxed);
    }

    pub fn record_crc_error(&self) {
        self.crc_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_frame(&self) {
        self.unknown_frame_types.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_payload_checksum_error(&self) {
        self.payload_checksum_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            records_decoded: self.records_decoded.load(Ordering::Relaxed),
            crc_errors: self.crc_errors.load(Ordering::Relaxed),
            unknown_frame_types: self.unknown_frame_types.load(Ordering::Relaxed),
            payload_checksum_errors: self.payload_checksum_errors.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
        }
    }

    /// Print a gateway metrics report.
    pub fn print_report(&self) {
        let s = self.snapshot();
        info!(
            "[Gateway] Metrics: connections={} (active={}), handshakes={}, \
             frames={}, records={}, crc_errors={}, unknown_frames={}, commands={}",
            s.connections_total,
            s.connections_active,
            s.handshakes_completed,
            s.frames_decoded,
            s.records_decoded,
            s.crc_errors,
            s.unknown_frame_types,
            s.commands_sent
        );
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        GatewayMetrics {
            start_time: Instant::now(),
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_completed: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            records_decoded: AtomicU64::new(0),
            crc_errors: AtomicU64::new(0),
            unknown_frame_types: AtomicU64::new(0),
            payload_checksum_errors: AtomicU64::new(0),
            commands_sent: AtomicU64::new(0),
        }
    }
}
