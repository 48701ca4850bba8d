//! Control API shared state.

use std::sync::Arc;

use crate::metrics::GatewayMetrics;
use crate::server::SessionRegistry;

/// Shared state for the control API.
pub struct WebState {
    /// Connected devices and their command queues.
    pub registry: Arc<SessionRegistry>,
    /// Gateway counters.
    pub metrics: Arc<GatewayMetrics>,
}

impl WebState {
    /// Create a new web state.
    pub fn new(registry: Arc<SessionRegistry>, metrics: Arc<GatewayMetrics>) -> Self {
        Self { registry, metrics }
    }
}
