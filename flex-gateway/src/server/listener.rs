//! TCP listener for accepting device connections.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::events::EventBus;
use crate::metrics::GatewayMetrics;
use crate::server::registry::SessionRegistry;
use crate::server::session::{Session, SessionConfig, SessionError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Per-connection settings.
    pub session: SessionConfig,
}

/// Accepts device connections and spawns a session for each.
pub struct Server {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    events: EventBus,
    metrics: Arc<GatewayMetrics>,
    next_id: AtomicU64,
    permits: Arc<Semaphore>,
}

impl Server {
    /// Create a new server with the given configuration.
    pub fn new(
        config: ServerConfig,
        registry: Arc<SessionRegistry>,
        events: EventBus,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Self {
            config,
            registry,
            events,
            metrics,
            next_id: AtomicU64::new(1),
            permits,
        }
    }

    /// Bind the configured address and serve until the task is cancelled.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!("Device server listening on {}", self.config.listen_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => self.spawn_connection(socket, addr),
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    fn spawn_connection(&self, socket: TcpStream, addr: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "[Conn {}] Rejecting {}: {} connections already open",
                    id, addr, self.config.max_connections
                );
                return;
            }
        };

        info!("[Conn {}] New connection from {}", id, addr);

        let config = self.config.session.clone();
        let registry = Arc::clone(&self.registry);
        let events = self.events.clone();
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            match handle_connection(socket, addr, id, config, registry, events, metrics, permit).await {
                Ok(()) => {}
                Err(SessionError::ConnectionClosed) => {
                    debug!("[Conn {}] Closed before negotiation finished", id);
                }
                Err(e) => {
                    error!("[Conn {}] Connection error: {}", id, e);
                }
            }
            info!("[Conn {}] Connection closed", id);
        });
    }
}

/// Handle a single device connection.
#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    id: u64,
    config: SessionConfig,
    registry: Arc<SessionRegistry>,
    events: EventBus,
    metrics: Arc<GatewayMetrics>,
    _permit: OwnedSemaphorePermit,
) -> Result<(), SessionError> {
    // Disable Nagle's algorithm so acks go out immediately
    socket.set_nodelay(true)?;

    let session = Session::new(id, addr, socket, config, registry, events, metrics);
    session.run().await
}
