//! flex-gateway: TCP gateway for NTCB/FLEX vehicle tracking terminals.
//!
//! Terminals connect over TCP, identify themselves with an NTCB handshake,
//! negotiate a FLEX field bitmask and then stream telemetry frames. Decoded
//! records are published as device events; operators send commands back
//! through the control API.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

mod events;
mod logging;
mod metrics;
mod server;
mod web;

use events::EventBus;
use metrics::GatewayMetrics;
use server::{Server, ServerConfig, SessionConfig, SessionRegistry};

const DEFAULT_LISTEN: &str = "0.0.0.0:12345";
const DEFAULT_CONTROL_LISTEN: &str = "127.0.0.1:8080";
const DEFAULT_MAX_CONNECTIONS: usize = 1024;
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_RETENTION_DAYS: u64 = 7;
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_OUTBOUND_QUEUE: usize = 64;
const DEFAULT_REPORT_INTERVAL_SECS: u64 = 300;

/// flex-gateway - TCP gateway for NTCB/FLEX tracking terminals
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address terminals connect to
    #[arg(short, long, default_value = DEFAULT_LISTEN)]
    listen: SocketAddr,

    /// Address for the control API
    #[arg(long, default_value = DEFAULT_CONTROL_LISTEN)]
    control_listen: SocketAddr,

    /// Maximum concurrent connections
    #[arg(short = 'c', long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value_t = DEFAULT_RETENTION_DAYS)]
    log_retention_days: u64,

    /// Seconds to wait for the handshake and the bitmask announcement
    #[arg(long, default_value_t = DEFAULT_HANDSHAKE_TIMEOUT_SECS)]
    handshake_timeout_secs: u64,

    /// Do not acknowledge telemetry frames
    #[arg(long)]
    no_ack: bool,

    /// Seconds between metrics reports in the log (0 disables)
    #[arg(long, default_value_t = DEFAULT_REPORT_INTERVAL_SECS)]
    report_interval_secs: u64,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct ServerSection {
    listen: Option<SocketAddr>,
    control_listen: Option<SocketAddr>,
    max_connections: Option<usize>,
    handshake_timeout_secs: Option<u64>,
    write_timeout_secs: Option<u64>,
    ack_frames: Option<bool>,
    outbound_queue: Option<usize>,
    report_interval_secs: Option<u64>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<PathBuf>,
    retention_days: Option<u64>,
    level: Option<String>,
}

/// Effective settings after merging the command line over the config file.
#[derive(Debug)]
struct Settings {
    server: ServerConfig,
    control_listen: SocketAddr,
    report_interval: Duration,
    log_dir: PathBuf,
    log_retention_days: u64,
    log_level: Option<String>,
    verbose: bool,
}

/// Command line value if it was changed from its default, else the file value.
fn pick<T: PartialEq>(cli: T, default: T, file: Option<T>) -> T {
    if cli != default {
        cli
    } else {
        file.unwrap_or(default)
    }
}

impl Settings {
    fn resolve(args: &Args, file: ConfigFile) -> Result<Self, Box<dyn std::error::Error>> {
        let ConfigFile { server, logging } = file;

        let listen = pick(args.listen, DEFAULT_LISTEN.parse()?, server.listen);
        let control_listen = pick(
            args.control_listen,
            DEFAULT_CONTROL_LISTEN.parse()?,
            server.control_listen,
        );
        let max_connections = pick(
            args.max_connections,
            DEFAULT_MAX_CONNECTIONS,
            server.max_connections,
        );
        let handshake_timeout_secs = pick(
            args.handshake_timeout_secs,
            DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            server.handshake_timeout_secs,
        );
        let ack_frames = !args.no_ack && server.ack_frames.unwrap_or(true);
        let report_interval_secs = pick(
            args.report_interval_secs,
            DEFAULT_REPORT_INTERVAL_SECS,
            server.report_interval_secs,
        );

        let session = SessionConfig {
            handshake_timeout: Duration::from_secs(handshake_timeout_secs),
            write_timeout: Duration::from_secs(
                server.write_timeout_secs.unwrap_or(DEFAULT_WRITE_TIMEOUT_SECS),
            ),
            ack_frames,
            outbound_queue: server.outbound_queue.unwrap_or(DEFAULT_OUTBOUND_QUEUE),
        };

        Ok(Self {
            server: ServerConfig {
                listen_addr: listen,
                max_connections,
                session,
            },
            control_listen,
            report_interval: Duration::from_secs(report_interval_secs),
            log_dir: pick(
                args.log_dir.clone(),
                PathBuf::from(DEFAULT_LOG_DIR),
                logging.log_dir,
            ),
            log_retention_days: pick(
                args.log_retention_days,
                DEFAULT_RETENTION_DAYS,
                logging.retention_days,
            ),
            log_level: logging.level,
            verbose: args.verbose,
        })
    }
}

fn load_config(path: &Path) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Config file: explicit path > auto-detect > defaults
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("flex-gateway.toml");
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file {}: {}", path.display(), e);
                return Err(e);
            }
        },
        None => ConfigFile::default(),
    };

    let settings = Settings::resolve(&args, file_config)?;

    logging::init_logging(
        &settings.log_dir,
        settings.log_retention_days,
        settings.verbose,
        settings.log_level.as_deref(),
    )?;

    info!("flex-gateway starting...");
    info!("  Listen address: {}", settings.server.listen_addr);
    info!("  Control API: {}", settings.control_listen);
    info!("  Max connections: {}", settings.server.max_connections);
    info!(
        "  Handshake timeout: {}s, write timeout: {}s",
        settings.server.session.handshake_timeout.as_secs(),
        settings.server.session.write_timeout.as_secs()
    );
    info!("  Frame acks: {}", settings.server.session.ack_frames);

    let registry = Arc::new(SessionRegistry::new());
    let events = EventBus::new();
    let metrics = GatewayMetrics::new();
    let shutdown = CancellationToken::new();

    tokio::spawn(events::run_event_logger(events.subscribe()));

    if !settings.report_interval.is_zero() {
        let metrics = Arc::clone(&metrics);
        let period = settings.report_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                metrics.print_report();
            }
        });
    }

    let web_state = Arc::new(web::WebState::new(Arc::clone(&registry), Arc::clone(&metrics)));
    let web_shutdown = shutdown.clone();
    let control_listen = settings.control_listen;
    tokio::spawn(async move {
        match web::start_web_server(control_listen, web_state, web_shutdown).await {
            Ok(()) => info!("Control API stopped"),
            Err(e) => error!("Control API error: {}", e),
        }
    });

    let server = Server::new(settings.server, registry, events, Arc::clone(&metrics));
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    shutdown.cancel();
    metrics.print_report();
    Ok(())
}
