//! Gatehouse - the authentication front door of a multi-client gateway
//!
//! Every client (operator tooling, automation, remote execution nodes) must
//! complete a signed connect handshake here before it may issue requests.
//! The binary wires the trust stores, rate limiter, and handshake server
//! together and serves the WebSocket endpoint plus the pairing approval API.

use anyhow::{Context, Result};
use clap::Parser;
use gatehouse_auth::{AuditLog, AuthRateLimiter, DeviceTokenStore, PairingStore};
use gatehouse_core::GatewayConfig;
use gatehouse_server::{create_router, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Gatehouse - authenticated connect handshake and device pairing
#[derive(Parser, Debug)]
#[command(name = "gatehouse")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Shared secret clients may authenticate with (overrides config)
    #[arg(long)]
    shared_secret: Option<String>,

    /// Directory for paired-device and token state
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Waive device-identity requirements (not recommended)
    #[arg(long)]
    dangerously_disable_device_auth: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("Gatehouse v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration and apply CLI overrides
    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(secret) = args.shared_secret {
        config.shared_secret = Some(secret);
    }
    if let Some(dir) = args.state_dir {
        config.state_dir = Some(dir);
    }
    if args.dangerously_disable_device_auth {
        config.control_ui.dangerously_disable_device_auth = true;
    }

    // Trust stores shared across all connections
    let (tokens, pairing) = match &config.state_dir {
        Some(dir) => {
            info!("Initializing trust stores in {:?}", dir);
            let tokens = DeviceTokenStore::with_path(dir.join("device_tokens.json"))
                .await
                .context("failed to open device token store")?;
            let pairing = PairingStore::with_path(dir.join("paired_devices.json"))
                .await
                .context("failed to open pairing store")?;
            (tokens, pairing)
        }
        None => {
            let tokens = DeviceTokenStore::new()
                .await
                .context("failed to open device token store")?;
            let pairing = PairingStore::new()
                .await
                .context("failed to open pairing store")?;
            (tokens, pairing)
        }
    };
    let tokens = Arc::new(tokens);
    let pairing = Arc::new(pairing);
    let limiter = Arc::new(AuthRateLimiter::new(config.rate_limit.clone()));
    let audit = Arc::new(AuditLog::new());

    if config.shared_secret.is_some() {
        info!("Shared-secret auth: ENABLED");
    } else {
        warn!("Shared-secret auth: DISABLED (no secret configured)");
    }
    if config.control_ui.dangerously_disable_device_auth {
        warn!("Device auth: DISABLED (--dangerously-disable-device-auth)");
    } else {
        let paired = pairing.list().await.len();
        info!("Device auth: ENABLED ({} paired devices)", paired);
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;
    let state = Arc::new(AppState::new(config, limiter, tokens, pairing, audit));
    let router = create_router(state);

    info!("Listening on {}", addr);
    info!("  WebSocket endpoint: ws://{}/ws", addr);
    info!("  Pairing API:        http://{}/api/pairing/pending", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind listener")?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}
