//! iap-tunnel: open a local tunnel to an instance and keep it alive
//!
//! Relays through the direct relay client configured in `direct_targets`.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iap_core::config::{self, TransportConfig};
use iap_core::{AllowAllPolicy, InstanceLocator, Protocol, Rdp, Ssh, TunnelProfile};
use iap_transport::{
    DirectRelayClient, EventQueue, RelayTunnelFactory, TransportFactory, TunnelEvent,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProtocolArg {
    Rdp,
    Ssh,
}

#[derive(Parser)]
#[command(name = "iap-tunnel")]
#[command(about = "Open a loopback tunnel to a cloud instance")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Target instance, as projects/{project}/zones/{zone}/instances/{name}
    #[arg(short, long)]
    instance: InstanceLocator,

    /// Application protocol
    #[arg(long, value_enum, default_value = "rdp")]
    protocol: ProtocolArg,

    /// Target port (defaults to the protocol's port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Preferred local port
    #[arg(short, long)]
    local_port: Option<u16>,

    /// Creation timeout in seconds (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(args.config.as_deref())?;
    config.validate().context("Invalid configuration")?;

    let (protocol, default_port): (Arc<dyn Protocol>, u16) = match args.protocol {
        ProtocolArg::Rdp => (Arc::new(Rdp), Rdp::DEFAULT_PORT),
        ProtocolArg::Ssh => (Arc::new(Ssh), Ssh::DEFAULT_PORT),
    };

    let profile = TunnelProfile::new(
        protocol,
        Arc::new(AllowAllPolicy),
        args.instance.clone(),
        args.port.unwrap_or(default_port),
        args.local_port
            .map(|port| SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)),
    )?;

    let client = DirectRelayClient::from_config(&config.direct_targets)
        .context("Invalid direct_targets entry")?;
    if client.is_empty() {
        tracing::warn!("No direct targets configured - every relay will be denied");
    }

    let tunnels = RelayTunnelFactory::from_config(Arc::new(client), &config);

    let (events, receiver) = EventQueue::channel();
    tokio::spawn(receiver.dispatch(|event| match event {
        TunnelEvent::Created(tunnel) => {
            tracing::info!("Tunnel created: {} on {}", tunnel.id(), tunnel.local_endpoint())
        }
        TunnelEvent::Closed(tunnel) => {
            let stats = tunnel.statistics();
            tracing::info!(
                "Tunnel closed: {} ({} bytes received, {} bytes transmitted)",
                tunnel.id(),
                stats.bytes_received(),
                stats.bytes_transmitted()
            )
        }
    }));

    let factory = TransportFactory::new(Arc::new(tunnels), Arc::new(events));
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(config.connect_timeout);

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        cancel_clone.cancel();
    });

    let transport = factory
        .create_transport(profile, timeout, &cancel)
        .await
        .map_err(|e| {
            let topic = e.help_topic();
            anyhow::Error::new(e).context(format!("See help topic '{}'", topic))
        })?;

    println!(
        "Forwarding {} -> {}",
        transport.endpoint(),
        transport.target()
    );

    cancel.cancelled().await;
    transport.close().await;

    tracing::info!("Tunnel shutdown complete");
    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<TransportConfig> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            TransportConfig::default()
        }))
    } else {
        tracing::info!("Using default configuration");
        Ok(TransportConfig::default())
    }
}
