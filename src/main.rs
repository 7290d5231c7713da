//! DriftVPN CLI
//!
//! Runs a WireGuard device from a standard `.conf` file: creates the TUN
//! interface, binds the UDP socket, registers every configured peer, and
//! runs until interrupted.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use driftvpn::config::{DeviceConfig, DEFAULT_MTU};
use driftvpn::net::{PacketTransport, UdpTransport};
use driftvpn::protocol::DEFAULT_KEEPALIVE;
use driftvpn::tun::TunDevice;
use driftvpn::Device;

/// DriftVPN - Userspace WireGuard
#[derive(Parser, Debug)]
#[command(name = "driftvpn")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to WireGuard configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    run(args).await
}

async fn run(args: Args) -> anyhow::Result<()> {
    tracing::info!("Loading configuration from: {}", args.config.display());
    let config = DeviceConfig::from_file(&args.config)?;

    let address = config
        .interface
        .address
        .first()
        .copied()
        .context("configuration must set at least one interface Address")?;
    let mtu = config.interface.mtu.unwrap_or(DEFAULT_MTU);
    let tun = TunDevice::create(address.addr(), address.prefix_len(), mtu).await?;

    let listen: SocketAddr = (
        Ipv4Addr::UNSPECIFIED,
        config.interface.listen_port.unwrap_or(0),
    )
        .into();
    let transport = UdpTransport::bind(listen).await?;
    tracing::info!("Listening on {}", transport.local_addr()?);

    let device = Device::new(
        config.interface.private_key.clone(),
        Arc::new(transport),
        Arc::new(tun),
    );
    for peer in &config.peers {
        device.add_peer(peer.connection_info(DEFAULT_KEEPALIVE))?;
    }

    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<anyhow::Result<()>>();

    tokio::select! {
        result = device.run() => {
            result?;
            Ok(())
        }
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
            Ok(())
        }
    }
}
