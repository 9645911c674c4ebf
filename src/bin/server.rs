//! ethertun server
//!
//! Accepts points over TCP and gives each one its own tap interface,
//! optionally enslaved to a Linux bridge so all points share one segment.

use anyhow::{Context, Result};
use clap::Parser;
use ethertun::{
    config::{generate_example_config, Config},
    server::{DeviceBridge, DeviceFactory, Server},
};
use std::sync::Arc;
use tracing::info;

/// Ethernet header bytes on top of the interface MTU
const ETHER_HEADER_LEN: usize = 14;

/// ethertun server - Ethernet frames over TCP
#[derive(Parser, Debug)]
#[command(name = "ethertun-server")]
#[command(about = "ethertun server - relays Ethernet frames between points and tap devices")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Bridge to attach every tap to (overrides config)
    #[arg(short, long)]
    bridge: Option<String>,

    /// Interface MTU (overrides config)
    #[arg(long)]
    mtu: Option<u16>,

    /// Log every frame
    #[arg(long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to render example config")?;
        print!("{}", example);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };

    // Command line wins over the file
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(bridge) = args.bridge {
        config.server.bridge = Some(bridge);
    }
    if let Some(mtu) = args.mtu {
        config.tunnel.max_frame_size = mtu as usize + ETHER_HEADER_LEN;
    }
    if args.verbose {
        config.tunnel.verbose = true;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate().context("Invalid configuration")?;

    config.logging.init();

    info!("ethertun server v{}", ethertun::VERSION);
    if let Some(bridge) = &config.server.bridge {
        info!("Taps will be attached to bridge {}", bridge);
    }

    let handler = Arc::new(DeviceBridge::new(
        tap_factory(&config)?,
        config.tunnel.pump_config(),
    ));
    let server = Server::bind(&config.server.listen, config.server_options(), handler)
        .await
        .context("Failed to bind to address")?;

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}

/// One kernel tap per point
#[cfg(all(target_os = "linux", feature = "tap"))]
fn tap_factory(config: &Config) -> Result<DeviceFactory> {
    use ethertun::device::{Device, LinuxTap};
    use ethertun::Connection;

    let mtu = u16::try_from(config.tunnel.max_frame_size.saturating_sub(ETHER_HEADER_LEN))
        .context("MTU out of range")?;
    let bridge = config.server.bridge.clone();

    Ok(Box::new(move |conn: &Connection| {
        let tap = LinuxTap::open(None, mtu)?;
        if let Some(bridge) = &bridge {
            tap.attach_to_bridge(bridge)?;
        }
        info!("{} uses {}", conn, tap.name());
        Ok(Arc::new(tap) as Arc<dyn Device>)
    }))
}

#[cfg(not(all(target_os = "linux", feature = "tap")))]
fn tap_factory(_config: &Config) -> Result<DeviceFactory> {
    anyhow::bail!("tap devices require Linux and the `tap` feature")
}
