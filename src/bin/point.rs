//! ethertun point
//!
//! Connects one local tap interface to an ethertun server. When the
//! tunnel breaks it is rebuilt after `reconnect_interval_ms`.

use anyhow::{Context, Result};
use clap::Parser;
use ethertun::{
    config::{generate_example_config, Config},
    device::Device,
    tunnel::Tunnel,
    Connection,
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Ethernet header bytes on top of the interface MTU
const ETHER_HEADER_LEN: usize = 14;

/// ethertun point - Ethernet frames over TCP
#[derive(Parser, Debug)]
#[command(name = "ethertun-point")]
#[command(about = "ethertun point - attaches a local tap device to an ethertun server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Tap interface name (overrides config)
    #[arg(short, long)]
    device: Option<String>,

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

    if let Some(server) = args.server {
        config.point.server = server;
    }
    if let Some(device) = args.device {
        config.point.device = Some(device);
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

    info!("ethertun point v{}", ethertun::VERSION);
    info!("Server: {}", config.point.server);

    let mut round = 0u64;
    loop {
        round += 1;

        let device = match open_device(&config) {
            Ok(device) => device,
            // Nothing will work without the interface
            Err(e) if round == 1 => return Err(e),
            Err(e) => {
                error!("Failed to open device: {:#}", e);
                if wait_or_interrupt(&config).await {
                    break;
                }
                continue;
            }
        };

        let conn = Arc::new(
            Connection::new(
                config.point.server.clone(),
                config.tunnel.framer(),
                config.transport.clone(),
            )
            .with_verbose(config.tunnel.verbose),
        );
        let mut tunnel = Tunnel::new(device, conn, config.tunnel.pump_config());
        tunnel.start()?;

        let interrupted = tokio::select! {
            _ = tunnel.closed() => false,
            _ = tokio::signal::ctrl_c() => true,
        };

        let stats = tunnel.stop().await;
        info!(
            sent = stats.outbound.written,
            received = stats.inbound.written,
            "Tunnel down"
        );

        if interrupted {
            break;
        }
        warn!(
            "Tunnel closed, rebuilding in {:?}",
            config.point.reconnect_interval()
        );
        if wait_or_interrupt(&config).await {
            break;
        }
    }

    info!("Shutting down...");
    Ok(())
}

/// Sleep for the reconnect interval; true if Ctrl-C came first
async fn wait_or_interrupt(config: &Config) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(config.point.reconnect_interval()) => false,
        _ = tokio::signal::ctrl_c() => true,
    }
}

#[cfg(all(target_os = "linux", feature = "tap"))]
fn open_device(config: &Config) -> Result<Arc<dyn Device>> {
    use ethertun::device::LinuxTap;

    let mtu = u16::try_from(config.tunnel.max_frame_size.saturating_sub(ETHER_HEADER_LEN))
        .context("MTU out of range")?;
    let tap = LinuxTap::open(config.point.device.as_deref(), mtu)
        .context("Failed to open tap device")?;
    Ok(Arc::new(tap))
}

#[cfg(not(all(target_os = "linux", feature = "tap")))]
fn open_device(_config: &Config) -> Result<Arc<dyn Device>> {
    anyhow::bail!("tap devices require Linux and the `tap` feature")
}
