//! Full-duplex tunnel: one device, one connection, two pumps

use super::pump::{FrameSink, FrameSource, Pump, PumpConfig, PumpStats};
use super::TunnelError;
use crate::device::{Device, DevicePort};
use crate::transport::Connection;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-direction counters of a stopped tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TunnelStats {
    /// Device → connection
    pub outbound: PumpStats,
    /// Connection → device
    pub inbound: PumpStats,
}

/// Relays frames both ways between a device and a connection
pub struct Tunnel {
    device: Arc<dyn Device>,
    conn: Arc<Connection>,
    config: PumpConfig,
    outbound: Option<Pump>,
    inbound: Option<Pump>,
    started: bool,
}

impl Tunnel {
    pub fn new(device: Arc<dyn Device>, conn: Arc<Connection>, config: PumpConfig) -> Self {
        Self {
            device,
            conn,
            config,
            outbound: None,
            inbound: None,
            started: false,
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Launch both pumps and return immediately. A tunnel starts once.
    pub fn start(&mut self) -> Result<(), TunnelError> {
        if self.started {
            return Err(TunnelError::AlreadyStarted);
        }
        self.started = true;

        let port = Arc::new(DevicePort::new(
            Arc::clone(&self.device),
            self.conn.framer().max_size(),
        ));
        let dev = self.device.name().to_string();
        let peer = self.conn.remote_addr().to_string();

        let conn_source: Arc<dyn FrameSource> = self.conn.clone();
        let conn_sink: Arc<dyn FrameSink> = self.conn.clone();

        self.outbound = Some(Pump::spawn(
            format!("{} -> {}", dev, peer),
            port.clone(),
            conn_sink,
            &self.config,
        ));
        self.inbound = Some(Pump::spawn(
            format!("{} -> {}", peer, dev),
            conn_source,
            port,
            &self.config,
        ));

        info!("Tunnel {} <-> {} started", dev, peer);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        match (&self.outbound, &self.inbound) {
            (Some(out), Some(inb)) => !out.is_terminated() && !inb.is_terminated(),
            _ => false,
        }
    }

    /// Resolves once either direction's reader has ended (device gone,
    /// peer gone, framing error). Returns at once if not running.
    pub async fn closed(&self) {
        if let (Some(out), Some(inb)) = (&self.outbound, &self.inbound) {
            tokio::select! {
                _ = out.terminated() => debug!("Tunnel outbound ended"),
                _ = inb.terminated() => debug!("Tunnel inbound ended"),
            }
        }
    }

    /// Close both endpoints, then wait for the pumps to drain or abort
    pub async fn stop(&mut self) -> TunnelStats {
        if let Err(e) = self.device.close().await {
            warn!("Closing {} failed: {}", self.device.name(), e);
        }
        self.conn.close().await;

        let mut stats = TunnelStats::default();
        if let Some(pump) = self.outbound.take() {
            stats.outbound = pump.join().await;
        }
        if let Some(pump) = self.inbound.take() {
            stats.inbound = pump.join().await;
        }

        info!(
            outbound = stats.outbound.written,
            inbound = stats.inbound.written,
            "Tunnel {} <-> {} stopped",
            self.device.name(),
            self.conn.remote_addr()
        );
        stats
    }
}
