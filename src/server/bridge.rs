//! Handler that gives every connection its own device
//!
//! Device → peer runs as a regular [`Pump`]. Peer → device frames arrive
//! through the registry's receive loop, so that direction only needs the
//! writer half: `on_receive` feeds an inlet queue drained into the device.

use super::Handler;
use crate::device::{Device, DevicePort};
use crate::transport::{Connection, ConnectionId};
use crate::tunnel::{FrameSink, FrameTx, Pump, PumpConfig};
use crate::Error;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Opens the device for a newly arrived connection
pub type DeviceFactory = Box<dyn Fn(&Connection) -> io::Result<Arc<dyn Device>> + Send + Sync>;

struct Attachment {
    device: Arc<dyn Device>,
    inlet: FrameTx,
    outbound: Pump,
    inbound: Pump,
}

/// Bridges each connection to a device opened by a factory
pub struct DeviceBridge {
    factory: DeviceFactory,
    config: PumpConfig,
    attached: Mutex<HashMap<ConnectionId, Attachment>>,
}

impl DeviceBridge {
    pub fn new(factory: DeviceFactory, config: PumpConfig) -> Self {
        Self {
            factory,
            config,
            attached: Mutex::new(HashMap::new()),
        }
    }

    /// Number of connections with a device attached
    pub async fn attached(&self) -> usize {
        self.attached.lock().await.len()
    }
}

#[async_trait]
impl Handler for DeviceBridge {
    async fn on_connect(&self, conn: &Arc<Connection>) -> crate::Result<()> {
        let device = (self.factory)(conn.as_ref())
            .map_err(|e| Error::Device(format!("opening device for {}: {}", conn, e)))?;
        let name = device.name().to_string();
        conn.set_device(name.clone());

        let port = Arc::new(DevicePort::new(
            Arc::clone(&device),
            conn.framer().max_size(),
        ));
        let conn_sink: Arc<dyn FrameSink> = conn.clone();

        let outbound = Pump::spawn(
            format!("{} -> {}", name, conn.remote_addr()),
            port.clone(),
            conn_sink,
            &self.config,
        );
        let (inlet, inbound) = Pump::with_inlet(
            format!("{} -> {}", conn.remote_addr(), name),
            port,
            &self.config,
        );

        info!("Attached {} to {}", name, conn);
        self.attached.lock().await.insert(
            conn.id(),
            Attachment {
                device,
                inlet,
                outbound,
                inbound,
            },
        );
        Ok(())
    }

    async fn on_receive(&self, conn: &Arc<Connection>, frame: Bytes) -> crate::Result<()> {
        // Don't hold the map across a possibly blocking enqueue
        let inlet = match self.attached.lock().await.get(&conn.id()) {
            Some(attachment) => attachment.inlet.clone(),
            None => return Err(Error::Device(format!("no device attached to {}", conn))),
        };
        inlet.enqueue(frame).await?;
        Ok(())
    }

    async fn on_disconnect(&self, conn: &Arc<Connection>) {
        let Some(attachment) = self.attached.lock().await.remove(&conn.id()) else {
            return;
        };
        let Attachment {
            device,
            inlet,
            outbound,
            inbound,
        } = attachment;

        if let Err(e) = device.close().await {
            warn!("Closing {} failed: {}", device.name(), e);
        }
        drop(inlet);

        let out = outbound.join().await;
        let inb = inbound.join().await;
        debug!(
            outbound = out.written,
            inbound = inb.written,
            "Detached {} from {}",
            device.name(),
            conn
        );
    }
}
