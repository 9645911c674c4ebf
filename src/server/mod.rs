//! Server side: accept loop, connection registry and handlers
//!
//! The accept loop only wraps sockets and hands them to the [`Registry`],
//! which is the single owner of the live-connection set. Every tracked
//! connection gets its own receive loop feeding [`Handler::on_receive`].

mod bridge;
mod registry;

pub use bridge::{DeviceBridge, DeviceFactory};
pub use registry::{Registry, RegistryHandle, RegistryStats, RegistryStopped, SessionInfo};

use crate::transport::{Connection, TransportConfig};
use crate::tunnel::Framer;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection lifecycle callbacks
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// A connection arrived. An error refuses it: the connection is closed
    /// and never tracked.
    async fn on_connect(&self, _conn: &Arc<Connection>) -> crate::Result<()> {
        Ok(())
    }

    /// One frame was received on `conn`. An error departs the connection.
    async fn on_receive(&self, conn: &Arc<Connection>, frame: Bytes) -> crate::Result<()>;

    /// The connection is being removed; it is closed right after this returns
    async fn on_disconnect(&self, _conn: &Arc<Connection>) {}
}

/// Settings the accept loop applies to every connection
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub framer: Framer,
    pub transport: TransportConfig,
    pub max_clients: usize,
    /// Per-frame logging at debug level
    pub verbose: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            framer: Framer::default(),
            transport: TransportConfig::default(),
            max_clients: 1024,
            verbose: false,
        }
    }
}

/// Listening server
pub struct Server {
    listener: TcpListener,
    options: ServerOptions,
    registry: RegistryHandle,
    registry_task: JoinHandle<()>,
}

impl Server {
    /// Bind the listening socket and start the registry
    pub async fn bind(
        addr: &str,
        options: ServerOptions,
        handler: Arc<dyn Handler>,
    ) -> crate::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (registry, registry_task) = Registry::spawn(handler, options.max_clients);

        info!("Listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            options,
            registry,
            registry_task,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Accept forever
    pub async fn run(self) -> crate::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept until `shutdown` resolves, then depart every connection
    pub async fn run_until<F>(self, shutdown: F) -> crate::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("New connection from {}", peer);
                        if let Err(e) = stream.set_nodelay(self.options.transport.nodelay) {
                            debug!("set_nodelay on {}: {}", peer, e);
                        }
                        let conn = Connection::from_stream(
                            stream,
                            peer.to_string(),
                            self.options.framer,
                            self.options.transport.clone(),
                        )
                        .with_verbose(self.options.verbose);

                        if self.registry.arrive(Arc::new(conn)).await.is_err() {
                            error!("Registry stopped, no longer accepting");
                            break;
                        }
                    }
                    Err(e) => {
                        // Usually EMFILE; back off instead of spinning
                        warn!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        self.registry.shutdown().await;
        if let Err(e) = self.registry_task.await {
            error!("Registry task failed: {}", e);
        }
        Ok(())
    }
}
