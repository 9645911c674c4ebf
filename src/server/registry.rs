//! Live-connection registry
//!
//! One task owns the map of live connections. Everything else talks to it
//! through channels:
//! - `arrived`: accepted connections, pushed by the accept loop
//! - `departed`: ids whose receive loop ended (or that were kicked)
//! - `control`: snapshot queries and shutdown
//!
//! Arrivals are always handled before departures, so a departure sent
//! after its arrival was queued never overtakes it.

use super::Handler;
use crate::transport::{Connection, ConnectionId, ConnectionStats};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ARRIVED_CAPACITY: usize = 4;
const DEPARTED_CAPACITY: usize = 8;

/// Read-only view of one live connection
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: ConnectionId,
    pub address: String,
    pub device: Option<String>,
    pub uptime_secs: u64,
    pub stats: ConnectionStats,
}

/// Registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Connections that became active
    pub accepted: u64,
    /// Active connections that departed
    pub closed: u64,
    /// Arrivals refused (limit reached or vetoed by the handler)
    pub rejected: u64,
    /// Currently active
    pub active: usize,
}

enum Control {
    Sessions(oneshot::Sender<Vec<SessionInfo>>),
    Stats(oneshot::Sender<RegistryStats>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running [`Registry`]
#[derive(Clone)]
pub struct RegistryHandle {
    arrived: mpsc::Sender<Arc<Connection>>,
    departed: mpsc::Sender<ConnectionId>,
    control: mpsc::Sender<Control>,
}

/// Returned when the registry task is gone
#[derive(Debug, thiserror::Error)]
#[error("Registry stopped")]
pub struct RegistryStopped;

impl RegistryHandle {
    /// Hand over a freshly accepted connection
    pub async fn arrive(&self, conn: Arc<Connection>) -> Result<(), RegistryStopped> {
        self.arrived.send(conn).await.map_err(|_| RegistryStopped)
    }

    /// Remove a connection; unknown ids are ignored
    pub async fn depart(&self, id: ConnectionId) -> Result<(), RegistryStopped> {
        self.departed.send(id).await.map_err(|_| RegistryStopped)
    }

    /// Snapshot of every live connection, ordered by id
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let (tx, rx) = oneshot::channel();
        if self.control.send(Control::Sessions(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn stats(&self) -> RegistryStats {
        let (tx, rx) = oneshot::channel();
        if self.control.send(Control::Stats(tx)).await.is_err() {
            return RegistryStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Number of live connections
    pub async fn len(&self) -> usize {
        self.stats().await.active
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Depart every live connection and stop the registry. Idempotent.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.control.send(Control::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct Entry {
    conn: Arc<Connection>,
    receiver: JoinHandle<()>,
}

/// Owner of the live-connection set
pub struct Registry {
    handler: Arc<dyn Handler>,
    max_clients: usize,
    live: HashMap<ConnectionId, Entry>,
    stats: RegistryStats,
    /// Cloned into every receive loop
    departed_tx: mpsc::Sender<ConnectionId>,
}

impl Registry {
    /// Start the registry task
    pub fn spawn(handler: Arc<dyn Handler>, max_clients: usize) -> (RegistryHandle, JoinHandle<()>) {
        let (arrived_tx, arrived_rx) = mpsc::channel(ARRIVED_CAPACITY);
        let (departed_tx, departed_rx) = mpsc::channel(DEPARTED_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(ARRIVED_CAPACITY);

        let registry = Self {
            handler,
            max_clients: max_clients.max(1),
            live: HashMap::new(),
            stats: RegistryStats::default(),
            departed_tx: departed_tx.clone(),
        };
        let task = tokio::spawn(registry.run(arrived_rx, departed_rx, control_rx));

        let handle = RegistryHandle {
            arrived: arrived_tx,
            departed: departed_tx,
            control: control_tx,
        };
        (handle, task)
    }

    async fn run(
        mut self,
        mut arrived: mpsc::Receiver<Arc<Connection>>,
        mut departed: mpsc::Receiver<ConnectionId>,
        mut control: mpsc::Receiver<Control>,
    ) {
        debug!("Registry started (max {} clients)", self.max_clients);

        let done = loop {
            tokio::select! {
                biased;

                Some(conn) = arrived.recv() => self.on_arrived(conn).await,
                Some(id) = departed.recv() => self.on_departed(id).await,
                msg = control.recv() => match msg {
                    Some(Control::Sessions(reply)) => {
                        let _ = reply.send(self.sessions());
                    }
                    Some(Control::Stats(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Control::Shutdown(reply)) => break Some(reply),
                    // Every handle dropped
                    None => break None,
                },
            }
        };

        let ids: Vec<ConnectionId> = self.live.keys().copied().collect();
        for id in ids {
            self.on_departed(id).await;
        }

        let stats = self.snapshot();
        info!(
            accepted = stats.accepted,
            closed = stats.closed,
            rejected = stats.rejected,
            "Registry stopped"
        );
        if let Some(reply) = done {
            let _ = reply.send(());
        }
    }

    async fn on_arrived(&mut self, conn: Arc<Connection>) {
        if self.live.len() >= self.max_clients {
            warn!(
                "Refusing {}: {} clients connected",
                conn,
                self.live.len()
            );
            self.stats.rejected += 1;
            conn.close().await;
            return;
        }

        if let Err(e) = self.handler.on_connect(&conn).await {
            warn!("Refusing {}: {}", conn, e);
            self.stats.rejected += 1;
            conn.close().await;
            return;
        }

        let receiver = tokio::spawn(receive_loop(
            Arc::clone(&conn),
            Arc::clone(&self.handler),
            self.departed_tx.clone(),
        ));
        info!("{} connected", conn);
        self.stats.accepted += 1;
        self.live.insert(conn.id(), Entry { conn, receiver });
    }

    async fn on_departed(&mut self, id: ConnectionId) {
        let Some(entry) = self.live.remove(&id) else {
            // Kicked earlier; its receive loop reported too
            debug!("Departure of unknown connection {}", id);
            return;
        };

        self.handler.on_disconnect(&entry.conn).await;
        entry.conn.close().await;
        // Closing fails the pending receive; the loop's own departure
        // notice will find nothing to remove
        drop(entry.receiver);

        self.stats.closed += 1;
        info!("{} disconnected ({} active)", entry.conn, self.live.len());
    }

    fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .live
            .values()
            .map(|entry| SessionInfo {
                id: entry.conn.id(),
                address: entry.conn.remote_addr().to_string(),
                device: entry.conn.device(),
                uptime_secs: entry.conn.uptime().as_secs(),
                stats: entry.conn.stats(),
            })
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    fn snapshot(&self) -> RegistryStats {
        RegistryStats {
            active: self.live.len(),
            ..self.stats
        }
    }
}

async fn receive_loop(
    conn: Arc<Connection>,
    handler: Arc<dyn Handler>,
    departed: mpsc::Sender<ConnectionId>,
) {
    loop {
        match conn.receive_message().await {
            Ok(frame) if frame.is_empty() => continue,
            Ok(frame) => {
                if let Err(e) = handler.on_receive(&conn, frame).await {
                    warn!("Handler failed on {}: {}", conn, e);
                    break;
                }
            }
            Err(e) => {
                debug!("Receive on {} ended: {}", conn, e);
                break;
            }
        }
    }

    // Fails only once the registry itself is gone
    let _ = departed.send(conn.id()).await;
}
