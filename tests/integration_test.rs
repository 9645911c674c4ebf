//! Integration tests for ethertun
//!
//! Drives real loopback sockets through the full stack:
//! - point tunnel ↔ server accept loop ↔ registry ↔ device bridge
//! - malformed messages tearing down a single connection
//! - registry bookkeeping under many concurrent points

use async_trait::async_trait;
use bytes::Bytes;
use ethertun::device::{Device, TapPeer, VirtualTap};
use ethertun::server::{DeviceBridge, DeviceFactory, Handler, RegistryHandle, Server, ServerOptions};
use ethertun::transport::{ConnectionId, TransportConfig};
use ethertun::tunnel::{Framer, PumpConfig, Tunnel};
use ethertun::Connection;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Event {
    Connect(ConnectionId),
    Receive(ConnectionId, Bytes),
    Disconnect(ConnectionId),
}

/// Handler that reports every callback on a channel
struct Recorder {
    events: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl Handler for Recorder {
    async fn on_connect(&self, conn: &Arc<Connection>) -> ethertun::Result<()> {
        let _ = self.events.send(Event::Connect(conn.id()));
        Ok(())
    }

    async fn on_receive(&self, conn: &Arc<Connection>, frame: Bytes) -> ethertun::Result<()> {
        let _ = self.events.send(Event::Receive(conn.id(), frame));
        Ok(())
    }

    async fn on_disconnect(&self, conn: &Arc<Connection>) {
        let _ = self.events.send(Event::Disconnect(conn.id()));
    }
}

struct Running {
    addr: SocketAddr,
    registry: RegistryHandle,
    stop: oneshot::Sender<()>,
    task: JoinHandle<ethertun::Result<()>>,
}

impl Running {
    async fn shutdown(self) {
        let _ = self.stop.send(());
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

async fn start_server(handler: Arc<dyn Handler>) -> Running {
    let server = Server::bind("127.0.0.1:0", ServerOptions::default(), handler)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry().clone();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async {
        let _ = stopped.await;
    }));
    Running {
        addr,
        registry,
        stop,
        task,
    }
}

fn pump_config() -> PumpConfig {
    PumpConfig {
        queue_capacity: 64,
        retry_interval: Duration::from_millis(20),
        drain_timeout: Duration::from_millis(500),
        max_write_errors: 0,
    }
}

/// Bridge whose devices are virtual taps; their host sides come out of
/// the returned channel
fn virtual_bridge() -> (Arc<DeviceBridge>, mpsc::UnboundedReceiver<TapPeer>) {
    let (peers_tx, peers) = mpsc::unbounded_channel();
    let factory: DeviceFactory = Box::new(move |conn: &Connection| {
        let (tap, peer) = VirtualTap::pair(format!("srv{}", conn.id().get()), 64);
        peers_tx
            .send(peer)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "test finished"))?;
        Ok(Arc::new(tap) as Arc<dyn Device>)
    });
    (Arc::new(DeviceBridge::new(factory, pump_config())), peers)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for handler event")
        .expect("handler gone")
}

async fn wait_for_len(registry: &RegistryHandle, want: usize) {
    for _ in 0..250 {
        if registry.len().await == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("registry never reached {} live connections", want);
}

/// Two tunnels: the point's and the one the server builds per connection
#[tokio::test]
async fn test_point_and_server_exchange_frames() {
    let (bridge, mut server_taps) = virtual_bridge();
    let server = start_server(bridge.clone()).await;

    let (tap, mut point_tap) = VirtualTap::pair("point0", 64);
    let conn = Arc::new(Connection::new(
        server.addr.to_string(),
        Framer::default(),
        TransportConfig::default(),
    ));
    let mut tunnel = Tunnel::new(Arc::new(tap), conn.clone(), pump_config());
    tunnel.start().unwrap();

    // The inbound reader dials on start; the server then opens a device
    let mut server_tap = tokio::time::timeout(WAIT, server_taps.recv())
        .await
        .expect("server never attached a device")
        .unwrap();

    // point → server
    let mut small = vec![0u8; 64];
    small[..6].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    for (i, byte) in small.iter_mut().enumerate().skip(6) {
        *byte = i as u8;
    }
    point_tap.inject(Bytes::from(small.clone())).await.unwrap();
    let seen = tokio::time::timeout(WAIT, server_tap.recv()).await.unwrap().unwrap();
    assert_eq!(&seen[..], &small[..]);

    // server → point, full size
    let big: Vec<u8> = (0..1514).map(|i| (i % 251) as u8).collect();
    server_tap.inject(Bytes::from(big.clone())).await.unwrap();
    let seen = tokio::time::timeout(WAIT, point_tap.recv()).await.unwrap().unwrap();
    assert_eq!(&seen[..], &big[..]);

    let sessions = server.registry.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].device.as_deref(), Some(server_tap.name()));
    assert_eq!(sessions[0].stats.rx_frames, 1);

    let stats = tunnel.stop().await;
    assert_eq!(stats.outbound.written, 1);
    assert_eq!(stats.inbound.written, 1);

    // Server notices the point leaving and releases its device
    wait_for_len(&server.registry, 0).await;
    assert!(server_tap.is_closed());
    assert_eq!(bridge.attached().await, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_oversize_message_closes_only_that_connection() {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let server = start_server(Arc::new(Recorder { events: events_tx })).await;

    let mut bad = TcpStream::connect(server.addr).await.unwrap();
    let bad_id = match next_event(&mut events).await {
        Event::Connect(id) => id,
        other => panic!("unexpected {:?}", other),
    };

    let good = Connection::new(
        server.addr.to_string(),
        Framer::default(),
        TransportConfig::default(),
    );
    good.connect().await.unwrap();
    let good_id = match next_event(&mut events).await {
        Event::Connect(id) => id,
        other => panic!("unexpected {:?}", other),
    };

    // payload_size = 2000
    let mut message = vec![0xFF, 0xFF, 0x07, 0xD0];
    message.extend(std::iter::repeat(0x55).take(2000));
    bad.write_all(&message).await.unwrap();

    match next_event(&mut events).await {
        Event::Disconnect(id) => assert_eq!(id, bad_id),
        other => panic!("unexpected {:?}", other),
    }

    // The server closed its end
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(WAIT, bad.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    // Everyone else is unaffected
    good.send_message(&[0x66; 60]).await.unwrap();
    match next_event(&mut events).await {
        Event::Receive(id, frame) => {
            assert_eq!(id, good_id);
            assert_eq!(frame, Bytes::from(vec![0x66; 60]));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(server.registry.len().await, 1);

    server.shutdown().await;
    match next_event(&mut events).await {
        Event::Disconnect(id) => assert_eq!(id, good_id),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_bad_magic_closes_connection() {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let server = start_server(Arc::new(Recorder { events: events_tx })).await;

    let mut raw = TcpStream::connect(server.addr).await.unwrap();
    assert!(matches!(next_event(&mut events).await, Event::Connect(_)));

    raw.write_all(&[0x12, 0x34, 0x00, 0x20]).await.unwrap();
    assert!(matches!(next_event(&mut events).await, Event::Disconnect(_)));
    assert!(server.registry.is_empty().await);

    server.shutdown().await;
}

#[tokio::test]
async fn test_many_points_come_and_go() {
    let (events_tx, _events) = mpsc::unbounded_channel();
    let server = start_server(Arc::new(Recorder { events: events_tx })).await;

    const N: usize = 24;
    const M: usize = 10;

    let mut clients = Vec::new();
    for _ in 0..N {
        let addr = server.addr;
        clients.push(tokio::spawn(async move {
            let conn = Connection::new(addr.to_string(), Framer::default(), TransportConfig::default());
            conn.connect().await.unwrap();
            conn
        }));
    }
    let mut conns = Vec::new();
    for client in clients {
        conns.push(client.await.unwrap());
    }
    wait_for_len(&server.registry, N).await;

    let leaving: Vec<Connection> = conns.drain(..M).collect();
    let closers: Vec<_> = leaving
        .into_iter()
        .map(|conn| tokio::spawn(async move { conn.close().await }))
        .collect();
    for closer in closers {
        closer.await.unwrap();
    }
    wait_for_len(&server.registry, N - M).await;

    let stats = server.registry.stats().await;
    assert_eq!(stats.accepted, N as u64);
    assert_eq!(stats.closed, M as u64);

    server.shutdown().await;
    for conn in &conns {
        let err = tokio::time::timeout(WAIT, conn.receive_message())
            .await
            .unwrap()
            .unwrap_err();
        assert!(!err.is_recoverable());
    }
}

#[tokio::test]
async fn test_point_redials_after_server_restart() {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let server = start_server(Arc::new(Recorder {
        events: events_tx.clone(),
    }))
    .await;
    let addr = server.addr;

    let first = Connection::new(addr.to_string(), Framer::default(), TransportConfig::default());
    first.send_message(&[1u8; 20]).await.unwrap();
    assert!(matches!(next_event(&mut events).await, Event::Connect(_)));
    assert!(matches!(next_event(&mut events).await, Event::Receive(..)));

    server.shutdown().await;
    assert!(matches!(next_event(&mut events).await, Event::Disconnect(_)));

    // A closed connection stays closed; the point builds a fresh one
    assert!(first.receive_message().await.is_err());
    assert!(first.is_closed());

    let server = Server::bind(&addr.to_string(), ServerOptions::default(), Arc::new(Recorder { events: events_tx }))
        .await
        .unwrap();
    let registry = server.registry().clone();
    let task = tokio::spawn(server.run());

    let second = Connection::new(addr.to_string(), Framer::default(), TransportConfig::default());
    second.send_message(&[2u8; 20]).await.unwrap();
    assert!(matches!(next_event(&mut events).await, Event::Connect(_)));
    match next_event(&mut events).await {
        Event::Receive(_, frame) => assert_eq!(frame, Bytes::from(vec![2u8; 20])),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(registry.len().await, 1);
    task.abort();
}
