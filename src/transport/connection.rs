//! Connection management
//!
//! A [`Connection`] wraps one stream socket and moves whole frames across
//! it. Sending and receiving lock separate halves of the stream, so a
//! reader loop blocked in `receive_message` never holds up a writer loop.
//!
//! Lifecycle:
//! - created unconnected ([`Connection::new`]) and dialed lazily, or
//!   created from an accepted socket ([`Connection::from_stream`])
//! - closed explicitly or on the first unrecoverable I/O error
//! - once closed it is never reused

use super::{dial, ConnectionError, ConnectionState, TransportConfig};
use crate::protocol::describe_frame;
use crate::tunnel::Framer;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, trace, warn};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub tx_frames: u64,
    pub tx_bytes: u64,
    pub rx_frames: u64,
    pub rx_bytes: u64,
    /// Writes that failed on the socket
    pub tx_errors: u64,
    /// Frames refused before reaching the socket
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    tx_frames: AtomicU64,
    tx_bytes: AtomicU64,
    rx_frames: AtomicU64,
    rx_bytes: AtomicU64,
    tx_errors: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// One framed stream to a peer
pub struct Connection {
    id: ConnectionId,
    addr: String,
    framer: Framer,
    transport: TransportConfig,
    verbose: bool,
    state: AtomicU8,
    reader: Mutex<Option<BoxReader>>,
    writer: Mutex<Option<BoxWriter>>,
    /// Serializes dial attempts
    dial_lock: Mutex<()>,
    closed: watch::Sender<bool>,
    counters: Counters,
    created: Instant,
    device: StdMutex<Option<String>>,
}

impl Connection {
    /// Create an unconnected client connection; the first send dials `addr`
    pub fn new(addr: impl Into<String>, framer: Framer, transport: TransportConfig) -> Self {
        Self {
            id: ConnectionId::next(),
            addr: addr.into(),
            framer,
            transport,
            verbose: false,
            state: AtomicU8::new(ConnectionState::Init as u8),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            dial_lock: Mutex::new(()),
            closed: watch::channel(false).0,
            counters: Counters::default(),
            created: Instant::now(),
            device: StdMutex::new(None),
        }
    }

    /// Wrap an already established stream (an accepted socket)
    pub fn from_stream<S>(
        stream: S,
        addr: impl Into<String>,
        framer: Framer,
        transport: TransportConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let conn = Self::new(addr, framer, transport);
        conn.state
            .store(ConnectionState::Connected as u8, Ordering::Release);
        Self {
            reader: Mutex::new(Some(Box::new(read_half))),
            writer: Mutex::new(Some(Box::new(write_half))),
            ..conn
        }
    }

    /// Log every frame at debug level instead of trace
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address (the dial target for client connections)
    pub fn remote_addr(&self) -> &str {
        &self.addr
    }

    pub fn framer(&self) -> &Framer {
        &self.framer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn uptime(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.counters.snapshot()
    }

    /// Name of the device this connection is attached to, if any
    pub fn device(&self) -> Option<String> {
        self.device
            .lock()
            .map(|d| d.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn set_device(&self, name: impl Into<String>) {
        let mut slot = self
            .device
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(name.into());
    }

    /// Dial the peer unless already connected.
    ///
    /// Concurrent callers share one dial. A failed dial leaves the
    /// connection unconnected so the caller may retry later.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closed => return Err(ConnectionError::Closed),
            _ => {}
        }

        let _guard = self.dial_lock.lock().await;
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closed => return Err(ConnectionError::Closed),
            _ => {}
        }

        self.transition(ConnectionState::Init, ConnectionState::Connecting);
        info!("Connecting {} to {}", self.id, self.addr);

        let stream = match dial(&self.addr, &self.transport).await {
            Ok(stream) => stream,
            Err(e) => {
                self.transition(ConnectionState::Connecting, ConnectionState::Init);
                return Err(e);
            }
        };

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(Box::new(read_half));
        *self.writer.lock().await = Some(Box::new(write_half));

        if !self.transition(ConnectionState::Connecting, ConnectionState::Connected) {
            // Closed while dialing
            self.reader.lock().await.take();
            self.writer.lock().await.take();
            return Err(ConnectionError::Closed);
        }

        info!("Connected {} to {}", self.id, self.addr);
        Ok(())
    }

    /// Send one frame, dialing first if needed
    pub async fn send_message(&self, frame: &[u8]) -> crate::Result<()> {
        if let Err(e) = self.connect().await {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }

        let message = match self.framer.encode(frame) {
            Ok(message) => message,
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let mut closed = self.closed.subscribe();
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(ConnectionError::Closed.into());
            }
        };

        let write_timeout = self.transport.write_timeout;
        let write = async {
            if write_timeout == 0 {
                crate::tunnel::write_full(writer.as_mut(), &message).await
            } else {
                match tokio::time::timeout(
                    Duration::from_secs(write_timeout),
                    crate::tunnel::write_full(writer.as_mut(), &message),
                )
                .await
                {
                    Ok(result) => result,
                    // Not retryable: part of the message may be on the wire
                    Err(_) => Err(ConnectionError::WriteFailed(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("write stalled for {}s", write_timeout),
                    ))),
                }
            }
        };

        let result = tokio::select! {
            result = write => result,
            _ = closed.wait_for(|closed| *closed) => Err(ConnectionError::Closed),
        };
        drop(guard);

        match result {
            Ok(()) => {
                self.counters.tx_frames.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .tx_bytes
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                self.log_frame("send", frame);
                Ok(())
            }
            Err(e) => {
                self.counters.tx_errors.fetch_add(1, Ordering::Relaxed);
                // A partial write leaves the stream misaligned
                if !matches!(e, ConnectionError::Closed) {
                    warn!("Write on {} ({}) failed: {}", self.id, self.addr, e);
                }
                self.close().await;
                Err(match e {
                    ConnectionError::Io(io) => ConnectionError::WriteFailed(io),
                    other => other,
                }
                .into())
            }
        }
    }

    /// Receive one frame; the connection must already be established
    pub async fn receive_message(&self) -> crate::Result<Bytes> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(ConnectionError::Closed.into()),
            _ => return Err(ConnectionError::NotConnected.into()),
        }

        let mut closed = self.closed.subscribe();
        let mut guard = self.reader.lock().await;
        let reader = match guard.as_mut() {
            Some(reader) => reader,
            None => return Err(ConnectionError::Closed.into()),
        };

        let result = tokio::select! {
            result = self.framer.read_message(reader.as_mut()) => result,
            _ = closed.wait_for(|closed| *closed) => Err(ConnectionError::Closed.into()),
        };
        drop(guard);

        match result {
            Ok(frame) => {
                self.counters.rx_frames.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .rx_bytes
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                self.log_frame("recv", &frame);
                Ok(frame)
            }
            Err(e) => {
                debug!("Read on {} ({}) failed: {}", self.id, self.addr, e);
                self.close().await;
                Err(e)
            }
        }
    }

    /// Release the socket. Idempotent.
    ///
    /// Pending sends and receives on other tasks fail with
    /// [`ConnectionError::Closed`].
    pub async fn close(&self) {
        let prev = self
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if ConnectionState::from(prev) == ConnectionState::Closed {
            return;
        }
        self.closed.send_replace(true);

        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await.ok();
        }
        self.reader.lock().await.take();

        let stats = self.stats();
        info!(
            tx_frames = stats.tx_frames,
            rx_frames = stats.rx_frames,
            tx_errors = stats.tx_errors,
            dropped = stats.dropped,
            "Closed {} ({})",
            self.id,
            self.addr
        );
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn log_frame(&self, dir: &str, frame: &[u8]) {
        if self.verbose {
            debug!(
                "{} {} {} bytes: {} [{:02x?}]",
                self.id,
                dir,
                frame.len(),
                describe_frame(frame),
                &frame[..frame.len().min(32)]
            );
        } else {
            trace!("{} {} {} bytes", self.id, dir, frame.len());
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.addr)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}
