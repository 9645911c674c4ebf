//! One relay direction: reader loop → bounded queue → writer loop
//!
//! The two loops run as independent tasks, so a slow write to the
//! destination never stops frames from being pulled off the source.
//! The reader ends on the first unrecoverable source error and drops its
//! end of the queue; the writer then drains what is left and exits.

use super::queue::{bounded, FrameRx, FrameTx};
use crate::protocol::DEFAULT_QUEUE_CAPACITY;
use crate::transport::Connection;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Something a reader loop can pull frames from
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Block until one frame is available
    async fn read_frame(&self) -> crate::Result<Bytes>;
}

/// Something a writer loop can push frames into
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Block until the frame has been written
    async fn write_frame(&self, frame: Bytes) -> crate::Result<()>;
}

#[async_trait]
impl FrameSource for Connection {
    async fn read_frame(&self) -> crate::Result<Bytes> {
        if !self.is_connected() {
            self.connect().await?;
        }
        self.receive_message().await
    }
}

#[async_trait]
impl FrameSink for Connection {
    async fn write_frame(&self, frame: Bytes) -> crate::Result<()> {
        self.send_message(&frame).await
    }
}

/// Pump configuration
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Frames buffered between reader and writer
    pub queue_capacity: usize,
    /// Pause before a reader retries after a recoverable error
    pub retry_interval: Duration,
    /// How long `join` waits for each loop before aborting it
    pub drain_timeout: Duration,
    /// Consecutive write failures after which the writer gives up (0 = never)
    pub max_write_errors: u32,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry_interval: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(2),
            max_write_errors: 0,
        }
    }
}

/// Counter snapshot for one pump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PumpStats {
    pub read: u64,
    pub written: u64,
    pub write_errors: u64,
}

#[derive(Default)]
struct Counters {
    read: AtomicU64,
    written: AtomicU64,
    write_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PumpStats {
        PumpStats {
            read: self.read.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// A running relay direction
pub struct Pump {
    name: String,
    reader: Option<JoinHandle<()>>,
    writer: JoinHandle<()>,
    counters: Arc<Counters>,
    done: watch::Receiver<bool>,
    drain_timeout: Duration,
}

impl Pump {
    /// Start both loops: frames read from `source` are written to `sink`
    pub fn spawn(
        name: impl Into<String>,
        source: Arc<dyn FrameSource>,
        sink: Arc<dyn FrameSink>,
        config: &PumpConfig,
    ) -> Self {
        let name = name.into();
        let (tx, rx) = bounded(config.queue_capacity);
        let counters = Arc::new(Counters::default());
        let (done_tx, done) = watch::channel(false);

        let writer = tokio::spawn(write_loop(
            name.clone(),
            rx,
            sink,
            Arc::clone(&counters),
            config.max_write_errors,
            None,
        ));
        let reader = tokio::spawn(read_loop(
            name.clone(),
            source,
            tx,
            Arc::clone(&counters),
            config.retry_interval,
            done_tx,
        ));

        debug!("Pump {} started", name);
        Self {
            name,
            reader: Some(reader),
            writer,
            counters,
            done,
            drain_timeout: config.drain_timeout,
        }
    }

    /// Start only the writer loop; the caller feeds the returned queue
    pub fn with_inlet(
        name: impl Into<String>,
        sink: Arc<dyn FrameSink>,
        config: &PumpConfig,
    ) -> (FrameTx, Self) {
        let name = name.into();
        let (tx, rx) = bounded(config.queue_capacity);
        let counters = Arc::new(Counters::default());
        let (done_tx, done) = watch::channel(false);

        let writer = tokio::spawn(write_loop(
            name.clone(),
            rx,
            sink,
            Arc::clone(&counters),
            config.max_write_errors,
            Some(done_tx),
        ));

        debug!("Pump {} started (inlet)", name);
        let pump = Self {
            name,
            reader: None,
            writer,
            counters,
            done,
            drain_timeout: config.drain_timeout,
        };
        (tx, pump)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> PumpStats {
        self.counters.snapshot()
    }

    /// Resolves once the reader loop (the writer, for inlet pumps) has ended
    pub async fn terminated(&self) {
        let mut done = self.done.clone();
        // The sender lives in the loop task; if it vanished the loop is gone
        let _ = done.wait_for(|done| *done).await;
    }

    pub fn is_terminated(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait for both loops to finish, aborting any that outlive the drain
    /// timeout
    pub async fn join(self) -> PumpStats {
        if let Some(reader) = self.reader {
            join_or_abort(&self.name, "reader", reader, self.drain_timeout).await;
        }
        join_or_abort(&self.name, "writer", self.writer, self.drain_timeout).await;

        let stats = self.counters.snapshot();
        debug!(
            read = stats.read,
            written = stats.written,
            write_errors = stats.write_errors,
            "Pump {} stopped",
            self.name
        );
        stats
    }
}

async fn join_or_abort(name: &str, which: &str, mut handle: JoinHandle<()>, timeout: Duration) {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => error!("Pump {} {} panicked: {}", name, which, e),
        Err(_) => {
            warn!("Pump {} {} did not finish in {:?}, aborting", name, which, timeout);
            handle.abort();
        }
    }
}

async fn read_loop(
    name: String,
    source: Arc<dyn FrameSource>,
    tx: FrameTx,
    counters: Arc<Counters>,
    retry_interval: Duration,
    done: watch::Sender<bool>,
) {
    loop {
        match source.read_frame().await {
            Ok(frame) if frame.is_empty() => continue,
            Ok(frame) => {
                counters.read.fetch_add(1, Ordering::Relaxed);
                if tx.enqueue(frame).await.is_err() {
                    debug!("Pump {} writer gone, reader exiting", name);
                    break;
                }
            }
            Err(e) if e.is_recoverable() => {
                debug!("Pump {} read: {}, retrying in {:?}", name, e, retry_interval);
                tokio::time::sleep(retry_interval).await;
            }
            Err(e) => {
                info!("Pump {} reader stopped: {}", name, e);
                break;
            }
        }
    }

    // Dropping the producer lets the writer drain and exit
    drop(tx);
    done.send_replace(true);
}

async fn write_loop(
    name: String,
    mut rx: FrameRx,
    sink: Arc<dyn FrameSink>,
    counters: Arc<Counters>,
    max_errors: u32,
    done: Option<watch::Sender<bool>>,
) {
    let mut consecutive = 0u32;

    while let Some(frame) = rx.dequeue().await {
        match sink.write_frame(frame).await {
            Ok(()) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
                consecutive = 0;
            }
            Err(e) => {
                counters.write_errors.fetch_add(1, Ordering::Relaxed);
                consecutive += 1;
                if consecutive == 1 {
                    warn!("Pump {} write failed: {}", name, e);
                } else {
                    debug!("Pump {} write failed ({} in a row): {}", name, consecutive, e);
                }
                if max_errors > 0 && consecutive >= max_errors {
                    error!("Pump {} giving up after {} write failures", name, consecutive);
                    rx.close();
                    break;
                }
            }
        }
    }

    if let Some(done) = done {
        done.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectionError;
    use crate::Error;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{mpsc, Mutex, Notify};

    /// Source fed from a channel; yields `Closed` once the channel ends
    struct ChannelSource {
        rx: Mutex<mpsc::Receiver<crate::Result<Bytes>>>,
    }

    #[async_trait]
    impl FrameSource for ChannelSource {
        async fn read_frame(&self) -> crate::Result<Bytes> {
            match self.rx.lock().await.recv().await {
                Some(result) => result,
                None => Err(ConnectionError::Closed.into()),
            }
        }
    }

    /// Sink that records frames, optionally failing or waiting for a gate
    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<Bytes>>,
        fail_first: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn write_frame(&self, frame: Bytes) -> crate::Result<()> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Device("sink unavailable".to_string()));
            }
            self.frames.lock().await.push(frame);
            Ok(())
        }
    }

    fn source() -> (mpsc::Sender<crate::Result<Bytes>>, Arc<ChannelSource>) {
        let (tx, rx) = mpsc::channel(64);
        (tx, Arc::new(ChannelSource { rx: Mutex::new(rx) }))
    }

    fn fast_config() -> PumpConfig {
        PumpConfig {
            queue_capacity: 8,
            retry_interval: Duration::from_millis(5),
            ..PumpConfig::default()
        }
    }

    #[tokio::test]
    async fn test_pump_relays_in_order() {
        let (feed, src) = source();
        let sink = Arc::new(RecordingSink::default());
        let pump = Pump::spawn("test", src, sink.clone(), &fast_config());

        for i in 0..20u8 {
            feed.send(Ok(Bytes::from(vec![i; 16]))).await.unwrap();
        }
        drop(feed);

        pump.terminated().await;
        let stats = pump.join().await;
        assert_eq!(stats.read, 20);
        assert_eq!(stats.written, 20);

        let frames = sink.frames.lock().await;
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame[0], i as u8);
        }
    }

    #[tokio::test]
    async fn test_write_failure_does_not_stop_writer() {
        let (feed, src) = source();
        let sink = Arc::new(RecordingSink {
            fail_first: AtomicUsize::new(2),
            ..RecordingSink::default()
        });
        let pump = Pump::spawn("test", src, sink.clone(), &fast_config());

        for i in 0..5u8 {
            feed.send(Ok(Bytes::from(vec![i; 16]))).await.unwrap();
        }
        drop(feed);

        let stats = pump.join().await;
        assert_eq!(stats.write_errors, 2);
        assert_eq!(stats.written, 3);
        assert_eq!(sink.frames.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn test_recoverable_errors_are_retried() {
        let (feed, src) = source();
        let sink = Arc::new(RecordingSink::default());
        let pump = Pump::spawn("test", src, sink.clone(), &fast_config());

        feed.send(Err(ConnectionError::NotConnected.into())).await.unwrap();
        feed.send(Ok(Bytes::from_static(b"after retry..."))).await.unwrap();
        feed.send(Err(ConnectionError::Closed.into())).await.unwrap();
        feed.send(Ok(Bytes::from_static(b"never read"))).await.unwrap();

        pump.terminated().await;
        let stats = pump.join().await;
        assert_eq!(stats.read, 1);
        assert_eq!(sink.frames.lock().await[0], Bytes::from_static(b"after retry..."));
    }

    #[tokio::test]
    async fn test_slow_sink_does_not_drop_frames() {
        let (feed, src) = source();
        let gate = Arc::new(Notify::new());
        let sink = Arc::new(RecordingSink {
            gate: Some(gate.clone()),
            ..RecordingSink::default()
        });
        let config = PumpConfig {
            queue_capacity: 2,
            ..fast_config()
        };
        let pump = Pump::spawn("test", src, sink.clone(), &config);

        let producer = tokio::spawn(async move {
            for i in 0..10u8 {
                feed.send(Ok(Bytes::from(vec![i; 16]))).await.unwrap();
            }
        });

        // Release the sink one frame at a time
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            gate.notify_one();
        }
        producer.await.unwrap();

        while sink.frames.lock().await.len() < 10 {
            gate.notify_one();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let frames = sink.frames.lock().await.clone();
        assert_eq!(frames.len(), 10);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame[0], i as u8);
        }
        drop(pump);
    }

    #[tokio::test]
    async fn test_inlet_pump() {
        let sink = Arc::new(RecordingSink::default());
        let (inlet, pump) = Pump::with_inlet("inlet", sink.clone(), &fast_config());

        inlet.enqueue(Bytes::from_static(b"first frame....")).await.unwrap();
        inlet.enqueue(Bytes::from_static(b"second frame...")).await.unwrap();
        drop(inlet);

        pump.terminated().await;
        assert!(pump.is_terminated());
        let stats = pump.join().await;
        assert_eq!(stats.written, 2);
    }

    #[tokio::test]
    async fn test_writer_gives_up_after_limit() {
        let (feed, src) = source();
        let sink = Arc::new(RecordingSink {
            fail_first: AtomicUsize::new(usize::MAX),
            ..RecordingSink::default()
        });
        let config = PumpConfig {
            max_write_errors: 3,
            ..fast_config()
        };
        let pump = Pump::spawn("test", src, sink, &config);

        for i in 0..20u8 {
            if feed.send(Ok(Bytes::from(vec![i; 16]))).await.is_err() {
                break;
            }
        }
        drop(feed);

        // Writer exits, the reader's next enqueue fails and it stops too
        pump.terminated().await;
        let stats = pump.join().await;
        assert_eq!(stats.write_errors, 3);
        assert_eq!(stats.written, 0);
    }
}
