//! Userspace tap device backed by channels
//!
//! The device side behaves like a kernel tap: `read` yields frames the
//! "host" injected, `write` delivers frames to the host. The host side is
//! the [`TapPeer`] returned alongside the device.

use super::Device;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use tokio::sync::{mpsc, watch, Mutex};

fn closed_error(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, format!("{} is closed", name))
}

/// Channel-backed virtual tap
pub struct VirtualTap {
    name: String,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    outbound: mpsc::Sender<Bytes>,
    closed: watch::Sender<bool>,
}

/// Host side of a [`VirtualTap`]
pub struct TapPeer {
    name: String,
    inject: mpsc::Sender<Bytes>,
    observe: mpsc::Receiver<Bytes>,
    closed: watch::Receiver<bool>,
}

impl VirtualTap {
    /// Create a device and its host-side handle; each direction buffers
    /// up to `capacity` frames
    pub fn pair(name: impl Into<String>, capacity: usize) -> (Self, TapPeer) {
        let name = name.into();
        let capacity = capacity.max(1);
        let (inject, inbound) = mpsc::channel(capacity);
        let (outbound, observe) = mpsc::channel(capacity);
        let (closed, closed_rx) = watch::channel(false);

        let tap = Self {
            name: name.clone(),
            inbound: Mutex::new(inbound),
            outbound,
            closed,
        };
        let peer = TapPeer {
            name,
            inject,
            observe,
            closed: closed_rx,
        };
        (tap, peer)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Device for VirtualTap {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        let mut inbound = self.inbound.lock().await;

        let frame = tokio::select! {
            frame = inbound.recv() => frame,
            _ = closed.wait_for(|closed| *closed) => None,
        };

        match frame {
            Some(frame) if frame.len() > buf.len() => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{}: {} byte frame does not fit a {} byte buffer",
                    self.name,
                    frame.len(),
                    buf.len()
                ),
            )),
            Some(frame) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            }
            None => Err(closed_error(&self.name)),
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error(&self.name));
        }

        let mut closed = self.closed.subscribe();
        let sent = tokio::select! {
            sent = self.outbound.send(Bytes::copy_from_slice(buf)) => sent.is_ok(),
            _ = closed.wait_for(|closed| *closed) => false,
        };

        if sent {
            Ok(buf.len())
        } else {
            Err(closed_error(&self.name))
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }
}

impl TapPeer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand a frame to the device, as if the host had transmitted it
    pub async fn inject(&self, frame: Bytes) -> io::Result<()> {
        if *self.closed.borrow() {
            return Err(closed_error(&self.name));
        }
        self.inject
            .send(frame)
            .await
            .map_err(|_| closed_error(&self.name))
    }

    /// Next frame the device wrote; `None` once the device is gone
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.observe.recv().await
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
