//! Virtual network interfaces
//!
//! A [`Device`] hands out one link-layer frame per `read` and accepts one
//! per `write`. Two implementations are provided:
//! - [`VirtualTap`], a userspace device backed by channels
//! - `LinuxTap`, a kernel tap interface (feature `tap`, Linux only)

mod virtual_tap;

#[cfg(all(target_os = "linux", feature = "tap"))]
mod linux_tap;

pub use virtual_tap::{TapPeer, VirtualTap};

#[cfg(all(target_os = "linux", feature = "tap"))]
pub use linux_tap::LinuxTap;

use crate::tunnel::{FrameSink, FrameSource};
use crate::Error;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Trait for virtual network interfaces
#[async_trait]
pub trait Device: Send + Sync {
    /// Interface name
    fn name(&self) -> &str;

    /// Read one frame into `buf`, returning its length. A frame longer
    /// than `buf` either fails with `InvalidData` or comes back cut to
    /// `buf.len()`, so callers size `buf` one byte past the largest frame
    /// they accept.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one frame
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Close the device; pending and later reads/writes fail
    async fn close(&self) -> io::Result<()>;
}

/// Adapts a [`Device`] to the pump's source/sink seams
pub struct DevicePort {
    device: Arc<dyn Device>,
    /// Largest frame passed on; longer ones are dropped
    mtu: usize,
    dropped: AtomicU64,
}

impl DevicePort {
    pub fn new(device: Arc<dyn Device>, mtu: usize) -> Self {
        Self {
            device,
            mtu,
            dropped: AtomicU64::new(0),
        }
    }

    /// Frames discarded for exceeding the mtu
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn drop_oversize(&self, len: Option<usize>) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        match len {
            Some(len) => warn!(
                "{} produced a {} byte frame, over the {} byte limit; dropped",
                self.device.name(),
                len,
                self.mtu
            ),
            None => warn!(
                "{} produced a frame over the {} byte limit; dropped",
                self.device.name(),
                self.mtu
            ),
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

#[async_trait]
impl FrameSource for DevicePort {
    async fn read_frame(&self) -> crate::Result<Bytes> {
        loop {
            // One spare byte tells an oversize frame from a full one
            let mut buf = BytesMut::zeroed(self.mtu + 1);
            let n = match self.device.read(&mut buf).await {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    self.drop_oversize(None);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return Err(Error::Device(format!("{} closed", self.device.name())));
            }
            if n > self.mtu {
                self.drop_oversize(Some(n));
                continue;
            }
            buf.truncate(n);
            trace!("{} read {} bytes", self.device.name(), n);
            return Ok(buf.freeze());
        }
    }
}

#[async_trait]
impl FrameSink for DevicePort {
    async fn write_frame(&self, frame: Bytes) -> crate::Result<()> {
        let n = self.device.write(&frame).await?;
        if n != frame.len() {
            return Err(Error::Device(format!(
                "{} short write: {} of {} bytes",
                self.device.name(),
                n,
                frame.len()
            )));
        }
        Ok(())
    }
}
