//! Linux kernel tap device

use super::Device;
use async_trait::async_trait;
use std::ffi::CStr;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::process::Command;
use std::sync::{Arc, RwLock};

use libc::{c_char, c_int, c_short, c_void, ioctl, socket, AF_INET, IFF_NO_PI, IFF_TAP, SOCK_DGRAM};
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;
use tracing::{debug, info};

/// TUNSETIFF ioctl number.
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// SIOCGIFFLAGS - Get interface flags.
const SIOCGIFFLAGS: libc::c_ulong = 0x8913;

/// SIOCSIFFLAGS - Set interface flags.
const SIOCSIFFLAGS: libc::c_ulong = 0x8914;

/// SIOCSIFMTU - Set interface MTU.
const SIOCSIFMTU: libc::c_ulong = 0x8922;

const IFF_UP: c_short = 0x1;
const IFF_RUNNING: c_short = 0x40;

/// Interface request with flags.
#[repr(C)]
struct IfReq {
    ifr_name: [c_char; 16],
    ifr_flags: c_short,
    _pad: [u8; 22],
}

/// Interface request with MTU.
#[repr(C)]
struct IfReqMtu {
    ifr_name: [c_char; 16],
    ifr_mtu: c_int,
    _pad: [u8; 20],
}

fn ifr_name(name: &str) -> [c_char; 16] {
    let mut out = [0 as c_char; 16];
    for (i, byte) in name.bytes().take(15).enumerate() {
        out[i] = byte as c_char;
    }
    out
}

/// Run an interface ioctl on a throwaway control socket
fn with_control_socket<T>(request: libc::c_ulong, arg: &mut T) -> io::Result<()> {
    unsafe {
        let sock = socket(AF_INET, SOCK_DGRAM, 0);
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        let ret = ioctl(sock, request as _, arg as *mut T as *mut c_void);
        let err = io::Error::last_os_error();
        libc::close(sock);
        if ret < 0 {
            return Err(err);
        }
    }
    Ok(())
}

/// Kernel tap interface (`IFF_TAP | IFF_NO_PI`)
///
/// The fd is non-blocking and polled through the runtime's reactor, so
/// `close` (or dropping the device) releases it as soon as pending calls
/// return. A named interface can then be opened again right away.
pub struct LinuxTap {
    name: String,
    fd: RwLock<Option<Arc<AsyncFd<File>>>>,
    closed: watch::Sender<bool>,
}

impl LinuxTap {
    /// Create (or attach to) a tap interface, set its MTU and bring it up.
    ///
    /// With `name` absent the kernel picks one like "tap0". Must be called
    /// from within a tokio runtime.
    pub fn open(name: Option<&str>, mtu: u16) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;

        let mut ifr = IfReq {
            ifr_name: ifr_name(name.unwrap_or("")),
            ifr_flags: (IFF_TAP | IFF_NO_PI) as c_short,
            _pad: [0; 22],
        };

        let name = unsafe {
            if ioctl(
                file.as_raw_fd(),
                TUNSETIFF as _,
                &mut ifr as *mut IfReq as *mut c_void,
            ) < 0
            {
                return Err(io::Error::last_os_error());
            }
            CStr::from_ptr(ifr.ifr_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        };

        let tap = Self {
            name,
            fd: RwLock::new(Some(Arc::new(AsyncFd::new(file)?))),
            closed: watch::channel(false).0,
        };
        tap.set_mtu(mtu)?;
        tap.set_up()?;

        info!("Opened tap device {} (mtu {})", tap.name, mtu);
        Ok(tap)
    }

    /// Set the interface MTU
    pub fn set_mtu(&self, mtu: u16) -> io::Result<()> {
        let mut req = IfReqMtu {
            ifr_name: ifr_name(&self.name),
            ifr_mtu: mtu as c_int,
            _pad: [0; 20],
        };
        with_control_socket(SIOCSIFMTU, &mut req)?;
        debug!("Set {} mtu to {}", self.name, mtu);
        Ok(())
    }

    /// Mark the interface up and running
    pub fn set_up(&self) -> io::Result<()> {
        let mut req = IfReq {
            ifr_name: ifr_name(&self.name),
            ifr_flags: 0,
            _pad: [0; 22],
        };
        with_control_socket(SIOCGIFFLAGS, &mut req)?;
        req.ifr_flags |= IFF_UP | IFF_RUNNING;
        with_control_socket(SIOCSIFFLAGS, &mut req)?;
        debug!("Set {} up", self.name);
        Ok(())
    }

    /// Enslave the interface to a Linux bridge
    pub fn attach_to_bridge(&self, bridge: &str) -> io::Result<()> {
        let status = Command::new("ip")
            .args(["link", "set", "dev", &self.name, "master", bridge])
            .status()?;
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("ip link set {} master {}: {}", self.name, bridge, status),
            ));
        }
        info!("Attached {} to bridge {}", self.name, bridge);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn closed_error(&self) -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, format!("{} is closed", self.name))
    }

    /// The open fd, or `BrokenPipe` once closed
    fn handle(&self) -> io::Result<Arc<AsyncFd<File>>> {
        let fd = self
            .fd
            .read()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "tap lock poisoned"))?;
        fd.as_ref().cloned().ok_or_else(|| self.closed_error())
    }
}

#[async_trait]
impl Device for LinuxTap {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        let fd = self.handle()?;

        loop {
            let mut guard = tokio::select! {
                guard = fd.readable() => guard?,
                _ = closed.wait_for(|closed| *closed) => return Err(self.closed_error()),
            };
            // The driver truncates a frame that does not fit
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        let fd = self.handle()?;

        loop {
            let mut guard = tokio::select! {
                guard = fd.writable() => guard?,
                _ = closed.wait_for(|closed| *closed) => return Err(self.closed_error()),
            };
            // One write per frame; the tap driver takes it whole
            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        // Pending calls hold their own clone until the signal wakes them
        let fd = self
            .fd
            .write()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "tap lock poisoned"))?
            .take();
        drop(fd);
        info!("Closed tap device {}", self.name);
        Ok(())
    }
}
