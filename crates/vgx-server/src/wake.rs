// src/wake.rs
//! Out-of-band wake channel for the I/O thread.
//!
//! Executors signal it when they return a client while the I/O thread is
//! parked in poll(). The signal carries no data; the completion queue is the
//! source of truth, so a lost or coalesced signal only costs latency.

use crate::error::{ServerError, ServerResult};
use serde::Deserialize;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeMode {
    /// eventfd where available, loopback otherwise.
    #[default]
    Auto,
    EventFd,
    Loopback,
}

impl std::str::FromStr for WakeMode {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(WakeMode::Auto),
            "eventfd" => Ok(WakeMode::EventFd),
            "loopback" => Ok(WakeMode::Loopback),
            other => Err(ServerError::Config(format!("unknown wake mode: {other}"))),
        }
    }
}

#[derive(Debug)]
pub enum WakeMonitor {
    #[cfg(target_os = "linux")]
    EventFd(std::os::fd::OwnedFd),
    /// Self-connected TCP pair on 127.0.0.1.
    Loopback { rx: TcpStream, tx: TcpStream },
}

impl WakeMonitor {
    pub fn new(mode: WakeMode) -> ServerResult<Self> {
        match mode {
            WakeMode::Loopback => Self::loopback(),
            WakeMode::EventFd => Self::eventfd(),
            WakeMode::Auto if cfg!(all(target_os = "linux", feature = "eventfd")) => {
                Self::eventfd().or_else(|e| {
                    tracing::warn!(error = %e, "eventfd unavailable, using loopback wake");
                    Self::loopback()
                })
            }
            WakeMode::Auto => Self::loopback(),
        }
    }

    #[cfg(target_os = "linux")]
    fn eventfd() -> ServerResult<Self> {
        crate::syscalls::create_eventfd()
            .map(WakeMonitor::EventFd)
            .map_err(|e| ServerError::Wake(format!("eventfd: {e}")))
    }

    #[cfg(not(target_os = "linux"))]
    fn eventfd() -> ServerResult<Self> {
        Err(ServerError::Wake("eventfd not supported on this platform".into()))
    }

    fn loopback() -> ServerResult<Self> {
        let setup = || -> io::Result<Self> {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
            let tx = TcpStream::connect(listener.local_addr()?)?;
            let (rx, _) = listener.accept()?;
            tx.set_nodelay(true)?;
            tx.set_nonblocking(true)?;
            rx.set_nonblocking(true)?;
            Ok(WakeMonitor::Loopback { rx, tx })
        };
        setup().map_err(|e| ServerError::Wake(format!("loopback: {e}")))
    }

    /// Descriptor the I/O thread polls for readability.
    pub fn poll_fd(&self) -> RawFd {
        match self {
            #[cfg(target_os = "linux")]
            WakeMonitor::EventFd(fd) => fd.as_raw_fd(),
            WakeMonitor::Loopback { rx, .. } => rx.as_raw_fd(),
        }
    }

    /// Best-effort readiness signal.
    pub fn signal(&self) {
        let res = match self {
            #[cfg(target_os = "linux")]
            WakeMonitor::EventFd(fd) => crate::syscalls::eventfd_write(fd.as_raw_fd(), 1),
            WakeMonitor::Loopback { tx, .. } => (&*tx).write(b"!").map(|_| ()),
        };
        if let Err(e) = res {
            if e.kind() != io::ErrorKind::WouldBlock {
                tracing::trace!(error = %e, "wake signal failed");
            }
        }
    }

    /// Consume pending signals. Returns how many were observed.
    pub fn drain(&self) -> u64 {
        match self {
            #[cfg(target_os = "linux")]
            WakeMonitor::EventFd(fd) => crate::syscalls::eventfd_read(fd.as_raw_fd()).unwrap_or(0),
            WakeMonitor::Loopback { rx, .. } => {
                let mut buf = [0u8; 64];
                let mut total = 0;
                loop {
                    match (&*rx).read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => total += n as u64,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
                total
            }
        }
    }

    pub fn is_eventfd(&self) -> bool {
        !matches!(self, WakeMonitor::Loopback { .. })
    }
}
