// src/syscalls.rs
use crate::error::ServerResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

// ---- Socket Operations ----

/// Owned non-blocking TCP socket. Closed on drop.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Take ownership of a raw descriptor.
    ///
    /// # Safety
    /// `fd` must be an open descriptor not owned by anything else.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } }
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Non-blocking receive. `Ok(0)` is orderly shutdown by the peer;
    /// an empty socket reports `WouldBlock`.
    #[inline(always)]
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let res = unsafe { libc::recv(self.fd(), buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(res as usize)
    }

    /// Non-blocking send without SIGPIPE.
    #[inline(always)]
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        #[cfg(target_os = "linux")]
        let flags = libc::MSG_NOSIGNAL;
        #[cfg(not(target_os = "linux"))]
        let flags = 0;
        let res = unsafe { libc::send(self.fd(), buf.as_ptr() as *const c_void, buf.len(), flags) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(res as usize)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        let res = unsafe {
            libc::getsockname(self.fd(), &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        to_socket_addr(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unsupported address family"))
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

#[inline(always)]
fn set_flag(fd: c_int, level: c_int, name: c_int) -> c_int {
    let one: c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        )
    }
}

#[cfg(not(target_os = "linux"))]
fn set_nonblocking(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
    Ok(())
}

/// Create a non-blocking TCP listen socket with SO_REUSEADDR and TCP_NODELAY
/// (inherited by accepted sockets).
pub fn create_listen_socket(addr: &SocketAddr) -> ServerResult<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    #[cfg(target_os = "linux")]
    let raw = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0) };
    #[cfg(not(target_os = "linux"))]
    let raw = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // Owned from here on, closed on every error path
    let socket = unsafe { Socket::from_raw(raw) };

    #[cfg(not(target_os = "linux"))]
    {
        set_nonblocking(raw)?;
        set_flag(raw, libc::SOL_SOCKET, libc::SO_NOSIGPIPE);
    }

    if set_flag(raw, libc::SOL_SOCKET, libc::SO_REUSEADDR) < 0 {
        return Err(io::Error::last_os_error().into());
    }
    set_flag(raw, libc::IPPROTO_TCP, libc::TCP_NODELAY);

    bind_addr(raw, addr)?;

    if unsafe { libc::listen(raw, libc::SOMAXCONN) } < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(socket)
}

/// Bind a socket to an address (shared between platforms).
fn bind_addr(fd: c_int, addr: &SocketAddr) -> io::Result<()> {
    let res = unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let mut sin: libc::sockaddr_in = mem::zeroed();
                #[cfg(any(target_os = "macos", target_os = "freebsd"))]
                {
                    sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
                }
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = a.port().to_be();
                sin.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(a.ip().octets()) };
                libc::bind(fd, &sin as *const _ as *const libc::sockaddr, mem::size_of_val(&sin) as socklen_t)
            }
            SocketAddr::V6(a) => {
                let mut sin6: libc::sockaddr_in6 = mem::zeroed();
                #[cfg(any(target_os = "macos", target_os = "freebsd"))]
                {
                    sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
                }
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = a.port().to_be();
                sin6.sin6_flowinfo = a.flowinfo();
                sin6.sin6_addr = libc::in6_addr { s6_addr: a.ip().octets() };
                sin6.sin6_scope_id = a.scope_id();
                libc::bind(fd, &sin6 as *const _ as *const libc::sockaddr, mem::size_of_val(&sin6) as socklen_t)
            }
        }
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Accept one non-blocking connection. `Ok(None)` when the backlog is empty.
pub fn accept_connection(listen_fd: c_int) -> io::Result<Option<(Socket, Option<SocketAddr>)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    let addr_ptr = &mut storage as *mut _ as *mut libc::sockaddr;

    #[cfg(target_os = "linux")]
    let fd = unsafe { libc::accept4(listen_fd, addr_ptr, &mut len, libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC) };
    #[cfg(not(target_os = "linux"))]
    let fd = unsafe { libc::accept(listen_fd, addr_ptr, &mut len) };

    if fd < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            _ if err.raw_os_error() == Some(libc::ECONNABORTED) => Ok(None),
            _ => Err(err),
        };
    }
    let socket = unsafe { Socket::from_raw(fd) };

    #[cfg(not(target_os = "linux"))]
    {
        set_nonblocking(fd)?;
        // SO_NOSIGPIPE on accepted socket (no MSG_NOSIGNAL here)
        set_flag(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE);
    }

    Ok(Some((socket, to_socket_addr(&storage))))
}

// ---- Poll ----

pub const POLLIN: i16 = libc::POLLIN;
pub const POLLOUT: i16 = libc::POLLOUT;
pub const POLLERR: i16 = libc::POLLERR;
pub const POLLHUP: i16 = libc::POLLHUP;
pub const POLLNVAL: i16 = libc::POLLNVAL;

#[inline(always)]
pub fn pollfd(fd: RawFd, events: i16) -> libc::pollfd {
    libc::pollfd { fd, events, revents: 0 }
}

/// poll(2) over `fds`. An interrupted call reports zero ready descriptors.
pub fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    let res = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(res as usize)
}

// ---- Eventfd (Linux Only) ----

#[cfg(target_os = "linux")]
pub fn create_eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(target_os = "linux")]
pub fn eventfd_write(fd: RawFd, value: u64) -> io::Result<()> {
    let res = unsafe { libc::write(fd, &value as *const u64 as *const c_void, mem::size_of::<u64>()) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
pub fn eventfd_read(fd: RawFd) -> io::Result<u64> {
    let mut value: u64 = 0;
    let res = unsafe { libc::read(fd, &mut value as *mut u64 as *mut c_void, mem::size_of::<u64>()) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}
