//! Listening sockets and accepted streams over TCP or Unix domain sockets.
//!
//! IP listeners are created by hand through `libc` so the `IPV6_V6ONLY` flag
//! can be chosen before `bind`: [`SocketType::Dual`] clears it, [`SocketType::IPv6`]
//! sets it. The resulting descriptor is handed over to a std [`TcpListener`].

use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use libc::{c_int, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, socklen_t};
use tracing::{debug, warn};

use crate::config::{HttpConfig, SocketType};
use crate::protocol::HttpError;

const LISTEN_BACKLOG: c_int = 1024;

/// Remote end of an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Ip(SocketAddr),
    Unix,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => match addr.ip() {
                std::net::IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                    Some(v4) => write!(f, "{v4}"),
                    None => write!(f, "{ip}"),
                },
                std::net::IpAddr::V4(ip) => write!(f, "{ip}"),
            },
            Self::Unix => f.write_str("unix"),
        }
    }
}

/// Address the daemon listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalAddr {
    Ip(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Opens the listening socket described by `config`, which must be valid.
    pub fn bind(config: &HttpConfig) -> Result<Self, HttpError> {
        if config.sock_type == SocketType::Unix {
            let path = config.unix_path.clone().unwrap_or_default();
            return bind_unix(&path).map_err(|e| HttpError::bind(path.display(), e));
        }

        let addr = ip_bind_addr(config)?;
        let listener = bind_ip(addr, config.sock_type).map_err(|e| HttpError::bind(addr, e))?;
        Ok(Self::Tcp(listener))
    }

    pub fn accept(&self) -> io::Result<(Stream, PeerAddr)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                stream.set_nodelay(true)?;
                Ok((Stream::Tcp(stream), PeerAddr::Ip(addr)))
            }
            Self::Unix { listener, .. } => {
                let (stream, _) = listener.accept()?;
                Ok((Stream::Unix(stream), PeerAddr::Unix))
            }
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Tcp(listener) => listener.set_nonblocking(nonblocking),
            Self::Unix { listener, .. } => listener.set_nonblocking(nonblocking),
        }
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(listener) => Ok(Self::Tcp(listener.try_clone()?)),
            Self::Unix { listener, path } => Ok(Self::Unix { listener: listener.try_clone()?, path: path.clone() }),
        }
    }

    pub fn local_addr(&self) -> io::Result<LocalAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().map(LocalAddr::Ip),
            Self::Unix { path, .. } => Ok(LocalAddr::Unix(path.clone())),
        }
    }

    /// Shuts down the read side so that threads blocked in `accept` or `poll`
    /// on this socket wake up.
    pub fn shutdown_read(&self) {
        // SAFETY: the descriptor is owned by `self` and stays open for the call.
        let rc = unsafe { libc::shutdown(self.as_raw_fd(), libc::SHUT_RD) };
        if rc < 0 {
            debug!(cause = %io::Error::last_os_error(), "shutdown of listening socket failed");
        }
    }

    /// Removes the socket file of a Unix listener.
    pub fn remove_socket_file(&self) {
        if let Self::Unix { path, .. } = self
            && let Err(e) = std::fs::remove_file(path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), cause = %e, "failed to remove unix socket");
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(listener) => listener.as_raw_fd(),
            Self::Unix { listener, .. } => listener.as_raw_fd(),
        }
    }
}

/// An accepted connection socket.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.set_nonblocking(nonblocking),
            Self::Unix(stream) => stream.set_nonblocking(nonblocking),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.set_read_timeout(timeout),
            Self::Unix(stream) => stream.set_read_timeout(timeout),
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.shutdown(how),
            Self::Unix(stream) => stream.shutdown(how),
        }
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(stream) => Ok(Self::Tcp(stream.try_clone()?)),
            Self::Unix(stream) => Ok(Self::Unix(stream.try_clone()?)),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(stream) => stream.as_raw_fd(),
            Self::Unix(stream) => stream.as_raw_fd(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            Self::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            Self::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            Self::Unix(stream) => stream.flush(),
        }
    }
}

fn bind_unix(path: &Path) -> io::Result<Listener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale unix socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(path)?;
    Ok(Listener::Unix { listener, path: path.to_owned() })
}

fn ip_bind_addr(config: &HttpConfig) -> Result<SocketAddr, HttpError> {
    let port = u16::try_from(config.port).map_err(|_| HttpError::bind(config.port, io::ErrorKind::InvalidInput.into()))?;

    let ip = match (&config.bind_addr, config.sock_type) {
        (Some(addr), _) => addr.parse().map_err(|_| HttpError::bind(addr, io::ErrorKind::InvalidInput.into()))?,
        (None, SocketType::IPv4) => Ipv4Addr::UNSPECIFIED.into(),
        (None, _) => Ipv6Addr::UNSPECIFIED.into(),
    };

    Ok(SocketAddr::new(ip, port))
}

fn bind_ip(addr: SocketAddr, sock_type: SocketType) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };

    // SAFETY: plain syscall, the result is checked below.
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` is a fresh socket that nothing else owns; the listener closes it on drop.
    let listener = unsafe { TcpListener::from_raw_fd(fd) };

    set_option(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    if domain == libc::AF_INET6 {
        set_option(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, c_int::from(sock_type == SocketType::IPv6))?;
    }

    let (storage, len) = to_storage(&addr);
    // SAFETY: `storage` holds a socket address of `len` bytes matching `domain`.
    let rc = unsafe { libc::bind(fd, (&raw const storage).cast::<sockaddr>(), len) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: plain syscall on a bound socket.
    if unsafe { libc::listen(fd, LISTEN_BACKLOG) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(listener)
}

fn set_option(fd: RawFd, level: c_int, name: c_int, value: c_int) -> io::Result<()> {
    // SAFETY: `value` outlives the call and its size is passed along.
    let rc = unsafe {
        libc::setsockopt(fd, level, name, (&raw const value).cast(), mem::size_of::<c_int>() as socklen_t)
    };
    if rc < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

fn to_storage(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    // SAFETY: an all-zero `sockaddr_storage` is a valid value.
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: `sockaddr_storage` is large and aligned enough for any socket address.
            let sa = unsafe { &mut *(&raw mut storage).cast::<sockaddr_in>() };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            (storage, mem::size_of::<sockaddr_in>() as socklen_t)
        }
        SocketAddr::V6(v6) => {
            // SAFETY: as above.
            let sa = unsafe { &mut *(&raw mut storage).cast::<sockaddr_in6>() };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_flowinfo = v6.flowinfo();
            sa.sin6_scope_id = v6.scope_id();
            (storage, mem::size_of::<sockaddr_in6>() as socklen_t)
        }
    }
}
