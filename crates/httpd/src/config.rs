//! Daemon configuration.
//!
//! [`HttpConfig`] is a plain struct with public fields and defaults. It can be
//! filled from textual `key = value` settings with [`HttpConfig::set_property`]
//! and must pass [`HttpConfig::validate`] before the daemon binds. Once the
//! daemon has started it keeps its own copy, so later edits have no effect.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::error;

/// Longest Unix socket path, `sizeof(sockaddr_un.sun_path) - 1` on Linux.
pub const MAX_UNIX_PATH_LEN: usize = 107;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("unknown property '{0}'")]
    UnknownProperty(String),

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

impl ConfigError {
    fn invalid_value(key: &str, value: &str) -> Self {
        Self::InvalidValue { key: key.to_owned(), value: value.to_owned() }
    }
}

/// Address family of the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// IPv6 socket accepting IPv4-mapped connections
    Dual,
    IPv4,
    IPv6,
    Unix,
}

/// Where the client address reported to handlers comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAddressMode {
    /// Peer address of the socket
    Socket,
    /// First entry of `X-Forwarded-For`
    XForwardedFor,
    /// `X-Real-IP`
    XRealIp,
}

/// Which dispatcher implementation drives the connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherKind {
    /// Self-contained `poll(2)` readiness loops with private worker sub-pools
    Poll,
    /// The tokio runtime with framed codecs
    Engine,
}

macro_rules! named_enum {
    ($ty:ty, $what:literal, { $($name:literal => $variant:expr),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(if s.eq_ignore_ascii_case($name) { return Ok($variant); })+
                Err(ConfigError::invalid_value($what, s))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                $(if *self == $variant { return f.write_str($name); })+
                Ok(())
            }
        }
    };
}

named_enum!(SocketType, "SocketType", { "Dual" => SocketType::Dual, "IPv4" => SocketType::IPv4, "IPv6" => SocketType::IPv6, "Unix" => SocketType::Unix });
named_enum!(ClientAddressMode, "ClientAddress", {
    "Socket" => ClientAddressMode::Socket,
    "X-Forwarded-For" => ClientAddressMode::XForwardedFor,
    "X-Real-IP" => ClientAddressMode::XRealIp,
});
named_enum!(DispatcherKind, "Dispatcher", { "Poll" => DispatcherKind::Poll, "Engine" => DispatcherKind::Engine });

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub sock_type: SocketType,
    /// Bind address for IP sockets, `None` binds every interface
    pub bind_addr: Option<String>,
    pub port: u32,
    pub unix_path: Option<PathBuf>,

    /// Simultaneous connections, 0 means unlimited
    pub max_connections: usize,
    pub idle_timeout: Duration,
    /// Maximum age of a keep-alive connection, zero disables keep-alive
    pub keepalive_time: Duration,
    /// Grace period given to running handlers by `stop`
    pub stop_timeout: Duration,

    pub max_request_size: usize,
    pub max_url_len: usize,
    pub max_request_headers: usize,
    pub max_request_cookies: usize,

    /// Dispatcher threads (poll) or runtime worker threads (engine)
    pub threads: usize,
    /// Size of the shared worker pool running async steps
    pub async_threads: usize,
    /// Private workers of each poll dispatcher
    pub workers_per_dispatcher: usize,
    pub addr_mode: ClientAddressMode,

    /// Pending response bytes above which `write` blocks
    pub write_buffer_bound: usize,
    /// Recycled connection records kept by each poll dispatcher
    pub free_list_size: usize,
    pub dispatcher: DispatcherKind,
}

impl Default for HttpConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism().map_or(4, |n| n.get().min(32));
        Self {
            sock_type: SocketType::Dual,
            bind_addr: None,
            port: 80,
            unix_path: None,
            max_connections: 0,
            idle_timeout: Duration::from_secs(60),
            keepalive_time: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
            max_request_size: 64 * 1024,
            max_url_len: 8 * 1024,
            max_request_headers: 64,
            max_request_cookies: 64,
            threads,
            async_threads: threads * 4,
            workers_per_dispatcher: 4,
            addr_mode: ClientAddressMode::Socket,
            write_buffer_bound: 4 * 1024,
            free_list_size: 256,
            dispatcher: DispatcherKind::Poll,
        }
    }
}

impl HttpConfig {
    /// Configuration listening on a Unix socket at `path`.
    pub fn unix<P: Into<PathBuf>>(path: P) -> Self {
        Self { sock_type: SocketType::Unix, unix_path: Some(path.into()), ..Self::default() }
    }

    /// Applies one textual setting.
    pub fn set_property(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::invalid_value(key, value);

        match key {
            "SocketType" | "IPStack" => self.sock_type = value.parse()?,
            "BindIP" => self.bind_addr = (value != "*").then(|| value.to_owned()),
            "Port" => self.port = value.parse().map_err(|_| invalid())?,
            "UnixPath" => self.unix_path = Some(PathBuf::from(value)),
            "ClientAddress" => self.addr_mode = value.parse()?,
            "IdleTimeout" => self.idle_timeout = parse_duration(value).ok_or_else(invalid)?,
            "KeepAliveTime" => {
                self.keepalive_time =
                    if value == "Disabled" { Duration::ZERO } else { parse_duration(value).ok_or_else(invalid)? };
            }
            "StopTimeout" => self.stop_timeout = parse_duration(value).ok_or_else(invalid)?,
            "MaxRequestSize" => self.max_request_size = parse_size(value).ok_or_else(invalid)?,
            "MaxUrlLength" => self.max_url_len = parse_size(value).ok_or_else(invalid)?,
            "MaxRequestHeaders" => self.max_request_headers = value.parse().map_err(|_| invalid())?,
            "MaxRequestCookies" => self.max_request_cookies = value.parse().map_err(|_| invalid())?,
            "MaxConnections" => self.max_connections = value.parse().map_err(|_| invalid())?,
            "Threads" => self.threads = value.parse().map_err(|_| invalid())?,
            "AsyncThreads" => self.async_threads = value.parse().map_err(|_| invalid())?,
            "WorkersPerDispatcher" => self.workers_per_dispatcher = value.parse().map_err(|_| invalid())?,
            "WriteBufferBound" => self.write_buffer_bound = parse_size(value).ok_or_else(invalid)?,
            "FreeListSize" => self.free_list_size = value.parse().map_err(|_| invalid())?,
            "Dispatcher" => self.dispatcher = value.parse()?,
            _ => {
                error!(key, "unknown HTTP property");
                return Err(ConfigError::UnknownProperty(key.to_owned()));
            }
        }

        Ok(())
    }

    /// Digits set the TCP port, anything else selects a Unix socket path.
    pub fn set_port_or_path(&mut self, str: &str) -> Result<(), ConfigError> {
        if !str.is_empty() && str.bytes().all(|b| b.is_ascii_digit()) {
            let port = str.parse::<u32>().ok().filter(|p| (1..=65535).contains(p));
            let Some(port) = port else {
                error!(port = str, "HTTP port is invalid (range: 1 - 65535)");
                return Err(ConfigError::invalid_value("Port", str));
            };

            if self.sock_type == SocketType::Unix {
                self.sock_type = SocketType::Dual;
            }
            self.port = port;
        } else {
            self.sock_type = SocketType::Unix;
            self.unix_path = Some(PathBuf::from(str));
        }

        Ok(())
    }

    /// Checks every setting, logging each problem, and fails if any is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.sock_type == SocketType::Unix {
            match &self.unix_path {
                None => errors.push("Unix socket path must be set".to_owned()),
                Some(path) if path.as_os_str().len() > MAX_UNIX_PATH_LEN => errors.push(format!(
                    "Socket path '{}' is too long (max length = {MAX_UNIX_PATH_LEN})",
                    path.display()
                )),
                Some(_) => {}
            }
        } else if !(1..=65535).contains(&self.port) {
            errors.push(format!("HTTP port {} is invalid (range: 1 - 65535)", self.port));
        }

        if self.idle_timeout < Duration::from_secs(1) {
            errors.push("HTTP IdleTimeout must be >= 1 sec".to_owned());
        }
        if !self.keepalive_time.is_zero() && self.keepalive_time < Duration::from_secs(5) {
            errors.push("HTTP KeepAliveTime must be >= 5 sec (or Disabled)".to_owned());
        }
        if self.stop_timeout < Duration::from_secs(1) {
            errors.push("HTTP StopTimeout must be >= 1 sec".to_owned());
        }
        if self.max_request_size < 1024 {
            errors.push("MaxRequestSize must be >= 1 kB".to_owned());
        }
        if self.max_url_len < 512 {
            errors.push("MaxUrlLength must be >= 512 B".to_owned());
        }
        if !(16..=crate::codec::MAX_HEADER_NUM).contains(&self.max_request_headers) {
            errors.push(format!("MaxRequestHeaders must be between 16 and {}", crate::codec::MAX_HEADER_NUM));
        }
        if !(1..=128).contains(&self.threads) {
            errors.push("HTTP threads must be between 1 and 128".to_owned());
        }
        if self.async_threads < 1 {
            errors.push("HTTP async threads must be >= 1".to_owned());
        }
        if self.workers_per_dispatcher < 1 {
            errors.push("HTTP workers per dispatcher must be >= 1".to_owned());
        }
        if self.write_buffer_bound < 512 {
            errors.push("WriteBufferBound must be >= 512 B".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            for e in &errors {
                error!("{e}");
            }
            Err(ConfigError::Invalid(errors))
        }
    }
}

/// Parses `1500ms`, `30s`, `5m`, `2h`; a bare number is in seconds.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let n = digits.parse::<u64>().ok()?;

    match unit.trim() {
        "ms" => Some(Duration::from_millis(n)),
        "" | "s" => Some(Duration::from_secs(n)),
        "m" | "min" => Some(Duration::from_secs(n * 60)),
        "h" => Some(Duration::from_secs(n * 3600)),
        _ => None,
    }
}

/// Parses `512`, `512B`, `64kB`, `64KiB`, `2MB`, `2MiB`.
fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let n = digits.parse::<usize>().ok()?;

    let multiplier = match unit.trim() {
        "" | "B" => 1,
        "kB" | "KB" => 1000,
        "KiB" => 1024,
        "MB" => 1000 * 1000,
        "MiB" => 1024 * 1024,
        _ => return None,
    };
    n.checked_mul(multiplier)
}
