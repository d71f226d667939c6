//! Dispatchers drive connections: they accept, parse request heads, run the
//! handler through an [`HttpIo`](crate::io::HttpIo) and write responses.
//!
//! Two implementations share the request context contract:
//!
//! - [`engine`]: the tokio runtime with framed codecs, one task per connection
//! - [`poll`]: self-contained `poll(2)` loops, each with a private worker
//!   sub-pool serving parsed connections
//!
//! While a request step runs on the worker pool, the dispatcher side of the
//! connection is parked on a [`ConnectionLink`].

mod engine;
mod poll;
mod serve;
mod wake;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use http::{StatusCode, Version};
use tokio::sync::Notify;
use tracing::warn;

use crate::config::DispatcherKind;
use crate::connection::{Listener, PeerAddr};
use crate::daemon::ServerContext;
use crate::io::PreparedResponse;
use crate::protocol::{PayloadSize, RequestHeader, RequestId, RequestInfo};
use crate::utils::{lock, wait};

pub(crate) use engine::EngineDispatcher;
pub(crate) use poll::PollDispatcher;
pub(crate) use wake::WakeChannel;

/// Pause before accepting again after a failed `accept`.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Bytes sent before the first body read when the client expects them.
pub(crate) const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Suspend/resume of the dispatcher side of one connection.
///
/// Both calls are idempotent and `resume` without a prior `suspend` is a
/// no-op. The request context calls them while holding its own lock.
pub(crate) trait ConnectionLink: Send + Sync {
    fn suspend(&self);
    fn resume(&self);
}

/// A link for a dispatcher thread that blocks while the connection is suspended.
#[derive(Debug, Default)]
pub(crate) struct ParkLink {
    suspended: Mutex<bool>,
    cv: Condvar,
}

impl ParkLink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Blocks while suspended.
    pub(crate) fn park(&self) {
        let mut suspended = lock(&self.suspended);
        while *suspended {
            suspended = wait(&self.cv, suspended);
        }
    }
}

impl ConnectionLink for ParkLink {
    fn suspend(&self) {
        *lock(&self.suspended) = true;
    }

    fn resume(&self) {
        let mut suspended = lock(&self.suspended);
        if std::mem::replace(&mut *suspended, false) {
            self.cv.notify_all();
        }
    }
}

/// A link for an async connection task.
#[derive(Debug, Default)]
pub(crate) struct NotifyLink {
    suspended: AtomicBool,
    notify: Notify,
}

impl NotifyLink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Completes once resumed; a resume that happened before is not lost.
    pub(crate) async fn parked(&self) {
        self.notify.notified().await;
    }
}

impl ConnectionLink for NotifyLink {
    fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    fn resume(&self) {
        if self.suspended.swap(false, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }
}

/// A running dispatcher as seen by the daemon.
pub(crate) trait Dispatcher: Send + std::fmt::Debug {
    /// Makes a blocked loop look at the daemon state again.
    fn wake(&self);

    /// Shuts down every connection socket still open.
    fn force_close(&self);

    /// Waits for the loop to exit and releases its connections.
    fn join(self: Box<Self>);
}

/// Starts the configured dispatchers over the bound listener.
pub(crate) fn start(server: &Arc<ServerContext>, listener: &Listener) -> std::io::Result<Vec<Box<dyn Dispatcher>>> {
    let config = server.config();
    let mut dispatchers: Vec<Box<dyn Dispatcher>> = Vec::new();

    match config.dispatcher {
        DispatcherKind::Engine => {
            dispatchers.push(Box::new(EngineDispatcher::start(Arc::clone(server), listener.try_clone()?)?));
        }
        DispatcherKind::Poll => {
            for index in 0..config.threads {
                dispatchers.push(Box::new(PollDispatcher::start(index, Arc::clone(server), listener.try_clone()?)?));
            }
        }
    }

    Ok(dispatchers)
}

/// Turns a parsed head into the descriptor handed to the handler, or into the
/// response sent instead of running it.
pub(crate) fn admit_request(
    server: &ServerContext,
    id: RequestId,
    header: RequestHeader,
    size: PayloadSize,
    peer: &PeerAddr,
    connected: Instant,
) -> Result<RequestInfo, PreparedResponse> {
    let version = header.version();

    let mut info = match RequestInfo::new(id, header, size, peer, server.config()) {
        Ok(info) => info,
        Err(e) => {
            warn!(request = %id, client = %peer, cause = %e, "rejected request");
            return Err(PreparedResponse::error(e.status(), version, &e.to_string()));
        }
    };

    if !server.is_running() {
        return Err(PreparedResponse::error(StatusCode::SERVICE_UNAVAILABLE, version, "Server is shutting down"));
    }

    let keepalive_time = server.config().keepalive_time;
    if keepalive_time == Duration::ZERO || connected.elapsed() > keepalive_time {
        info.disable_keepalive();
    }

    Ok(info)
}

/// Response for a connection accepted beyond the connection limit.
pub(crate) fn over_limit() -> PreparedResponse {
    PreparedResponse::error(StatusCode::SERVICE_UNAVAILABLE, Version::HTTP_11, "Too many connections")
}

/// Accept failures worth retrying after a short pause, the process or the
/// system ran out of something or the client gave up early.
pub(crate) fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::ECONNABORTED))
}
