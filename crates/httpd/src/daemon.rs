//! The daemon: owns the configuration, the listening socket, the worker pool
//! and the dispatchers, and sequences start and stop.
//!
//! ```no_run
//! use http::StatusCode;
//! use micro_httpd::config::HttpConfig;
//! use micro_httpd::daemon::HttpDaemon;
//! use micro_httpd::io::HttpIo;
//! use micro_httpd::protocol::RequestInfo;
//!
//! let mut config = HttpConfig::default();
//! config.port = 8080;
//!
//! let mut daemon = HttpDaemon::new();
//! daemon.start(&config, |_: &RequestInfo, io: &HttpIo| io.attach_text(StatusCode::OK, "ok"))?;
//! // ...
//! daemon.stop();
//! # Ok::<(), micro_httpd::protocol::HttpError>(())
//! ```

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::{debug, info, warn};

use crate::config::HttpConfig;
use crate::connection::{Listener, LocalAddr};
use crate::dispatcher::{self, Dispatcher};
use crate::handler::Handler;
use crate::protocol::HttpError;
use crate::worker::WorkerPool;

/// State shared by the dispatchers and every request context of a running daemon.
pub struct ServerContext {
    config: HttpConfig,
    handler: Arc<dyn Handler>,
    pool: WorkerPool,
    running: AtomicBool,
    connections: AtomicUsize,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("running", &self.is_running())
            .field("connections", &self.connections())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl ServerContext {
    pub(crate) fn new(config: HttpConfig, handler: Arc<dyn Handler>) -> io::Result<Arc<Self>> {
        let pool = WorkerPool::new("http-async", config.async_threads)?;
        Ok(Arc::new(Self { config, handler, pool, running: AtomicBool::new(true), connections: AtomicUsize::new(0) }))
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// `false` once the daemon started stopping.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Open connections across all dispatchers.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub(crate) fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Returns `false` when it was already stopping.
    pub(crate) fn stop_accepting(&self) -> bool {
        self.running.swap(false, Ordering::AcqRel)
    }

    /// Counts a new connection, `false` when it is beyond the limit.
    pub(crate) fn open_connection(&self) -> bool {
        let open = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        self.config.max_connections == 0 || open <= self.config.max_connections
    }

    pub(crate) fn close_connection(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct HttpDaemon {
    listener: Option<Listener>,
    server: Option<Arc<ServerContext>>,
    dispatchers: Vec<Box<dyn Dispatcher>>,
}

impl HttpDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `config` and opens the listening socket. A stale Unix socket
    /// file is replaced.
    pub fn bind(&mut self, config: &HttpConfig) -> Result<(), HttpError> {
        if self.server.is_some() {
            return Err(HttpError::AlreadyStarted);
        }

        config.validate()?;
        let listener = Listener::bind(config)?;
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "HTTP daemon bound");
        }
        self.listener = Some(listener);
        Ok(())
    }

    /// Binds if needed, then starts the worker pool and the dispatchers.
    /// The daemon keeps its own copy of `config`.
    pub fn start<H: Handler>(&mut self, config: &HttpConfig, handler: H) -> Result<(), HttpError> {
        if self.server.is_some() {
            return Err(HttpError::AlreadyStarted);
        }
        if self.listener.is_none() {
            self.bind(config)?;
        }
        let Some(listener) = &self.listener else {
            return Err(HttpError::Io { source: io::Error::from(io::ErrorKind::NotConnected) });
        };

        let server = ServerContext::new(config.clone(), Arc::new(handler))?;
        self.dispatchers = dispatcher::start(&server, listener)?;
        info!(
            dispatcher = ?config.dispatcher,
            threads = config.threads,
            workers = server.pool().worker_count(),
            "HTTP daemon started"
        );

        self.server = Some(server);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.server.as_ref().is_some_and(|server| server.is_running())
    }

    pub fn local_addr(&self) -> Option<LocalAddr> {
        self.listener.as_ref().and_then(|listener| listener.local_addr().ok())
    }

    /// Stops accepting, drains the worker pool within the stop timeout, then
    /// force-closes whatever is left. Calling it again does nothing.
    pub fn stop(&mut self) {
        let Some(server) = self.server.take() else {
            if let Some(listener) = self.listener.take() {
                listener.remove_socket_file();
            }
            return;
        };

        if !server.stop_accepting() {
            return;
        }
        info!("stopping HTTP daemon");

        if let Some(listener) = &self.listener {
            listener.shutdown_read();
        }

        for dispatcher in &self.dispatchers {
            dispatcher.wake();
        }

        let timeout = server.config().stop_timeout;
        if !server.pool().wait(timeout) {
            warn!(?timeout, outstanding = server.pool().outstanding(), "HTTP workers still busy, closing connections");
            for dispatcher in &self.dispatchers {
                dispatcher.force_close();
            }
            server.pool().sync();
        }

        for dispatcher in self.dispatchers.drain(..) {
            dispatcher.join();
        }
        if let Some(listener) = self.listener.take() {
            listener.remove_socket_file();
        }

        debug!(connections = server.connections(), "HTTP daemon stopped");
    }
}

impl Drop for HttpDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}
