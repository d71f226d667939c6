//! Dispatcher on the tokio runtime.
//!
//! One accept task hands every connection to its own task running an
//! [`HttpConnection`]. Two cancellation tokens drive shutdown: `stopping`
//! ends the accept loop and closes connections waiting for their next
//! request, `force` drops every connection future, which closes its socket
//! and aborts its request context.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::runtime::Runtime;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};

use crate::connection::{ConnectionId, HttpConnection, Listener, PeerAddr};
use crate::daemon::ServerContext;
use crate::dispatcher::{ACCEPT_BACKOFF, Dispatcher, is_transient_accept_error};

/// Time left to runtime threads still blocked in handler code once every
/// connection task is gone.
const RUNTIME_SHUTDOWN: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub(crate) struct EngineDispatcher {
    server: Arc<ServerContext>,
    runtime: Option<Runtime>,
    stopping: CancellationToken,
    force: CancellationToken,
    tracker: TaskTracker,
}

impl EngineDispatcher {
    pub(crate) fn start(server: Arc<ServerContext>, listener: Listener) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(server.config().threads)
            .thread_name("http-engine")
            .enable_all()
            .build()?;

        listener.set_nonblocking(true)?;
        let listener = {
            let _guard = runtime.enter();
            AsyncListener::from_std(listener)?
        };

        let acceptor = Acceptor {
            server: Arc::clone(&server),
            tracker: TaskTracker::new(),
            stopping: CancellationToken::new(),
            force: CancellationToken::new(),
            counter: 0,
        };
        let (tracker, stopping, force) = (acceptor.tracker.clone(), acceptor.stopping.clone(), acceptor.force.clone());

        runtime.spawn(tracker.track_future(acceptor.run(listener)));
        Ok(Self { server, runtime: Some(runtime), stopping, force, tracker })
    }
}

impl Dispatcher for EngineDispatcher {
    fn wake(&self) {
        self.stopping.cancel();
    }

    fn force_close(&self) {
        self.force.cancel();
    }

    /// Waits for the connection tasks, forcing them closed once the stop
    /// timeout passed. Must not be called from inside a tokio runtime.
    fn join(mut self: Box<Self>) {
        self.stopping.cancel();
        self.tracker.close();

        let Some(runtime) = self.runtime.take() else { return };
        let stop_timeout = self.server.config().stop_timeout;
        let (tracker, force) = (self.tracker.clone(), self.force.clone());

        runtime.block_on(async move {
            if tokio::time::timeout(stop_timeout, tracker.wait()).await.is_err() {
                warn!(connections = tracker.len(), "connections still open, closing them");
                force.cancel();
                tracker.wait().await;
            }
        });
        runtime.shutdown_timeout(RUNTIME_SHUTDOWN);
        debug!("engine dispatcher stopped");
    }
}

/// The accept task.
struct Acceptor {
    server: Arc<ServerContext>,
    tracker: TaskTracker,
    stopping: CancellationToken,
    force: CancellationToken,
    counter: u64,
}

impl Acceptor {
    async fn run(mut self, listener: AsyncListener) {
        debug!(threads = self.server.config().threads, "engine dispatcher started");

        loop {
            let accepted = select! {
                biased;
                () = self.stopping.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(Accepted::Tcp(stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(cause = %e, "failed to set TCP_NODELAY");
                    }
                    let (reader, writer) = stream.into_split();
                    self.spawn(reader, writer, PeerAddr::Ip(addr));
                }
                Ok(Accepted::Unix(stream)) => {
                    let (reader, writer) = stream.into_split();
                    self.spawn(reader, writer, PeerAddr::Unix);
                }
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                    debug!("listening socket shut down");
                    break;
                }
                Err(e) => {
                    if is_transient_accept_error(&e) {
                        warn!(cause = %e, "failed to accept connection, retrying");
                    } else {
                        error!(cause = %e, "failed to accept connection");
                    }
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        debug!("accept loop finished");
    }

    fn spawn<R, W>(&mut self, reader: R, writer: W, peer: PeerAddr)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let within_limit = self.server.open_connection();
        if !within_limit {
            warn!(limit = self.server.config().max_connections, client = %peer, "too many connections");
        }

        self.counter += 1;
        let id = ConnectionId::new(0, self.counter);
        trace!(conn = %id, client = %peer, "accepted connection");

        let mut connection = HttpConnection::new(reader, writer, Arc::clone(&self.server), id, peer);
        connection.set_over_limit(!within_limit);

        let server = Arc::clone(&self.server);
        let stopping = self.stopping.clone();
        let force = self.force.clone();
        self.tracker.spawn(async move {
            select! {
                biased;
                () = force.cancelled() => debug!(conn = %id, "forcing connection closed"),
                result = connection.process(stopping) => {
                    if let Err(e) = result {
                        debug!(conn = %id, cause = %e, "connection closed with error");
                    }
                }
            }
            server.close_connection();
        });
    }
}

enum AsyncListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

enum Accepted {
    Tcp(TcpStream, SocketAddr),
    Unix(UnixStream),
}

impl AsyncListener {
    /// Registers a non-blocking std listener with the current runtime.
    fn from_std(listener: Listener) -> io::Result<Self> {
        match listener {
            Listener::Tcp(listener) => Ok(Self::Tcp(TcpListener::from_std(listener)?)),
            Listener::Unix { listener, .. } => Ok(Self::Unix(UnixListener::from_std(listener)?)),
        }
    }

    async fn accept(&self) -> io::Result<Accepted> {
        match self {
            Self::Tcp(listener) => listener.accept().await.map(|(stream, addr)| Accepted::Tcp(stream, addr)),
            Self::Unix(listener) => listener.accept().await.map(|(stream, _)| Accepted::Unix(stream)),
        }
    }
}
