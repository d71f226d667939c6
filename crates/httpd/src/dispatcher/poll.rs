//! `poll(2)` readiness-loop dispatcher.
//!
//! Each dispatcher thread owns the connections it accepted. Idle ones live in
//! a [`Slab`] and sit in the poll set next to the listener and the
//! [`WakeChannel`]. Once a complete request head is buffered the record leaves
//! the slab and is served on the dispatcher's private worker pool (see
//! [`serve`]); it comes back through a channel when no further head is
//! buffered.
//!
//! On stop the loop closes its idle connections, waits for the ones in flight
//! and shuts their sockets down once the stop timeout passed or the daemon
//! asks for it.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio_util::codec::Decoder;
use tracing::{debug, error, trace, warn};

use crate::codec::HeaderDecoder;
use crate::connection::{ConnectionId, ConnectionRecord, FreeList, Listener, PeerAddr, Slab, Stream};
use crate::daemon::ServerContext;
use crate::dispatcher::serve::{Pending, close, log_io_error, serve};
use crate::dispatcher::{ACCEPT_BACKOFF, Dispatcher, WakeChannel, is_transient_accept_error};
use crate::utils::lock;
use crate::worker::WorkerPool;

const ACCEPT_BATCH: usize = 64;
const MAX_POLL_WAIT: Duration = Duration::from_secs(1);
const STOP_TICK: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub(crate) struct PollDispatcher {
    index: usize,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

/// Parts of a dispatcher reachable from other threads.
#[derive(Debug)]
struct Shared {
    wake: WakeChannel,
    /// Sockets of the connections currently served on the worker sub-pool
    busy: Mutex<HashMap<ConnectionId, Stream>>,
    force: AtomicBool,
}

impl Shared {
    fn close_busy(&self) {
        for (id, stream) in lock(&self.busy).iter() {
            debug!(conn = %id, "forcing connection closed");
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// A record handed back by a sub-pool worker.
struct Returned {
    record: ConnectionRecord,
    keep: bool,
}

impl PollDispatcher {
    pub(crate) fn start(index: usize, server: Arc<ServerContext>, listener: Listener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;

        let shared = Arc::new(Shared { wake: WakeChannel::new()?, busy: Mutex::default(), force: AtomicBool::new(false) });
        let config = server.config();
        let workers = WorkerPool::new(&format!("http-dispatch-{index}"), config.workers_per_dispatcher)?;
        let (returns, returned) = mpsc::channel();

        let event_loop = EventLoop {
            index,
            decoder: HeaderDecoder::new(config),
            records: Slab::with_capacity(64),
            free: FreeList::new(config.free_list_size),
            server,
            shared: Arc::clone(&shared),
            listener,
            workers,
            returns,
            returned,
            counter: 0,
            in_flight: 0,
            accepting: true,
            accept_paused_until: None,
            stopping_since: None,
            fds: Vec::new(),
            slots: Vec::new(),
        };

        let thread = thread::Builder::new().name(format!("http-poll-{index}")).spawn(move || event_loop.run())?;
        Ok(Self { index, shared, thread: Some(thread) })
    }
}

impl Dispatcher for PollDispatcher {
    fn wake(&self) {
        self.shared.wake.wake();
    }

    fn force_close(&self) {
        self.shared.force.store(true, Ordering::Release);
        self.shared.close_busy();
        self.shared.wake.wake();
    }

    fn join(mut self: Box<Self>) {
        self.shared.wake.wake();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!(dispatcher = self.index, "poll dispatcher thread panicked");
        }
    }
}

struct EventLoop {
    index: usize,
    server: Arc<ServerContext>,
    shared: Arc<Shared>,
    listener: Listener,
    decoder: HeaderDecoder,
    records: Slab<ConnectionRecord>,
    free: FreeList<ConnectionRecord>,
    workers: WorkerPool,
    returns: Sender<Returned>,
    returned: Receiver<Returned>,
    counter: u64,
    in_flight: usize,
    accepting: bool,
    accept_paused_until: Option<Instant>,
    stopping_since: Option<Instant>,
    fds: Vec<libc::pollfd>,
    /// Slab slot of every connection entry in `fds`
    slots: Vec<usize>,
}

impl EventLoop {
    fn run(mut self) {
        debug!(dispatcher = self.index, workers = self.workers.worker_count(), "poll dispatcher started");

        loop {
            self.collect_returned();
            if !self.server.is_running() && !self.keep_stopping() {
                break;
            }

            let listening = self.build_poll_set();
            let timeout = self.poll_timeout();
            let nfds = libc::nfds_t::try_from(self.fds.len()).unwrap_or(libc::nfds_t::MAX);
            // SAFETY: `fds` is an initialized pollfd buffer that outlives the call
            // and `nfds` does not exceed its length.
            let n = unsafe { libc::poll(self.fds.as_mut_ptr(), nfds, timeout) };
            if n < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(dispatcher = self.index, cause = %e, "poll failed, stopping dispatcher");
                break;
            }

            if n > 0 {
                self.handle_events(listening);
            }
            self.expire_idle();
        }

        self.shutdown();
        debug!(dispatcher = self.index, "poll dispatcher stopped");
    }

    /// Fills the poll set: wake channel, then the listener if accepting, then
    /// every idle connection. Returns whether the listener is included.
    fn build_poll_set(&mut self) -> bool {
        self.fds.clear();
        self.slots.clear();
        self.fds.push(pollfd(self.shared.wake.as_raw_fd()));

        if self.accept_paused_until.is_some_and(|until| Instant::now() >= until) {
            self.accept_paused_until = None;
        }
        let listening = self.accepting && self.stopping_since.is_none() && self.accept_paused_until.is_none();
        if listening {
            self.fds.push(pollfd(self.listener.as_raw_fd()));
        }

        for (slot, record) in self.records.iter() {
            if let Some(stream) = record.stream() {
                self.fds.push(pollfd(stream.as_raw_fd()));
                self.slots.push(slot);
            }
        }

        listening
    }

    /// Milliseconds until the earliest idle deadline, an accept retry or a stop tick.
    fn poll_timeout(&self) -> libc::c_int {
        let now = Instant::now();
        let mut timeout = MAX_POLL_WAIT;

        if let Some(deadline) = self.records.iter().map(|(_, record)| record.deadline()).min() {
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }
        if let Some(until) = self.accept_paused_until {
            timeout = timeout.min(until.saturating_duration_since(now));
        }
        if self.stopping_since.is_some() {
            timeout = timeout.min(STOP_TICK);
        }

        libc::c_int::try_from(timeout.as_micros().div_ceil(1000)).unwrap_or(libc::c_int::MAX)
    }

    fn handle_events(&mut self, listening: bool) {
        let offset = if listening { 2 } else { 1 };

        if self.fds[0].revents != 0 {
            self.shared.wake.drain();
        }

        let ready: Vec<usize> = self.fds[offset..]
            .iter()
            .zip(&self.slots)
            .filter(|(fd, _)| fd.revents != 0)
            .map(|(_, slot)| *slot)
            .collect();
        for slot in ready {
            self.read_ready(slot);
        }

        self.collect_returned();
        if listening && self.fds[1].revents != 0 {
            self.accept();
        }
    }

    fn read_ready(&mut self, slot: usize) {
        let idle_timeout = self.server.config().idle_timeout;
        let Some(record) = self.records.get_mut(slot) else { return };

        match record.fill() {
            Ok(0) => {
                trace!(conn = %record.id(), "client closed connection");
                self.close(slot);
                return;
            }
            Ok(n) => trace!(conn = %record.id(), n, "read request bytes"),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => return,
            Err(e) => {
                log_io_error(&e);
                self.close(slot);
                return;
            }
        }

        record.touch(idle_timeout);
        let pending = match self.decoder.decode(&mut record.buf) {
            Ok(None) => return,
            Ok(Some((header, size))) => Pending::Request(header, size),
            Err(e) => Pending::Invalid(e),
        };
        self.dispatch(slot, pending);
    }

    /// Moves a connection with a parsed head to the worker sub-pool.
    fn dispatch(&mut self, slot: usize, pending: Pending) {
        let Some(mut record) = self.records.remove(slot) else { return };

        let busy = match record.stream().map(Stream::try_clone) {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                error!(conn = %record.id(), cause = %e, "failed to track connection socket");
                self.release(record);
                return;
            }
            None => {
                self.release(record);
                return;
            }
        };
        lock(&self.shared.busy).insert(record.id(), busy);
        self.in_flight += 1;

        let server = Arc::clone(&self.server);
        let shared = Arc::clone(&self.shared);
        let returns = self.returns.clone();
        let mut decoder = self.decoder;

        self.workers.run(move || {
            let keep = serve(&server, &mut decoder, &mut record, pending);
            lock(&shared.busy).remove(&record.id());

            match returns.send(Returned { record, keep }) {
                Ok(()) => shared.wake.wake(),
                Err(mpsc::SendError(mut returned)) => {
                    close(&mut returned.record);
                    server.close_connection();
                }
            }
            true
        });
    }

    fn collect_returned(&mut self) {
        let idle_timeout = self.server.config().idle_timeout;

        while let Ok(Returned { mut record, keep }) = self.returned.try_recv() {
            self.in_flight -= 1;
            if keep && self.server.is_running() {
                record.touch(idle_timeout);
                self.records.insert(record);
            } else {
                self.release(record);
            }
        }
    }

    fn accept(&mut self) {
        for _ in 0..ACCEPT_BATCH {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                    debug!(dispatcher = self.index, "listening socket shut down");
                    self.accepting = false;
                    return;
                }
                Err(e) => {
                    if is_transient_accept_error(&e) {
                        warn!(cause = %e, "failed to accept connection, retrying");
                    } else {
                        error!(cause = %e, "failed to accept connection");
                    }
                    self.accept_paused_until = Some(Instant::now() + ACCEPT_BACKOFF);
                    return;
                }
            }
        }
    }

    fn admit(&mut self, stream: Stream, peer: PeerAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            error!(client = %peer, cause = %e, "failed to configure accepted connection");
            return;
        }

        let within_limit = self.server.open_connection();
        if !within_limit {
            warn!(limit = self.server.config().max_connections, client = %peer, "too many connections");
        }

        self.counter += 1;
        let id = ConnectionId::new(self.index, self.counter);
        let mut record = self.free.take().unwrap_or_default();
        record.init(id, stream, peer, self.server.config().idle_timeout);
        record.set_over_limit(!within_limit);

        trace!(conn = %id, client = %record.peer(), "accepted connection");
        self.records.insert(record);
    }

    fn expire_idle(&mut self) {
        let now = Instant::now();
        let expired: Vec<usize> =
            self.records.iter().filter(|(_, record)| record.deadline() <= now).map(|(slot, _)| slot).collect();

        for slot in expired {
            if let Some(record) = self.records.get(slot) {
                debug!(conn = %record.id(), "Timed out while waiting for HTTP request");
            }
            self.close(slot);
        }
    }

    /// Called on every iteration once the daemon is stopping. Returns `false`
    /// when nothing is left to wait for.
    fn keep_stopping(&mut self) -> bool {
        let since = *self.stopping_since.get_or_insert_with(Instant::now);

        if !self.records.is_empty() {
            debug!(idle = self.records.len(), busy = self.in_flight, "closing idle connections");
        }
        let idle: Vec<usize> = self.records.iter().map(|(slot, _)| slot).collect();
        for slot in idle {
            self.close(slot);
        }

        if self.in_flight == 0 {
            return false;
        }
        if self.shared.force.load(Ordering::Acquire) || since.elapsed() >= self.server.config().stop_timeout {
            self.shared.close_busy();
        }
        true
    }

    /// Releases everything once the loop is done.
    fn shutdown(&mut self) {
        let open: Vec<ConnectionRecord> = self.records.drain().collect();
        for record in open {
            self.release(record);
        }

        if self.in_flight > 0 {
            self.shared.close_busy();
        }
        while self.in_flight > 0 {
            match self.returned.recv_timeout(STOP_TICK) {
                Ok(Returned { record, .. }) => {
                    self.in_flight -= 1;
                    self.release(record);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => self.shared.close_busy(),
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn close(&mut self, slot: usize) {
        if let Some(record) = self.records.remove(slot) {
            self.release(record);
        }
    }

    /// Closes the socket and parks the record for reuse.
    fn release(&mut self, mut record: ConnectionRecord) {
        close(&mut record);
        self.server.close_connection();
        record.reset();
        let _ = self.free.park(record);
    }
}

fn pollfd(fd: std::os::fd::RawFd) -> libc::pollfd {
    libc::pollfd { fd, events: libc::POLLIN, revents: 0 }
}
