use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::connection::{PeerAddr, Stream};

const INITIAL_BUFFER_SIZE: usize = 8 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// Identifies a connection in logs: the dispatcher that accepted it plus a
/// per-dispatcher counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    dispatcher: usize,
    counter: u64,
}

impl ConnectionId {
    pub fn new(dispatcher: usize, counter: u64) -> Self {
        Self { dispatcher, counter }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dispatcher, self.counter)
    }
}

/// Per-socket state kept by the readiness-loop dispatcher.
///
/// Records are recycled: [`reset`](Self::reset) drops the socket and rewinds
/// the read buffer while keeping its allocation.
#[derive(Debug)]
pub struct ConnectionRecord {
    id: ConnectionId,
    stream: Option<Stream>,
    peer: PeerAddr,
    /// Bytes read from the socket and not parsed yet
    pub buf: BytesMut,
    deadline: Instant,
    started: Instant,
    requests: u64,
    /// Accepted beyond the connection limit, its first request gets a 503
    over_limit: bool,
}

impl ConnectionRecord {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(0, 0),
            stream: None,
            peer: PeerAddr::Unix,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            deadline: now,
            started: now,
            requests: 0,
            over_limit: false,
        }
    }

    /// Attaches a freshly accepted socket.
    pub fn init(&mut self, id: ConnectionId, stream: Stream, peer: PeerAddr, idle_timeout: Duration) {
        let now = Instant::now();
        self.id = id;
        self.stream = Some(stream);
        self.peer = peer;
        self.started = now;
        self.deadline = now + idle_timeout;
        self.requests = 0;
    }

    /// Clears the socket slot and rewinds the buffer before parking the record.
    pub fn reset(&mut self) {
        self.stream = None;
        self.buf.clear();
        self.requests = 0;
        self.over_limit = false;
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    pub fn stream(&self) -> Option<&Stream> {
        self.stream.as_ref()
    }

    pub fn take_stream(&mut self) -> Option<Stream> {
        self.stream.take()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn touch(&mut self, idle_timeout: Duration) {
        self.deadline = Instant::now() + idle_timeout;
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn over_limit(&self) -> bool {
        self.over_limit
    }

    pub fn set_over_limit(&mut self, over_limit: bool) {
        self.over_limit = over_limit;
    }

    /// Reads once from the socket into [`buf`](Self::buf). `Ok(0)` means the
    /// peer closed its side.
    pub fn fill(&mut self) -> io::Result<usize> {
        let stream = self.stream.as_mut().ok_or(ErrorKind::NotConnected)?;

        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk)?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or(ErrorKind::NotConnected)?;
        stream.write_all(data)
    }

    /// Returns the sequence number of the next request on this connection.
    pub fn next_request(&mut self) -> u64 {
        let seq = self.requests;
        self.requests += 1;
        seq
    }
}

impl Default for ConnectionRecord {
    fn default() -> Self {
        Self::new()
    }
}
