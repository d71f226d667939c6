//! The request context handed to handlers.
//!
//! One [`HttpIo`] exists per request. The handler first runs inline on the
//! dispatcher thread (`Sync`); work queued with [`HttpIo::run_async`] then runs
//! on the daemon worker pool (`Async`) while the dispatcher parks the
//! connection. Request and response bodies are streamed with blocking
//! [`read`](HttpIo::read) / [`write`](HttpIo::write) calls from those steps.
//!
//! The dispatcher side talks to the context through [`HttpIo::poll_driver`]:
//! every call inspects the shared state under the context lock and returns the
//! next [`DriverStep`], suspending the connection link when there is nothing to
//! do. Steps that change what the dispatcher should do always call
//! [`ConnectionLink::resume`] while holding the same lock, so a wakeup is never
//! lost between the check and the park.

use std::fs::File;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{self, HeaderValue, IntoHeaderName};
use http::{HeaderMap, StatusCode, Version};
use mime::Mime;
use tracing::{Span, debug, error, info_span, warn};

use crate::daemon::ServerContext;
use crate::dispatcher::ConnectionLink;
use crate::io::encoding::{self, BodyEncoder, CompressionType};
use crate::io::response::{self, PreparedResponse, ResponseBody};
use crate::io::stream::{BodyReader, BodyWriter, IoSink};
use crate::io::IoState;
use crate::protocol::{PayloadSize, RequestInfo, ResponseHead, StreamError};
use crate::utils::{lock, wait_timeout};
use crate::ws::{self, WebSocket};

/// How often blocked `read` / `write` calls re-check whether the daemon is stopping.
const SHUTDOWN_TICK: Duration = Duration::from_millis(100);

pub(crate) type AsyncStep = Box<dyn FnOnce(&HttpIo) + Send + 'static>;
type Finalizer = Box<dyn FnOnce() + Send + 'static>;

/// What the dispatcher has to do next for a request.
#[derive(Debug)]
pub(crate) enum DriverStep {
    /// Nothing to do until the link is resumed.
    Wait,
    /// A step waits for up to this many request body bytes.
    WantBody(usize),
    /// Send this `101 Switching Protocols` head, then call [`HttpIo::enter_websocket`].
    Upgrade(Bytes),
    /// Commit the head of a streamed response.
    StreamHead { head: ResponseHead, size: PayloadSize, headers_only: bool },
    /// Next piece of a streamed response, or raw bytes once upgraded.
    Chunk(Bytes),
    /// The streamed response body is complete.
    End,
    /// The streamed response was sent and the context is idle again.
    Done,
    /// The context went idle before ending its streamed response.
    Truncated,
    /// A fully buffered response.
    Response(PreparedResponse),
    /// Upgraded session is over, close the connection.
    Close,
}

struct IoInner {
    state: IoState,
    async_step: Option<AsyncStep>,
    /// The queued step produces the response, attaching another one cancels it.
    async_step_response: bool,

    read_want: usize,
    read_data: BytesMut,
    read_eof: bool,
    read_total: u64,
    read_max: Option<u64>,

    write_buf: BytesMut,
    write_eof: bool,
    /// Response framing committed by the first `write`
    write_attached: bool,
    head_sent: bool,
    end_sent: bool,
    write_code: StatusCode,
    write_len: Option<u64>,
    write_encoding: CompressionType,

    status: Option<StatusCode>,
    headers: HeaderMap,
    body: ResponseBody,
    keepalive: bool,

    finalizers: Vec<Finalizer>,
    last_err: Option<String>,
    ws_upgrade: Option<Bytes>,
    upgraded: bool,
}

pub struct HttpIo {
    request: RequestInfo,
    server: Arc<ServerContext>,
    link: Arc<dyn ConnectionLink>,
    span: Span,
    inner: Mutex<IoInner>,
    read_cv: Condvar,
    write_cv: Condvar,
    ws_cv: Condvar,
}

impl std::fmt::Debug for HttpIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIo").field("id", &self.request.id()).field("state", &self.state()).finish_non_exhaustive()
    }
}

impl HttpIo {
    pub(crate) fn new(request: RequestInfo, server: Arc<ServerContext>, link: Arc<dyn ConnectionLink>) -> Arc<Self> {
        let span = info_span!("request", id = %request.id(), client = request.client_addr());
        let keepalive = request.keepalive();

        Arc::new(Self {
            request,
            server,
            link,
            span,
            inner: Mutex::new(IoInner {
                state: IoState::Sync,
                async_step: None,
                async_step_response: false,
                read_want: 0,
                read_data: BytesMut::new(),
                read_eof: false,
                read_total: 0,
                read_max: None,
                write_buf: BytesMut::new(),
                write_eof: false,
                write_attached: false,
                head_sent: false,
                end_sent: false,
                write_code: StatusCode::OK,
                write_len: None,
                write_encoding: CompressionType::None,
                status: None,
                headers: HeaderMap::new(),
                body: ResponseBody::Empty,
                keepalive,
                finalizers: Vec::new(),
                last_err: None,
                ws_upgrade: None,
                upgraded: false,
            }),
            read_cv: Condvar::new(),
            write_cv: Condvar::new(),
            ws_cv: Condvar::new(),
        })
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn state(&self) -> IoState {
        lock(&self.inner).state
    }

    /// Last error recorded with [`log_error`](Self::log_error) or by the
    /// streaming calls, used as the default detail of 4xx error pages.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner).last_err.clone()
    }

    /// Logs an error for this request and remembers it as the last error.
    pub fn log_error<S: Into<String>>(&self, msg: S) {
        let msg = msg.into();
        self.span.in_scope(|| error!("{msg}"));
        lock(&self.inner).last_err = Some(msg);
    }

    pub fn add_header<K, V>(&self, key: K, value: V)
    where
        K: IntoHeaderName,
        V: TryInto<HeaderValue>,
    {
        match value.try_into() {
            Ok(value) => {
                lock(&self.inner).headers.append(key, value);
            }
            Err(_) => self.span.in_scope(|| warn!("ignoring invalid response header value")),
        }
    }

    /// Adds a `Set-Cookie` header, `value: None` deletes the cookie.
    pub fn add_cookie_header(&self, path: &str, name: &str, value: Option<&str>, http_only: bool, secure: bool) {
        if let Some(value) = response::cookie_value(path, name, value, http_only, secure) {
            self.add_header(header::SET_COOKIE, value);
        }
    }

    /// `Cache-Control: max-age` (or `no-store` for zero) plus an optional `ETag`.
    pub fn add_caching_headers(&self, max_age: Duration, etag: Option<&str>) {
        self.add_header(header::CACHE_CONTROL, response::cache_control_value(max_age));
        if let Some(etag) = etag {
            self.add_header(header::ETAG, etag);
        }
    }

    pub fn add_encoding_header(&self, encoding: CompressionType) {
        if let Some(value) = encoding.header_value() {
            self.add_header(header::CONTENT_ENCODING, value);
        }
    }

    pub fn attach_text<S: Into<String>>(&self, code: StatusCode, text: S) {
        let text = text.into();
        self.attach(code, ResponseBody::Bytes(Bytes::from(text)), Some(&mime::TEXT_PLAIN_UTF_8));
    }

    pub fn attach_binary<B: Into<Bytes>>(&self, code: StatusCode, data: B, content_type: &Mime) {
        self.attach(code, ResponseBody::Bytes(data.into()), Some(content_type));
    }

    /// Sends a regular file as the response body.
    pub fn attach_file(&self, code: StatusCode, file: File, content_type: &Mime) -> io::Result<()> {
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            self.log_error("Cannot serve non-regular file");
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
        }

        self.attach(code, ResponseBody::File { file, len: metadata.len() }, Some(content_type));
        Ok(())
    }

    pub fn attach_empty(&self, code: StatusCode) {
        self.attach(code, ResponseBody::Empty, None);
    }

    /// Plain text error page. Without `details`, 4xx pages show the last error.
    pub fn attach_error(&self, code: StatusCode, details: Option<&str>) {
        let mut inner = lock(&self.inner);
        attach_error_locked(&mut inner, code, details);
    }

    /// Compresses `data` with the negotiated coding on the worker pool and
    /// attaches it. Attaches a 406 when no acceptable coding exists.
    pub fn attach_binary_encoded<B: Into<Bytes>>(&self, code: StatusCode, data: B, content_type: Mime, preferred: CompressionType) {
        let Some(encoding) = self.negotiate_encoding(preferred) else { return };
        let data = data.into();

        if encoding == CompressionType::None {
            self.attach_binary(code, data, &content_type);
            return;
        }

        self.queue_step(
            Box::new(move |io: &HttpIo| match encoding::compress(&data, encoding) {
                Ok(compressed) => {
                    io.add_encoding_header(encoding);
                    io.attach_binary(code, compressed, &content_type);
                }
                Err(e) => {
                    io.log_error(format!("Failed to compress response: {e}"));
                    io.attach_error(StatusCode::INTERNAL_SERVER_ERROR, None);
                }
            }),
            true,
        );
    }

    /// Picks a coding from `Accept-Encoding`; attaches a 406 and returns `None`
    /// when nothing is acceptable.
    pub fn negotiate_encoding(&self, preferred: CompressionType) -> Option<CompressionType> {
        let accept = self.request.header(header::ACCEPT_ENCODING);
        let encoding = encoding::negotiate_encoding(accept, preferred);
        if encoding.is_none() {
            self.attach_error(StatusCode::NOT_ACCEPTABLE, None);
        }
        encoding
    }

    /// Queues `step` to run on the worker pool once the current handler or
    /// step returns. At most one step may be queued at a time.
    pub fn run_async<F>(&self, step: F)
    where
        F: FnOnce(&HttpIo) + Send + 'static,
    {
        self.queue_step(Box::new(step), false);
    }

    /// Registers a closure run when the context is destroyed.
    pub fn add_finalizer<F>(&self, finalizer: F)
    where
        F: FnOnce() + Send + 'static,
    {
        lock(&self.inner).finalizers.push(Box::new(finalizer));
    }

    /// Streams the request body. A declared `Content-Length` above `max_len`
    /// is rejected right away with 413, later reads enforce the running total.
    pub fn open_for_read(&self, max_len: Option<u64>) -> Result<BodyReader<'_>, StreamError> {
        let mut inner = lock(&self.inner);
        assert!(inner.state != IoState::Sync, "request body must be read from an async step");

        if let (Some(max), Some(declared)) = (max_len, self.request.body_size().declared_length())
            && declared > max
        {
            inner.last_err = Some(format!("HTTP body is too big (max = {max})"));
            attach_error_locked(&mut inner, StatusCode::PAYLOAD_TOO_LARGE, None);
            inner.keepalive = false;
            return Err(StreamError::TooLarge { max });
        }

        inner.read_max = max_len;
        Ok(BodyReader::new(self))
    }

    /// Streams the response body. `len: None` or a compressed body selects
    /// chunked framing (close-delimited for HTTP/1.0 clients).
    pub fn open_for_write(&self, code: StatusCode, len: Option<u64>, encoding: CompressionType) -> BodyWriter<'_> {
        {
            let mut inner = lock(&self.inner);
            assert!(!inner.write_attached, "response body already opened");
            inner.write_code = code;
            inner.write_len = if encoding == CompressionType::None { len } else { None };
            inner.write_encoding = encoding;
            if let Some(value) = encoding.header_value() {
                inner.headers.insert(header::CONTENT_ENCODING, value);
            }
        }

        BodyWriter::new(BodyEncoder::new(IoSink::new(self), encoding))
    }

    /// Blocks until request body bytes are available and copies them into
    /// `buf`. Returns 0 at the end of the body.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let mut inner = lock(&self.inner);
        assert!(inner.state != IoState::Sync, "request body must be read from an async step");
        if buf.is_empty() {
            return Ok(0);
        }

        inner.read_want = buf.len();
        while inner.state.is_async() && inner.read_data.is_empty() && !inner.read_eof {
            if !self.server.is_running() {
                inner.read_want = 0;
                drop(inner);
                self.log_error("Server is shutting down");
                return Err(StreamError::ShuttingDown);
            }

            self.link.resume();
            inner = wait_timeout(&self.read_cv, inner, SHUTDOWN_TICK);
        }
        inner.read_want = 0;

        if inner.state == IoState::Zombie {
            drop(inner);
            self.log_error("Connection aborted while reading");
            return Err(StreamError::Aborted);
        }

        let n = buf.len().min(inner.read_data.len());
        buf[..n].copy_from_slice(&inner.read_data[..n]);
        inner.read_data.advance(n);
        inner.read_total += n as u64;

        if let Some(max) = inner.read_max
            && inner.read_total > max
        {
            inner.last_err = Some(format!("HTTP body is too big (max = {max})"));
            attach_error_locked(&mut inner, StatusCode::PAYLOAD_TOO_LARGE, None);
            inner.keepalive = false;
            return Err(StreamError::TooLarge { max });
        }

        Ok(n)
    }

    /// Appends response bytes, blocking while the pending buffer is at its
    /// bound. An empty `buf` ends the body.
    ///
    /// # Panics
    ///
    /// When called from the synchronous handler or after the end of the body.
    pub fn write(&self, buf: &[u8]) -> Result<(), StreamError> {
        let bound = self.server.config().write_buffer_bound;

        let mut inner = lock(&self.inner);
        assert!(inner.state != IoState::Sync, "response body must be written from an async step");
        assert!(!inner.write_eof, "write after end of body");

        if inner.state == IoState::Zombie {
            drop(inner);
            self.log_error("Connection aborted while writing");
            return Err(StreamError::Aborted);
        }

        inner.write_attached = true;
        if inner.async_step_response {
            inner.async_step = None;
            inner.async_step_response = false;
        }
        self.link.resume();

        while inner.state.is_async() && inner.write_buf.len() >= bound {
            if !self.server.is_running() {
                drop(inner);
                self.log_error("Server is shutting down");
                return Err(StreamError::ShuttingDown);
            }
            inner = wait_timeout(&self.write_cv, inner, SHUTDOWN_TICK);
        }

        if inner.state == IoState::Zombie {
            drop(inner);
            self.log_error("Connection aborted while writing");
            return Err(StreamError::Aborted);
        }

        inner.write_eof |= buf.is_empty();
        inner.write_buf.extend_from_slice(buf);
        self.link.resume();
        Ok(())
    }

    /// Whether the request asks for a WebSocket upgrade.
    pub fn is_websocket(&self) -> bool {
        ws::is_upgrade_request(self.request.headers())
    }

    /// Accepts a WebSocket upgrade from an async step and returns the
    /// message-level stream once the dispatcher switched protocols.
    pub fn upgrade_websocket(&self) -> Result<WebSocket<'_>, StreamError> {
        let accept = match ws::validate_upgrade(self.request.headers()) {
            Ok(accept) => accept,
            Err(reject) => {
                if reject.status == StatusCode::UPGRADE_REQUIRED {
                    self.add_header(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
                }
                self.log_error(reject.reason);
                self.attach_error(reject.status, None);
                return Err(StreamError::protocol(reject.reason));
            }
        };

        let mut inner = lock(&self.inner);
        assert!(inner.state == IoState::Async, "websocket upgrade must run from an async step");

        inner.ws_upgrade = Some(ws::switching_protocols(&accept));
        inner.keepalive = false;
        self.link.resume();

        while inner.state == IoState::Async {
            inner = wait_timeout(&self.ws_cv, inner, SHUTDOWN_TICK);
        }

        if inner.state == IoState::WebSocket {
            drop(inner);
            Ok(WebSocket::new(self))
        } else {
            Err(StreamError::Aborted)
        }
    }

    fn attach(&self, code: StatusCode, body: ResponseBody, content_type: Option<&Mime>) {
        let content_type = content_type.and_then(|mime| HeaderValue::from_str(mime.as_ref()).ok());

        let mut inner = lock(&self.inner);
        cancel_response_step(&mut inner);
        inner.status = Some(code);
        inner.body = body;
        match content_type {
            Some(value) => {
                inner.headers.insert(header::CONTENT_TYPE, value);
            }
            None => {
                inner.headers.remove(header::CONTENT_TYPE);
            }
        }
    }

    fn queue_step(&self, step: AsyncStep, response: bool) {
        let mut inner = lock(&self.inner);
        assert!(inner.async_step.is_none(), "only one async step may be queued per request");
        inner.async_step = Some(step);
        inner.async_step_response = response;
    }
}

/// Dispatcher side.
impl HttpIo {
    /// Runs the handler inline, then starts the first queued step if any.
    pub(crate) fn begin(self: &Arc<Self>) {
        let _enter = self.span.enter();

        let handler = self.server.handler();
        if panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&self.request, self))).is_err() {
            error!("request handler panicked");
            self.attach_error(StatusCode::INTERNAL_SERVER_ERROR, None);
        }

        let mut inner = lock(&self.inner);
        inner.state = IoState::Idle;
        self.start_next_step(&mut inner);
    }

    /// Call with the context locked.
    fn start_next_step(self: &Arc<Self>, inner: &mut IoInner) {
        if inner.state != IoState::Idle || inner.async_step.is_none() {
            return;
        }

        inner.state = if inner.upgraded { IoState::WebSocket } else { IoState::Async };
        inner.async_step_response = false;

        let io = Arc::clone(self);
        self.server.pool().run(move || io.run_step());
    }

    fn run_step(self: Arc<Self>) -> bool {
        let _enter = self.span.enter();

        let step = lock(&self.inner).async_step.take();
        if let Some(step) = step {
            if self.server.is_running() {
                if panic::catch_unwind(AssertUnwindSafe(|| step(self.as_ref()))).is_err() {
                    error!("async request step panicked");
                    self.attach_error(StatusCode::INTERNAL_SERVER_ERROR, None);
                }
            } else {
                self.attach_text(StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down");
            }
        }

        let mut inner = lock(&self.inner);
        if inner.state == IoState::Zombie {
            debug!("releasing aborted request context");
            return true;
        }

        inner.state = IoState::Idle;
        if inner.async_step.is_some() {
            self.start_next_step(&mut inner);
        } else {
            self.link.resume();
        }

        true
    }

    /// Decides the next dispatcher action, see [`DriverStep`].
    pub(crate) fn poll_driver(&self) -> DriverStep {
        let mut inner = lock(&self.inner);

        if let Some(head) = inner.ws_upgrade.take() {
            return DriverStep::Upgrade(head);
        }
        if inner.state == IoState::Zombie {
            return DriverStep::Close;
        }

        // written bytes leave before the dispatcher blocks on the next body read
        if inner.write_attached && !inner.upgraded && !inner.head_sent {
            inner.head_sent = true;
            return self.stream_head(&mut inner);
        }
        if !inner.write_buf.is_empty() {
            return self.take_chunk(&mut inner);
        }
        if inner.read_want > 0 && inner.read_data.is_empty() && !inner.read_eof {
            return DriverStep::WantBody(inner.read_want);
        }

        if inner.upgraded {
            if inner.write_eof || inner.state == IoState::Idle {
                return DriverStep::Close;
            }
        } else if inner.write_attached {
            if inner.write_eof {
                if !inner.end_sent {
                    inner.end_sent = true;
                    return DriverStep::End;
                }
                if inner.state == IoState::Idle {
                    return DriverStep::Done;
                }
            } else if inner.state == IoState::Idle {
                error!(parent: &self.span, "Truncated HTTP response stream");
                return DriverStep::Truncated;
            }
        } else if inner.state == IoState::Idle {
            return DriverStep::Response(self.prepare_response(&mut inner));
        }

        self.link.suspend();
        DriverStep::Wait
    }

    fn take_chunk(&self, inner: &mut IoInner) -> DriverStep {
        let chunk = inner.write_buf.split().freeze();
        self.write_cv.notify_all();
        DriverStep::Chunk(chunk)
    }

    fn stream_head(&self, inner: &mut IoInner) -> DriverStep {
        let size = match inner.write_len {
            Some(len) => PayloadSize::new_length(len),
            None if self.request.version() == Version::HTTP_10 => PayloadSize::Close,
            None => PayloadSize::Chunked,
        };
        if size == PayloadSize::Close {
            inner.keepalive = false;
        }

        let headers = std::mem::take(&mut inner.headers);
        let head = response::build_head(inner.write_code, self.request.version(), headers, inner.keepalive);
        DriverStep::StreamHead { head, size, headers_only: self.request.headers_only() }
    }

    fn prepare_response(&self, inner: &mut IoInner) -> PreparedResponse {
        if inner.status.is_none() {
            attach_error_locked(inner, StatusCode::INTERNAL_SERVER_ERROR, None);
        }
        let status = inner.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let headers = std::mem::take(&mut inner.headers);
        let head = response::build_head(status, self.request.version(), headers, inner.keepalive);
        PreparedResponse { head, body: std::mem::take(&mut inner.body), headers_only: self.request.headers_only() }
    }

    /// Hands request body bytes to the pending `read`.
    pub(crate) fn supply_body(&self, data: &[u8]) {
        let mut inner = lock(&self.inner);
        inner.read_data.extend_from_slice(data);
        self.read_cv.notify_all();
    }

    /// Reports the end of the request body (or of the upgraded stream).
    pub(crate) fn finish_body(&self) {
        let mut inner = lock(&self.inner);
        inner.read_eof = true;
        self.read_cv.notify_all();
    }

    /// The `101` head was sent, bytes now move unframed.
    pub(crate) fn enter_websocket(&self) {
        let mut inner = lock(&self.inner);
        if inner.state == IoState::Async {
            inner.state = IoState::WebSocket;
        }
        inner.upgraded = true;
        self.ws_cv.notify_all();
    }

    /// The connection is gone. A running step keeps the context alive as a
    /// zombie until it returns; blocked streaming calls fail right away.
    pub(crate) fn abort(&self) {
        let mut inner = lock(&self.inner);
        if inner.state.is_async() {
            debug!(parent: &self.span, state = %inner.state, "connection closed while request step is running");
            inner.state = IoState::Zombie;
        }
        inner.keepalive = false;

        self.read_cv.notify_all();
        self.write_cv.notify_all();
        self.ws_cv.notify_all();
    }

    /// Whether the connection may serve another request after this one.
    pub(crate) fn keepalive(&self) -> bool {
        let inner = lock(&self.inner);
        inner.keepalive && !inner.upgraded
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }
}

impl Drop for HttpIo {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        for finalizer in inner.finalizers.drain(..) {
            finalizer();
        }
    }
}

fn cancel_response_step(inner: &mut IoInner) {
    if inner.async_step_response {
        inner.async_step = None;
        inner.async_step_response = false;
    }
}

fn attach_error_locked(inner: &mut IoInner, code: StatusCode, details: Option<&str>) {
    let details = match details {
        Some(details) => details,
        None if code.as_u16() < 500 => inner.last_err.as_deref().unwrap_or(""),
        None => "",
    };
    let text = response::error_text(code, details);

    cancel_response_step(inner);
    inner.status = Some(code);
    inner.body = ResponseBody::Bytes(Bytes::from(text));
    inner.headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    use bytes::BytesMut;
    use tokio_util::codec::Decoder;

    use super::*;
    use crate::codec::HeaderDecoder;
    use crate::config::HttpConfig;
    use crate::connection::{ConnectionId, PeerAddr};
    use crate::dispatcher::ParkLink;
    use crate::handler::Handler;
    use crate::protocol::RequestId;

    pub(crate) fn request_info(raw: &str, config: &HttpConfig) -> RequestInfo {
        let mut buf = BytesMut::from(raw);
        let (header, size) = HeaderDecoder::new(config).decode(&mut buf).unwrap().unwrap();
        RequestInfo::new(RequestId::new(ConnectionId::new(0, 1), 0), header, size, &PeerAddr::Unix, config).unwrap()
    }

    fn context<H: Handler>(raw: &str, config: HttpConfig, handler: H) -> (Arc<HttpIo>, Arc<ParkLink>) {
        let info = request_info(raw, &config);
        let server = ServerContext::new(config, Arc::new(handler)).unwrap();
        let link = Arc::new(ParkLink::new());
        let io = HttpIo::new(info, server, Arc::clone(&link) as Arc<dyn ConnectionLink>);
        (io, link)
    }

    /// Drives a context the way a dispatcher does, feeding `body` in pieces of
    /// at most `piece` bytes and collecting streamed response bytes.
    fn drive(io: &HttpIo, link: &ParkLink, body: &[u8], piece: usize) -> (Vec<DriverStep>, Vec<u8>) {
        let mut steps = Vec::new();
        let mut out = Vec::new();
        let mut offset = 0;

        loop {
            match io.poll_driver() {
                DriverStep::Wait => link.park(),
                DriverStep::WantBody(n) => {
                    let end = body.len().min(offset + n.min(piece));
                    if offset == end {
                        io.finish_body();
                    } else {
                        io.supply_body(&body[offset..end]);
                        offset = end;
                    }
                }
                DriverStep::Chunk(bytes) => out.extend_from_slice(&bytes),
                step @ (DriverStep::Response(_) | DriverStep::Done | DriverStep::Truncated | DriverStep::Close) => {
                    steps.push(step);
                    return (steps, out);
                }
                step => steps.push(step),
            }
        }
    }

    const GET: &str = "GET /x HTTP/1.1\r\nHost: test\r\n\r\n";

    #[test]
    fn sync_response() {
        let (io, link) = context(GET, HttpConfig::default(), |_: &RequestInfo, io: &HttpIo| {
            io.attach_text(StatusCode::OK, "ok");
        });

        io.begin();
        assert_eq!(io.state(), IoState::Idle);

        let (steps, _) = drive(&io, &link, b"", 1);
        let Some(DriverStep::Response(response)) = steps.last() else { panic!("expect response") };
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body.len(), 2);
        assert_eq!(response.head.headers()[header::CONNECTION], "keep-alive");
    }

    #[test]
    fn missing_response_is_500() {
        let (io, link) = context(GET, HttpConfig::default(), |_: &RequestInfo, _: &HttpIo| {});
        io.begin();

        let (steps, _) = drive(&io, &link, b"", 1);
        let Some(DriverStep::Response(response)) = steps.last() else { panic!("expect response") };
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn async_response_after_step() {
        let (io, link) = context(GET, HttpConfig::default(), |_: &RequestInfo, io: &HttpIo| {
            io.run_async(|io| {
                assert_eq!(io.state(), IoState::Async);
                thread::sleep(Duration::from_millis(20));
                io.attach_text(StatusCode::CREATED, "later");
            });
        });

        io.begin();
        let (steps, _) = drive(&io, &link, b"", 1);
        let Some(DriverStep::Response(response)) = steps.last() else { panic!("expect response") };
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(io.state(), IoState::Idle);
    }

    #[test]
    fn chained_steps_never_overlap() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (running2, peak2) = (Arc::clone(&running), Arc::clone(&peak));
        let (io, link) = context(GET, HttpConfig::default(), move |_: &RequestInfo, io: &HttpIo| {
            fn step(io: &HttpIo, left: usize, running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
                running.fetch_sub(1, Ordering::SeqCst);

                if left > 0 {
                    io.run_async(move |io| step(io, left - 1, running, peak));
                } else {
                    io.attach_empty(StatusCode::NO_CONTENT);
                }
            }

            let (running, peak) = (Arc::clone(&running2), Arc::clone(&peak2));
            io.run_async(move |io| step(io, 10, running, peak));
        });

        io.begin();
        let (steps, _) = drive(&io, &link, b"", 1);
        assert!(matches!(steps.last(), Some(DriverStep::Response(r)) if r.status() == StatusCode::NO_CONTENT));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "only one async step")]
    fn second_queued_step_panics() {
        let (io, _link) = context(GET, HttpConfig::default(), |_: &RequestInfo, _: &HttpIo| {});
        io.run_async(|_| {});
        io.run_async(|_| {});
    }

    #[test]
    fn streamed_body_in_order() {
        let config = HttpConfig { write_buffer_bound: 512, ..HttpConfig::default() };
        let (io, link) = context(GET, config, |_: &RequestInfo, io: &HttpIo| {
            io.run_async(|io| {
                for i in 0..100u8 {
                    io.write(&[i; 100]).unwrap();
                }
                io.write(&[]).unwrap();
            });
        });

        io.begin();
        let (steps, out) = drive(&io, &link, b"", 1);

        assert!(matches!(steps.first(), Some(DriverStep::StreamHead { size: PayloadSize::Chunked, .. })));
        assert!(steps.iter().any(|s| matches!(s, DriverStep::End)));
        assert!(matches!(steps.last(), Some(DriverStep::Done)));

        let expected: Vec<u8> = (0..100u8).flat_map(|i| [i; 100]).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn write_blocks_at_bound() {
        let config = HttpConfig { write_buffer_bound: 512, ..HttpConfig::default() };
        let written = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&written);

        let (io, _link) = context(GET, config, move |_: &RequestInfo, io: &HttpIo| {
            let counter = Arc::clone(&counter);
            io.run_async(move |io| {
                for _ in 0..4 {
                    io.write(&[0; 256]).unwrap();
                    counter.fetch_add(256, Ordering::SeqCst);
                }
                io.write(&[]).unwrap();
            });
        });

        io.begin();
        thread::sleep(Duration::from_millis(100));
        // two writes fill the buffer, the third one waits for the dispatcher
        assert_eq!(written.load(Ordering::SeqCst), 512);

        assert!(matches!(io.poll_driver(), DriverStep::StreamHead { .. }));
        let DriverStep::Chunk(chunk) = io.poll_driver() else { panic!("expect chunk") };
        assert_eq!(chunk.len(), 512);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(written.load(Ordering::SeqCst), 1024);
    }

    /// Starts a step whose second `write` waits at the bound and reports how it ended.
    fn blocked_write() -> (Arc<HttpIo>, mpsc::Receiver<Result<(), StreamError>>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let config = HttpConfig { write_buffer_bound: 512, ..HttpConfig::default() };

        let (io, _link) = context(GET, config, move |_: &RequestInfo, io: &HttpIo| {
            let tx = lock(&tx).clone();
            io.run_async(move |io| {
                io.write(&[0; 512]).unwrap();
                let _ = tx.send(io.write(b"more"));
            });
        });
        io.begin();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err(), "write should wait for the dispatcher");
        (io, rx)
    }

    #[test]
    fn blocked_write_fails_on_abort() {
        let (io, rx) = blocked_write();
        io.abort();
        assert!(matches!(rx.recv_timeout(Duration::from_secs(1)), Ok(Err(StreamError::Aborted))));
        assert_eq!(io.state(), IoState::Zombie);
    }

    #[test]
    fn blocked_write_fails_on_shutdown() {
        let (io, rx) = blocked_write();
        assert!(io.server.stop_accepting());
        assert!(matches!(rx.recv_timeout(Duration::from_secs(1)), Ok(Err(StreamError::ShuttingDown))));
    }

    #[test]
    fn blocked_read_fails_on_shutdown() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let raw = "POST /upload HTTP/1.1\r\nContent-Length: 100\r\n\r\n";

        let (io, _link) = context(raw, HttpConfig::default(), move |_: &RequestInfo, io: &HttpIo| {
            let tx = lock(&tx).clone();
            io.run_async(move |io| {
                let mut buf = [0u8; 16];
                let _ = tx.send(io.read(&mut buf));
            });
        });
        io.begin();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err(), "read should wait for body bytes");
        assert!(io.server.stop_accepting());
        assert!(matches!(rx.recv_timeout(Duration::from_secs(1)), Ok(Err(StreamError::ShuttingDown))));
        assert_eq!(io.last_error().as_deref(), Some("Server is shutting down"));
    }

    #[test]
    fn written_bytes_leave_before_body_read() {
        let raw = "POST /chat HTTP/1.1\r\nContent-Length: 3\r\n\r\n";
        let (io, link) = context(raw, HttpConfig::default(), |_: &RequestInfo, io: &HttpIo| {
            io.run_async(|io| {
                io.write(b"first").unwrap();
                let mut buf = [0u8; 8];
                assert_eq!(io.read(&mut buf).unwrap(), 3);
                io.write(&[]).unwrap();
            });
        });

        io.begin();
        let mut seen = Vec::new();
        loop {
            match io.poll_driver() {
                DriverStep::Wait => link.park(),
                DriverStep::StreamHead { .. } => seen.push("head"),
                DriverStep::Chunk(bytes) => {
                    assert_eq!(&bytes[..], b"first");
                    seen.push("chunk");
                }
                DriverStep::WantBody(_) => {
                    seen.push("want");
                    io.supply_body(b"abc");
                }
                DriverStep::End => seen.push("end"),
                DriverStep::Done => break,
                step => panic!("unexpected {step:?}"),
            }
        }
        assert_eq!(seen, ["head", "chunk", "want", "end"]);
    }

    #[test]
    fn read_body_in_pieces() {
        let raw = "POST /upload HTTP/1.1\r\nContent-Length: 10000\r\n\r\n";
        let total = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&total);

        let (io, link) = context(raw, HttpConfig::default(), move |_: &RequestInfo, io: &HttpIo| {
            let counter = Arc::clone(&counter);
            io.run_async(move |io| {
                let mut buf = [0u8; 1024];
                loop {
                    let n = io.read(&mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    assert!(n <= buf.len());
                    counter.fetch_add(n, Ordering::SeqCst);
                }
                io.attach_text(StatusCode::OK, "done");
            });
        });

        io.begin();
        let body = vec![7u8; 10000];
        let (steps, _) = drive(&io, &link, &body, 300);
        assert!(matches!(steps.last(), Some(DriverStep::Response(r)) if r.status() == StatusCode::OK));
        assert_eq!(total.load(Ordering::SeqCst), 10000);
    }

    #[test]
    fn declared_length_over_limit_is_413() {
        let raw = "POST /upload HTTP/1.1\r\nContent-Length: 5000\r\n\r\n";
        let (io, link) = context(raw, HttpConfig::default(), |_: &RequestInfo, io: &HttpIo| {
            io.run_async(|io| {
                assert!(matches!(io.open_for_read(Some(1000)), Err(StreamError::TooLarge { max: 1000 })));
            });
        });

        io.begin();
        let (steps, _) = drive(&io, &link, b"", 1);
        let Some(DriverStep::Response(response)) = steps.last() else { panic!("expect response") };
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(!io.keepalive());
    }

    #[test]
    fn abort_turns_running_step_into_zombie() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finalized);
        let raw = "POST /upload HTTP/1.1\r\nContent-Length: 100\r\n\r\n";

        let (io, link) = context(raw, HttpConfig::default(), move |_: &RequestInfo, io: &HttpIo| {
            let counter = Arc::clone(&counter);
            io.add_finalizer(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            io.run_async(|io| {
                let mut buf = [0u8; 64];
                assert!(matches!(io.read(&mut buf), Err(StreamError::Aborted)));
                thread::sleep(Duration::from_millis(50));
            });
        });

        io.begin();
        loop {
            match io.poll_driver() {
                DriverStep::WantBody(_) => break,
                DriverStep::Wait => link.park(),
                step => panic!("unexpected {step:?}"),
            }
        }

        io.abort();
        assert_eq!(io.state(), IoState::Zombie);
        let server = Arc::clone(&io.server);
        drop(io);
        assert_eq!(finalized.load(Ordering::SeqCst), 0);

        assert!(server.pool().sync());
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn truncated_stream_is_detected() {
        let (io, link) = context(GET, HttpConfig::default(), |_: &RequestInfo, io: &HttpIo| {
            io.run_async(|io| io.write(b"partial").unwrap());
        });

        io.begin();
        let (steps, out) = drive(&io, &link, b"", 1);
        assert_eq!(out, b"partial");
        assert!(matches!(steps.last(), Some(DriverStep::Truncated)));
    }

    #[test]
    fn head_request_keeps_length() {
        let raw = "HEAD /x HTTP/1.1\r\nHost: test\r\n\r\n";
        let (io, link) = context(raw, HttpConfig::default(), |_: &RequestInfo, io: &HttpIo| {
            io.attach_text(StatusCode::OK, "twelve bytes");
        });

        io.begin();
        let (steps, _) = drive(&io, &link, b"", 1);
        let Some(DriverStep::Response(response)) = steps.last() else { panic!("expect response") };
        assert!(response.headers_only);
        assert_eq!(response.payload_size(), PayloadSize::Length(12));
    }

    #[test]
    fn error_page_uses_last_error() {
        let (io, link) = context(GET, HttpConfig::default(), |_: &RequestInfo, io: &HttpIo| {
            io.log_error("Missing 'key' parameter");
            io.attach_error(StatusCode::UNPROCESSABLE_ENTITY, None);
        });

        io.begin();
        let (steps, _) = drive(&io, &link, b"", 1);
        let Some(DriverStep::Response(response)) = steps.last() else { panic!("expect response") };
        let ResponseBody::Bytes(body) = &response.body else { panic!("expect bytes") };
        assert_eq!(&body[..], b"Error 422: Unprocessable Content\nMissing 'key' parameter");
    }

    #[test]
    fn attach_cancels_encoded_response_step() {
        let raw = "GET /x HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n";
        let (io, link) = context(raw, HttpConfig::default(), |_: &RequestInfo, io: &HttpIo| {
            io.attach_binary_encoded(StatusCode::OK, vec![1u8; 100], mime::APPLICATION_OCTET_STREAM, CompressionType::Gzip);
            io.attach_empty(StatusCode::NOT_MODIFIED);
        });

        io.begin();
        let (steps, _) = drive(&io, &link, b"", 1);
        let Some(DriverStep::Response(response)) = steps.last() else { panic!("expect response") };
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }

    #[test]
    fn encoded_response_is_compressed() {
        let raw = "GET /x HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n";
        let (io, link) = context(raw, HttpConfig::default(), |_: &RequestInfo, io: &HttpIo| {
            io.attach_binary_encoded(StatusCode::OK, vec![1u8; 4096], mime::APPLICATION_OCTET_STREAM, CompressionType::Gzip);
        });

        io.begin();
        let (steps, _) = drive(&io, &link, b"", 1);
        let Some(DriverStep::Response(response)) = steps.last() else { panic!("expect response") };
        assert_eq!(response.head.headers()[header::CONTENT_ENCODING], "gzip");
        assert!(response.body.len() < 4096);
    }
}
