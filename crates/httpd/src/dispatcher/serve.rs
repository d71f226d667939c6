//! Blocking connection service used by the poll dispatcher's sub-pool.
//!
//! A worker takes a connection whose first request head was parsed by the
//! readiness loop, switches the socket to blocking mode and serves requests
//! until none is buffered any more: handler, body pumping, response writing
//! and keep-alive. The connection then goes back to the loop.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::net::Shutdown;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, trace};

use crate::codec::{HeaderDecoder, PayloadDecoder, ResponseEncoder};
use crate::connection::ConnectionRecord;
use crate::daemon::ServerContext;
use crate::dispatcher::{CONTINUE, ConnectionLink, ParkLink, admit_request, over_limit};
use crate::io::{DriverStep, HttpIo, PreparedResponse, ResponseBody};
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHeader, RequestId, ResponseHead, SendError};

const FILE_CHUNK: usize = 64 * 1024;

/// What the readiness loop found on a connection.
#[derive(Debug)]
pub(crate) enum Pending {
    Request(RequestHeader, PayloadSize),
    Invalid(ParseError),
}

/// Serves requests on `record` until no complete head is buffered. Returns
/// whether the connection stays open.
pub(crate) fn serve(server: &Arc<ServerContext>, decoder: &mut HeaderDecoder, record: &mut ConnectionRecord, first: Pending) -> bool {
    let Some(stream) = record.stream() else { return false };
    if let Err(e) = stream.set_nonblocking(false).and_then(|()| stream.set_read_timeout(Some(server.config().idle_timeout))) {
        error!(conn = %record.id(), cause = %e, "failed to switch connection to blocking mode");
        return false;
    }

    let mut pending = first;
    loop {
        let keep = match pending {
            Pending::Invalid(e) => {
                debug!(conn = %record.id(), cause = %e, "invalid request head");
                let response = PreparedResponse::error(e.status(), http::Version::HTTP_11, &e.to_string());
                let _ = write_response(record, &mut ResponseEncoder::new(), response);
                false
            }
            Pending::Request(_, _) if record.over_limit() => {
                let _ = write_response(record, &mut ResponseEncoder::new(), over_limit());
                false
            }
            Pending::Request(header, size) => Exchange::new(server, record, size).run(header),
        };

        if !keep {
            return false;
        }

        pending = match decoder.decode(&mut record.buf) {
            Ok(Some((header, size))) => Pending::Request(header, size),
            Ok(None) => break,
            Err(e) => Pending::Invalid(e),
        };
    }

    match record.stream() {
        Some(stream) => stream.set_nonblocking(true).is_ok(),
        None => false,
    }
}

/// One request on a blocking connection.
struct Exchange<'a> {
    server: &'a Arc<ServerContext>,
    record: &'a mut ConnectionRecord,
    size: PayloadSize,
    body: PayloadDecoder,
    body_done: bool,
    continued: bool,
    encoder: ResponseEncoder,
    out: BytesMut,
    upgraded: bool,
    headers_only: bool,
}

impl<'a> Exchange<'a> {
    fn new(server: &'a Arc<ServerContext>, record: &'a mut ConnectionRecord, size: PayloadSize) -> Self {
        Self {
            server,
            record,
            size,
            body: size.into(),
            body_done: size.is_empty(),
            continued: true,
            encoder: ResponseEncoder::new(),
            out: BytesMut::new(),
            upgraded: false,
            headers_only: false,
        }
    }

    fn run(mut self, header: RequestHeader) -> bool {
        let id = RequestId::new(self.record.id(), self.record.next_request());
        self.continued = !header.expects_continue();

        let info = match admit_request(self.server, id, header, self.size, self.record.peer(), self.record.started()) {
            Ok(info) => info,
            Err(response) => {
                let _ = write_response(self.record, &mut self.encoder, response);
                return false;
            }
        };

        let link = Arc::new(ParkLink::new());
        let io = HttpIo::new(info, Arc::clone(self.server), Arc::clone(&link) as Arc<dyn ConnectionLink>);
        let keep = {
            let _enter = io.span().enter();
            io.begin();
            self.drive(&io, &link) && io.keepalive()
        };
        drop(io);

        // a body the client still holds back for `100 Continue` is not worth waiting for
        keep && (self.continued || self.body_done) && self.skip_body()
    }

    fn drive(&mut self, io: &HttpIo, link: &ParkLink) -> bool {
        loop {
            let ok = match io.poll_driver() {
                DriverStep::Wait => {
                    link.park();
                    true
                }
                DriverStep::WantBody(_) => self.send_continue() && self.pump_body(io),
                DriverStep::Upgrade(head) => {
                    let ok = self.send_raw(&head);
                    io.enter_websocket();
                    self.upgraded = true;
                    ok
                }
                DriverStep::StreamHead { head, size, headers_only } => {
                    if headers_only {
                        self.encoder.head_only();
                    }
                    self.headers_only = headers_only;
                    self.send(Message::Header((head, size)))
                }
                DriverStep::Chunk(bytes) if self.upgraded => self.send_raw(&bytes),
                DriverStep::Chunk(bytes) => self.headers_only || self.send(Message::Payload(PayloadItem::Chunk(bytes))),
                DriverStep::End => self.send(Message::Payload(PayloadItem::Eof)),
                DriverStep::Done => return true,
                DriverStep::Truncated | DriverStep::Close => false,
                DriverStep::Response(response) => match write_response(self.record, &mut self.encoder, response) {
                    Ok(()) => return true,
                    Err(e) => {
                        debug!(cause = %e, "failed to send response");
                        false
                    }
                },
            };

            if !ok {
                io.abort();
                return false;
            }
        }
    }

    fn send_continue(&mut self) -> bool {
        if self.continued {
            return true;
        }
        self.continued = true;
        self.send_raw(CONTINUE)
    }

    /// Hands the next piece of the request body to the pending read.
    fn pump_body(&mut self, io: &HttpIo) -> bool {
        if self.upgraded {
            if self.record.buf.is_empty() {
                match self.record.fill() {
                    Ok(0) => {
                        io.finish_body();
                        return true;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log_io_error(&e);
                        return false;
                    }
                }
            }
            io.supply_body(&self.record.buf.split());
            return true;
        }

        match self.next_body_chunk() {
            Ok(Some(bytes)) => io.supply_body(&bytes),
            Ok(None) => io.finish_body(),
            Err(e) => {
                io.log_error(format!("failed to read request body: {e}"));
                return false;
            }
        }
        true
    }

    fn next_body_chunk(&mut self) -> Result<Option<Bytes>, ParseError> {
        loop {
            if self.body_done {
                return Ok(None);
            }

            match self.body.decode(&mut self.record.buf)? {
                Some(PayloadItem::Chunk(bytes)) if bytes.is_empty() => {}
                Some(PayloadItem::Chunk(bytes)) => return Ok(Some(bytes)),
                Some(PayloadItem::Eof) => self.body_done = true,
                None => {
                    let n = self.record.fill().map_err(ParseError::io)?;
                    if n == 0 {
                        return Err(ParseError::invalid_body("connection closed before end of body"));
                    }
                    trace!(n, "read request body bytes");
                }
            }
        }
    }

    /// Discards the rest of a body the handler did not read.
    fn skip_body(&mut self) -> bool {
        loop {
            match self.next_body_chunk() {
                Ok(Some(_)) => {}
                Ok(None) => return true,
                Err(e) => {
                    debug!(cause = %e, "failed to skip request body");
                    return false;
                }
            }
        }
    }

    fn send(&mut self, item: Message<(ResponseHead, PayloadSize)>) -> bool {
        let result = self.encoder.encode(item, &mut self.out).and_then(|()| flush(self.record, &mut self.out));
        if let Err(e) = result {
            debug!(cause = %e, "failed to send response");
            return false;
        }
        true
    }

    fn send_raw(&mut self, bytes: &[u8]) -> bool {
        if let Err(e) = self.record.write_all(bytes) {
            log_io_error(&e);
            return false;
        }
        true
    }
}

fn flush(record: &mut ConnectionRecord, out: &mut BytesMut) -> Result<(), SendError> {
    if !out.is_empty() {
        record.write_all(out)?;
        out.clear();
    }
    Ok(())
}

/// Writes a fully buffered response.
pub(crate) fn write_response(record: &mut ConnectionRecord, encoder: &mut ResponseEncoder, response: PreparedResponse) -> Result<(), SendError> {
    let size = response.payload_size();
    if response.headers_only {
        encoder.head_only();
    }

    let mut out = BytesMut::new();
    encoder.encode(Message::<_, Bytes>::Header((response.head, size)), &mut out)?;

    match response.body {
        ResponseBody::Empty => {}
        ResponseBody::Bytes(bytes) => encoder.encode(Message::Payload(PayloadItem::Chunk(bytes)), &mut out)?,
        ResponseBody::File { .. } if response.headers_only => {}
        ResponseBody::File { file, len } => {
            flush(record, &mut out)?;
            send_file(record, encoder, file, len, &mut out)?;
        }
    }

    encoder.encode(Message::<_, Bytes>::Payload(PayloadItem::Eof), &mut out)?;
    flush(record, &mut out)
}

fn send_file(record: &mut ConnectionRecord, encoder: &mut ResponseEncoder, file: File, len: u64, out: &mut BytesMut) -> Result<(), SendError> {
    let mut reader = file.take(len);
    let mut chunk = vec![0u8; FILE_CHUNK];

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        encoder.encode(Message::Payload(PayloadItem::Chunk(Bytes::copy_from_slice(&chunk[..n]))), out)?;
        flush(record, out)?;
    }
}

/// Closes both directions so a blocked peer notices.
pub(crate) fn close(record: &mut ConnectionRecord) {
    if let Some(stream) = record.take_stream() {
        let _ = stream.shutdown(Shutdown::Both);
    }
}

pub(crate) fn log_io_error(e: &std::io::Error) {
    match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::UnexpectedEof => {
            debug!(cause = %e, "client disconnected");
        }
        ErrorKind::WouldBlock | ErrorKind::TimedOut => debug!("Timed out while waiting for HTTP request"),
        _ => error!(cause = %e, "connection I/O error"),
    }
}
