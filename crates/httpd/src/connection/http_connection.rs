use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use http::Version;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::codec::{RequestDecoder, ResponseEncoder};
use crate::connection::{ConnectionId, PeerAddr};
use crate::daemon::ServerContext;
use crate::dispatcher::{CONTINUE, ConnectionLink, NotifyLink, admit_request, over_limit};
use crate::io::{DriverStep, HttpIo, PreparedResponse, ResponseBody};
use crate::protocol::{HttpError, Message, ParseError, PayloadItem, PayloadSize, RequestHeader, RequestId, SendError};

const READ_CAPACITY: usize = 8 * 1024;
const FILE_CHUNK: usize = 64 * 1024;

/// An HTTP connection served on the tokio engine.
///
/// `HttpConnection` reads request heads and bodies through a [`FramedRead`]
/// with a [`RequestDecoder`] and writes responses through a [`FramedWrite`]
/// with a [`ResponseEncoder`]. Every request gets an [`HttpIo`]; while one of
/// its steps runs on the worker pool the connection task waits on a
/// [`NotifyLink`].
///
/// # Type Parameters
///
/// * `R`: The async readable stream type
/// * `W`: The async writable stream type
pub(crate) struct HttpConnection<R, W> {
    framed_read: FramedRead<R, RequestDecoder>,
    framed_write: FramedWrite<W, ResponseEncoder>,
    server: Arc<ServerContext>,
    id: ConnectionId,
    peer: PeerAddr,
    started: Instant,
    requests: u64,
    over_limit: bool,
}

impl<R, W> HttpConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(reader: R, writer: W, server: Arc<ServerContext>, id: ConnectionId, peer: PeerAddr) -> Self {
        let decoder = RequestDecoder::new(server.config());
        Self {
            framed_read: FramedRead::with_capacity(reader, decoder, READ_CAPACITY),
            framed_write: FramedWrite::new(writer, ResponseEncoder::new()),
            server,
            id,
            peer,
            started: Instant::now(),
            requests: 0,
            over_limit: false,
        }
    }

    /// The connection was accepted beyond the connection limit, its first
    /// request gets a 503.
    pub(crate) fn set_over_limit(&mut self, over_limit: bool) {
        self.over_limit = over_limit;
    }

    /// Serves requests until the client leaves, the connection idles out or
    /// `stopping` fires between two requests.
    pub(crate) async fn process(mut self, stopping: CancellationToken) -> Result<(), HttpError> {
        let idle_timeout = self.server.config().idle_timeout;

        loop {
            let next = select! {
                biased;
                () = stopping.cancelled() => {
                    debug!(conn = %self.id, "closing idle connection, daemon is stopping");
                    return Ok(());
                }
                next = timeout(idle_timeout, self.framed_read.next()) => next,
            };

            match next {
                Err(_elapsed) => {
                    debug!(conn = %self.id, "Timed out while waiting for HTTP request");
                    return Ok(());
                }

                Ok(Some(Ok(Message::Header((header, size))))) => {
                    if !self.do_process(header, size).await? {
                        return Ok(());
                    }
                }

                Ok(Some(Ok(Message::Payload(_)))) => {
                    return Err(ParseError::invalid_body("received body bytes outside a request").into());
                }

                Ok(Some(Err(e))) => {
                    debug!(conn = %self.id, cause = %e, "invalid request head");
                    self.send_prepared(PreparedResponse::error(e.status(), Version::HTTP_11, &e.to_string())).await?;
                    return Ok(());
                }

                Ok(None) => {
                    trace!(conn = %self.id, "client closed connection");
                    return Ok(());
                }
            }
        }
    }

    /// Runs one request. Returns whether the connection stays open.
    async fn do_process(&mut self, header: RequestHeader, size: PayloadSize) -> Result<bool, HttpError> {
        let id = RequestId::new(self.id, self.requests);
        self.requests += 1;
        let mut continued = !header.expects_continue();

        if self.over_limit {
            self.send_prepared(over_limit()).await?;
            return Ok(false);
        }

        let info = match admit_request(&self.server, id, header, size, &self.peer, self.started) {
            Ok(info) => info,
            Err(response) => {
                self.send_prepared(response).await?;
                return Ok(false);
            }
        };

        let link = Arc::new(NotifyLink::new());
        let io = HttpIo::new(info, Arc::clone(&self.server), Arc::clone(&link) as Arc<dyn ConnectionLink>);
        let mut guard = AbortOnDrop(Some(io.as_ref()));

        io.begin();
        let done = self.drive(&io, &link, &mut continued).await?;
        let keep = done && io.keepalive();
        if done {
            guard.disarm();
        }
        drop(guard);
        drop(io);

        if !keep {
            return Ok(false);
        }

        if self.framed_read.decoder().in_body() {
            // a body the client still holds back for `100 Continue` is not worth waiting for
            if !continued && !size.is_empty() {
                return Ok(false);
            }
            self.skip_body().await?;
        }
        Ok(true)
    }

    /// Follows the request context until its response is out. Returns
    /// `false` when the connection has to be closed.
    async fn drive(&mut self, io: &HttpIo, link: &NotifyLink, continued: &mut bool) -> Result<bool, HttpError> {
        let mut upgraded = false;
        let mut headers_only = false;

        loop {
            match io.poll_driver() {
                DriverStep::Wait => link.parked().await,

                DriverStep::WantBody(_) => {
                    if !*continued {
                        *continued = true;
                        self.write_raw(CONTINUE).await?;
                        trace!("sent 100 Continue");
                    }
                    if upgraded {
                        self.pump_raw(io).await?;
                    } else {
                        self.pump_body(io).await?;
                    }
                }

                DriverStep::Upgrade(head) => {
                    self.write_raw(&head).await?;
                    io.enter_websocket();
                    upgraded = true;
                }

                DriverStep::StreamHead { head, size, headers_only: only } => {
                    if only {
                        self.framed_write.encoder_mut().head_only();
                    }
                    headers_only = only;
                    self.framed_write.send(Message::<_, Bytes>::Header((head, size))).await?;
                }

                DriverStep::Chunk(bytes) if upgraded => self.write_raw(&bytes).await?,

                DriverStep::Chunk(bytes) => {
                    if !headers_only {
                        self.framed_write.send(Message::Payload(PayloadItem::Chunk(bytes))).await?;
                    }
                }

                DriverStep::End => self.framed_write.send(Message::Payload(PayloadItem::<Bytes>::Eof)).await?,

                DriverStep::Done => return Ok(true),

                DriverStep::Truncated | DriverStep::Close => return Ok(false),

                DriverStep::Response(response) => {
                    self.send_prepared(response).await?;
                    return Ok(true);
                }
            }
        }
    }

    /// Hands the next decoded body chunk to the pending read.
    async fn pump_body(&mut self, io: &HttpIo) -> Result<(), HttpError> {
        if !self.framed_read.decoder().in_body() {
            io.finish_body();
            return Ok(());
        }

        let idle_timeout = self.server.config().idle_timeout;
        match timeout(idle_timeout, self.framed_read.next()).await {
            Ok(Some(Ok(Message::Payload(PayloadItem::Chunk(bytes))))) => io.supply_body(&bytes),
            Ok(Some(Ok(Message::Payload(PayloadItem::Eof)))) => io.finish_body(),
            Ok(Some(Ok(Message::Header(_)))) => {
                return Err(ParseError::invalid_body("request head inside a body").into());
            }
            Ok(Some(Err(e))) => {
                io.log_error(format!("failed to read request body: {e}"));
                return Err(e.into());
            }
            Ok(None) => return Err(ParseError::invalid_body("connection closed before end of body").into()),
            Err(_elapsed) => return Err(ParseError::io(ErrorKind::TimedOut).into()),
        }
        Ok(())
    }

    /// Upgraded connections pass socket bytes through unframed.
    async fn pump_raw(&mut self, io: &HttpIo) -> Result<(), HttpError> {
        let buffered = self.framed_read.read_buffer_mut();
        if !buffered.is_empty() {
            io.supply_body(&buffered.split());
            return Ok(());
        }

        let mut buf = BytesMut::with_capacity(READ_CAPACITY);
        let n = self.framed_read.get_mut().read_buf(&mut buf).await?;
        if n == 0 {
            io.finish_body();
        } else {
            io.supply_body(&buf);
        }
        Ok(())
    }

    /// Discards the rest of a body the handler did not read.
    async fn skip_body(&mut self) -> Result<(), HttpError> {
        let idle_timeout = self.server.config().idle_timeout;

        while self.framed_read.decoder().in_body() {
            match timeout(idle_timeout, self.framed_read.next()).await {
                Ok(Some(Ok(Message::Payload(_)))) => {}
                Ok(Some(Ok(Message::Header(_)))) => {
                    return Err(ParseError::invalid_body("request head inside a body").into());
                }
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => return Err(ParseError::invalid_body("connection closed before end of body").into()),
                Err(_elapsed) => return Err(ParseError::io(ErrorKind::TimedOut).into()),
            }
        }
        Ok(())
    }

    async fn send_prepared(&mut self, response: PreparedResponse) -> Result<(), HttpError> {
        let size = response.payload_size();
        if response.headers_only {
            self.framed_write.encoder_mut().head_only();
        }

        self.framed_write.feed(Message::<_, Bytes>::Header((response.head, size))).await?;

        match response.body {
            ResponseBody::Empty => {}
            ResponseBody::Bytes(bytes) => self.framed_write.feed(Message::Payload(PayloadItem::Chunk(bytes))).await?,
            ResponseBody::File { .. } if response.headers_only => {}
            ResponseBody::File { file, len } => {
                let mut reader = tokio::fs::File::from_std(file).take(len);
                loop {
                    let mut chunk = BytesMut::with_capacity(FILE_CHUNK);
                    let n = reader.read_buf(&mut chunk).await.map_err(SendError::io)?;
                    if n == 0 {
                        break;
                    }
                    self.framed_write.send(Message::Payload(PayloadItem::Chunk(chunk.freeze()))).await?;
                }
            }
        }

        // using send instead of feed, the response has to leave the buffer
        self.framed_write.send(Message::Payload(PayloadItem::<Bytes>::Eof)).await?;
        Ok(())
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), HttpError> {
        let writer = self.framed_write.get_mut();
        writer.write_all(bytes).await.map_err(SendError::io)?;
        writer.flush().await.map_err(SendError::io)?;
        Ok(())
    }
}

/// Aborts the request context when the connection future is dropped or
/// fails before the request completed.
struct AbortOnDrop<'a>(Option<&'a HttpIo>);

impl AbortOnDrop<'_> {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(io) = self.0.take() {
            io.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::StatusCode;
    use indoc::indoc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;
    use crate::config::HttpConfig;
    use crate::handler::Handler;
    use crate::protocol::RequestInfo;

    fn server<H: Handler>(handler: H) -> Arc<ServerContext> {
        let mut config = HttpConfig::default();
        config.async_threads = 2;
        config.idle_timeout = Duration::from_secs(2);
        ServerContext::new(config, Arc::new(handler)).unwrap()
    }

    async fn exchange<H: Handler>(handler: H, request: &str) -> String {
        let (client, server_side) = duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server_side);
        let connection = HttpConnection::new(reader, writer, server(handler), ConnectionId::new(0, 1), PeerAddr::Unix);
        let task = tokio::spawn(connection.process(CancellationToken::new()));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(request.as_bytes()).await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut response = String::new();
        client_read.read_to_string(&mut response).await.unwrap();
        task.await.unwrap().unwrap();
        response
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sync_text_response() {
        let request = indoc! {"
            GET /hello HTTP/1.1\r
            Connection: close\r
            \r
        "};
        let response = exchange(|_: &RequestInfo, io: &HttpIo| io.attach_text(StatusCode::OK, "ok"), request).await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nok"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_step_reads_body() {
        let request = indoc! {"
            POST /echo HTTP/1.1\r
            Content-Length: 5\r
            Connection: close\r
            \r
            hello"};
        let handler = |_: &RequestInfo, io: &HttpIo| {
            io.run_async(|io: &HttpIo| {
                let mut buf = [0u8; 16];
                let mut body = Vec::new();
                loop {
                    let n = io.read(&mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    body.extend_from_slice(&buf[..n]);
                }
                io.attach_binary(StatusCode::OK, body, &mime::APPLICATION_OCTET_STREAM);
            });
        };

        let response = exchange(handler, request).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn keep_alive_serves_pipelined_requests() {
        let request = indoc! {"
            GET /a HTTP/1.1\r
            \r
            GET /b HTTP/1.1\r
            Connection: close\r
            \r
        "};
        let handler = |request: &RequestInfo, io: &HttpIo| io.attach_text(StatusCode::OK, request.path().to_string());

        let response = exchange(handler, request).await;
        assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(response.contains("\r\n\r\n/a"));
        assert!(response.ends_with("\r\n\r\n/b"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_head_gets_error_page() {
        let response = exchange(|_: &RequestInfo, _: &HttpIo| {}, "BREW /pot HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 405 "));
        assert!(response.to_ascii_lowercase().contains("connection: close"));
    }
}
