//! End-to-end scenarios shared by the dispatcher test suites. Every scenario
//! runs a real daemon on a Unix socket in the temp directory.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use indoc::indoc;
use micro_httpd::config::{DispatcherKind, HttpConfig};
use micro_httpd::daemon::HttpDaemon;
use micro_httpd::handler::Handler;
use micro_httpd::io::{CompressionType, HttpIo, IoState};
use micro_httpd::protocol::{RequestInfo, StreamError};
use micro_httpd::ws::{self, Frame, Opcode, WsCodec};
use tokio_util::codec::{Decoder, Encoder};
use tracing_subscriber::EnvFilter;

static SOCKETS: AtomicUsize = AtomicUsize::new(0);

pub struct TestServer {
    pub daemon: HttpDaemon,
    pub path: PathBuf,
}

impl TestServer {
    pub fn start<H: Handler>(kind: DispatcherKind, handler: H) -> Self {
        Self::start_with(kind, |_| {}, handler)
    }

    pub fn start_with<H: Handler>(kind: DispatcherKind, tweak: impl FnOnce(&mut HttpConfig), handler: H) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter(EnvFilter::from_default_env()).try_init();

        let n = SOCKETS.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("micro-httpd-{}-{n}.sock", std::process::id()));

        let mut config = HttpConfig::unix(&path);
        config.dispatcher = kind;
        config.threads = 2;
        config.async_threads = 4;
        config.workers_per_dispatcher = 2;
        config.idle_timeout = Duration::from_secs(10);
        config.stop_timeout = Duration::from_secs(1);
        tweak(&mut config);

        let mut daemon = HttpDaemon::new();
        daemon.start(&config, handler).unwrap();
        Self { daemon, path }
    }

    pub fn connect(&self) -> Client {
        let stream = UnixStream::connect(&self.path).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Client { stream, reader }
    }

    pub fn stop(&mut self) {
        self.daemon.stop();
    }
}

pub struct Client {
    pub stream: UnixStream,
    reader: BufReader<UnixStream>,
}

#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

impl Client {
    pub fn send(&mut self, data: &str) {
        self.stream.write_all(data.as_bytes()).unwrap();
    }

    pub fn reply(&mut self) -> Reply {
        self.read_reply(false).unwrap()
    }

    pub fn head_reply(&mut self) -> Reply {
        self.read_reply(true).unwrap()
    }

    /// Reads until the server closes the connection.
    pub fn rest(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.reader.read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn read_reply(&mut self, head: bool) -> io::Result<Reply> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let status = line.split(' ').nth(1).and_then(|s| s.parse().ok()).unwrap_or(0);

        let mut headers = Vec::new();
        loop {
            line.clear();
            self.reader.read_line(&mut line)?;
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }
            let (name, value) = trimmed.split_once(':').unwrap();
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }

        let mut reply = Reply { status, headers, body: Vec::new() };
        if head || status == 101 {
            return Ok(reply);
        }

        if let Some(len) = reply.header("content-length") {
            let mut body = vec![0u8; len.parse().unwrap()];
            self.reader.read_exact(&mut body)?;
            reply.body = body;
        } else if reply.header("transfer-encoding").is_some_and(|v| v.eq_ignore_ascii_case("chunked")) {
            reply.body = self.read_chunked()?;
        } else {
            self.reader.read_to_end(&mut reply.body)?;
        }
        Ok(reply)
    }

    fn read_chunked(&mut self) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            self.reader.read_line(&mut line)?;
            let size = usize::from_str_radix(line.trim(), 16).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            let mut chunk = vec![0u8; size + 2];
            self.reader.read_exact(&mut chunk)?;
            if size == 0 {
                return Ok(body);
            }
            body.extend_from_slice(&chunk[..size]);
        }
    }

    fn read_raw(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        let n = self.reader.read(&mut chunk)?;
        buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Sends the upgrade request and checks the `101` answer.
    fn upgrade_websocket(&mut self) {
        self.send(indoc! {"
            GET /chat HTTP/1.1\r
            Host: localhost\r
            Upgrade: websocket\r
            Connection: Upgrade\r
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r
            Sec-WebSocket-Version: 13\r
            \r
        "});
        let reply = self.reply();
        assert_eq!(reply.status, 101);
        assert_eq!(reply.header("sec-websocket-accept"), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    fn send_frame(&mut self, codec: &mut WsCodec, frame: Frame) {
        let mut out = BytesMut::new();
        codec.encode(frame, &mut out).unwrap();
        self.stream.write_all(&out).unwrap();
    }

    fn read_frame(&mut self, codec: &mut WsCodec, buf: &mut BytesMut) -> io::Result<Frame> {
        loop {
            if let Some(frame) = codec.decode(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))? {
                return Ok(frame);
            }
            if self.read_raw(buf)? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }
}

fn ok(_: &RequestInfo, io: &HttpIo) {
    io.attach_text(StatusCode::OK, "ok");
}

/// A: synchronous response, the context never leaves the dispatcher.
pub fn sync_response(kind: DispatcherKind) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (deleted_tx, deleted_rx) = mpsc::channel();
    let deleted_tx = Mutex::new(deleted_tx);

    let states = Arc::clone(&seen);
    let server = TestServer::start(kind, move |_: &RequestInfo, io: &HttpIo| {
        states.lock().unwrap().push(io.state());
        let tx = deleted_tx.lock().unwrap().clone();
        io.add_finalizer(move || {
            let _ = tx.send(());
        });
        io.attach_text(StatusCode::OK, "ok");
    });

    let mut client = server.connect();
    client.send(indoc! {"
        POST /a HTTP/1.1\r
        Content-Length: 0\r
        \r
    "});
    let reply = client.reply();

    assert_eq!(reply.status, 200);
    assert_eq!(reply.text(), "ok");
    assert_eq!(reply.header("connection"), Some("keep-alive"));
    deleted_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![IoState::Sync]);
}

/// B: a 10 MiB body streamed through `open_for_read` in 64 KiB pieces.
pub fn large_body_upload(kind: DispatcherKind) {
    const SIZE: usize = 10 * 1024 * 1024;

    let server = TestServer::start(kind, |_: &RequestInfo, io: &HttpIo| {
        io.run_async(|io: &HttpIo| {
            let mut reader = io.open_for_read(None).unwrap();
            let mut chunk = vec![0u8; 64 * 1024];
            let mut total = 0usize;
            let mut longest = Duration::ZERO;
            loop {
                let started = Instant::now();
                let result = reader.read(&mut chunk);
                longest = longest.max(started.elapsed());
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        assert!(n <= chunk.len());
                        total += n;
                    }
                    Err(e) => panic!("body read failed: {e}"),
                }
            }
            // the upload pauses halfway, one read has to wait for it
            io.attach_text(StatusCode::OK, format!("{total} {}", longest >= Duration::from_millis(100)));
        });
    });

    let mut client = server.connect();
    let mut writer = client.stream.try_clone().unwrap();
    let upload = thread::spawn(move || {
        writer.write_all(format!("PUT /upload HTTP/1.1\r\nContent-Length: {SIZE}\r\n\r\n").as_bytes()).unwrap();
        let block = vec![b'x'; 256 * 1024];
        let blocks = SIZE / block.len();
        for i in 0..blocks {
            if i == blocks / 2 {
                thread::sleep(Duration::from_millis(300));
            }
            writer.write_all(&block).unwrap();
        }
    });

    let reply = client.reply();
    upload.join().unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.text(), format!("{SIZE} true"));
}

/// C: the response is produced by an async step.
pub fn async_response(kind: DispatcherKind) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    let (states, finished) = (Arc::clone(&seen), Arc::clone(&done));
    let server = TestServer::start(kind, move |_: &RequestInfo, io: &HttpIo| {
        states.lock().unwrap().push(io.state());
        let (states, finished) = (Arc::clone(&states), Arc::clone(&finished));
        io.run_async(move |io: &HttpIo| {
            states.lock().unwrap().push(io.state());
            thread::sleep(Duration::from_millis(200));
            finished.store(true, Ordering::SeqCst);
            io.attach_text(StatusCode::OK, "computed");
        });
    });

    let mut client = server.connect();
    client.send("GET /compute HTTP/1.1\r\n\r\n");
    let reply = client.reply();

    assert!(done.load(Ordering::SeqCst));
    assert_eq!(reply.status, 200);
    assert_eq!(reply.text(), "computed");
    assert_eq!(*seen.lock().unwrap(), vec![IoState::Sync, IoState::Async]);
}

/// D: the client vanishes while a step waits for more body.
pub fn disconnect_mid_body(kind: DispatcherKind) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    let server = TestServer::start(kind, move |_: &RequestInfo, io: &HttpIo| {
        let tx = tx.lock().unwrap().clone();
        let deleted = tx.clone();
        io.add_finalizer(move || {
            let _ = deleted.send("deleted".to_owned());
        });

        io.run_async(move |io: &HttpIo| {
            let mut buf = [0u8; 1024];
            let result = loop {
                match io.read(&mut buf) {
                    Ok(0) => break "eof".to_owned(),
                    Ok(_) => {}
                    Err(StreamError::Aborted) => break "aborted".to_owned(),
                    Err(e) => break e.to_string(),
                }
            };
            let _ = tx.send(result);
            let _ = tx.send(format!("{:?}", io.state()));
        });
    });

    let mut client = server.connect();
    client.send("POST /slow HTTP/1.1\r\nContent-Length: 1000\r\n\r\nonly a few bytes");
    thread::sleep(Duration::from_millis(200));
    drop(client);

    let started = Instant::now();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "aborted");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "Zombie");
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "deleted");
}

/// Streams a response with `open_for_write`, the body arrives chunked.
pub fn streamed_response(kind: DispatcherKind) {
    let server = TestServer::start(kind, |_: &RequestInfo, io: &HttpIo| {
        io.run_async(|io: &HttpIo| {
            let mut writer = io.open_for_write(StatusCode::OK, None, CompressionType::None);
            for i in 0..100 {
                writeln!(writer, "line {i}").unwrap();
            }
            writer.finish().unwrap();
        });
    });

    let mut client = server.connect();
    client.send("GET /stream HTTP/1.1\r\n\r\n");
    let reply = client.reply();

    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("transfer-encoding"), Some("chunked"));
    let expected: String = (0..100).map(|i| format!("line {i}\n")).collect();
    assert_eq!(reply.text(), expected);

    // the connection is still usable
    client.send("GET /stream HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert_eq!(client.reply().text(), expected);
}

/// Pipelined requests, HTTP/1.0 defaults and `Connection: close`.
pub fn keep_alive(kind: DispatcherKind) {
    let server = TestServer::start(kind, |request: &RequestInfo, io: &HttpIo| {
        io.attach_text(StatusCode::OK, request.path().to_owned());
    });

    let mut client = server.connect();
    client.send("GET /one HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\n\r\n");
    let first = client.reply();
    let second = client.reply();
    assert_eq!((first.text(), second.text()), ("/one", "/two"));
    assert_eq!(second.header("connection"), Some("keep-alive"));

    client.send("GET /three HTTP/1.0\r\n\r\n");
    let third = client.reply();
    assert_eq!(third.text(), "/three");
    assert_eq!(third.header("connection"), Some("close"));
    assert!(client.rest().unwrap().is_empty());

    let mut client = server.connect();
    client.send("GET /four HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert_eq!(client.reply().header("connection"), Some("close"));
    assert!(client.rest().unwrap().is_empty());
}

/// A body the handler never reads is skipped before the next request.
pub fn unread_body_is_skipped(kind: DispatcherKind) {
    let server = TestServer::start(kind, ok);

    let mut client = server.connect();
    client.send("POST /ignore HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello worldGET /next HTTP/1.1\r\n\r\n");
    assert_eq!(client.reply().status, 200);
    assert_eq!(client.reply().status, 200);

    client.send("POST /chunked HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n");
    assert_eq!(client.reply().status, 200);
}

/// `Expect: 100-continue` is answered before the body is read.
pub fn expect_continue(kind: DispatcherKind) {
    let server = TestServer::start(kind, |_: &RequestInfo, io: &HttpIo| {
        io.run_async(|io: &HttpIo| {
            let mut body = String::new();
            io.open_for_read(Some(1024)).unwrap().read_to_string(&mut body).unwrap();
            io.attach_text(StatusCode::OK, body);
        });
    });

    let mut client = server.connect();
    client.send("PUT /data HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\n");
    let interim = client.head_reply();
    assert_eq!(interim.status, 100);

    client.send("ping");
    let reply = client.reply();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.text(), "ping");
}

/// Responses to `HEAD` carry the real length but no body.
pub fn head_request(kind: DispatcherKind) {
    let server = TestServer::start(kind, |_: &RequestInfo, io: &HttpIo| io.attach_text(StatusCode::OK, "twelve bytes"));

    let mut client = server.connect();
    client.send("HEAD / HTTP/1.1\r\n\r\n");
    let reply = client.head_reply();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("content-length"), Some("12"));

    client.send("GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert_eq!(client.reply().text(), "twelve bytes");
}

/// Malformed or unsupported requests are answered without the handler.
pub fn rejected_requests(kind: DispatcherKind) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let server = TestServer::start_with(
        kind,
        |config| config.max_url_len = 512,
        move |_: &RequestInfo, io: &HttpIo| {
            counter.fetch_add(1, Ordering::SeqCst);
            io.attach_empty(StatusCode::NO_CONTENT);
        },
    );

    let cases = [
        ("BREW /pot HTTP/1.1\r\n\r\n".to_owned(), 405),
        ("GET /../etc/passwd HTTP/1.1\r\n\r\n".to_owned(), 403),
        (format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(600)), 414),
        ("GET / HTTP/2.0\r\n\r\n".to_owned(), 505),
        ("garbage\r\n\r\n".to_owned(), 400),
    ];

    for (request, status) in cases {
        let mut client = server.connect();
        client.send(&request);
        let reply = client.reply();
        assert_eq!(reply.status, status, "{request:?}");
        assert_eq!(reply.header("connection"), Some("close"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// A handler that panics produces a 500, the daemon keeps serving.
pub fn handler_panic(kind: DispatcherKind) {
    let server = TestServer::start(kind, |request: &RequestInfo, io: &HttpIo| match request.path() {
        "/sync" => panic!("handler failure"),
        "/async" => io.run_async(|_: &HttpIo| panic!("step failure")),
        _ => io.attach_text(StatusCode::OK, "fine"),
    });

    let mut client = server.connect();
    client.send("GET /sync HTTP/1.1\r\n\r\n");
    assert_eq!(client.reply().status, 500);
    client.send("GET /async HTTP/1.1\r\n\r\n");
    assert_eq!(client.reply().status, 500);
    client.send("GET /fine HTTP/1.1\r\n\r\n");
    assert_eq!(client.reply().text(), "fine");
}

/// A connection without traffic is closed after the idle timeout.
pub fn idle_timeout(kind: DispatcherKind) {
    let server = TestServer::start_with(kind, |config| config.idle_timeout = Duration::from_secs(1), ok);

    let mut client = server.connect();
    client.send("GET / HTTP/1.1\r\n\r\n");
    assert_eq!(client.reply().status, 200);

    let started = Instant::now();
    assert!(client.rest().unwrap().is_empty());
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(500), "closed after {waited:?}");
    assert!(waited < Duration::from_secs(5), "closed after {waited:?}");
}

/// Requests on connections beyond the limit get a 503.
pub fn connection_limit(kind: DispatcherKind) {
    let server = TestServer::start_with(
        kind,
        |config| {
            config.max_connections = 1;
            config.threads = 1;
        },
        ok,
    );

    let mut first = server.connect();
    first.send("GET / HTTP/1.1\r\n\r\n");
    assert_eq!(first.reply().status, 200);

    let mut second = server.connect();
    second.send("GET / HTTP/1.1\r\n\r\n");
    let reply = second.reply();
    assert_eq!(reply.status, 503);
    assert!(reply.text().contains("Too many connections"));
    assert!(second.rest().unwrap().is_empty());

    first.send("GET / HTTP/1.1\r\n\r\n");
    assert_eq!(first.reply().status, 200);
}

/// `stop` with a step stuck past the grace period closes its connection and
/// returns once the step is over.
pub fn stop_with_stuck_handler(kind: DispatcherKind) {
    let (started_tx, started_rx) = mpsc::channel();
    let started_tx = Mutex::new(started_tx);
    let finished = Arc::new(AtomicBool::new(false));

    let done = Arc::clone(&finished);
    let mut server = TestServer::start(kind, move |_: &RequestInfo, io: &HttpIo| {
        let started = started_tx.lock().unwrap().clone();
        let done = Arc::clone(&done);
        io.run_async(move |io: &HttpIo| {
            let _ = started.send(());
            thread::sleep(Duration::from_secs(3));
            done.store(true, Ordering::SeqCst);
            io.attach_text(StatusCode::OK, "late");
        });
    });

    let mut client = server.connect();
    client.send("GET /stuck HTTP/1.1\r\n\r\n");
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let path = server.path.clone();
    let stopper = thread::spawn(move || {
        let begin = Instant::now();
        server.stop();
        (begin.elapsed(), server)
    });

    let rest = client.rest().unwrap_or_default();
    assert!(rest.is_empty(), "unexpected bytes: {}", String::from_utf8_lossy(&rest));
    assert!(!finished.load(Ordering::SeqCst), "socket was closed only after the step ended");

    let (elapsed, server) = stopper.join().unwrap();
    assert!(finished.load(Ordering::SeqCst));
    assert!(elapsed >= Duration::from_secs(1), "stop took {elapsed:?}");
    assert!(!server.daemon.is_running());
    assert!(!path.exists());
}

/// Requests arriving after `stop` began on a busy connection are refused.
pub fn stop_refuses_new_requests(kind: DispatcherKind) {
    let (started_tx, started_rx) = mpsc::channel();
    let started_tx = Mutex::new(started_tx);

    let mut server = TestServer::start(kind, move |request: &RequestInfo, io: &HttpIo| {
        if request.path() == "/slow" {
            let started = started_tx.lock().unwrap().clone();
            io.run_async(move |io: &HttpIo| {
                let _ = started.send(());
                thread::sleep(Duration::from_millis(500));
                io.attach_text(StatusCode::OK, "slow");
            });
        } else {
            io.attach_text(StatusCode::OK, "fast");
        }
    });

    let mut client = server.connect();
    client.send("GET /slow HTTP/1.1\r\n\r\nGET /fast HTTP/1.1\r\n\r\n");
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let stopper = thread::spawn(move || server.stop());

    let first = client.reply();
    assert_eq!(first.text(), "slow");
    if let Ok(second) = client.read_reply(false) {
        assert_eq!(second.status, 503);
        assert!(second.text().contains("Server is shutting down"));
    }
    stopper.join().unwrap();
}

/// WebSocket upgrade followed by an echo and a close handshake.
pub fn websocket_echo(kind: DispatcherKind) {
    let server = TestServer::start(kind, |_: &RequestInfo, io: &HttpIo| {
        if !io.is_websocket() {
            io.attach_error(StatusCode::BAD_REQUEST, Some("websocket expected"));
            return;
        }
        io.run_async(|io: &HttpIo| {
            let mut socket = io.upgrade_websocket().unwrap();
            while let Ok(Some(message)) = socket.read_message() {
                match message {
                    ws::Message::Text(text) => socket.send_text(&text.to_uppercase()).unwrap(),
                    ws::Message::Binary(data) => socket.send_binary(&data).unwrap(),
                    ws::Message::Close { .. } => break,
                }
            }
        });
    });

    let mut client = server.connect();
    client.upgrade_websocket();

    let mut codec = WsCodec::client();
    let mut buf = BytesMut::new();
    client.send_frame(&mut codec, Frame::new(Opcode::Text, "hello"));
    let frame = client.read_frame(&mut codec, &mut buf).unwrap();
    assert_eq!(frame.opcode, Opcode::Text);
    assert_eq!(&frame.payload[..], b"HELLO");

    client.send_frame(&mut codec, Frame::new(Opcode::Close, Bytes::from_static(&[0x03, 0xe8])));
    let frame = client.read_frame(&mut codec, &mut buf).unwrap();
    assert_eq!(frame.opcode, Opcode::Close);
    assert!(client.rest().unwrap().is_empty());
}

/// The server talks first; its greeting must not wait for client bytes.
pub fn websocket_greeting(kind: DispatcherKind) {
    let server = TestServer::start(kind, |_: &RequestInfo, io: &HttpIo| {
        io.run_async(|io: &HttpIo| {
            let mut socket = io.upgrade_websocket().unwrap();
            socket.send_text("welcome").unwrap();
            if let Ok(Some(ws::Message::Text(name))) = socket.read_message() {
                socket.send_text(&format!("hello {name}")).unwrap();
            }
        });
    });

    let mut client = server.connect();
    client.upgrade_websocket();
    client.stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();

    let mut codec = WsCodec::client();
    let mut buf = BytesMut::new();
    let started = Instant::now();
    let greeting = client.read_frame(&mut codec, &mut buf).unwrap_or_else(|e| panic!("no greeting after {:?}: {e}", started.elapsed()));
    assert_eq!(&greeting.payload[..], b"welcome");

    client.send_frame(&mut codec, Frame::new(Opcode::Text, "bob"));
    let reply = client.read_frame(&mut codec, &mut buf).unwrap();
    assert_eq!(&reply.payload[..], b"hello bob");
}
