//! An HTTP/1.1 connection and request lifecycle engine
//!
//! This crate accepts connections, parses request heads, runs a registered
//! handler and writes responses. Handlers are plain synchronous functions: a
//! handler either attaches a response right away, or queues a step with
//! [`io::HttpIo::run_async`] that continues on a worker pool where it may
//! block on the request and response bodies. The connection is suspended
//! meanwhile and resumed once the step returns.
//!
//! # Features
//!
//! - HTTP/1.0 and HTTP/1.1 with keep-alive and pipelining
//! - Blocking body streaming on worker threads with write backpressure
//! - Chunked transfer encoding in both directions
//! - Expect-continue
//! - Response helpers for text, binary, files, errors, cookies, caching
//!   headers and content-coding negotiation
//! - WebSocket upgrades
//! - Two dispatchers: a tokio engine and self-contained `poll(2)` loops
//! - Graceful then forced shutdown
//!
//! # Example
//!
//! ```no_run
//! use std::io::Read;
//!
//! use http::StatusCode;
//! use micro_httpd::config::HttpConfig;
//! use micro_httpd::daemon::HttpDaemon;
//! use micro_httpd::io::HttpIo;
//! use micro_httpd::protocol::RequestInfo;
//!
//! fn handler(request: &RequestInfo, io: &HttpIo) {
//!     if request.path() == "/upload" {
//!         io.run_async(|io: &HttpIo| {
//!             let mut body = String::new();
//!             match io.open_for_read(Some(1 << 20)).map(|mut r| r.read_to_string(&mut body)) {
//!                 Ok(Ok(_)) => io.attach_text(StatusCode::OK, format!("{} bytes", body.len())),
//!                 _ => io.attach_error(StatusCode::BAD_REQUEST, None),
//!             }
//!         });
//!     } else {
//!         io.attach_text(StatusCode::OK, "hello");
//!     }
//! }
//!
//! let mut config = HttpConfig::default();
//! config.port = 8080;
//!
//! let mut daemon = HttpDaemon::new();
//! daemon.start(&config, handler)?;
//! // ...
//! daemon.stop();
//! # Ok::<(), micro_httpd::protocol::HttpError>(())
//! ```
//!
//! # Architecture
//!
//! - [`daemon`]: start and stop sequencing, the shared [`daemon::ServerContext`]
//! - [`io`]: the per-request context and its state machine
//! - [`worker`]: the worker pool running async steps
//! - [`connection`]: sockets and per-connection state
//! - [`codec`]: request head, body framing and response encoding
//! - [`protocol`]: request and response types, errors
//! - [`ws`]: WebSocket handshake and framing
//! - [`config`]: daemon configuration
//!
//! # Error Handling
//!
//! - [`protocol::HttpError`]: start-up and connection level failures
//! - [`protocol::ParseError`]: malformed requests, each mapped to a status code
//! - [`protocol::SendError`]: response sending errors
//! - [`protocol::StreamError`]: failures of blocking body reads and writes
//!
//! Errors on one connection never reach another one: the dispatcher answers
//! or closes the connection and moves on.
//!
//! # Logging
//!
//! Diagnostics go through `tracing`. Every request runs inside a `request`
//! span carrying its id and client address. The crate never installs a
//! subscriber.

pub mod codec;
pub mod config;
pub mod connection;
pub mod daemon;
mod dispatcher;
pub mod handler;
pub mod io;
pub mod protocol;
pub mod worker;
pub mod ws;

mod utils;
pub(crate) use utils::ensure;
