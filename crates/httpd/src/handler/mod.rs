//! The request handler registered with the daemon.
//!
//! A handler runs inline on the dispatcher side for every admitted request.
//! It either attaches a response right away or queues work with
//! [`HttpIo::run_async`], which continues on the daemon worker pool.
//!
//! Any `Fn(&RequestInfo, &HttpIo)` closure is a handler:
//!
//! ```
//! use http::StatusCode;
//! use micro_httpd::handler::Handler;
//! use micro_httpd::io::HttpIo;
//! use micro_httpd::protocol::RequestInfo;
//!
//! fn hello(_request: &RequestInfo, io: &HttpIo) {
//!     io.attach_text(StatusCode::OK, "hello");
//! }
//!
//! fn assert_handler<H: Handler>(_: H) {}
//! assert_handler(hello);
//! ```

use crate::io::HttpIo;
use crate::protocol::RequestInfo;

pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: &RequestInfo, io: &HttpIo);
}

impl<F> Handler for F
where
    F: Fn(&RequestInfo, &HttpIo) + Send + Sync + 'static,
{
    fn handle(&self, request: &RequestInfo, io: &HttpIo) {
        self(request, io);
    }
}
