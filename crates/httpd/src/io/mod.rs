//! Per-request context: state machine, body streaming and response assembly.
//!
//! - [`HttpIo`]: the context handed to handlers, see [`IoState`] for its states
//! - [`BodyReader`] / [`BodyWriter`]: `std::io` views of the request and response bodies
//! - [`CompressionType`] and [`negotiate_encoding`]: response content codings

mod context;
mod encoding;
mod response;
mod state;
mod stream;

pub(crate) use context::DriverStep;
pub use context::HttpIo;
pub use encoding::{AcceptableEncodings, CompressionType, compress, negotiate_encoding};
pub(crate) use response::{PreparedResponse, ResponseBody};
pub use state::IoState;
pub use stream::{BodyReader, BodyWriter};

#[cfg(test)]
pub(crate) use context::tests::request_info;
