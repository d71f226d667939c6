//! Wire codecs for HTTP/1.x requests and responses.
//!
//! - [`RequestDecoder`]: request heads and bodies, for `FramedRead`
//! - [`ResponseEncoder`]: response heads and bodies, for `FramedWrite` or a plain buffer
//! - [`HeaderDecoder`] / [`PayloadDecoder`]: the two halves of request decoding,
//!   used directly by the readiness-loop dispatcher
//!
//! Both directions are state machines driven by [`Message`](crate::protocol::Message)
//! items, implementing the `tokio_util::codec` traits.
//!
//! ```
//! use micro_httpd::codec::RequestDecoder;
//! use tokio_util::codec::Decoder;
//! use bytes::BytesMut;
//!
//! let mut decoder = RequestDecoder::default();
//! let mut buf = BytesMut::from("GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
//! assert!(decoder.decode(&mut buf).unwrap().is_some());
//! ```

mod body;
mod header;
mod request_decoder;
mod response_encoder;

pub use body::{PayloadDecoder, PayloadEncoder};
pub use header::{HeaderDecoder, HeaderEncoder, MAX_HEADER_NUM};
pub use request_decoder::RequestDecoder;
pub use response_encoder::ResponseEncoder;
