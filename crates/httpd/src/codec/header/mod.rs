//! Request head decoding and response head encoding.
//!
//! - [`HeaderDecoder`]: request line and header fields, with size and count limits
//! - [`HeaderEncoder`]: status line, header fields and body framing headers

mod header_decoder;
mod header_encoder;

pub use header_decoder::HeaderDecoder;
pub use header_decoder::MAX_HEADER_NUM;
pub use header_encoder::HeaderEncoder;
