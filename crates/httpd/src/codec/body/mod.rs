//! Body framing codecs.
//!
//! Decoders turn request body bytes into [`PayloadItem`](crate::protocol::PayloadItem)s:
//! `Content-Length` ([`length_decoder`]) or chunked ([`chunked_decoder`]), selected by
//! [`PayloadDecoder`]. Encoders do the reverse for response bodies, including the
//! close-delimited framing used for HTTP/1.0 responses of unknown length.

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
