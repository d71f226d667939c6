//! Request head decoder.
//!
//! Parses the request line and header fields with `httparse`, enforcing the
//! configured head size and header count, and determines how the request body
//! is framed (`Content-Length`, chunked, or none).
//!
//! Header names and values are recorded as byte ranges into the parsed buffer
//! and sliced out of one frozen `Bytes`, so no header data is copied.

use std::mem::MaybeUninit;

use bytes::BytesMut;
use http::{HeaderName, HeaderValue, Request};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::config::HttpConfig;
use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, RequestHeader};

/// Hard upper bound of header fields, the configured limit may only be lower.
pub const MAX_HEADER_NUM: usize = 128;

/// Smallest complete request: `GET / HTTP/1.1\r\n\r\n` minus the version minor digit.
const MIN_REQUEST_BYTES: usize = 14;

/// Decoder for HTTP request heads implementing the [`Decoder`] trait.
#[derive(Debug, Clone, Copy)]
pub struct HeaderDecoder {
    max_headers: usize,
    max_bytes: usize,
}

impl HeaderDecoder {
    pub fn new(config: &HttpConfig) -> Self {
        Self::with_limits(config.max_request_headers, config.max_request_size)
    }

    pub fn with_limits(max_headers: usize, max_bytes: usize) -> Self {
        Self { max_headers: max_headers.min(MAX_HEADER_NUM), max_bytes }
    }
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self::new(&HttpConfig::default())
    }
}

impl Decoder for HeaderDecoder {
    type Item = (RequestHeader, PayloadSize);
    type Error = ParseError;

    /// Attempts to decode a request head from `src`.
    ///
    /// Returns `Ok(None)` while the head is incomplete and still within the
    /// size limit. On success the head bytes are split off `src`, leaving any
    /// body or pipelined bytes in place.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < MIN_REQUEST_BYTES {
            return Ok(None);
        }

        let mut req = httparse::Request::new(&mut []);
        // SAFETY: an array of `MaybeUninit` needs no initialization.
        let mut headers: [MaybeUninit<httparse::Header>; MAX_HEADER_NUM] = unsafe { MaybeUninit::uninit().assume_init() };
        let headers = &mut headers[..self.max_headers];

        let parsed = req.parse_with_uninit_headers(src, headers).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(self.max_headers),
            Error::Version => ParseError::InvalidVersion(None),
            Error::Token => ParseError::InvalidMethod,
            e => ParseError::invalid_header(e.to_string()),
        })?;

        let body_offset = match parsed {
            Status::Complete(body_offset) => body_offset,
            Status::Partial => {
                ensure!(src.len() < self.max_bytes, ParseError::too_large_header(src.len(), self.max_bytes));
                return Ok(None);
            }
        };

        trace!(head_size = body_offset, "parsed request head");
        ensure!(body_offset < self.max_bytes, ParseError::too_large_header(body_offset, self.max_bytes));

        let header_count = req.headers.len();
        let mut header_index = vec![HeaderIndex::default(); header_count];
        HeaderIndex::record(src, req.headers, &mut header_index);

        let version = match req.version {
            Some(0) => http::Version::HTTP_10,
            Some(1) => http::Version::HTTP_11,
            v => return Err(ParseError::InvalidVersion(v)),
        };

        let mut builder = Request::builder()
            .method(req.method.ok_or(ParseError::InvalidMethod)?)
            .uri(req.path.ok_or(ParseError::InvalidUri)?)
            .version(version);

        let header_bytes = src.split_to(body_offset).freeze();
        if let Some(headers) = builder.headers_mut() {
            headers.reserve(header_count);
            for index in &header_index {
                let name = HeaderName::from_bytes(&header_bytes[index.name.0..index.name.1]).map_err(ParseError::invalid_header)?;
                let value = HeaderValue::from_maybe_shared(header_bytes.slice(index.value.0..index.value.1))
                    .map_err(ParseError::invalid_header)?;
                headers.append(name, value);
            }
        }

        // the builder only fails on an invalid method or uri
        let header = match builder.body(()) {
            Ok(request) => RequestHeader::from(request),
            Err(e) if e.is::<http::method::InvalidMethod>() => return Err(ParseError::InvalidMethod),
            Err(_) => return Err(ParseError::InvalidUri),
        };
        let payload_size = parse_payload(&header)?;

        Ok(Some((header, payload_size)))
    }
}

/// Byte range positions of a header's name and value within the parsed buffer.
#[derive(Clone, Copy, Default)]
struct HeaderIndex {
    name: (usize, usize),
    value: (usize, usize),
}

impl HeaderIndex {
    fn record(bytes: &[u8], headers: &[httparse::Header<'_>], indices: &mut [HeaderIndex]) {
        let bytes_ptr = bytes.as_ptr() as usize;
        for (header, index) in headers.iter().zip(indices.iter_mut()) {
            let name_start = header.name.as_ptr() as usize - bytes_ptr;
            index.name = (name_start, name_start + header.name.len());
            let value_start = header.value.as_ptr() as usize - bytes_ptr;
            index.value = (value_start, value_start + header.value.len());
        }
    }
}

/// Determines request body framing, refer to
/// <https://www.rfc-editor.org/rfc/rfc9112.html#name-message-body-length>.
fn parse_payload(header: &RequestHeader) -> Result<PayloadSize, ParseError> {
    let te_header = header.headers().get(http::header::TRANSFER_ENCODING);
    let cl_header = header.headers().get(http::header::CONTENT_LENGTH);

    match (te_header, cl_header) {
        (None, None) => Ok(PayloadSize::new_empty()),

        (Some(te_value), None) => {
            if is_chunked(te_value) {
                Ok(PayloadSize::new_chunked())
            } else {
                Err(ParseError::UnsupportedTransferEncoding(String::from_utf8_lossy(te_value.as_bytes()).into_owned()))
            }
        }

        (None, Some(cl_value)) => {
            let cl_str = cl_value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;
            let length = cl_str
                .trim()
                .parse::<u64>()
                .map_err(|_| ParseError::invalid_content_length(format!("value {cl_str} is not u64")))?;

            Ok(PayloadSize::new_length(length))
        }

        (Some(_), Some(_)) => Err(ParseError::invalid_content_length("transfer_encoding and content_length both present in headers")),
    }
}

/// Chunked must be the last transfer coding when present.
fn is_chunked(value: &HeaderValue) -> bool {
    value.as_bytes().rsplit(|b| *b == b',').next().is_some_and(|last| last.trim_ascii().eq_ignore_ascii_case(b"chunked"))
}
