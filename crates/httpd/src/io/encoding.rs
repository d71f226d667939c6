//! Content codings for response bodies.
//!
//! [`negotiate_encoding`] picks a coding from `Accept-Encoding`, and
//! [`BodyEncoder`] wraps any `io::Write` sink with the chosen compressor.

use std::fmt;
use std::io::{self, Write};

use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use http::HeaderValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionType {
    None,
    Deflate,
    Gzip,
}

impl CompressionType {
    const ALL: [Self; 3] = [Self::None, Self::Deflate, Self::Gzip];

    fn bit(self) -> u32 {
        1 << self as u32
    }

    /// `Content-Encoding` value, `None` for the identity coding.
    pub fn header_value(self) -> Option<HeaderValue> {
        match self {
            Self::None => None,
            Self::Deflate => Some(HeaderValue::from_static("deflate")),
            Self::Gzip => Some(HeaderValue::from_static("gzip")),
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "identity",
            Self::Deflate => "deflate",
            Self::Gzip => "gzip",
        })
    }
}

/// Bit set of the codings accepted by an `Accept-Encoding` value.
///
/// An absent or empty header accepts everything. Identity is accepted unless
/// excluded with a zero weight, either by name or through `*;q=0`. Coding names
/// are case-insensitive and a named coding overrides `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptableEncodings(u32);

impl AcceptableEncodings {
    pub fn parse(header: Option<&str>) -> Self {
        let header = header.map_or("", str::trim);
        if header.is_empty() {
            return Self(u32::MAX);
        }

        // named codings win over `*` whatever their order
        let mut wildcard = None;
        let (mut enabled, mut disabled) = (0, 0);

        for item in header.split(',') {
            let mut parts = item.split(';');
            let coding = parts.next().unwrap_or_default().trim();
            let accepted = parts.find_map(qvalue).is_none_or(|q| q > 0.0);

            let mask = if coding.eq_ignore_ascii_case("identity") {
                CompressionType::None.bit()
            } else if coding.eq_ignore_ascii_case("deflate") {
                CompressionType::Deflate.bit()
            } else if coding.eq_ignore_ascii_case("gzip") {
                CompressionType::Gzip.bit()
            } else if coding == "*" {
                wildcard = Some(accepted);
                continue;
            } else {
                continue;
            };

            if accepted {
                enabled |= mask;
            } else {
                disabled |= mask;
            }
        }

        let base = match wildcard {
            Some(true) => u32::MAX,
            Some(false) => 0,
            None => CompressionType::None.bit(),
        };
        Self((base | enabled) & !disabled)
    }

    pub fn accepts(self, encoding: CompressionType) -> bool {
        self.0 & encoding.bit() != 0
    }

    /// The strongest accepted compression, identity last.
    pub fn best(self) -> Option<CompressionType> {
        CompressionType::ALL.into_iter().rev().find(|e| self.accepts(*e))
    }
}

/// The weight of a `q=` parameter; a malformed one counts as absent.
fn qvalue(param: &str) -> Option<f32> {
    let (name, value) = param.split_once('=')?;
    if !name.trim().eq_ignore_ascii_case("q") {
        return None;
    }
    value.trim().parse().ok()
}

/// Picks `preferred` when acceptable, the best acceptable coding otherwise.
/// `None` means nothing is acceptable and the request deserves a 406.
pub fn negotiate_encoding(accept_encoding: Option<&str>, preferred: CompressionType) -> Option<CompressionType> {
    let acceptable = AcceptableEncodings::parse(accept_encoding);
    if acceptable.accepts(preferred) { Some(preferred) } else { acceptable.best() }
}

/// An `io::Write` sink with an optional compressor in front of it.
pub enum BodyEncoder<W: Write> {
    Identity(W),
    Deflate(ZlibEncoder<W>),
    Gzip(GzEncoder<W>),
}

impl<W: Write> fmt::Debug for BodyEncoder<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BodyEncoder").field(&self.encoding()).finish()
    }
}

impl<W: Write> BodyEncoder<W> {
    pub fn new(sink: W, encoding: CompressionType) -> Self {
        match encoding {
            CompressionType::None => Self::Identity(sink),
            CompressionType::Deflate => Self::Deflate(ZlibEncoder::new(sink, Compression::default())),
            CompressionType::Gzip => Self::Gzip(GzEncoder::new(sink, Compression::default())),
        }
    }

    pub fn encoding(&self) -> CompressionType {
        match self {
            Self::Identity(_) => CompressionType::None,
            Self::Deflate(_) => CompressionType::Deflate,
            Self::Gzip(_) => CompressionType::Gzip,
        }
    }

    /// Flushes the compressor trailer and hands back the sink.
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Identity(sink) => Ok(sink),
            Self::Deflate(encoder) => encoder.finish(),
            Self::Gzip(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for BodyEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Identity(sink) => sink.write(buf),
            Self::Deflate(encoder) => encoder.write(buf),
            Self::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Identity(sink) => sink.flush(),
            Self::Deflate(encoder) => encoder.flush(),
            Self::Gzip(encoder) => encoder.flush(),
        }
    }
}

/// Compresses a whole buffer.
pub fn compress(data: &[u8], encoding: CompressionType) -> io::Result<Vec<u8>> {
    let mut encoder = BodyEncoder::new(Vec::with_capacity(data.len() / 2), encoding);
    encoder.write_all(data)?;
    encoder.finish()
}
