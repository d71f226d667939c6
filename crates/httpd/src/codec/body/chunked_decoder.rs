//! Decoder for `Transfer-Encoding: chunked` request bodies, see
//! [RFC 9112 section 7.1](https://www.rfc-editor.org/rfc/rfc9112.html#section-7.1).
//!
//! Works line by line: a size line (hex size, optional extensions), the chunk
//! data and its CRLF, and after the zero-size chunk a trailer section ending
//! with an empty line. Trailer fields are skipped.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadItem};

/// Longest size or trailer line accepted before the body is rejected.
const MAX_LINE_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    End,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: State::Size }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::End => {
                    trace!("finished reading chunked data");
                    return Ok(Some(PayloadItem::Eof));
                }

                State::Size => {
                    let Some(line) = take_line(src)? else { return Ok(None) };
                    let size = parse_size(&line)?;
                    self.state = if size == 0 { State::Trailer } else { State::Data(size) };
                }

                State::Data(remaining) => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let len = usize::try_from(remaining).unwrap_or(usize::MAX).min(src.len());
                    let bytes = src.split_to(len).freeze();
                    let remaining = remaining - len as u64;
                    self.state = if remaining == 0 { State::DataEnd } else { State::Data(remaining) };

                    trace!(len = bytes.len(), "read chunked bytes");
                    return Ok(Some(PayloadItem::Chunk(bytes)));
                }

                State::DataEnd => {
                    let Some(line) = take_line(src)? else { return Ok(None) };
                    ensure!(line.is_empty(), ParseError::invalid_body("missing CRLF after chunk data"));
                    self.state = State::Size;
                }

                State::Trailer => {
                    let Some(line) = take_line(src)? else { return Ok(None) };
                    if line.is_empty() {
                        self.state = State::End;
                    }
                }
            }
        }
    }
}

/// Splits one line off `src`, without its line ending. Accepts a bare LF.
fn take_line(src: &mut BytesMut) -> Result<Option<BytesMut>, ParseError> {
    let Some(pos) = src.iter().position(|b| *b == b'\n') else {
        ensure!(src.len() <= MAX_LINE_BYTES, ParseError::invalid_body("chunk line is too long"));
        return Ok(None);
    };

    let mut line = src.split_to(pos);
    src.advance(1);
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    Ok(Some(line))
}

fn parse_size(line: &[u8]) -> Result<u64, ParseError> {
    let digits = line.split(|b| *b == b';').next().unwrap_or_default().trim_ascii();
    ensure!(!digits.is_empty(), ParseError::invalid_body("empty chunk size"));

    digits.iter().try_fold(0u64, |size, b| {
        let digit = (*b as char).to_digit(16).ok_or_else(|| ParseError::invalid_body("invalid chunk size"))?;
        size.checked_mul(16)
            .and_then(|size| size.checked_add(u64::from(digit)))
            .ok_or_else(|| ParseError::invalid_body("invalid overflow chunked length"))
    })
}
