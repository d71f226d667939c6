//! `std::io` adapters over the blocking body calls of [`HttpIo`].

use std::io::{self, Read, Write};

use crate::io::HttpIo;
use crate::io::encoding::BodyEncoder;

/// Request body reader returned by [`HttpIo::open_for_read`].
#[derive(Debug)]
pub struct BodyReader<'a> {
    io: &'a HttpIo,
}

impl<'a> BodyReader<'a> {
    pub(crate) fn new(io: &'a HttpIo) -> Self {
        Self { io }
    }
}

impl Read for BodyReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.io.read(buf)?)
    }
}

/// Unframed sink writing into the response buffer of an [`HttpIo`].
#[derive(Debug)]
pub struct IoSink<'a> {
    io: &'a HttpIo,
}

impl<'a> IoSink<'a> {
    pub(crate) fn new(io: &'a HttpIo) -> Self {
        Self { io }
    }

    fn close(self) -> io::Result<()> {
        Ok(self.io.write(&[])?)
    }
}

impl Write for IoSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // an empty write would end the body
        if !buf.is_empty() {
            self.io.write(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Response body writer returned by [`HttpIo::open_for_write`].
///
/// The body must be completed with [`finish`](Self::finish); dropping the
/// writer without it leaves a truncated response, which the dispatcher
/// reports and answers by closing the connection.
#[derive(Debug)]
pub struct BodyWriter<'a> {
    encoder: BodyEncoder<IoSink<'a>>,
}

impl<'a> BodyWriter<'a> {
    pub(crate) fn new(encoder: BodyEncoder<IoSink<'a>>) -> Self {
        Self { encoder }
    }

    /// Flushes the compressor and ends the body.
    pub fn finish(self) -> io::Result<()> {
        self.encoder.finish()?.close()
    }
}

impl Write for BodyWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}
