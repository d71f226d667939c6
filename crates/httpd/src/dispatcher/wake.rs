//! Cross-thread wake-up for a blocked `poll(2)` call.
//!
//! A Unix socket pair whose read end sits in the poll set. Wakes are
//! coalesced: only the first `wake` after a `drain` writes a byte.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

#[derive(Debug)]
pub(crate) struct WakeChannel {
    tx: UnixStream,
    rx: UnixStream,
    pending: AtomicBool,
}

impl WakeChannel {
    pub(crate) fn new() -> io::Result<Self> {
        let (tx, rx) = UnixStream::pair()?;
        tx.set_nonblocking(true)?;
        rx.set_nonblocking(true)?;
        Ok(Self { tx, rx, pending: AtomicBool::new(false) })
    }

    pub(crate) fn wake(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }

        match (&self.tx).write(&[1]) {
            Ok(_) => {}
            // the buffer is full, the loop will wake anyway
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!(cause = %e, "failed to wake dispatcher"),
        }
    }

    /// Consumes pending wake-ups. Call when the read end is readable.
    pub(crate) fn drain(&self) {
        self.pending.store(false, Ordering::Release);

        let mut buf = [0u8; 64];
        loop {
            match (&self.rx).read(&mut buf) {
                Ok(n) if n == buf.len() => {}
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    }
}

impl AsRawFd for WakeChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }
}
