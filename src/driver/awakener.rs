use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use super::io::{pipe, Io};

/// Wakes a poller blocked in another thread.
///
/// Backed by a non-blocking pipe: the read end is registered with the
/// poller, a byte written to the other end makes it readable.
#[derive(Debug)]
pub(crate) struct Awakener {
    reader: Io,
    writer: Io,
}

impl Awakener {
    pub(crate) fn new() -> io::Result<Awakener> {
        let (reader, writer) = pipe()?;
        Ok(Awakener { reader, writer })
    }

    pub(crate) fn wakeup(&self) -> io::Result<()> {
        match (&self.writer).write(&[1]) {
            Ok(_) => Ok(()),
            // pipe full, a wakeup is already pending
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Consumes data until all bytes are purged.
    pub(crate) fn cleanup(&self) {
        let mut buf = [0; 128];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(i) if i > 0 => {}
                _ => return,
            }
        }
    }

    /// Fd to register with the poller.
    pub(crate) fn reader_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}
