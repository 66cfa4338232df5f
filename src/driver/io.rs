use iovec::{unix, IoVec};
use std::cmp;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

const IOV_MAX: usize = 1024;

pub(crate) trait IsMinusOne {
    fn is_minus_one(&self) -> bool;
}

impl IsMinusOne for i32 {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

impl IsMinusOne for isize {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

pub(crate) fn cvt<T: IsMinusOne>(t: T) -> io::Result<T> {
    if t.is_minus_one() {
        Err(io::Error::last_os_error())
    } else {
        Ok(t)
    }
}

/// Duplicates `fd`; the copy is close-on-exec and owned by the caller.
pub(crate) fn dup(fd: RawFd) -> io::Result<RawFd> {
    unsafe { cvt(libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0)) }
}

/// Reads into `buf`, retrying on EINTR.
pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        match cvt(rc) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            res => return res.map(|n| n as usize),
        }
    }
}

/// Writes `buf`, retrying on EINTR.
pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let rc = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        match cvt(rc) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            res => return res.map(|n| n as usize),
        }
    }
}

/// Gathers `bufs` into one `writev` call, skipping empty slices.
pub(crate) fn writev(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    let iovs: Vec<&IoVec> = bufs
        .iter()
        .take(IOV_MAX)
        .filter_map(|b| IoVec::from_bytes(b))
        .collect();
    if iovs.is_empty() {
        return Ok(0);
    }
    let slice = unix::as_os_slice(&iovs);
    let len = cmp::min(<libc::c_int>::max_value() as usize, slice.len());
    loop {
        let rc = unsafe { libc::writev(fd, slice.as_ptr(), len as libc::c_int) };
        match cvt(rc) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            res => return res.map(|n| n as usize),
        }
    }
}

/// Manages a FD
#[derive(Debug)]
pub(crate) struct Io {
    fd: File,
}

impl FromRawFd for Io {
    unsafe fn from_raw_fd(fd: RawFd) -> Io {
        Io {
            fd: File::from_raw_fd(fd),
        }
    }
}

impl AsRawFd for Io {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl<'a> Read for &'a Io {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        (&self.fd).read(dst)
    }
}

impl<'a> Write for &'a Io {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        (&self.fd).write(src)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.fd).flush()
    }
}

/// Creates a non-blocking, close-on-exec pipe: `(reader, writer)`.
pub(crate) fn pipe() -> io::Result<(Io, Io)> {
    let mut pipes = [0; 2];
    unsafe {
        cvt(libc::pipe2(
            pipes.as_mut_ptr(),
            libc::O_NONBLOCK | libc::O_CLOEXEC,
        ))?;
        Ok((Io::from_raw_fd(pipes[0]), Io::from_raw_fd(pipes[1])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_round_trip() {
        let (rd, wr) = pipe().unwrap();
        assert_eq!(writev(wr.as_raw_fd(), &[&b"ab"[..], &b""[..], &b"cd"[..]]).unwrap(), 4);
        let mut buf = [0; 8];
        assert_eq!(read(rd.as_raw_fd(), &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"abcd");
        // nothing left, non-blocking
        let err = read(rd.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn dup_is_independent() {
        let (rd, wr) = pipe().unwrap();
        let fd = dup(wr.as_raw_fd()).unwrap();
        assert_ne!(fd, wr.as_raw_fd());
        drop(wr);
        assert_eq!(write(fd, b"x").unwrap(), 1);
        unsafe { libc::close(fd) };
        let mut buf = [0; 2];
        assert_eq!((&rd).read(&mut buf).unwrap(), 1);
    }

    #[test]
    fn empty_writev() {
        let (_rd, wr) = pipe().unwrap();
        assert_eq!(writev(wr.as_raw_fd(), &[&b""[..]]).unwrap(), 0);
    }
}
