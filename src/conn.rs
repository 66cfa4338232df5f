//! Connections as seen from event handlers.
//!
//! A [`Conn`] is owned by the loop it was enrolled in and only handed out as
//! `&mut Conn` inside callbacks. Its capabilities are split the way callers
//! use them: [`Reader`] over the bytes received so far, [`Writer`] for output
//! and [`Socket`] for options of the underlying descriptor.
//!
//! Other threads address a connection by its [`Gfd`] through the owning
//! loop's [`EventLoopHandle`], see [`Conn::handle`].

use std::any::Any;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::address::{parse_proto_addr, resolve_inet, NetAddr, Protocol};
use crate::driver::{io as sys, socket};
use crate::errors::{Error, Result};
use crate::eventloop::EventLoopHandle;
use crate::gfd::Gfd;
use crate::listener::Listener;
use crate::options::{Options, TcpSocketOpt};

/// Completion callback of an asynchronous command, run on the owning loop.
///
/// Receives the target connection and the outcome; an error it returns is
/// logged.
pub type AsyncCallback = Box<dyn FnOnce(Gfd, Result<()>) -> anyhow::Result<()> + Send>;

/// An accepted or dialed socket not yet owned by any loop.
#[derive(Debug)]
pub enum RawStream {
    Tcp(TcpStream),
    Unix(UnixStream),
    /// A connected UDP socket.
    Udp(UdpSocket),
}

impl RawStream {
    pub fn local_addr(&self) -> io::Result<NetAddr> {
        match self {
            RawStream::Tcp(s) => s.local_addr().map(NetAddr::from),
            RawStream::Unix(s) => s.local_addr().map(NetAddr::from),
            RawStream::Udp(s) => s.local_addr().map(NetAddr::from),
        }
    }

    pub fn peer_addr(&self) -> io::Result<NetAddr> {
        match self {
            RawStream::Tcp(s) => s.peer_addr().map(NetAddr::from),
            RawStream::Unix(s) => s.peer_addr().map(NetAddr::from),
            RawStream::Udp(s) => s.peer_addr().map(NetAddr::from),
        }
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            RawStream::Tcp(s) => s.set_nonblocking(true),
            RawStream::Unix(s) => s.set_nonblocking(true),
            RawStream::Udp(s) => s.set_nonblocking(true),
        }
    }

    /// Prepares a fresh socket for its loop: non-blocking mode plus the
    /// per-connection socket options.
    pub(crate) fn configure(&self, opts: &Options) -> io::Result<()> {
        self.set_nonblocking()?;
        let fd = self.as_raw_fd();
        if let RawStream::Tcp(_) = self {
            socket::set_no_delay(fd, opts.tcp_no_delay == TcpSocketOpt::NoDelay)?;
            if opts.tcp_keep_alive > Duration::from_secs(0) {
                let interval = if opts.tcp_keep_interval > Duration::from_secs(0) {
                    opts.tcp_keep_interval
                } else {
                    (opts.tcp_keep_alive / 5).max(Duration::from_secs(1))
                };
                let count = if opts.tcp_keep_count > 0 {
                    opts.tcp_keep_count
                } else {
                    5
                };
                socket::set_keep_alive_probes(fd, opts.tcp_keep_alive, interval, count)?;
            }
        }
        if opts.socket_recv_buffer > 0 {
            socket::set_recv_buffer(fd, opts.socket_recv_buffer)?;
        }
        if opts.socket_send_buffer > 0 {
            socket::set_send_buffer(fd, opts.socket_send_buffer)?;
        }
        Ok(())
    }
}

impl AsRawFd for RawStream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            RawStream::Tcp(s) => s.as_raw_fd(),
            RawStream::Unix(s) => s.as_raw_fd(),
            RawStream::Udp(s) => s.as_raw_fd(),
        }
    }
}

impl From<TcpStream> for RawStream {
    fn from(s: TcpStream) -> Self {
        RawStream::Tcp(s)
    }
}

impl From<UnixStream> for RawStream {
    fn from(s: UnixStream) -> Self {
        RawStream::Unix(s)
    }
}

impl From<UdpSocket> for RawStream {
    fn from(s: UdpSocket) -> Self {
        RawStream::Udp(s)
    }
}

/// Connects to `proto_addr`. UDP sockets are bound to an ephemeral port and
/// connected to the remote address.
pub(crate) fn dial(proto_addr: &str) -> Result<RawStream> {
    let (proto, addr) = parse_proto_addr(proto_addr)?;
    let stream = match proto {
        Protocol::Unix => RawStream::Unix(UnixStream::connect(&addr)?),
        p if p.is_tcp() => RawStream::Tcp(TcpStream::connect(resolve_inet(p, &addr)?)?),
        p => {
            let remote = resolve_inet(p, &addr)?;
            let local: SocketAddr = if remote.is_ipv4() {
                ([0u8, 0, 0, 0], 0).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let sock = UdpSocket::bind(local)?;
            sock.connect(remote)?;
            RawStream::Udp(sock)
        }
    };
    Ok(stream)
}

fn short_buffer() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "short buffer")
}

/// Read side of a connection: the inbound bytes received so far.
///
/// `None` as a length means "everything buffered".
pub trait Reader: io::Read {
    /// Returns the next `n` bytes and consumes them.
    fn next(&mut self, n: Option<usize>) -> io::Result<&[u8]>;

    /// Returns the next `n` bytes without consuming them.
    fn peek(&mut self, n: Option<usize>) -> io::Result<&[u8]>;

    /// Skips the next `n` bytes, returning how many were dropped.
    fn discard(&mut self, n: Option<usize>) -> io::Result<usize>;

    /// Number of bytes that can be read without touching the socket.
    fn inbound_buffered(&self) -> usize;

    /// Moves every buffered byte to `w`.
    fn write_to(&mut self, w: &mut dyn io::Write) -> io::Result<u64>;
}

/// Write side of a connection.
///
/// Writes made inside a callback go out before the loop polls again; bytes
/// the socket does not take right away are buffered and flushed when it
/// becomes writable.
pub trait Writer: io::Write {
    /// Writes several buffers at once.
    fn writev(&mut self, bufs: &[&[u8]]) -> io::Result<usize>;

    /// Sends one datagram to the connection's peer. Only valid for UDP.
    fn send_to(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Bytes accepted by `write` but not yet taken by the socket.
    fn outbound_buffered(&self) -> usize;

    /// Drains `r` into the connection.
    fn read_from(&mut self, r: &mut dyn io::Read) -> io::Result<u64>;

    /// Queues `buf` to the owning loop; `callback` runs once it is written.
    fn async_write(&self, buf: Vec<u8>, callback: Option<AsyncCallback>) -> Result<()>;

    /// Like [`Writer::async_write`] for several buffers.
    fn async_writev(&self, bufs: Vec<Vec<u8>>, callback: Option<AsyncCallback>) -> Result<()>;
}

/// Options of the descriptor behind a connection.
pub trait Socket {
    fn fd(&self) -> RawFd;

    /// A duplicate of the descriptor, owned by the caller.
    fn dup(&self) -> io::Result<RawFd>;

    fn set_read_buffer(&self, bytes: usize) -> io::Result<()>;

    fn set_write_buffer(&self, bytes: usize) -> io::Result<()>;

    /// `Some(0)` discards unsent data on close, `None` keeps the default.
    fn set_linger(&self, linger: Option<Duration>) -> io::Result<()>;

    fn set_keep_alive_period(&self, period: Duration) -> io::Result<()>;

    fn set_keep_alive(&self, on: bool) -> io::Result<()>;

    fn set_no_delay(&self, no_delay: bool) -> io::Result<()>;
}

enum Endpoint {
    Stream(RawStream),
    /// One datagram received on a UDP listener, answered through it.
    Datagram {
        listener: Arc<Listener>,
        peer: SocketAddr,
    },
}

/// A connection owned by an event loop.
pub struct Conn {
    gfd: Gfd,
    fd: RawFd,
    endpoint: Endpoint,
    local_addr: Option<NetAddr>,
    remote_addr: Option<NetAddr>,
    inbound: Vec<u8>,
    inbound_pos: usize,
    outbound: Vec<u8>,
    outbound_pos: usize,
    outbound_cap: usize,
    pub(crate) watching_write: bool,
    context: Option<Box<dyn Any + Send>>,
    handle: EventLoopHandle,
}

impl Conn {
    pub(crate) fn new(stream: RawStream, handle: EventLoopHandle) -> Conn {
        let outbound_cap = handle.options().write_buffer_cap;
        Conn {
            gfd: Gfd::default(),
            fd: stream.as_raw_fd(),
            local_addr: stream.local_addr().ok(),
            remote_addr: stream.peer_addr().ok(),
            endpoint: Endpoint::Stream(stream),
            inbound: Vec::new(),
            inbound_pos: 0,
            outbound: Vec::new(),
            outbound_pos: 0,
            outbound_cap,
            watching_write: false,
            context: None,
            handle,
        }
    }

    pub(crate) fn datagram(
        listener: Arc<Listener>,
        peer: SocketAddr,
        data: &[u8],
        handle: EventLoopHandle,
    ) -> Conn {
        let fd = listener.fd();
        Conn {
            gfd: Gfd::new(fd, handle.index(), 0, 0),
            fd,
            local_addr: listener.local_addr(),
            remote_addr: Some(NetAddr::Inet(peer)),
            endpoint: Endpoint::Datagram { listener, peer },
            inbound: data.to_vec(),
            inbound_pos: 0,
            outbound: Vec::new(),
            outbound_pos: 0,
            outbound_cap: 0,
            watching_write: false,
            context: None,
            handle,
        }
    }

    pub(crate) fn set_gfd(&mut self, gfd: Gfd) {
        self.gfd = gfd;
    }

    /// Identifier of the connection, valid across threads.
    pub fn gfd(&self) -> Gfd {
        self.gfd
    }

    pub fn local_addr(&self) -> Option<&NetAddr> {
        self.local_addr.as_ref()
    }

    pub fn remote_addr(&self) -> Option<&NetAddr> {
        self.remote_addr.as_ref()
    }

    /// Whether the connection carries datagrams rather than a byte stream.
    pub fn is_datagram(&self) -> bool {
        match self.endpoint {
            Endpoint::Stream(RawStream::Udp(_)) | Endpoint::Datagram { .. } => true,
            _ => false,
        }
    }

    /// User data attached to the connection.
    pub fn context(&self) -> Option<&(dyn Any + Send)> {
        self.context.as_deref()
    }

    pub fn context_mut(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.context.as_deref_mut()
    }

    pub fn set_context(&mut self, ctx: Option<Box<dyn Any + Send>>) {
        self.context = ctx;
    }

    /// Handle of the loop owning this connection.
    pub fn handle(&self) -> &EventLoopHandle {
        &self.handle
    }

    /// Queues a wake-up: the owning loop calls `on_traffic` for this
    /// connection even though no data arrived.
    pub fn wake(&self, callback: Option<AsyncCallback>) -> Result<()> {
        self.handle.wake(self.gfd, callback)
    }

    /// Queues the closing of this connection to its loop.
    pub fn close_with_callback(&self, callback: Option<AsyncCallback>) -> Result<()> {
        self.handle.close_with_callback(self.gfd, callback)
    }

    /// Deadlines are not supported by the engine.
    pub fn set_deadline(&self, _: Instant) -> Result<()> {
        Err(Error::UnsupportedOp)
    }

    pub fn set_read_deadline(&self, _: Instant) -> Result<()> {
        Err(Error::UnsupportedOp)
    }

    pub fn set_write_deadline(&self, _: Instant) -> Result<()> {
        Err(Error::UnsupportedOp)
    }

    pub(crate) fn fill_inbound(&mut self, data: &[u8]) {
        if self.inbound_pos == self.inbound.len() {
            self.inbound.clear();
            self.inbound_pos = 0;
        }
        self.inbound.extend_from_slice(data);
    }

    /// Drops consumed bytes once most of the inbound buffer is dead.
    pub(crate) fn compact_inbound(&mut self) {
        if self.inbound_pos == self.inbound.len() {
            self.inbound.clear();
            self.inbound_pos = 0;
        } else if self.inbound_pos > self.inbound.len() / 2 {
            self.inbound.drain(..self.inbound_pos);
            self.inbound_pos = 0;
        }
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        self.outbound_pos < self.outbound.len()
    }

    /// Writes buffered output until the socket stops taking it.
    pub(crate) fn flush_outbound(&mut self) -> io::Result<()> {
        while self.outbound_pos < self.outbound.len() {
            match sys::write(self.fd, &self.outbound[self.outbound_pos..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.outbound_pos += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        self.outbound.clear();
        self.outbound_pos = 0;
        if self.outbound.capacity() > self.outbound_cap {
            self.outbound.shrink_to(self.outbound_cap);
        }
        Ok(())
    }

    /// Writes what the socket takes now and buffers the rest.
    fn enqueue(&mut self, bufs: &[&[u8]]) -> io::Result<usize> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if self.is_datagram() {
            let mut buf = Vec::with_capacity(total);
            for b in bufs {
                buf.extend_from_slice(b);
            }
            return self.send_datagram(&buf);
        }

        let mut written = 0;
        if !self.has_pending_output() {
            written = match sys::writev(self.fd, bufs) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                Err(e) => return Err(e),
            };
        }
        let mut skip = written;
        for b in bufs {
            if skip >= b.len() {
                skip -= b.len();
                continue;
            }
            self.outbound.extend_from_slice(&b[skip..]);
            skip = 0;
        }
        Ok(total)
    }

    fn send_datagram(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.endpoint {
            Endpoint::Datagram { listener, peer } => listener.send_to(buf, *peer),
            _ => sys::write(self.fd, buf),
        }
    }

    fn inbound(&self) -> &[u8] {
        &self.inbound[self.inbound_pos..]
    }

    fn available(&self, n: Option<usize>) -> io::Result<usize> {
        let buffered = self.inbound_buffered();
        match n {
            None => Ok(buffered),
            Some(n) if n <= buffered => Ok(n),
            Some(_) => Err(short_buffer()),
        }
    }
}

impl Reader for Conn {
    fn next(&mut self, n: Option<usize>) -> io::Result<&[u8]> {
        let n = self.available(n)?;
        let start = self.inbound_pos;
        self.inbound_pos += n;
        Ok(&self.inbound[start..start + n])
    }

    fn peek(&mut self, n: Option<usize>) -> io::Result<&[u8]> {
        let n = self.available(n)?;
        Ok(&self.inbound()[..n])
    }

    fn discard(&mut self, n: Option<usize>) -> io::Result<usize> {
        let n = n.map_or(self.inbound_buffered(), |n| n.min(self.inbound_buffered()));
        self.inbound_pos += n;
        Ok(n)
    }

    fn inbound_buffered(&self) -> usize {
        self.inbound.len() - self.inbound_pos
    }

    fn write_to(&mut self, w: &mut dyn io::Write) -> io::Result<u64> {
        let mut total = 0;
        while self.inbound_buffered() > 0 {
            let n = w.write(self.inbound())?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.inbound_pos += n;
            total += n as u64;
        }
        Ok(total)
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.inbound_buffered());
        buf[..n].copy_from_slice(&self.inbound()[..n]);
        self.inbound_pos += n;
        Ok(n)
    }
}

impl Writer for Conn {
    fn writev(&mut self, bufs: &[&[u8]]) -> io::Result<usize> {
        self.enqueue(bufs)
    }

    fn send_to(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.is_datagram() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "send_to on a stream connection",
            ));
        }
        self.send_datagram(buf)
    }

    fn outbound_buffered(&self) -> usize {
        self.outbound.len() - self.outbound_pos
    }

    fn read_from(&mut self, r: &mut dyn io::Read) -> io::Result<u64> {
        let mut buf = [0; 4096];
        let mut total = 0;
        loop {
            let n = match r.read(&mut buf) {
                Ok(0) => return Ok(total),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.enqueue(&[&buf[..n]])?;
            total += n as u64;
        }
    }

    fn async_write(&self, buf: Vec<u8>, callback: Option<AsyncCallback>) -> Result<()> {
        self.handle.async_writev(self.gfd, vec![buf], callback)
    }

    fn async_writev(&self, bufs: Vec<Vec<u8>>, callback: Option<AsyncCallback>) -> Result<()> {
        self.handle.async_writev(self.gfd, bufs, callback)
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.enqueue(&[buf])
    }

    /// Pushes buffered output to the socket; whatever it does not take is
    /// left for the loop.
    fn flush(&mut self) -> io::Result<()> {
        self.flush_outbound()
    }
}

impl Socket for Conn {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn dup(&self) -> io::Result<RawFd> {
        sys::dup(self.fd)
    }

    fn set_read_buffer(&self, bytes: usize) -> io::Result<()> {
        socket::set_recv_buffer(self.fd, bytes)
    }

    fn set_write_buffer(&self, bytes: usize) -> io::Result<()> {
        socket::set_send_buffer(self.fd, bytes)
    }

    fn set_linger(&self, linger: Option<Duration>) -> io::Result<()> {
        socket::set_linger(self.fd, linger)
    }

    fn set_keep_alive_period(&self, period: Duration) -> io::Result<()> {
        socket::set_keep_alive_probes(self.fd, period, period, 5)
    }

    fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        socket::set_keep_alive(self.fd, on)
    }

    fn set_no_delay(&self, no_delay: bool) -> io::Result<()> {
        socket::set_no_delay(self.fd, no_delay)
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("gfd", &self.gfd)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("inbound", &self.inbound_buffered())
            .field("outbound", &self.outbound_buffered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use std::net::TcpListener;
    use std::os::unix::net::UnixStream;

    fn conn_pair() -> (Conn, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let stream = RawStream::from(a);
        stream.configure(&Options::default()).unwrap();
        let handle = EventLoopHandle::new(0, Arc::new(Options::default())).unwrap();
        (Conn::new(stream, handle), b)
    }

    #[test]
    fn reader_consumes_inbound() {
        let (mut conn, _peer) = conn_pair();
        conn.fill_inbound(b"hello world");
        assert_eq!(conn.inbound_buffered(), 11);
        assert_eq!(conn.peek(Some(5)).unwrap(), b"hello");
        assert_eq!(conn.next(Some(6)).unwrap(), b"hello ");
        assert!(conn.next(Some(10)).is_err());
        assert_eq!(conn.discard(Some(100)).unwrap(), 5);
        assert_eq!(conn.inbound_buffered(), 0);

        conn.fill_inbound(b"abc");
        let mut out = Vec::new();
        assert_eq!(conn.write_to(&mut out).unwrap(), 3);
        assert_eq!(out, b"abc");
        conn.compact_inbound();
        assert_eq!(conn.next(None).unwrap(), b"");
    }

    #[test]
    fn read_trait_drains_buffer() {
        let (mut conn, _peer) = conn_pair();
        conn.fill_inbound(b"xyz");
        let mut buf = [0; 2];
        assert_eq!(conn.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"xy");
        assert_eq!(conn.read(&mut buf).unwrap(), 1);
        assert_eq!(conn.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn writes_reach_the_peer() {
        let (mut conn, mut peer) = conn_pair();
        conn.write_all(b"ping").unwrap();
        conn.writev(&[&b"-"[..], &b"pong"[..]]).unwrap();
        assert_eq!(conn.outbound_buffered(), 0);

        let mut buf = [0; 9];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping-pong");
    }

    #[test]
    fn full_socket_buffers_output() {
        let (mut conn, mut peer) = conn_pair();
        let chunk = vec![7u8; 64 * 1024];
        let mut sent = 0;
        while conn.outbound_buffered() == 0 {
            sent += conn.write(&chunk).unwrap();
        }
        assert!(conn.has_pending_output());

        let reader = std::thread::spawn(move || {
            let mut total = 0;
            let mut buf = vec![0; 64 * 1024];
            while total < sent {
                total += peer.read(&mut buf).unwrap();
            }
            total
        });
        while conn.has_pending_output() {
            conn.flush_outbound().unwrap();
        }
        assert_eq!(reader.join().unwrap(), sent);
    }

    #[test]
    fn stream_send_to_is_rejected() {
        let (mut conn, _peer) = conn_pair();
        assert!(!conn.is_datagram());
        assert!(conn.send_to(b"x").is_err());
        assert_eq!(conn.set_deadline(Instant::now()), Err(Error::UnsupportedOp));
    }

    #[test]
    fn context_round_trip() {
        let (mut conn, _peer) = conn_pair();
        assert!(conn.context().is_none());
        conn.set_context(Some(Box::new(42u32)));
        *conn.context_mut().unwrap().downcast_mut::<u32>().unwrap() += 1;
        assert_eq!(conn.context().unwrap().downcast_ref::<u32>(), Some(&43));
    }

    #[test]
    fn dial_tcp_and_udp() {
        let ln = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = format!("tcp://{}", ln.local_addr().unwrap());
        let stream = dial(&addr).unwrap();
        assert_eq!(
            stream.peer_addr().unwrap(),
            NetAddr::from(ln.local_addr().unwrap())
        );
        stream.configure(&Options::default()).unwrap();

        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let stream = dial(&format!("udp://{}", server.local_addr().unwrap())).unwrap();
        match stream {
            RawStream::Udp(_) => {}
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(dial("ftp://x").unwrap_err(), Error::UnsupportedProtocol);
    }
}
