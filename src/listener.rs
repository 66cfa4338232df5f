use std::fmt;
use std::fs;
use std::io;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::Path;

use log::{debug, warn};
use net2::unix::{UnixTcpBuilderExt, UnixUdpBuilderExt};
use net2::{TcpBuilder, UdpBuilder};
use parking_lot::Mutex;

use crate::address::{parse_proto_addr, resolve_inet, NetAddr, Protocol};
use crate::conn::RawStream;
use crate::driver::{io as sys, socket};
use crate::errors::{Error, Result};
use crate::options::Options;

const LISTEN_BACKLOG: i32 = 1024;

#[derive(Debug)]
enum ListenerSocket {
    Tcp(TcpListener),
    Udp(UdpSocket),
    Unix(UnixListener),
}

/// A bound socket serving one address.
///
/// The socket is released by [`Listener::close`], or on drop.
pub(crate) struct Listener {
    proto: Protocol,
    addr: String,
    fd: RawFd,
    local_addr: Option<NetAddr>,
    socket: Mutex<Option<ListenerSocket>>,
}

impl Listener {
    /// Binds `addr` with the listener socket options of `opts`.
    pub(crate) fn bind(proto: Protocol, addr: &str, opts: &Options) -> Result<Listener> {
        let socket = if proto.is_unix() {
            bind_unix(addr)?
        } else {
            let sa = resolve_inet(proto, addr)?;
            if proto.is_udp() {
                bind_udp(sa, opts)?
            } else {
                bind_tcp(sa, opts)?
            }
        };
        let (fd, local_addr) = match &socket {
            ListenerSocket::Tcp(l) => (l.as_raw_fd(), l.local_addr().ok().map(NetAddr::from)),
            ListenerSocket::Udp(l) => (l.as_raw_fd(), l.local_addr().ok().map(NetAddr::from)),
            ListenerSocket::Unix(l) => (l.as_raw_fd(), l.local_addr().ok().map(NetAddr::from)),
        };
        debug!("listening on {}://{} (fd {})", proto, addr, fd);
        Ok(Listener {
            proto,
            addr: addr.to_owned(),
            fd,
            local_addr,
            socket: Mutex::new(Some(socket)),
        })
    }

    /// Binds a second socket to the address this one actually got, so several
    /// loops share it through SO_REUSEPORT.
    pub(crate) fn rebind(&self, opts: &Options) -> Result<Listener> {
        let sa = match &self.local_addr {
            Some(NetAddr::Inet(sa)) if !self.proto.is_unix() => *sa,
            _ => return Err(Error::UnsupportedOp),
        };
        let socket = if self.proto.is_udp() {
            bind_udp(sa, opts)?
        } else {
            bind_tcp(sa, opts)?
        };
        let fd = match &socket {
            ListenerSocket::Tcp(l) => l.as_raw_fd(),
            ListenerSocket::Udp(l) => l.as_raw_fd(),
            ListenerSocket::Unix(l) => l.as_raw_fd(),
        };
        Ok(Listener {
            proto: self.proto,
            addr: self.addr.clone(),
            fd,
            local_addr: self.local_addr.clone(),
            socket: Mutex::new(Some(socket)),
        })
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.proto
    }

    /// The address as it was given, without the scheme.
    pub(crate) fn address(&self) -> &str {
        &self.addr
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn local_addr(&self) -> Option<NetAddr> {
        self.local_addr.clone()
    }

    pub(crate) fn is_datagram(&self) -> bool {
        self.proto.is_udp()
    }

    /// Duplicates the listening descriptor for use outside the engine.
    pub(crate) fn dup(&self) -> Result<RawFd> {
        match &*self.socket.lock() {
            Some(_) => Ok(sys::dup(self.fd)?),
            None => Err(Error::EngineInShutdown),
        }
    }

    /// Accepts one pending connection; `None` once the backlog is empty.
    pub(crate) fn accept(&self) -> io::Result<Option<RawStream>> {
        let res = match &*self.socket.lock() {
            Some(ListenerSocket::Tcp(l)) => l.accept().map(|(s, _)| RawStream::Tcp(s)),
            Some(ListenerSocket::Unix(l)) => l.accept().map(|(s, _)| RawStream::Unix(s)),
            Some(ListenerSocket::Udp(_)) | None => return Ok(None),
        };
        match res {
            Ok(stream) => Ok(Some(stream)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Receives one datagram; `None` when nothing is pending.
    pub(crate) fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match &*self.socket.lock() {
            Some(ListenerSocket::Udp(l)) => match l.recv_from(buf) {
                Ok(res) => Ok(Some(res)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            },
            _ => Ok(None),
        }
    }

    pub(crate) fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        match &*self.socket.lock() {
            Some(ListenerSocket::Udp(l)) => l.send_to(buf, peer),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Closes the socket, removing the socket file of a unix listener.
    pub(crate) fn close(&self) {
        if let Some(socket) = self.socket.lock().take() {
            drop(socket);
            if self.proto.is_unix() {
                if let Err(e) = fs::remove_file(&self.addr) {
                    warn!("failed to remove {}: {}", self.addr, e);
                }
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("proto", &self.proto)
            .field("addr", &self.addr)
            .field("fd", &self.fd)
            .finish()
    }
}

fn configure_fd(fd: RawFd, opts: &Options) -> io::Result<()> {
    if opts.socket_recv_buffer > 0 {
        socket::set_recv_buffer(fd, opts.socket_recv_buffer)?;
    }
    if opts.socket_send_buffer > 0 {
        socket::set_send_buffer(fd, opts.socket_send_buffer)?;
    }
    if !opts.bind_to_device.is_empty() {
        socket::bind_to_device(fd, &opts.bind_to_device)?;
    }
    Ok(())
}

fn bind_tcp(addr: SocketAddr, opts: &Options) -> io::Result<ListenerSocket> {
    let builder = match addr {
        SocketAddr::V4(..) => TcpBuilder::new_v4()?,
        SocketAddr::V6(..) => TcpBuilder::new_v6()?,
    };
    builder.reuse_address(opts.reuse_addr)?;
    builder.reuse_port(opts.reuse_port)?;
    configure_fd(builder.as_raw_fd(), opts)?;
    builder.bind(addr)?;
    let listener = builder.listen(LISTEN_BACKLOG)?;
    listener.set_nonblocking(true)?;
    Ok(ListenerSocket::Tcp(listener))
}

fn bind_udp(addr: SocketAddr, opts: &Options) -> io::Result<ListenerSocket> {
    let builder = match addr {
        SocketAddr::V4(..) => UdpBuilder::new_v4()?,
        SocketAddr::V6(..) => UdpBuilder::new_v6()?,
    };
    builder.reuse_address(opts.reuse_addr)?;
    builder.reuse_port(opts.reuse_port)?;
    configure_fd(builder.as_raw_fd(), opts)?;
    let sock = builder.bind(addr)?;
    if addr.ip().is_multicast() {
        socket::join_multicast(sock.as_raw_fd(), addr.ip(), opts.multicast_interface_index)?;
    }
    sock.set_nonblocking(true)?;
    Ok(ListenerSocket::Udp(sock))
}

fn bind_unix(path: &str) -> io::Result<ListenerSocket> {
    // a socket file left over by a previous run
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_socket() {
            fs::remove_file(path)?;
        }
    }
    let listener = UnixListener::bind(Path::new(path))?;
    listener.set_nonblocking(true)?;
    Ok(ListenerSocket::Unix(listener))
}

/// Normalizes `opts` against `addrs`, then binds one listener per address.
///
/// Fails as a whole: listeners bound before an error are closed again.
pub(crate) fn create_listeners(addrs: &[&str], opts: &mut Options) -> Result<Vec<Listener>> {
    if addrs.is_empty() {
        return Err(Error::InvalidNetworkAddress);
    }
    opts.normalize(addrs)?;
    let mut listeners = Vec::with_capacity(addrs.len());
    for proto_addr in addrs {
        let (proto, addr) = parse_proto_addr(proto_addr)?;
        match Listener::bind(proto, &addr, opts) {
            Ok(ln) => listeners.push(ln),
            Err(e) => {
                for ln in &listeners {
                    ln.close();
                }
                return Err(e);
            }
        }
    }
    Ok(listeners)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{load_options, with_reuse_port};
    use std::net::{TcpStream, UdpSocket};
    use tempdir::TempDir;

    fn inet(ln: &Listener) -> SocketAddr {
        match ln.local_addr() {
            Some(NetAddr::Inet(sa)) => sa,
            other => panic!("not an inet listener: {:?}", other),
        }
    }

    #[test]
    fn tcp_accept() {
        let mut opts = Options::default();
        let lns = create_listeners(&["tcp://127.0.0.1:0"], &mut opts).unwrap();
        let ln = &lns[0];
        assert_eq!(ln.protocol(), Protocol::Tcp);
        assert_eq!(ln.address(), "127.0.0.1:0");
        assert!(ln.accept().unwrap().is_none());

        let _client = TcpStream::connect(inet(ln)).unwrap();
        let mut accepted = None;
        for _ in 0..100 {
            accepted = ln.accept().unwrap();
            if accepted.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(matches!(accepted, Some(RawStream::Tcp(_))));

        let fd = ln.dup().unwrap();
        assert!(fd > 2);
        unsafe { libc::close(fd) };

        ln.close();
        assert_eq!(ln.dup().unwrap_err(), Error::EngineInShutdown);
    }

    #[test]
    fn udp_round_trip() {
        let mut opts = Options::default();
        let lns = create_listeners(&["udp://127.0.0.1:0"], &mut opts).unwrap();
        assert!(opts.reuse_port);
        let ln = &lns[0];
        assert!(ln.is_datagram());

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"ping", inet(ln)).unwrap();

        let mut buf = [0; 16];
        let mut got = None;
        for _ in 0..100 {
            got = ln.recv_from(&mut buf).unwrap();
            if got.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let (n, peer) = got.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(ln.send_to(b"pong", peer).unwrap(), 4);
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[test]
    fn reuse_port_rebind() {
        let mut opts = load_options(vec![with_reuse_port(true)]);
        let lns = create_listeners(&["tcp://127.0.0.1:0"], &mut opts).unwrap();
        let twin = lns[0].rebind(&opts).unwrap();
        assert_eq!(inet(&twin), inet(&lns[0]));
        assert_ne!(twin.fd(), lns[0].fd());
    }

    #[test]
    fn unix_socket_file_is_removed() {
        let dir = TempDir::new("evnet-listener").unwrap();
        let path = dir.path().join("s.sock");
        let addr = format!("unix://{}", path.display());

        let mut opts = Options::default();
        let lns = create_listeners(&[addr.as_str()], &mut opts).unwrap();
        assert!(path.exists());
        assert_eq!(lns[0].rebind(&opts).unwrap_err(), Error::UnsupportedOp);
        drop(lns);
        assert!(!path.exists());

        // a stale socket file does not prevent binding again
        let stale = UnixListener::bind(&path).unwrap();
        drop(stale);
        let lns = create_listeners(&[addr.as_str()], &mut opts).unwrap();
        lns[0].close();
    }

    #[test]
    fn failure_closes_earlier_listeners() {
        let dir = TempDir::new("evnet-listener").unwrap();
        let path = dir.path().join("a.sock");
        let good = format!("unix://{}", path.display());
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = format!("tcp://{}", taken.local_addr().unwrap());

        let mut opts = Options::default();
        let err = create_listeners(&[good.as_str(), busy.as_str()], &mut opts).unwrap_err();
        assert_eq!(err, Error::Io(io::ErrorKind::AddrInUse.into()));
        assert!(!path.exists());
    }

    #[test]
    fn no_addresses_binds_nothing() {
        let mut opts = load_options(vec![]);
        assert_eq!(
            create_listeners(&[], &mut opts).unwrap_err(),
            Error::InvalidNetworkAddress
        );
    }
}
