//! Socket option setters over raw fds.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::io::cvt;

fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, val: T) -> io::Result<()> {
    unsafe {
        let payload = &val as *const T as *const libc::c_void;
        cvt(libc::setsockopt(
            fd,
            level,
            name,
            payload,
            mem::size_of::<T>() as libc::socklen_t,
        ))?;
    }
    Ok(())
}

#[cfg(test)]
fn getsockopt<T: Copy>(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<T> {
    unsafe {
        let mut slot: T = mem::zeroed();
        let mut len = mem::size_of::<T>() as libc::socklen_t;
        cvt(libc::getsockopt(
            fd,
            level,
            name,
            &mut slot as *mut T as *mut libc::c_void,
            &mut len,
        ))?;
        Ok(slot)
    }
}

fn secs(d: Duration) -> libc::c_int {
    d.as_secs().min(libc::c_int::max_value() as u64) as libc::c_int
}

pub(crate) fn set_no_delay(fd: RawFd, no_delay: bool) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, no_delay as libc::c_int)
}

pub(crate) fn set_recv_buffer(fd: RawFd, size: usize) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, size as libc::c_int)
}

pub(crate) fn set_send_buffer(fd: RawFd, size: usize) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, size as libc::c_int)
}

#[cfg(test)]
pub(crate) fn recv_buffer(fd: RawFd) -> io::Result<usize> {
    getsockopt::<libc::c_int>(fd, libc::SOL_SOCKET, libc::SO_RCVBUF).map(|n| n as usize)
}

/// `None` restores the default close behavior, `Some(0)` makes close reset
/// the connection.
pub(crate) fn set_linger(fd: RawFd, linger: Option<Duration>) -> io::Result<()> {
    let val = libc::linger {
        l_onoff: linger.is_some() as libc::c_int,
        l_linger: linger.map_or(0, secs),
    };
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, val)
}

pub(crate) fn set_keep_alive(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as libc::c_int)
}

/// Enables keep-alive probing after `idle`, then every `interval`, giving up
/// after `count` unanswered probes.
pub(crate) fn set_keep_alive_probes(
    fd: RawFd,
    idle: Duration,
    interval: Duration,
    count: u32,
) -> io::Result<()> {
    set_keep_alive(fd, true)?;
    let idle = secs(idle).max(1);
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, idle)?;
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, secs(interval).max(1))?;
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, count as libc::c_int)
}

pub(crate) fn bind_to_device(fd: RawFd, iface: &str) -> io::Result<()> {
    unsafe {
        cvt(libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            iface.as_ptr() as *const libc::c_void,
            iface.len() as libc::socklen_t,
        ))?;
    }
    Ok(())
}

#[repr(C)]
struct IpMreqn {
    imr_multiaddr: libc::in_addr,
    imr_address: libc::in_addr,
    imr_ifindex: libc::c_int,
}

/// Joins the multicast `group` on the interface with index `ifindex`
/// (0 lets the kernel pick one).
pub(crate) fn join_multicast(fd: RawFd, group: IpAddr, ifindex: u32) -> io::Result<()> {
    match group {
        IpAddr::V4(group) => join_multicast_v4(fd, group, ifindex),
        IpAddr::V6(group) => join_multicast_v6(fd, group, ifindex),
    }
}

fn join_multicast_v4(fd: RawFd, group: Ipv4Addr, ifindex: u32) -> io::Result<()> {
    let mreq = IpMreqn {
        imr_multiaddr: libc::in_addr {
            s_addr: u32::from_ne_bytes(group.octets()),
        },
        imr_address: libc::in_addr { s_addr: 0 },
        imr_ifindex: ifindex as libc::c_int,
    };
    setsockopt(fd, libc::IPPROTO_IP, libc::IP_ADD_MEMBERSHIP, mreq)
}

fn join_multicast_v6(fd: RawFd, group: Ipv6Addr, ifindex: u32) -> io::Result<()> {
    let mut mreq: libc::ipv6_mreq = unsafe { mem::zeroed() };
    mreq.ipv6mr_multiaddr.s6_addr = group.octets();
    mreq.ipv6mr_interface = ifindex as libc::c_uint;
    setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_ADD_MEMBERSHIP, mreq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn stream_options() {
        let ln = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(ln.local_addr().unwrap()).unwrap();
        let fd = stream.as_raw_fd();

        set_no_delay(fd, true).unwrap();
        assert!(stream.nodelay().unwrap());
        set_no_delay(fd, false).unwrap();
        assert!(!stream.nodelay().unwrap());

        set_keep_alive_probes(fd, Duration::from_secs(30), Duration::from_secs(6), 5).unwrap();
        set_linger(fd, Some(Duration::from_secs(0))).unwrap();
        set_linger(fd, None).unwrap();

        set_recv_buffer(fd, 64 * 1024).unwrap();
        assert!(recv_buffer(fd).unwrap() >= 64 * 1024);
        set_send_buffer(fd, 64 * 1024).unwrap();
    }

    #[test]
    fn multicast_membership() {
        let sock = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        // no multicast route in some sandboxes
        let _ = join_multicast(sock.as_raw_fd(), "224.0.0.251".parse().unwrap(), 0);
    }
}
