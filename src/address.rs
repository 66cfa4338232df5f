//! Address strings: `scheme://host[:port]` and `unix://path`.
//!
//! [`parse_proto_addr`] splits an address into its [`Protocol`] and the
//! address proper. Literal `%` characters survive parsing, so IPv6 zone
//! suffixes such as `udp://[ff02::3%lo0]:9991` keep their zone id.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::{Error, Result};
use crate::platform;

/// Transport named by an address scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
}

impl Protocol {
    /// The scheme spelling, e.g. `"tcp4"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Tcp4 => "tcp4",
            Protocol::Tcp6 => "tcp6",
            Protocol::Udp => "udp",
            Protocol::Udp4 => "udp4",
            Protocol::Udp6 => "udp6",
            Protocol::Unix => "unix",
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Tcp4 | Protocol::Tcp6)
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, Protocol::Udp | Protocol::Udp4 | Protocol::Udp6)
    }

    pub fn is_unix(&self) -> bool {
        *self == Protocol::Unix
    }

    fn wants_v4(&self) -> bool {
        matches!(self, Protocol::Tcp4 | Protocol::Udp4)
    }

    fn wants_v6(&self) -> bool {
        matches!(self, Protocol::Tcp6 | Protocol::Udp6)
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Protocol> {
        Ok(match s {
            "tcp" => Protocol::Tcp,
            "tcp4" => Protocol::Tcp4,
            "tcp6" => Protocol::Tcp6,
            "udp" => Protocol::Udp,
            "udp4" => Protocol::Udp4,
            "udp6" => Protocol::Udp6,
            "unix" => Protocol::Unix,
            _ => return Err(Error::UnsupportedProtocol),
        })
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint of a connection or listener.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NetAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetAddr::Inet(addr) => addr.fmt(f),
            NetAddr::Unix(path) => path.display().fmt(f),
        }
    }
}

impl From<SocketAddr> for NetAddr {
    fn from(addr: SocketAddr) -> Self {
        NetAddr::Inet(addr)
    }
}

impl From<std::os::unix::net::SocketAddr> for NetAddr {
    fn from(addr: std::os::unix::net::SocketAddr) -> Self {
        NetAddr::Unix(addr.as_pathname().map(PathBuf::from).unwrap_or_default())
    }
}

/// Splits `scheme://host[:port]` or `unix://path` into protocol and address.
///
/// Never returns partial results: either both parts or a typed error.
pub fn parse_proto_addr(proto_addr: &str) -> Result<(Protocol, String)> {
    if platform::unix_path_conflicts_with_uri() && proto_addr.starts_with("unix://") {
        let path = &proto_addr["unix://".len()..];
        if path.is_empty() {
            return Err(Error::InvalidNetworkAddress);
        }
        return Ok((Protocol::Unix, path.to_string()));
    }

    // udp://[ff02::3%lo0]:9991 must not read "%lo" as an escape
    let escaped = proto_addr.replace('%', "%25");
    let uri = Uri::parse(&escaped)?;

    let proto = match uri.scheme.as_str() {
        "" => return Err(Error::InvalidNetworkAddress),
        scheme => scheme.parse::<Protocol>()?,
    };
    match proto {
        Protocol::Unix => {
            let path = join_path(&uri.host, &uri.path);
            if path.is_empty() {
                return Err(Error::InvalidNetworkAddress);
            }
            Ok((proto, path))
        }
        _ => {
            if uri.host.is_empty() || !uri.path.is_empty() {
                return Err(Error::InvalidNetworkAddress);
            }
            Ok((proto, uri.host))
        }
    }
}

#[derive(Debug, Default)]
struct Uri {
    scheme: String,
    host: String,
    path: String,
}

impl Uri {
    fn parse(raw: &str) -> Result<Uri> {
        if raw.bytes().any(|b| b < 0x20 || b == 0x7f) {
            return Err(Error::InvalidNetworkAddress);
        }
        let raw = raw.splitn(2, '#').next().unwrap_or_default();
        let (scheme, rest) = split_scheme(raw)?;
        let mut uri = Uri {
            scheme: scheme.to_ascii_lowercase(),
            ..Uri::default()
        };
        if uri.scheme.is_empty() {
            return Ok(uri);
        }

        let rest = rest.splitn(2, '?').next().unwrap_or_default();
        if !rest.starts_with('/') {
            // opaque form such as "tcp:host"
            return Ok(uri);
        }
        let rest = if rest.starts_with("//") {
            let authority_end = rest[2..].find('/').map(|i| i + 2).unwrap_or_else(|| rest.len());
            uri.host = parse_host(&rest[2..authority_end])?;
            &rest[authority_end..]
        } else {
            rest
        };
        uri.path = unescape(rest)?;
        Ok(uri)
    }
}

fn split_scheme(raw: &str) -> Result<(&str, &str)> {
    for (i, c) in raw.char_indices() {
        match c {
            'a'..='z' | 'A'..='Z' => {}
            '0'..='9' | '+' | '-' | '.' if i > 0 => {}
            ':' if i == 0 => return Err(Error::InvalidNetworkAddress),
            ':' => return Ok((&raw[..i], &raw[i + 1..])),
            _ => return Ok(("", raw)),
        }
    }
    Ok(("", raw))
}

fn parse_host(authority: &str) -> Result<String> {
    let host = match authority.rfind('@') {
        Some(i) => &authority[i + 1..],
        None => authority,
    };
    if host.starts_with('[') {
        let close = host.rfind(']').ok_or(Error::InvalidNetworkAddress)?;
        if !valid_optional_port(&host[close + 1..]) {
            return Err(Error::InvalidNetworkAddress);
        }
    } else if let Some(i) = host.rfind(':') {
        if !valid_optional_port(&host[i..]) {
            return Err(Error::InvalidNetworkAddress);
        }
    }
    unescape(host)
}

fn valid_optional_port(port: &str) -> bool {
    match port.strip_prefix(':') {
        Some(digits) => digits.bytes().all(|b| b.is_ascii_digit()),
        None => port.is_empty(),
    }
}

fn unescape(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3).ok_or(Error::InvalidNetworkAddress)?;
            let b = u8::from_str_radix(hex, 16).map_err(|_| Error::InvalidNetworkAddress)?;
            out.push(b);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| Error::InvalidNetworkAddress)
}

/// Joins host and path into one slash-separated, lexically cleaned path.
fn join_path(host: &str, path: &str) -> String {
    let joined = match (host.is_empty(), path.is_empty()) {
        (true, true) => return String::new(),
        (false, true) => host.to_string(),
        (true, false) => path.to_string(),
        (false, false) => format!("{}/{}", host, path),
    };
    clean_path(&joined)
}

fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().map_or(false, |p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            p => parts.push(p),
        }
    }
    let body = parts.join("/");
    match (rooted, body.is_empty()) {
        (true, _) => format!("/{}", body),
        (false, true) => ".".to_string(),
        (false, false) => body,
    }
}

/// Resolves a `host:port` address for binding or dialing.
///
/// An empty host means every local interface; bracketed IPv6 hosts may
/// carry a `%zone` suffix naming an interface or its numeric index.
pub(crate) fn resolve_inet(proto: Protocol, addr: &str) -> io::Result<SocketAddr> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidInput, format!("invalid address {}", addr));
    let colon = addr.rfind(':').ok_or_else(invalid)?;
    let (host, port) = (&addr[..colon], &addr[colon + 1..]);
    let port: u16 = port.parse().map_err(|_| invalid())?;

    if host.is_empty() {
        let ip = if proto.wants_v6() {
            IpAddr::from(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::from([0, 0, 0, 0])
        };
        return Ok(SocketAddr::new(ip, port));
    }

    if host.starts_with('[') && host.ends_with(']') {
        let inner = &host[1..host.len() - 1];
        if let Some(pct) = inner.find('%') {
            let ip: Ipv6Addr = inner[..pct].parse().map_err(|_| invalid())?;
            let scope_id = zone_index(&inner[pct + 1..])?;
            return Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, scope_id)));
        }
    }

    (host, port)
        .to_socket_addrs()
        .or_else(|_| addr.to_socket_addrs())?
        .find(|a| {
            (!proto.wants_v4() || a.is_ipv4()) && (!proto.wants_v6() || a.is_ipv6())
        })
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} address found for {}", proto, addr),
            )
        })
}

fn zone_index(zone: &str) -> io::Result<u32> {
    if let Ok(index) = zone.parse::<u32>() {
        return Ok(index);
    }
    let name = CString::new(zone)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "zone contains NUL"))?;
    match unsafe { libc::if_nametoindex(name.as_ptr()) } {
        0 => Err(io::Error::last_os_error()),
        index => Ok(index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(s: &str) -> (&'static str, String) {
        let (proto, addr) = parse_proto_addr(s).unwrap();
        (proto.as_str(), addr)
    }

    #[test]
    fn inet_addresses() {
        assert_eq!(parsed("tcp://127.0.0.1:9000"), ("tcp", "127.0.0.1:9000".to_string()));
        assert_eq!(parsed("tcp4://localhost:80"), ("tcp4", "localhost:80".to_string()));
        assert_eq!(parsed("tcp6://[::1]:80"), ("tcp6", "[::1]:80".to_string()));
        assert_eq!(parsed("udp://:9000"), ("udp", ":9000".to_string()));
        assert_eq!(parsed("TCP://127.0.0.1:1"), ("tcp", "127.0.0.1:1".to_string()));
    }

    #[test]
    fn ipv6_zone_is_preserved() {
        assert_eq!(
            parsed("udp://[ff02::3%lo0]:9991"),
            ("udp", "[ff02::3%lo0]:9991".to_string())
        );
    }

    #[test]
    fn unix_paths() {
        assert_eq!(parsed("unix:///tmp/s.sock"), ("unix", "/tmp/s.sock".to_string()));
        assert_eq!(parsed("unix://s.sock"), ("unix", "s.sock".to_string()));
        assert_eq!(parsed("unix://run/./app/s.sock"), ("unix", "run/app/s.sock".to_string()));
        assert_eq!(parse_proto_addr("unix://"), Err(Error::InvalidNetworkAddress));
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(parse_proto_addr("tcp://host/path"), Err(Error::InvalidNetworkAddress));
        assert_eq!(parse_proto_addr(""), Err(Error::InvalidNetworkAddress));
        assert_eq!(parse_proto_addr("127.0.0.1:9000"), Err(Error::InvalidNetworkAddress));
        assert_eq!(parse_proto_addr("tcp://"), Err(Error::InvalidNetworkAddress));
        assert_eq!(parse_proto_addr("tcp:host"), Err(Error::InvalidNetworkAddress));
        assert_eq!(parse_proto_addr("tcp://host:port"), Err(Error::InvalidNetworkAddress));
        assert_eq!(parse_proto_addr("://host"), Err(Error::InvalidNetworkAddress));
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert_eq!(parse_proto_addr("ftp://host"), Err(Error::UnsupportedProtocol));
        assert_eq!(parse_proto_addr("http://host:80"), Err(Error::UnsupportedProtocol));
    }

    #[test]
    fn resolves_bind_addresses() {
        assert_eq!(
            resolve_inet(Protocol::Tcp, "127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve_inet(Protocol::Tcp4, ":80").unwrap(),
            "0.0.0.0:80".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve_inet(Protocol::Udp6, ":80").unwrap(),
            "[::]:80".parse::<SocketAddr>().unwrap()
        );
        match resolve_inet(Protocol::Udp6, "[ff02::3%7]:9991").unwrap() {
            SocketAddr::V6(v6) => assert_eq!(v6.scope_id(), 7),
            other => panic!("unexpected {}", other),
        }
        assert!(resolve_inet(Protocol::Tcp, "nonsense").is_err());
    }
}
