//! Engine configuration.
//!
//! Options are built by folding a sequence of option functions over
//! [`Options::default`]; later functions overwrite earlier ones:
//!
//! ```
//! use evnet::options::{self, load_options};
//!
//! let opts = load_options(vec![
//!     options::with_multicore(true),
//!     options::with_read_buffer_cap(8 * 1024),
//!     options::with_read_buffer_cap(16 * 1024),
//! ]);
//! assert!(opts.multicore);
//! assert_eq!(opts.read_buffer_cap, 16 * 1024);
//! ```
//!
//! Before any socket is opened the bootstrap normalizes the folded options
//! against the address list, see [`Options::normalize`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{error, LevelFilter};

use crate::address::parse_proto_addr;
use crate::balancer::LoadBalancing;
use crate::errors::{Error, Result};
use crate::gfd::EVENT_LOOP_INDEX_MAX;
use crate::platform;
use crate::registry::Registry;

/// Default cap of per-connection read and write buffers.
pub const MAX_STREAM_BUFFER_CAP: usize = 64 * 1024;
/// Smallest buffer block handed out by the buffer pools.
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;
/// Per-notification read limit when edge-triggered I/O has no explicit chunk.
pub const DEFAULT_EDGE_TRIGGERED_IO_CHUNK: usize = 1 << 20;
/// Upper bound on event loops while OS-thread locking is requested.
pub const MAX_LOCKED_EVENT_LOOPS: usize = 10_000;

/// TCP_NODELAY mode applied to TCP connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpSocketOpt {
    /// Disable Nagle's algorithm.
    NoDelay,
    /// Keep Nagle's algorithm.
    Delay,
}

impl Default for TcpSocketOpt {
    fn default() -> Self {
        TcpSocketOpt::NoDelay
    }
}

/// Full engine configuration.
///
/// Zero values mean "unset" for every numeric field.
#[derive(Clone)]
pub struct Options {
    /// Strategy selecting the loop that owns a new connection.
    pub lb: LoadBalancing,
    /// SO_REUSEADDR on listeners.
    pub reuse_addr: bool,
    /// SO_REUSEPORT on listeners.
    pub reuse_port: bool,
    /// Interface index used to join multicast UDP groups.
    pub multicast_interface_index: u32,
    /// Interface the listeners are bound to (SO_BINDTODEVICE).
    pub bind_to_device: String,
    /// Size the loop pool to the number of cores.
    pub multicore: bool,
    /// Explicit number of event loops, overrides `multicore`.
    pub num_event_loop: usize,
    /// Read buffer capacity of each connection.
    pub read_buffer_cap: usize,
    /// Write buffer capacity of each connection.
    pub write_buffer_cap: usize,
    /// Keep every event loop on a dedicated OS thread.
    pub lock_os_thread: bool,
    /// Call `on_tick` periodically.
    pub ticker: bool,
    /// Keep-alive idle time of TCP connections; zero disables keep-alive.
    pub tcp_keep_alive: Duration,
    /// Interval between keep-alive probes.
    pub tcp_keep_interval: Duration,
    /// Number of unanswered probes before the connection is dropped.
    pub tcp_keep_count: u32,
    /// TCP_NODELAY mode.
    pub tcp_no_delay: TcpSocketOpt,
    /// SO_RCVBUF of sockets.
    pub socket_recv_buffer: usize,
    /// SO_SNDBUF of sockets.
    pub socket_send_buffer: usize,
    /// File the engine logs to.
    pub log_path: String,
    /// Level of the engine's logger.
    pub log_level: LevelFilter,
    /// Logger overriding `log_path`.
    pub logger: Option<Arc<dyn log::Log>>,
    /// Drain sockets on each readiness notification.
    pub edge_triggered_io: bool,
    /// Bytes read per connection and notification under edge-triggered I/O.
    pub edge_triggered_io_chunk: usize,
    /// Registry the engine is published in, keyed by its addresses.
    pub registry: Option<Registry>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            lb: LoadBalancing::default(),
            reuse_addr: false,
            reuse_port: false,
            multicast_interface_index: 0,
            bind_to_device: String::new(),
            multicore: false,
            num_event_loop: 0,
            read_buffer_cap: 0,
            write_buffer_cap: 0,
            lock_os_thread: false,
            ticker: false,
            tcp_keep_alive: Duration::from_secs(0),
            tcp_keep_interval: Duration::from_secs(0),
            tcp_keep_count: 0,
            tcp_no_delay: TcpSocketOpt::default(),
            socket_recv_buffer: 0,
            socket_send_buffer: 0,
            log_path: String::new(),
            log_level: LevelFilter::Info,
            logger: None,
            edge_triggered_io: false,
            edge_triggered_io_chunk: 0,
            registry: None,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("lb", &self.lb)
            .field("reuse_addr", &self.reuse_addr)
            .field("reuse_port", &self.reuse_port)
            .field("multicast_interface_index", &self.multicast_interface_index)
            .field("bind_to_device", &self.bind_to_device)
            .field("multicore", &self.multicore)
            .field("num_event_loop", &self.num_event_loop)
            .field("read_buffer_cap", &self.read_buffer_cap)
            .field("write_buffer_cap", &self.write_buffer_cap)
            .field("lock_os_thread", &self.lock_os_thread)
            .field("ticker", &self.ticker)
            .field("tcp_keep_alive", &self.tcp_keep_alive)
            .field("tcp_keep_interval", &self.tcp_keep_interval)
            .field("tcp_keep_count", &self.tcp_keep_count)
            .field("tcp_no_delay", &self.tcp_no_delay)
            .field("socket_recv_buffer", &self.socket_recv_buffer)
            .field("socket_send_buffer", &self.socket_send_buffer)
            .field("log_path", &self.log_path)
            .field("log_level", &self.log_level)
            .field("logger", &self.logger.as_ref().map(|_| "..."))
            .field("edge_triggered_io", &self.edge_triggered_io)
            .field("edge_triggered_io_chunk", &self.edge_triggered_io_chunk)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Options {
    /// Validates and rewrites the options against the addresses to bind.
    ///
    /// Runs before any socket exists: rejects a locked-thread loop count
    /// above [`MAX_LOCKED_EVENT_LOOPS`], settles edge-triggered I/O, snaps the
    /// buffer capacities to pool-friendly sizes and decides reuse-port
    /// eligibility from the protocols present.
    pub fn normalize(&mut self, addrs: &[&str]) -> Result<()> {
        if self.lock_os_thread && self.num_event_loop > MAX_LOCKED_EVENT_LOOPS {
            error!(
                "too many event-loops under LockOSThread mode, should be less than {} \
                 while you are trying to set up {}",
                MAX_LOCKED_EVENT_LOOPS, self.num_event_loop
            );
            return Err(Error::TooManyEventLoopThreads);
        }

        if self.edge_triggered_io_chunk > 0 {
            self.edge_triggered_io = true;
            self.edge_triggered_io_chunk = self.edge_triggered_io_chunk.next_power_of_two();
        } else if self.edge_triggered_io {
            self.edge_triggered_io_chunk = DEFAULT_EDGE_TRIGGERED_IO_CHUNK;
        }

        self.read_buffer_cap = normalize_buffer_cap(self.read_buffer_cap);
        self.write_buffer_cap = normalize_buffer_cap(self.write_buffer_cap);

        let (mut has_udp, mut has_unix) = (false, false);
        for addr in addrs {
            let (proto, _) = parse_proto_addr(addr)?;
            has_udp |= proto.is_udp();
            has_unix |= proto.is_unix();
        }

        if self.reuse_port
            && (self.multicore || self.num_event_loop > 1)
            && !platform::supports_reuse_port_sharding()
        {
            self.reuse_port = false;
        }
        if self.reuse_port && has_unix {
            self.reuse_port = false;
        }
        if has_udp {
            self.reuse_port = true;
            self.edge_triggered_io = false;
        }
        Ok(())
    }

    /// Size of the event-loop pool these options ask for.
    pub fn num_event_loops(&self) -> usize {
        let mut n = 1;
        if self.multicore {
            n = platform::num_cpus();
        }
        if self.num_event_loop > 0 {
            n = self.num_event_loop;
        }
        n.min(EVENT_LOOP_INDEX_MAX)
    }
}

fn normalize_buffer_cap(cap: usize) -> usize {
    match cap {
        0 => MAX_STREAM_BUFFER_CAP,
        c if c <= DEFAULT_BUFFER_SIZE => DEFAULT_BUFFER_SIZE,
        c => c.next_power_of_two(),
    }
}

/// A function setting one field of [`Options`].
pub type Opt = Box<dyn FnOnce(&mut Options) + Send>;

/// Folds `opts` over the default options, in order.
pub fn load_options(opts: Vec<Opt>) -> Options {
    let mut options = Options::default();
    for opt in opts {
        opt(&mut options);
    }
    options
}

/// Replaces every field at once.
pub fn with_options(options: Options) -> Opt {
    Box::new(move |opts| *opts = options)
}

pub fn with_multicore(multicore: bool) -> Opt {
    Box::new(move |opts| opts.multicore = multicore)
}

pub fn with_lock_os_thread(lock_os_thread: bool) -> Opt {
    Box::new(move |opts| opts.lock_os_thread = lock_os_thread)
}

pub fn with_read_buffer_cap(read_buffer_cap: usize) -> Opt {
    Box::new(move |opts| opts.read_buffer_cap = read_buffer_cap)
}

pub fn with_write_buffer_cap(write_buffer_cap: usize) -> Opt {
    Box::new(move |opts| opts.write_buffer_cap = write_buffer_cap)
}

pub fn with_load_balancing(lb: LoadBalancing) -> Opt {
    Box::new(move |opts| opts.lb = lb)
}

pub fn with_num_event_loop(num_event_loop: usize) -> Opt {
    Box::new(move |opts| opts.num_event_loop = num_event_loop)
}

pub fn with_reuse_port(reuse_port: bool) -> Opt {
    Box::new(move |opts| opts.reuse_port = reuse_port)
}

pub fn with_reuse_addr(reuse_addr: bool) -> Opt {
    Box::new(move |opts| opts.reuse_addr = reuse_addr)
}

pub fn with_tcp_keep_alive(tcp_keep_alive: Duration) -> Opt {
    Box::new(move |opts| opts.tcp_keep_alive = tcp_keep_alive)
}

pub fn with_tcp_keep_interval(tcp_keep_interval: Duration) -> Opt {
    Box::new(move |opts| opts.tcp_keep_interval = tcp_keep_interval)
}

pub fn with_tcp_keep_count(tcp_keep_count: u32) -> Opt {
    Box::new(move |opts| opts.tcp_keep_count = tcp_keep_count)
}

pub fn with_tcp_no_delay(tcp_no_delay: TcpSocketOpt) -> Opt {
    Box::new(move |opts| opts.tcp_no_delay = tcp_no_delay)
}

pub fn with_socket_recv_buffer(recv_buf: usize) -> Opt {
    Box::new(move |opts| opts.socket_recv_buffer = recv_buf)
}

pub fn with_socket_send_buffer(send_buf: usize) -> Opt {
    Box::new(move |opts| opts.socket_send_buffer = send_buf)
}

pub fn with_ticker(ticker: bool) -> Opt {
    Box::new(move |opts| opts.ticker = ticker)
}

pub fn with_log_path(file_name: impl Into<String>) -> Opt {
    let file_name = file_name.into();
    Box::new(move |opts| opts.log_path = file_name)
}

pub fn with_log_level(level: LevelFilter) -> Opt {
    Box::new(move |opts| opts.log_level = level)
}

pub fn with_logger(logger: Arc<dyn log::Log>) -> Opt {
    Box::new(move |opts| opts.logger = Some(logger))
}

pub fn with_multicast_interface_index(idx: u32) -> Opt {
    Box::new(move |opts| opts.multicast_interface_index = idx)
}

pub fn with_bind_to_device(iface: impl Into<String>) -> Opt {
    let iface = iface.into();
    Box::new(move |opts| opts.bind_to_device = iface)
}

pub fn with_edge_triggered_io(et: bool) -> Opt {
    Box::new(move |opts| opts.edge_triggered_io = et)
}

pub fn with_edge_triggered_io_chunk(chunk: usize) -> Opt {
    Box::new(move |opts| opts.edge_triggered_io_chunk = chunk)
}

pub fn with_registry(registry: Registry) -> Opt {
    Box::new(move |opts| opts.registry = Some(registry))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalized(opts: Vec<Opt>, addrs: &[&str]) -> Options {
        let mut options = load_options(opts);
        options.normalize(addrs).unwrap();
        options
    }

    #[test]
    fn later_options_win() {
        let opts = load_options(vec![
            with_num_event_loop(2),
            with_reuse_addr(true),
            with_num_event_loop(4),
        ]);
        assert_eq!(opts.num_event_loop, 4);
        assert!(opts.reuse_addr);

        let base = Options {
            ticker: true,
            ..Options::default()
        };
        let opts = load_options(vec![with_multicore(true), with_options(base)]);
        assert!(opts.ticker);
        assert!(!opts.multicore);
    }

    #[test]
    fn buffer_caps() {
        assert_eq!(normalize_buffer_cap(0), MAX_STREAM_BUFFER_CAP);
        assert_eq!(normalize_buffer_cap(100), DEFAULT_BUFFER_SIZE);
        assert_eq!(normalize_buffer_cap(DEFAULT_BUFFER_SIZE), DEFAULT_BUFFER_SIZE);
        assert_eq!(normalize_buffer_cap(70_000), 131_072);
        assert_eq!(normalize_buffer_cap(65_536), 65_536);

        let opts = normalized(
            vec![with_read_buffer_cap(70_000), with_write_buffer_cap(100)],
            &["tcp://127.0.0.1:9000"],
        );
        assert_eq!(opts.read_buffer_cap, 131_072);
        assert_eq!(opts.write_buffer_cap, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn edge_triggered_chunk() {
        let opts = normalized(vec![with_edge_triggered_io_chunk(3000)], &["tcp://:9000"]);
        assert!(opts.edge_triggered_io);
        assert_eq!(opts.edge_triggered_io_chunk, 4096);

        let opts = normalized(vec![with_edge_triggered_io(true)], &["tcp://:9000"]);
        assert_eq!(opts.edge_triggered_io_chunk, DEFAULT_EDGE_TRIGGERED_IO_CHUNK);

        let opts = normalized(vec![], &["tcp://:9000"]);
        assert!(!opts.edge_triggered_io);
        assert_eq!(opts.edge_triggered_io_chunk, 0);
    }

    #[test]
    fn udp_forces_reuse_port_without_edge_triggering() {
        let opts = normalized(
            vec![with_reuse_port(false), with_edge_triggered_io(true)],
            &["tcp://:9000", "udp://:9001"],
        );
        assert!(opts.reuse_port);
        assert!(!opts.edge_triggered_io);
    }

    #[test]
    fn unix_disables_reuse_port() {
        let opts = normalized(vec![with_reuse_port(true)], &["unix:///tmp/evnet.sock"]);
        assert!(!opts.reuse_port);

        let opts = normalized(vec![with_reuse_port(true)], &["tcp://:9000"]);
        assert!(opts.reuse_port);
    }

    #[test]
    fn too_many_locked_loops() {
        let mut opts = load_options(vec![
            with_lock_os_thread(true),
            with_num_event_loop(MAX_LOCKED_EVENT_LOOPS + 1),
        ]);
        assert_eq!(
            opts.normalize(&["tcp://:9000"]),
            Err(Error::TooManyEventLoopThreads)
        );

        let mut opts = load_options(vec![with_num_event_loop(MAX_LOCKED_EVENT_LOOPS + 1)]);
        assert!(opts.normalize(&["tcp://:9000"]).is_ok());
    }

    #[test]
    fn bad_address_aborts_normalization() {
        let mut opts = Options::default();
        assert_eq!(
            opts.normalize(&["tcp://:9000", "ftp://host"]),
            Err(Error::UnsupportedProtocol)
        );
    }

    #[test]
    fn loop_count() {
        assert_eq!(Options::default().num_event_loops(), 1);
        let opts = load_options(vec![with_multicore(true)]);
        assert_eq!(opts.num_event_loops(), platform::num_cpus().min(EVENT_LOOP_INDEX_MAX));
        let opts = load_options(vec![with_multicore(true), with_num_event_loop(3)]);
        assert_eq!(opts.num_event_loops(), 3);
        let opts = load_options(vec![with_num_event_loop(1000)]);
        assert_eq!(opts.num_event_loops(), EVENT_LOOP_INDEX_MAX);
    }
}
