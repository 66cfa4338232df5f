//! Event loops.
//!
//! Each loop runs on its own thread and exclusively owns the connections
//! enrolled in it. Other threads talk to a loop through its
//! [`EventLoopHandle`]: commands are appended to the loop's inbox and the
//! loop is woken up to process them. No other thread ever touches a
//! connection directly.

mod matrix;

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::io::{self, Write};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use futures_channel::oneshot;
use log::{debug, error, warn};
use parking_lot::Mutex;

use self::matrix::ConnMatrix;
use crate::conn::{dial, AsyncCallback, Conn, RawStream, Writer};
use crate::driver::{self, io as sys, Awakener, Events, PollOpt, Poller, Ready, Token};
use crate::engine::{Engine, RegisteredResult};
use crate::errors::{Error, Result};
use crate::gfd::Gfd;
use crate::handler::{Action, EventHandler};
use crate::listener::Listener;
use crate::options::Options;

const EVENTS_CAPACITY: usize = 1024;

/// A unit of work run on a loop; an error it returns is logged.
pub type Task = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

pub(crate) enum Command {
    Enroll {
        stream: RawStream,
        reply: Option<oneshot::Sender<RegisteredResult>>,
    },
    Write {
        gfd: Gfd,
        bufs: Vec<Vec<u8>>,
        callback: Option<AsyncCallback>,
    },
    Close {
        gfd: Gfd,
        callback: Option<AsyncCallback>,
    },
    Wake {
        gfd: Gfd,
        callback: Option<AsyncCallback>,
    },
    Execute(Task),
    Schedule {
        task: Task,
        delay: Duration,
    },
    Shutdown,
}

#[derive(Default)]
struct Inbox {
    queue: VecDeque<Command>,
    closed: bool,
}

struct Shared {
    index: usize,
    opts: Arc<Options>,
    inbox: Mutex<Inbox>,
    awakener: Awakener,
    conn_count: CachePadded<AtomicI32>,
}

/// Cross-thread handle of one event loop.
///
/// Everything submitted through a handle is executed later on the loop's own
/// thread, in submission order. Submitting to a loop that has exited fails
/// with [`Error::EngineInShutdown`].
#[derive(Clone)]
pub struct EventLoopHandle {
    shared: Arc<Shared>,
}

impl EventLoopHandle {
    pub(crate) fn new(index: usize, opts: Arc<Options>) -> io::Result<EventLoopHandle> {
        Ok(EventLoopHandle {
            shared: Arc::new(Shared {
                index,
                opts,
                inbox: Mutex::new(Inbox::default()),
                awakener: Awakener::new()?,
                conn_count: CachePadded::new(AtomicI32::new(0)),
            }),
        })
    }

    /// Position of the loop in the pool.
    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// Number of connections the loop currently owns.
    pub fn count_conn(&self) -> i32 {
        self.shared.conn_count.load(Ordering::Acquire)
    }

    pub(crate) fn add_conn(&self, delta: i32) {
        self.shared.conn_count.fetch_add(delta, Ordering::AcqRel);
    }

    pub(crate) fn options(&self) -> &Options {
        &self.shared.opts
    }

    pub(crate) fn send(&self, cmd: Command) -> Result<()> {
        {
            let mut inbox = self.shared.inbox.lock();
            if inbox.closed {
                return Err(Error::EngineInShutdown);
            }
            inbox.queue.push_back(cmd);
        }
        self.shared.awakener.wakeup()?;
        Ok(())
    }

    /// Hands an already connected socket to the loop.
    ///
    /// The receiver yields the identifier of the new connection once the
    /// loop has opened it.
    pub fn enroll(&self, stream: RawStream) -> Result<oneshot::Receiver<RegisteredResult>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Enroll {
            stream,
            reply: Some(tx),
        })?;
        Ok(rx)
    }

    /// Connects to `proto_addr` from the calling thread, then enrolls the
    /// connection in the loop.
    pub fn register(&self, proto_addr: &str) -> Result<oneshot::Receiver<RegisteredResult>> {
        let stream = dial(proto_addr)?;
        self.enroll(stream)
    }

    /// Runs `task` on the loop.
    pub fn execute(&self, task: Task) -> Result<()> {
        self.send(Command::Execute(task))
    }

    /// Runs `task` on the loop once `delay` has passed.
    pub fn schedule(&self, task: Task, delay: Duration) -> Result<()> {
        self.send(Command::Schedule { task, delay })
    }

    /// Writes `buf` to the connection `gfd`.
    pub fn async_write(
        &self,
        gfd: Gfd,
        buf: Vec<u8>,
        callback: Option<AsyncCallback>,
    ) -> Result<()> {
        self.async_writev(gfd, vec![buf], callback)
    }

    pub fn async_writev(
        &self,
        gfd: Gfd,
        bufs: Vec<Vec<u8>>,
        callback: Option<AsyncCallback>,
    ) -> Result<()> {
        self.send(Command::Write {
            gfd,
            bufs,
            callback,
        })
    }

    /// Calls `on_traffic` for `gfd` without new data.
    pub fn wake(&self, gfd: Gfd, callback: Option<AsyncCallback>) -> Result<()> {
        self.send(Command::Wake { gfd, callback })
    }

    /// Closes the connection `gfd`.
    pub fn close(&self, gfd: Gfd) -> Result<()> {
        self.close_with_callback(gfd, None)
    }

    pub fn close_with_callback(&self, gfd: Gfd, callback: Option<AsyncCallback>) -> Result<()> {
        self.send(Command::Close { gfd, callback })
    }

    pub(crate) fn shutdown(&self) {
        // a loop that already exited has nothing left to stop
        let _ = self.send(Command::Shutdown);
    }

    fn close_inbox(&self) -> VecDeque<Command> {
        let mut inbox = self.shared.inbox.lock();
        inbox.closed = true;
        mem::take(&mut inbox.queue)
    }
}

impl fmt::Debug for EventLoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopHandle")
            .field("index", &self.index())
            .field("conns", &self.count_conn())
            .finish()
    }
}

struct Timer {
    at: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // earliest first out of the max-heap
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

fn run_task(task: Task) {
    if let Err(e) = task() {
        warn!("task failed: {:#}", e);
    }
}

fn notify(callback: Option<AsyncCallback>, gfd: Gfd, res: Result<()>) {
    if let Some(callback) = callback {
        if let Err(e) = callback(gfd, res) {
            warn!("callback for {:?} failed: {:#}", gfd, e);
        }
    }
}

/// Fails a command that will never be processed.
fn reject(cmd: Command) {
    match cmd {
        Command::Enroll { reply, .. } => {
            if let Some(tx) = reply {
                let _ = tx.send(Err(Error::EngineInShutdown));
            }
        }
        Command::Write { gfd, callback, .. }
        | Command::Close { gfd, callback }
        | Command::Wake { gfd, callback } => notify(callback, gfd, Err(Error::EngineInShutdown)),
        Command::Execute(_) | Command::Schedule { .. } | Command::Shutdown => {}
    }
}

pub(crate) struct EventLoop {
    handle: EventLoopHandle,
    engine: Engine,
    handler: Arc<dyn EventHandler>,
    poller: Poller,
    events: Events,
    listeners: Vec<Arc<Listener>>,
    conns: ConnMatrix,
    buffer: Vec<u8>,
    edge_triggered: bool,
    chunk: usize,
    timers: BinaryHeap<Timer>,
    timer_seq: u64,
    ticker: Option<Instant>,
    pending: VecDeque<Gfd>,
}

impl EventLoop {
    pub(crate) fn new(
        handle: EventLoopHandle,
        engine: Engine,
        handler: Arc<dyn EventHandler>,
        listeners: Vec<Arc<Listener>>,
    ) -> io::Result<EventLoop> {
        let poller = Poller::new()?;
        poller.register(
            handle.shared.awakener.reader_fd(),
            driver::AWAKENER_TOKEN,
            Ready::readable(),
            PollOpt::level(),
        )?;
        for ln in &listeners {
            poller.register(ln.fd(), token(ln.fd()), Ready::readable(), PollOpt::level())?;
        }

        let opts = handle.options();
        let ticker = if opts.ticker && handle.index() == 0 {
            Some(Instant::now())
        } else {
            None
        };
        Ok(EventLoop {
            buffer: vec![0; opts.read_buffer_cap.max(1)],
            edge_triggered: opts.edge_triggered_io,
            chunk: opts.edge_triggered_io_chunk,
            handle,
            engine,
            handler,
            poller,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listeners,
            conns: ConnMatrix::default(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            ticker,
            pending: VecDeque::new(),
        })
    }

    fn index(&self) -> usize {
        self.handle.index()
    }

    /// Polls until shutdown is requested, then closes every connection and
    /// fails whatever is still queued.
    pub(crate) fn run(mut self) -> Result<()> {
        debug!("event-loop({}) is running", self.index());
        let res = self.poll();
        if let Err(ref e) = res {
            error!("event-loop({}) is exiting due to error: {}", self.index(), e);
        }
        self.close_all();
        for cmd in self.handle.close_inbox() {
            reject(cmd);
        }
        debug!("event-loop({}) exits", self.index());
        res
    }

    fn poll(&mut self) -> Result<()> {
        loop {
            let timeout = self.next_timeout();
            self.poller.wait(&mut self.events, timeout)?;

            for i in 0..self.events.len() {
                let event = match self.events.get(i) {
                    Some(event) => event,
                    None => continue,
                };
                if event.token() == driver::AWAKENER_TOKEN {
                    self.handle.shared.awakener.cleanup();
                    continue;
                }
                let fd = event.token().0 as RawFd;
                match self.listeners.iter().find(|ln| ln.fd() == fd).cloned() {
                    Some(ln) => self.accept(&ln),
                    None => self.process_io(fd, event.readiness()),
                }
            }

            if self.process_inbox() {
                return Ok(());
            }
            self.fire_timers();
            self.resume_pending();
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        if !self.pending.is_empty() {
            return Some(Duration::from_secs(0));
        }
        let next = match (self.timers.peek().map(|t| t.at), self.ticker) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        next.map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn accept(&mut self, ln: &Arc<Listener>) {
        if ln.is_datagram() {
            return self.read_datagrams(ln);
        }
        loop {
            match ln.accept() {
                Ok(Some(stream)) => self.enroll(stream, None),
                Ok(None) => return,
                Err(e) => {
                    warn!("event-loop({}) accept failed: {}", self.index(), e);
                    return;
                }
            }
        }
    }

    fn read_datagrams(&mut self, ln: &Arc<Listener>) {
        loop {
            let (n, peer) = match ln.recv_from(&mut self.buffer) {
                Ok(Some(res)) => res,
                Ok(None) => return,
                Err(e) => {
                    warn!("event-loop({}) recvfrom failed: {}", self.index(), e);
                    return;
                }
            };
            let mut conn = Conn::datagram(ln.clone(), peer, &self.buffer[..n], self.handle.clone());
            if self.handler.on_traffic(&mut conn) == Action::Shutdown {
                self.engine.request_shutdown(Error::EngineShutdown);
            }
        }
    }

    fn enroll(&mut self, stream: RawStream, reply: Option<oneshot::Sender<RegisteredResult>>) {
        let res = self.open(stream);
        if let Err(ref e) = res {
            debug!("event-loop({}) failed to open connection: {}", self.index(), e);
        }
        if let Some(tx) = reply {
            let _ = tx.send(res);
        }
    }

    fn open(&mut self, stream: RawStream) -> Result<Gfd> {
        stream.configure(self.handle.options())?;
        let fd = stream.as_raw_fd();
        let conn = Conn::new(stream, self.handle.clone());
        let gfd = self.conns.insert(conn, self.index(), fd)?;

        let (interest, opt) = if self.edge_triggered {
            (Ready::readable() | Ready::writable(), PollOpt::edge())
        } else {
            (Ready::readable(), PollOpt::level())
        };
        if let Err(e) = self.poller.register(fd, token(fd), interest, opt) {
            self.conns.remove(gfd);
            return Err(e.into());
        }
        self.handle.add_conn(1);

        if let Some(conn) = self.conns.get_mut(gfd) {
            let (out, action) = self.handler.on_open(conn);
            if let Some(out) = out {
                if let Err(e) = conn.write_all(&out) {
                    self.close_conn(gfd, Some(e.into()));
                    return Ok(gfd);
                }
            }
            self.settle(gfd, action);
        }
        Ok(gfd)
    }

    fn process_io(&mut self, fd: RawFd, ready: Ready) {
        let gfd = match self.conns.gfd_of(fd) {
            Some(gfd) => gfd,
            None => return,
        };
        if ready.is_writable() {
            self.write_out(gfd);
        }
        if ready.is_readable() || ready.is_hup() || ready.is_error() {
            self.read_in(gfd);
        }
    }

    fn write_out(&mut self, gfd: Gfd) {
        let res = match self.conns.get_mut(gfd) {
            Some(conn) => conn.flush_outbound(),
            None => return,
        };
        match res {
            Ok(()) => self.sync_interest(gfd),
            Err(e) => self.close_conn(gfd, Some(e.into())),
        }
    }

    fn read_in(&mut self, gfd: Gfd) {
        let limit = if self.edge_triggered {
            self.chunk
        } else {
            self.buffer.len()
        };
        let mut total = 0;
        loop {
            let conn = match self.conns.get_mut(gfd) {
                Some(conn) => conn,
                None => return,
            };
            match sys::read(gfd.fd(), &mut self.buffer) {
                // an empty datagram, not a hangup
                Ok(0) if conn.is_datagram() => {}
                Ok(0) => return self.close_conn(gfd, None),
                Ok(n) => {
                    conn.fill_inbound(&self.buffer[..n]);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return self.close_conn(gfd, Some(e.into())),
            }
            if total >= limit || !self.edge_triggered {
                if self.edge_triggered {
                    // the socket may hold more, continue next round
                    self.pending.push_back(gfd);
                }
                break;
            }
        }
        if total > 0 {
            self.traffic(gfd);
        }
    }

    fn traffic(&mut self, gfd: Gfd) {
        let action = match self.conns.get_mut(gfd) {
            Some(conn) => {
                let action = self.handler.on_traffic(conn);
                conn.compact_inbound();
                action
            }
            None => return,
        };
        self.settle(gfd, action);
    }

    /// Applies the action a callback returned for `gfd`.
    fn settle(&mut self, gfd: Gfd, action: Action) {
        match action {
            Action::Close => self.close_conn(gfd, None),
            Action::Shutdown => {
                self.engine.request_shutdown(Error::EngineShutdown);
                self.sync_interest(gfd);
            }
            Action::None => self.sync_interest(gfd),
        }
    }

    /// Watches writability exactly while output is buffered. Edge-triggered
    /// registrations watch both directions all along.
    fn sync_interest(&mut self, gfd: Gfd) {
        if self.edge_triggered {
            return;
        }
        let conn = match self.conns.get_mut(gfd) {
            Some(conn) => conn,
            None => return,
        };
        let want = conn.has_pending_output();
        if want == conn.watching_write {
            return;
        }
        let interest = if want {
            Ready::readable() | Ready::writable()
        } else {
            Ready::readable()
        };
        let fd = gfd.fd();
        match self
            .poller
            .reregister(fd, token(fd), interest, PollOpt::level())
        {
            Ok(()) => conn.watching_write = want,
            Err(e) => self.close_conn(gfd, Some(e.into())),
        }
    }

    fn close_conn(&mut self, gfd: Gfd, err: Option<Error>) {
        let mut conn = match self.conns.remove(gfd) {
            Some(conn) => conn,
            None => return,
        };
        if conn.has_pending_output() {
            let _ = conn.flush_outbound();
        }
        if let Err(e) = self.poller.deregister(gfd.fd()) {
            debug!("event-loop({}) deregister {:?}: {}", self.index(), gfd, e);
        }
        self.handle.add_conn(-1);
        if self.handler.on_close(&mut conn, err.as_ref()) == Action::Shutdown {
            self.engine.request_shutdown(Error::EngineShutdown);
        }
    }

    fn close_all(&mut self) {
        if !self.conns.is_empty() {
            debug!("event-loop({}) closing {} connection(s)", self.index(), self.conns.len());
        }
        for gfd in self.conns.gfds() {
            self.close_conn(gfd, None);
        }
    }

    /// Runs queued commands; `true` once shutdown was requested.
    fn process_inbox(&mut self) -> bool {
        let cmds = mem::take(&mut self.handle.shared.inbox.lock().queue);
        let mut exit = false;
        for cmd in cmds {
            if exit {
                reject(cmd);
                continue;
            }
            match cmd {
                Command::Enroll { stream, reply } => self.enroll(stream, reply),
                Command::Write {
                    gfd,
                    bufs,
                    callback,
                } => {
                    let res = self.write_bufs(gfd, &bufs);
                    notify(callback, gfd, res);
                }
                Command::Close { gfd, callback } => {
                    let res = if self.conns.get_mut(gfd).is_some() {
                        self.close_conn(gfd, None);
                        Ok(())
                    } else {
                        Err(Error::stale())
                    };
                    notify(callback, gfd, res);
                }
                Command::Wake { gfd, callback } => {
                    let res = if self.conns.get_mut(gfd).is_some() {
                        self.traffic(gfd);
                        Ok(())
                    } else {
                        Err(Error::stale())
                    };
                    notify(callback, gfd, res);
                }
                Command::Execute(task) => run_task(task),
                Command::Schedule { task, delay } => {
                    self.timer_seq += 1;
                    self.timers.push(Timer {
                        at: Instant::now() + delay,
                        seq: self.timer_seq,
                        task,
                    });
                }
                Command::Shutdown => {
                    debug!("event-loop({}) received shutdown", self.index());
                    exit = true;
                }
            }
        }
        exit
    }

    fn write_bufs(&mut self, gfd: Gfd, bufs: &[Vec<u8>]) -> Result<()> {
        let res = match self.conns.get_mut(gfd) {
            Some(conn) => {
                let slices: Vec<&[u8]> = bufs.iter().map(Vec::as_slice).collect();
                conn.writev(&slices)
            }
            None => {
                debug!("event-loop({}) dropped write to stale {:?}", self.index(), gfd);
                return Err(Error::stale());
            }
        };
        match res {
            Ok(_) => {
                self.sync_interest(gfd);
                Ok(())
            }
            Err(e) => {
                let kind = e.kind();
                self.close_conn(gfd, Some(e.into()));
                Err(io::Error::from(kind).into())
            }
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while self.timers.peek().map_or(false, |t| t.at <= now) {
            if let Some(timer) = self.timers.pop() {
                run_task(timer.task);
            }
        }

        if let Some(at) = self.ticker {
            if at <= now {
                let (delay, action) = self.handler.on_tick();
                if action == Action::Shutdown {
                    debug!("event-loop({}) ticker requested shutdown", self.index());
                    self.engine.request_shutdown(Error::EngineShutdown);
                    self.ticker = None;
                } else {
                    self.ticker = Some(Instant::now() + delay);
                }
            }
        }
    }

    fn resume_pending(&mut self) {
        let pending: Vec<Gfd> = self.pending.drain(..).collect();
        for gfd in pending {
            self.read_in(gfd);
        }
    }
}

fn token(fd: RawFd) -> Token {
    Token(fd as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn handle() -> EventLoopHandle {
        EventLoopHandle::new(0, Arc::new(Options::default())).unwrap()
    }

    #[test]
    fn closed_inbox_rejects_commands() {
        let handle = handle();
        handle.execute(Box::new(|| -> anyhow::Result<()> { Ok(()) })).unwrap();
        let queued = handle.close_inbox();
        assert_eq!(queued.len(), 1);
        assert_eq!(
            handle.execute(Box::new(|| -> anyhow::Result<()> { Ok(()) })).unwrap_err(),
            Error::EngineInShutdown
        );
    }

    #[test]
    fn rejected_work_sees_shutdown() {
        let handle = handle();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        handle
            .async_write(
                Gfd::new(10, 0, 0, 0),
                b"x".to_vec(),
                Some(Box::new(move |_, res: Result<()>| {
                    assert_eq!(res, Err(Error::EngineInShutdown));
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
            )
            .unwrap();
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut rx = handle.enroll(RawStream::Unix(a)).unwrap();
        for cmd in handle.close_inbox() {
            reject(cmd);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(rx.try_recv().unwrap(), Some(Err(Error::EngineInShutdown)));
    }

    #[test]
    fn timers_pop_earliest_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        for (seq, ms) in [(1u64, 30u64), (2, 10), (3, 20), (4, 10)].iter() {
            heap.push(Timer {
                at: now + Duration::from_millis(*ms),
                seq: *seq,
                task: Box::new(|| -> anyhow::Result<()> { Ok(()) }),
            });
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|t| t.seq)).collect();
        assert_eq!(order, vec![2, 4, 3, 1]);
    }
}
