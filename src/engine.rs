//! Engine lifecycle and registration.
//!
//! An [`Engine`] is the handle handlers and callers use to reach a running
//! server: it validates, counts connections, registers new connections into
//! the loop pool, hands out listener descriptors and stops the whole thing.
//! The zero value (`Engine::default()`) owns nothing; every operation on it
//! fails with [`Error::EmptyEngine`].

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures_channel::oneshot;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::address::{parse_proto_addr, NetAddr};
use crate::balancer::{new_balancer, LoadBalancer};
use crate::conn::RawStream;
use crate::context::Context;
use crate::driver::{self, Awakener, Events, PollOpt, Poller, Ready};
use crate::errors::{Error, Result};
use crate::eventloop::{Command, EventLoop, EventLoopHandle};
use crate::gfd::Gfd;
use crate::handler::{Action, EventHandler};
use crate::listener::Listener;
use crate::options::Options;

/// How often [`Engine::stop`] checks whether the loops have drained.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of a registration: the identifier of the new connection.
pub type RegisteredResult = Result<Gfd>;

/// What [`Engine::register`] should bring into the loop pool.
#[derive(Debug)]
pub enum Registration {
    /// A socket connected by the caller.
    Stream(RawStream),
    /// An address to connect to, in `scheme://host[:port]` or `unix://path`
    /// form.
    Addr(String),
}

struct EngineInner {
    listeners: Vec<Arc<Listener>>,
    balancer: Box<dyn LoadBalancer>,
    in_shutdown: AtomicBool,
    shut_down: AtomicBool,
    acceptor: Option<Arc<Awakener>>,
    error: Mutex<Option<Error>>,
}

/// Handle to a running engine. Clones refer to the same engine.
#[derive(Clone, Default)]
pub struct Engine {
    inner: Option<Arc<EngineInner>>,
}

impl Engine {
    fn checked(&self) -> Result<&EngineInner> {
        let inner = match &self.inner {
            Some(inner) if !inner.listeners.is_empty() => inner.as_ref(),
            _ => return Err(Error::EmptyEngine),
        };
        if inner.in_shutdown.load(Ordering::Acquire) {
            return Err(Error::EngineInShutdown);
        }
        Ok(inner)
    }

    /// Fails with [`Error::EmptyEngine`] for an engine without listeners and
    /// with [`Error::EngineInShutdown`] once shutdown has begun.
    pub fn validate(&self) -> Result<()> {
        self.checked().map(|_| ())
    }

    /// Total number of connections across all loops, or `-1` when the engine
    /// does not validate.
    pub fn count_connections(&self) -> i32 {
        match self.checked() {
            Ok(inner) => {
                let mut n = 0;
                inner.balancer.iterate(&mut |_, el| {
                    n += el.count_conn();
                    true
                });
                n
            }
            Err(_) => -1,
        }
    }

    /// Hands a connection to a load-balanced loop.
    ///
    /// The receiver resolves once the owning loop has opened the connection
    /// and run `on_open` for it.
    pub fn register(&self, req: Registration) -> Result<oneshot::Receiver<RegisteredResult>> {
        let inner = self.checked()?;
        match req {
            Registration::Stream(stream) => {
                let peer = stream.peer_addr().ok();
                let el = inner.balancer.next(peer.as_ref()).ok_or(Error::EmptyEngine)?;
                el.enroll(stream)
            }
            Registration::Addr(addr) => {
                if addr.is_empty() {
                    return Err(Error::InvalidNetworkAddress);
                }
                parse_proto_addr(&addr)?;
                let el = inner.balancer.next(None).ok_or(Error::EmptyEngine)?;
                el.register(&addr)
            }
        }
    }

    /// Duplicates the descriptor of the only listener.
    ///
    /// Engines bound to more than one address must use
    /// [`dup_listener`](Engine::dup_listener).
    pub fn dup(&self) -> Result<RawFd> {
        let inner = self.checked()?;
        if inner.listeners.len() != 1 {
            return Err(Error::UnsupportedOp);
        }
        inner.listeners[0].dup()
    }

    /// Duplicates the descriptor of the listener bound to `addr` over
    /// `protocol`.
    pub fn dup_listener(&self, protocol: &str, addr: &str) -> Result<RawFd> {
        let inner = self.checked()?;
        inner
            .listeners
            .iter()
            .find(|ln| ln.protocol().as_str() == protocol && ln.address() == addr)
            .ok_or(Error::InvalidNetworkAddress)?
            .dup()
    }

    /// Shuts the engine down and waits for every loop to exit.
    ///
    /// Stopping an engine that is already stopping or stopped just waits.
    /// When `ctx` is canceled or expires first, its error is returned and the
    /// shutdown keeps going in the background.
    pub fn stop(&self, ctx: &Context) -> Result<()> {
        match self.validate() {
            Ok(()) => self.request_shutdown(Error::EngineShutdown),
            Err(Error::EngineInShutdown) => {}
            Err(e) => return Err(e),
        }
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return Err(Error::EmptyEngine),
        };
        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            if inner.shut_down.load(Ordering::Acquire) {
                return Ok(());
            }
            ctx.wait(SHUTDOWN_POLL_INTERVAL);
        }
    }

    /// Starts the shutdown once; `err` is what the run reports, unless an
    /// earlier failure was recorded.
    pub(crate) fn request_shutdown(&self, err: Error) {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return,
        };
        if inner.in_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("engine shutdown requested: {}", err);
        inner.error.lock().get_or_insert(err);
        for el in inner.balancer.loops() {
            el.shutdown();
        }
        if let Some(acceptor) = &inner.acceptor {
            if let Err(e) = acceptor.wakeup() {
                warn!("failed to wake the acceptor: {}", e);
            }
        }
    }

    /// Whether both handles refer to the same engine.
    pub(crate) fn same(&self, other: &Engine) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Whether every loop has exited and the listeners are closed.
    pub(crate) fn is_shut_down(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(false, |inner| inner.shut_down.load(Ordering::Acquire))
    }

    fn in_shutdown(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(true, |inner| inner.in_shutdown.load(Ordering::Acquire))
    }

    /// Closes the listeners and publishes the stopped state.
    fn finish(&self) {
        if let Some(inner) = &self.inner {
            for ln in &inner.listeners {
                ln.close();
            }
            inner.in_shutdown.store(true, Ordering::Release);
            inner.shut_down.store(true, Ordering::Release);
        }
    }

    fn take_error(&self) -> Option<Error> {
        self.inner.as_ref().and_then(|inner| inner.error.lock().take())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => f.write_str("Engine(empty)"),
            Some(inner) => f
                .debug_struct("Engine")
                .field("listeners", &inner.listeners)
                .field("loops", &inner.balancer.len())
                .field("in_shutdown", &inner.in_shutdown.load(Ordering::Relaxed))
                .field("shut_down", &inner.shut_down.load(Ordering::Relaxed))
                .finish(),
        }
    }
}

/// Runs an engine over `listeners` until it is shut down.
///
/// `opts` must already be normalized against `addrs`.
pub(crate) fn run(
    handler: Arc<dyn EventHandler>,
    listeners: Vec<Listener>,
    opts: Options,
    addrs: &[&str],
) -> Result<()> {
    let opts = Arc::new(opts);
    let n = opts.num_event_loops();
    // every loop carries its own listeners when the kernel shards the port
    let per_loop = n == 1 || opts.reuse_port;

    let listeners: Vec<Arc<Listener>> = listeners.into_iter().map(Arc::new).collect();
    let mut balancer = new_balancer(opts.lb);
    for i in 0..n {
        balancer.register(EventLoopHandle::new(i, opts.clone())?);
    }
    let acceptor = if per_loop {
        None
    } else {
        Some(Arc::new(Awakener::new()?))
    };
    let engine = Engine {
        inner: Some(Arc::new(EngineInner {
            listeners: listeners.clone(),
            balancer,
            in_shutdown: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            acceptor: acceptor.clone(),
            error: Mutex::new(None),
        })),
    };

    if handler.on_boot(engine.clone()) == Action::Shutdown {
        info!("engine shut down from on_boot");
        engine.finish();
        return Ok(());
    }

    if let Some(registry) = &opts.registry {
        for addr in addrs {
            registry.insert(addr, engine.clone());
        }
    }
    info!("engine is listening on {:?} with {} event-loop(s)", addrs, n);

    let res = start(&engine, &handler, &opts, &listeners, acceptor, per_loop);
    if let Err(ref e) = res {
        error!("engine failed to start: {}", e);
        engine.request_shutdown(Error::EngineShutdown);
    }
    let outcome = match res {
        Ok(threads) => {
            for t in threads {
                let name = t.thread().name().unwrap_or("").to_owned();
                if t.join().is_err() {
                    error!("thread {} panicked", name);
                }
            }
            match engine.take_error() {
                None | Some(Error::EngineShutdown) => Ok(()),
                Some(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    };

    handler.on_shutdown(engine.clone());
    engine.finish();
    if let Some(registry) = &opts.registry {
        for addr in addrs {
            registry.remove_if_same(addr, &engine);
        }
    }
    info!("engine is stopped");
    outcome
}

/// Builds every loop, then spawns their threads and the acceptor.
fn start(
    engine: &Engine,
    handler: &Arc<dyn EventHandler>,
    opts: &Options,
    listeners: &[Arc<Listener>],
    acceptor: Option<Arc<Awakener>>,
    per_loop: bool,
) -> Result<Vec<thread::JoinHandle<()>>> {
    let inner = engine.inner.as_ref().ok_or(Error::EmptyEngine)?;

    let mut loops = Vec::with_capacity(inner.balancer.len());
    for (i, handle) in inner.balancer.loops().iter().enumerate() {
        let lns = if !per_loop {
            Vec::new()
        } else if i == 0 {
            listeners.to_vec()
        } else {
            // unix paths cannot be shared, their connections stay on loop 0
            listeners
                .iter()
                .filter(|ln| !ln.protocol().is_unix())
                .map(|ln| ln.rebind(opts).map(Arc::new))
                .collect::<Result<Vec<_>>>()?
        };
        loops.push(EventLoop::new(
            handle.clone(),
            engine.clone(),
            handler.clone(),
            lns,
        )?);
    }

    let mut threads = Vec::with_capacity(loops.len() + 1);
    let spawned = spawn_all(engine, loops, acceptor, listeners, &mut threads);
    if let Err(e) = spawned {
        // stop whatever already runs before reporting
        engine.request_shutdown(Error::EngineShutdown);
        for t in threads {
            let _ = t.join();
        }
        return Err(e);
    }
    Ok(threads)
}

fn spawn_all(
    engine: &Engine,
    loops: Vec<EventLoop>,
    acceptor: Option<Arc<Awakener>>,
    listeners: &[Arc<Listener>],
    threads: &mut Vec<thread::JoinHandle<()>>,
) -> Result<()> {
    for (i, el) in loops.into_iter().enumerate() {
        let engine = engine.clone();
        let t = thread::Builder::new()
            .name(format!("evnet-loop-{}", i))
            .spawn(move || {
                if let Err(e) = el.run() {
                    engine.request_shutdown(e);
                }
            })?;
        threads.push(t);
    }

    if let Some(awakener) = acceptor {
        let engine = engine.clone();
        let listeners = listeners.to_vec();
        let t = thread::Builder::new()
            .name("evnet-acceptor".to_owned())
            .spawn(move || {
                if let Err(e) = accept_loop(&engine, &listeners, &awakener) {
                    error!("acceptor is exiting due to error: {}", e);
                    engine.request_shutdown(e);
                }
            })?;
        threads.push(t);
    }
    Ok(())
}

/// Accepts stream connections and hands each to the load-balanced loop.
fn accept_loop(engine: &Engine, listeners: &[Arc<Listener>], awakener: &Awakener) -> Result<()> {
    let poller = Poller::new()?;
    poller.register(
        awakener.reader_fd(),
        driver::AWAKENER_TOKEN,
        Ready::readable(),
        PollOpt::level(),
    )?;
    for ln in listeners {
        poller.register(
            ln.fd(),
            driver::Token(ln.fd() as usize),
            Ready::readable(),
            PollOpt::level(),
        )?;
    }

    let mut events = Events::with_capacity(listeners.len() + 1);
    loop {
        if engine.in_shutdown() {
            debug!("acceptor exits");
            return Ok(());
        }
        poller.wait(&mut events, None)?;
        for i in 0..events.len() {
            let event = match events.get(i) {
                Some(event) => event,
                None => continue,
            };
            if event.token() == driver::AWAKENER_TOKEN {
                awakener.cleanup();
                continue;
            }
            if let Some(ln) = listeners.iter().find(|ln| ln.fd() as usize == event.token().0) {
                dispatch(engine, ln);
            }
        }
    }
}

fn dispatch(engine: &Engine, ln: &Listener) {
    let inner = match engine.checked() {
        Ok(inner) => inner,
        Err(_) => return,
    };
    loop {
        let stream = match ln.accept() {
            Ok(Some(stream)) => stream,
            Ok(None) => return,
            Err(e) => {
                warn!("acceptor failed on {:?}: {}", ln, e);
                return;
            }
        };
        let peer: Option<NetAddr> = stream.peer_addr().ok();
        let el = match inner.balancer.next(peer.as_ref()) {
            Some(el) => el,
            None => return,
        };
        if let Err(e) = el.send(Command::Enroll {
            stream,
            reply: None,
        }) {
            debug!("event-loop({}) refused connection: {}", el.index(), e);
        }
    }
}

#[cfg(test)]
pub(crate) fn finished_engine() -> Engine {
    use crate::address::Protocol;
    use crate::balancer::LoadBalancing;

    let opts = crate::options::load_options(Vec::new());
    let ln = Listener::bind(Protocol::Tcp, "127.0.0.1:0", &opts).unwrap();
    let engine = Engine {
        inner: Some(Arc::new(EngineInner {
            listeners: vec![Arc::new(ln)],
            balancer: new_balancer(LoadBalancing::RoundRobin),
            in_shutdown: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            acceptor: None,
            error: Mutex::new(None),
        })),
    };
    engine.finish();
    engine
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_engine_gates_everything() {
        let engine = Engine::default();
        assert_eq!(engine.validate(), Err(Error::EmptyEngine));
        assert_eq!(engine.count_connections(), -1);
        assert_eq!(
            engine
                .register(Registration::Addr("tcp://127.0.0.1:1".into()))
                .unwrap_err(),
            Error::EmptyEngine
        );
        assert_eq!(engine.dup(), Err(Error::EmptyEngine));
        assert_eq!(engine.dup_listener("tcp", "127.0.0.1:1"), Err(Error::EmptyEngine));
        assert_eq!(engine.stop(&Context::background()), Err(Error::EmptyEngine));
    }

    #[test]
    fn empty_engines_are_never_the_same() {
        let a = Engine::default();
        assert!(!a.same(&a.clone()));
        a.request_shutdown(Error::EngineShutdown);
        assert_eq!(a.validate(), Err(Error::EmptyEngine));
    }

    #[test]
    fn finished_engine_stops_at_once() {
        let engine = finished_engine();
        assert!(engine.is_shut_down());
        assert_eq!(engine.validate(), Err(Error::EngineInShutdown));
        assert_eq!(engine.stop(&Context::background()), Ok(()));
        assert!(!Engine::default().is_shut_down());
    }
}
