//! # Event-driven networking over epoll
//!
//! `evnet` binds TCP, UDP and unix-domain listeners, spreads their
//! connections over a pool of event loops and drives an [`EventHandler`]
//! through each connection's lifecycle. Loops never share connections: other
//! threads name a connection by its [`Gfd`] and submit work to the owning
//! loop through its [`EventLoopHandle`].
//!
//! # Examples
//! __Echo server__
//! ```rust,no_run
//! use evnet::{options, Action, Conn, EventHandler, Reader};
//! use std::io::Write;
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn on_traffic(&self, conn: &mut Conn) -> Action {
//!         let data = conn.next(None).map(|b| b.to_vec()).unwrap_or_default();
//!         match conn.write_all(&data) {
//!             Ok(()) => Action::None,
//!             Err(_) => Action::Close,
//!         }
//!     }
//! }
//!
//! fn main() -> evnet::Result<()> {
//!     evnet::run(Echo, "tcp://127.0.0.1:9000", vec![options::with_multicore(true)])
//! }
//! ```
//! __Stopping by address__
//! ```rust,no_run
//! use evnet::{options, Context, Registry};
//! use std::time::Duration;
//!
//! # struct Noop;
//! # impl evnet::EventHandler for Noop {}
//! let registry = Registry::new();
//! let r = registry.clone();
//! let server = std::thread::spawn(move || {
//!     evnet::run(Noop, "tcp://127.0.0.1:9000", vec![options::with_registry(r)])
//! });
//! // ...
//! evnet::stop(&registry, &Context::with_timeout(Duration::from_secs(5)), "tcp://127.0.0.1:9000")?;
//! server.join().unwrap()?;
//! # Ok::<(), evnet::Error>(())
//! ```

#![warn(rust_2018_idioms, unreachable_pub, missing_debug_implementations)]
#![allow(clippy::type_complexity, clippy::new_without_default)]

use std::sync::Arc;

pub mod options;
pub mod runtime;

mod address;
mod balancer;
mod conn;
mod context;
mod driver;
mod engine;
mod errors;
mod eventloop;
mod gfd;
mod handler;
mod listener;
mod logging;
mod platform;
mod registry;

#[doc(inline)]
pub use crate::address::{parse_proto_addr, NetAddr, Protocol};
#[doc(inline)]
pub use crate::balancer::LoadBalancing;
#[doc(inline)]
pub use crate::conn::{AsyncCallback, Conn, RawStream, Reader, Socket, Writer};
#[doc(inline)]
pub use crate::context::Context;
#[doc(inline)]
pub use crate::engine::{Engine, RegisteredResult, Registration};
#[doc(inline)]
pub use crate::errors::{Error, Result};
#[doc(inline)]
pub use crate::eventloop::{EventLoopHandle, Task};
#[doc(inline)]
pub use crate::gfd::{Gfd, CONN_MATRIX_COLUMN_MAX, CONN_MATRIX_ROW_MAX, EVENT_LOOP_INDEX_MAX};
#[doc(inline)]
pub use crate::handler::{Action, EventHandler};
#[doc(inline)]
pub use crate::registry::Registry;

/// Serves `proto_addr` with `handler` until the engine is stopped.
///
/// Blocks the calling thread.
pub fn run<H: EventHandler>(handler: H, proto_addr: &str, opts: Vec<options::Opt>) -> Result<()> {
    rotate(handler, &[proto_addr], opts)
}

/// Serves every address in `addrs` from one engine.
///
/// Options are normalized and every listener is bound before the first loop
/// starts; when any bind fails nothing is left open.
pub fn rotate<H: EventHandler>(
    handler: H,
    addrs: &[&str],
    opts: Vec<options::Opt>,
) -> Result<()> {
    let mut opts = options::load_options(opts);
    logging::configure(&opts)?;

    let res = listener::create_listeners(addrs, &mut opts)
        .and_then(|listeners| engine::run(Arc::new(handler), listeners, opts, addrs));
    logging::cleanup();
    res
}

/// Stops the engine `registry` holds for `proto_addr`.
///
/// See [`Registry::stop`].
pub fn stop(registry: &Registry, ctx: &Context, proto_addr: &str) -> Result<()> {
    registry.stop(ctx, proto_addr)
}
