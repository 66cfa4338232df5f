//! Callbacks driven by the event loops.

use std::time::Duration;

use crate::conn::Conn;
use crate::engine::Engine;
use crate::errors::Error;

/// What the loop does after a callback returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Continue.
    None,
    /// Close the connection the callback was invoked for.
    Close,
    /// Shut the whole engine down.
    Shutdown,
}

impl Default for Action {
    fn default() -> Self {
        Action::None
    }
}

/// Connection lifecycle hooks.
///
/// A connection goes through `on_open`, any number of `on_traffic` and one
/// `on_close`, all on the thread of the loop owning it. One handler is shared
/// by every loop, so handlers that keep state use interior mutability.
///
/// Every method has a no-op default.
pub trait EventHandler: Send + Sync + 'static {
    /// Called once the engine is ready to accept connections, before any
    /// loop starts. Returning [`Action::Shutdown`] ends the run right away.
    fn on_boot(&self, engine: Engine) -> Action {
        let _ = engine;
        Action::None
    }

    /// Called once after every loop has exited.
    fn on_shutdown(&self, engine: Engine) {
        let _ = engine;
    }

    /// A connection was opened. The returned bytes, if any, are written to it
    /// before any traffic is read.
    fn on_open(&self, conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        let _ = conn;
        (None, Action::None)
    }

    /// A connection was closed; `err` is the reason, `None` for a clean close.
    ///
    /// The returned action may only be [`Action::Shutdown`] to be effective.
    fn on_close(&self, conn: &mut Conn, err: Option<&Error>) -> Action {
        let _ = (conn, err);
        Action::None
    }

    /// Data arrived, or the connection was woken up.
    fn on_traffic(&self, conn: &mut Conn) -> Action {
        let _ = conn;
        Action::None
    }

    /// Fires periodically on the first loop when the ticker is enabled;
    /// returns the delay until the next tick.
    fn on_tick(&self) -> (Duration, Action) {
        (Duration::from_secs(1), Action::None)
    }
}
