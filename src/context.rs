//! Cancellation and deadlines for blocking calls such as [`Engine::stop`].
//!
//! [`Engine::stop`]: crate::Engine::stop

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::errors::Error;

struct Inner {
    canceled: Mutex<bool>,
    cond: Condvar,
    deadline: Option<Instant>,
}

/// A cancellation signal with an optional deadline.
///
/// Clones observe the same signal.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Context {
        Context::new(None)
    }

    /// A context canceled only through [`Context::cancel`].
    pub fn with_cancel() -> Context {
        Context::new(None)
    }

    /// A context whose deadline is `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Context {
        Context::new(Some(Instant::now() + timeout))
    }

    /// A context expiring at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Context {
        Context::new(Some(deadline))
    }

    fn new(deadline: Option<Instant>) -> Context {
        Context {
            inner: Arc::new(Inner {
                canceled: Mutex::new(false),
                cond: Condvar::new(),
                deadline,
            }),
        }
    }

    /// Cancels the context and wakes every waiter.
    pub fn cancel(&self) {
        *self.inner.canceled.lock() = true;
        self.inner.cond.notify_all();
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// `Some(Canceled)` or `Some(DeadlineExceeded)` once the context is done.
    pub fn err(&self) -> Option<Error> {
        if *self.inner.canceled.lock() {
            return Some(Error::Canceled);
        }
        match self.inner.deadline {
            Some(d) if Instant::now() >= d => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Blocks for at most `dur`, returning early when the context is
    /// canceled or its deadline passes.
    pub(crate) fn wait(&self, dur: Duration) {
        let mut until = Instant::now() + dur;
        if let Some(d) = self.inner.deadline {
            until = until.min(d);
        }
        let mut canceled = self.inner.canceled.lock();
        while !*canceled {
            if self.inner.cond.wait_until(&mut canceled, until).timed_out() {
                break;
            }
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}
