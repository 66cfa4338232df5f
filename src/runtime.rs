//! Blocking executor for the one-shot results the engine hands out.

use std::future::Future;

use futures_channel::oneshot;
use futures_executor::LocalPool;

use crate::engine::RegisteredResult;
use crate::errors::Error;

/// Drives futures to completion on the calling thread.
pub trait Runtime {
    /// Run a future and wait for its result.
    fn exec<Fut>(&mut self, fut: Fut) -> Fut::Output
    where
        Fut: Future;
}

impl<T: ?Sized> Runtime for &mut T
where
    T: Runtime,
{
    #[inline]
    fn exec<Fut>(&mut self, fut: Fut) -> Fut::Output
    where
        Fut: Future,
    {
        (**self).exec(fut)
    }
}

impl<T: ?Sized> Runtime for Box<T>
where
    T: Runtime,
{
    #[inline]
    fn exec<Fut>(&mut self, fut: Fut) -> Fut::Output
    where
        Fut: Future,
    {
        (**self).exec(fut)
    }
}

/// A [`Runtime`] backed by a single-threaded pool.
pub fn default() -> impl Runtime {
    DefaultRuntime {
        pool: LocalPool::new(),
    }
}

struct DefaultRuntime {
    pool: LocalPool,
}

impl Runtime for DefaultRuntime {
    #[inline]
    fn exec<Fut>(&mut self, fut: Fut) -> Fut::Output
    where
        Fut: Future,
    {
        self.pool.run_until(fut)
    }
}

/// Waits for a registration to complete.
///
/// A result dropped unanswered means the owning loop went away, reported as
/// [`Error::EngineInShutdown`].
pub fn wait_registered(rx: oneshot::Receiver<RegisteredResult>) -> RegisteredResult {
    let res: Result<RegisteredResult, oneshot::Canceled> = default().exec(rx);
    res.unwrap_or(Err(Error::EngineInShutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfd::Gfd;

    #[test]
    fn exec_runs_to_completion() {
        let mut rt = default();
        assert_eq!(rt.exec(async { 40 + 2 }), 42);
    }

    #[test]
    fn dropped_sender_means_shutdown() {
        let (tx, rx) = oneshot::channel::<RegisteredResult>();
        drop(tx);
        assert_eq!(wait_registered(rx), Err(Error::EngineInShutdown));
    }

    #[test]
    fn delivered_result() {
        let gfd = Gfd::new(7, 1, 0, 3);
        let (tx, rx) = oneshot::channel();
        tx.send(Ok(gfd)).unwrap();
        assert_eq!(wait_registered(rx), Ok(gfd));
    }
}
