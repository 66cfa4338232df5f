//! Address-keyed lookup of running engines.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;
use crate::engine::Engine;
use crate::errors::{Error, Result};

/// Maps the protocol-prefixed address strings an engine was started with to
/// that engine.
///
/// A registry is passed to [`run`](crate::run) or [`rotate`](crate::rotate)
/// through [`with_registry`](crate::options::with_registry); each address of
/// the engine is inserted once its loops are about to start and removed once
/// it has shut down. Clones share the same map.
#[derive(Clone, Default)]
pub struct Registry {
    engines: Arc<Mutex<HashMap<String, Engine>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Registry {
        Registry::default()
    }

    pub(crate) fn insert(&self, addr: &str, engine: Engine) {
        self.engines.lock().insert(addr.to_owned(), engine);
    }

    /// The engine serving `addr`, if one is registered.
    pub fn lookup(&self, addr: &str) -> Option<Engine> {
        self.engines.lock().get(addr).cloned()
    }

    /// Removes `addr`, returning the engine it mapped to.
    pub fn remove(&self, addr: &str) -> Option<Engine> {
        self.engines.lock().remove(addr)
    }

    /// Removes `addr` unless a different engine took it over meanwhile.
    pub(crate) fn remove_if_same(&self, addr: &str, engine: &Engine) {
        let mut engines = self.engines.lock();
        if engines.get(addr).map_or(false, |e| e.same(engine)) {
            engines.remove(addr);
        }
    }

    /// Number of registered addresses.
    pub fn len(&self) -> usize {
        self.engines.lock().len()
    }

    /// Whether no address is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the engine registered under `addr`, as [`Engine::stop`] does.
    ///
    /// An unknown address, or one whose engine has already shut down, yields
    /// [`Error::EngineInShutdown`]. The entry is removed when the engine
    /// stopped cleanly.
    pub fn stop(&self, ctx: &Context, addr: &str) -> Result<()> {
        let engine = self.lookup(addr).ok_or(Error::EngineInShutdown)?;
        if engine.is_shut_down() {
            self.remove_if_same(addr, &engine);
            return Err(Error::EngineInShutdown);
        }
        engine.stop(ctx)?;
        self.remove_if_same(addr, &engine);
        Ok(())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let engines = self.engines.lock();
        f.debug_set().entries(engines.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_address() {
        let registry = Registry::new();
        assert!(registry.is_empty());
        assert_eq!(
            registry.stop(&Context::background(), "tcp://:1"),
            Err(Error::EngineInShutdown)
        );
    }

    #[test]
    fn remove_only_same_engine() {
        let registry = Registry::new();
        let engine = Engine::default();
        registry.insert("tcp://:9000", engine.clone());
        assert!(registry.lookup("tcp://:9000").is_some());

        // zero-value engines are never the same as one another
        registry.remove_if_same("tcp://:9000", &Engine::default());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("tcp://:9000").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn stopping_a_finished_engine() {
        let registry = Registry::new();
        registry.insert("tcp://:9001", crate::engine::finished_engine());
        assert_eq!(
            registry.stop(&Context::background(), "tcp://:9001"),
            Err(Error::EngineInShutdown)
        );
        assert!(registry.is_empty());
    }
}
