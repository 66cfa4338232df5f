//! Load balancing across the event-loop pool.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::address::NetAddr;
use crate::eventloop::EventLoopHandle;

/// Strategy picking the loop a new connection is handed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadBalancing {
    /// Cycle through the loops.
    RoundRobin,
    /// The loop with the fewest open connections.
    LeastConnections,
    /// Hash of the remote address, so one peer always lands on one loop.
    SourceAddrHash,
}

impl Default for LoadBalancing {
    fn default() -> Self {
        LoadBalancing::RoundRobin
    }
}

/// The pool of loops together with the strategy selecting among them.
pub(crate) trait LoadBalancer: fmt::Debug + Send + Sync {
    /// Adds a loop; loops are registered in index order.
    fn register(&mut self, el: EventLoopHandle);

    /// Picks the loop for a connection whose remote address is `key`.
    fn next(&self, key: Option<&NetAddr>) -> Option<&EventLoopHandle>;

    /// All loops in index order.
    fn loops(&self) -> &[EventLoopHandle];

    /// Calls `f` on every loop until it returns `false`.
    fn iterate(&self, f: &mut dyn FnMut(usize, &EventLoopHandle) -> bool) {
        for (i, el) in self.loops().iter().enumerate() {
            if !f(i, el) {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.loops().len()
    }
}

pub(crate) fn new_balancer(lb: LoadBalancing) -> Box<dyn LoadBalancer> {
    match lb {
        LoadBalancing::RoundRobin => Box::new(RoundRobin::default()),
        LoadBalancing::LeastConnections => Box::new(LeastConnections::default()),
        LoadBalancing::SourceAddrHash => Box::new(SourceAddrHash::default()),
    }
}

#[derive(Debug, Default)]
struct RoundRobin {
    next_index: AtomicUsize,
    loops: Vec<EventLoopHandle>,
}

impl RoundRobin {
    fn pick(&self) -> Option<&EventLoopHandle> {
        if self.loops.is_empty() {
            return None;
        }
        let i = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.loops.get(i % self.loops.len())
    }
}

impl LoadBalancer for RoundRobin {
    fn register(&mut self, el: EventLoopHandle) {
        self.loops.push(el);
    }

    fn next(&self, _: Option<&NetAddr>) -> Option<&EventLoopHandle> {
        self.pick()
    }

    fn loops(&self) -> &[EventLoopHandle] {
        &self.loops
    }
}

#[derive(Debug, Default)]
struct LeastConnections {
    loops: Vec<EventLoopHandle>,
}

impl LoadBalancer for LeastConnections {
    fn register(&mut self, el: EventLoopHandle) {
        self.loops.push(el);
    }

    // ties go to the lowest index
    fn next(&self, _: Option<&NetAddr>) -> Option<&EventLoopHandle> {
        self.loops.iter().min_by_key(|el| el.count_conn())
    }

    fn loops(&self) -> &[EventLoopHandle] {
        &self.loops
    }
}

#[derive(Debug, Default)]
struct SourceAddrHash {
    fallback: RoundRobin,
}

impl LoadBalancer for SourceAddrHash {
    fn register(&mut self, el: EventLoopHandle) {
        self.fallback.register(el);
    }

    fn next(&self, key: Option<&NetAddr>) -> Option<&EventLoopHandle> {
        let loops = self.loops();
        match key {
            Some(addr) if !loops.is_empty() => {
                let mut hasher = DefaultHasher::new();
                addr.to_string().hash(&mut hasher);
                loops.get(hasher.finish() as usize % loops.len())
            }
            _ => self.fallback.pick(),
        }
    }

    fn loops(&self) -> &[EventLoopHandle] {
        self.fallback.loops()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use std::sync::Arc;

    fn pool(lb: LoadBalancing, n: usize) -> Box<dyn LoadBalancer> {
        let opts = Arc::new(Options::default());
        let mut balancer = new_balancer(lb);
        for i in 0..n {
            balancer.register(EventLoopHandle::new(i, opts.clone()).unwrap());
        }
        balancer
    }

    #[test]
    fn round_robin_cycles() {
        let balancer = pool(LoadBalancing::RoundRobin, 3);
        let picked: Vec<_> = (0..6)
            .map(|_| balancer.next(None).unwrap().index())
            .collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn least_connections_prefers_idle_loop() {
        let balancer = pool(LoadBalancing::LeastConnections, 3);
        balancer.loops()[0].add_conn(2);
        balancer.loops()[1].add_conn(1);
        balancer.loops()[2].add_conn(1);
        assert_eq!(balancer.next(None).unwrap().index(), 1);
        balancer.loops()[1].add_conn(5);
        assert_eq!(balancer.next(None).unwrap().index(), 2);
    }

    #[test]
    fn source_hash_is_sticky() {
        let balancer = pool(LoadBalancing::SourceAddrHash, 4);
        let peer = NetAddr::from("10.0.0.7:5555".parse::<std::net::SocketAddr>().unwrap());
        let first = balancer.next(Some(&peer)).unwrap().index();
        for _ in 0..10 {
            assert_eq!(balancer.next(Some(&peer)).unwrap().index(), first);
        }
        assert!(balancer.next(None).is_some());
    }

    #[test]
    fn iterate_stops_early() {
        let balancer = pool(LoadBalancing::RoundRobin, 4);
        let mut seen = vec![];
        balancer.iterate(&mut |i, _| {
            seen.push(i);
            i < 1
        });
        assert_eq!(seen, vec![0, 1]);
        assert_eq!(balancer.len(), 4);
    }

    #[test]
    fn empty_pool() {
        for &lb in [
            LoadBalancing::RoundRobin,
            LoadBalancing::LeastConnections,
            LoadBalancing::SourceAddrHash,
        ]
        .iter()
        {
            assert!(pool(lb, 0).next(None).is_none());
        }
    }
}
