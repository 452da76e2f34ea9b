//! Pool of idle flows.

use std::io::{self, Write};

use tracing::warn;

use super::Flow;
use crate::cache::{Cache, CacheStats};

/// Bounded pool owning every idle [`Flow`].
#[derive(Debug)]
pub struct FlowCache {
    cache: Cache<Flow>,
    warned: bool,
}

impl Default for FlowCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowCache {
    pub fn new() -> Self {
        Self {
            cache: Cache::new("FlowCache"),
            warned: false,
        }
    }

    pub fn with_capacity(count: usize) -> Self {
        let mut cache = Self::new();
        cache.create_flows(count);
        cache
    }

    /// Take an idle flow, or `None` when the pool is exhausted.
    pub fn acquire_flow(&mut self) -> Option<Box<Flow>> {
        let flow = self.cache.acquire();
        if flow.is_none() && !self.warned {
            warn!(
                total = self.cache.total_items(),
                "flow cache exhausted, new flows are not tracked"
            );
            self.warned = true;
        }
        flow
    }

    /// Reset `flow` and return it to the pool.
    pub fn release_flow(&mut self, flow: Box<Flow>) {
        self.cache.release(flow);
    }

    pub fn create_flows(&mut self, count: usize) {
        self.cache.create(count);
    }

    /// Destroy `count` idle flows; no-op when fewer are idle.
    pub fn destroy_flows(&mut self, count: usize) -> usize {
        self.cache.destroy(count)
    }

    pub fn set_dynamic_allocated_memory(&mut self, value: bool) {
        self.cache.set_dynamic_allocated_memory(value);
    }

    #[inline]
    pub fn total_flows(&self) -> usize {
        self.cache.total_items()
    }

    #[inline]
    pub fn idle_flows(&self) -> usize {
        self.cache.idle_items()
    }

    /// Acquisitions that found the pool empty.
    #[inline]
    pub fn misses(&self) -> u64 {
        self.cache.fails()
    }

    pub fn allocated_memory(&self) -> usize {
        self.cache.allocated_memory()
    }

    pub fn current_use_memory(&self) -> usize {
        self.cache.current_use_memory()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn statistics(&self, out: &mut dyn Write) -> io::Result<()> {
        self.cache.statistics(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::PacketAnomaly;
    use crate::flow::FiveTuple;

    #[test]
    fn test_released_flow_is_clean() {
        let mut cache = FlowCache::with_capacity(1);

        let mut flow = cache.acquire_flow().unwrap();
        flow.init(9, FiveTuple::default(), Some(3), 100);
        flow.total_packets = 5;
        flow.set_reject(true);
        flow.set_anomaly(PacketAnomaly::TcpBadFlags);
        cache.release_flow(flow);

        let flow = cache.acquire_flow().unwrap();
        assert_eq!(flow.id(), 0);
        assert_eq!(flow.total_packets, 0);
        assert!(flow.tag().is_none());
        assert!(!flow.is_reject());
        assert!(flow.anomaly().is_none());
        assert!(flow.is_accept());
    }

    #[test]
    fn test_misses_counted_on_exhaustion() {
        let mut cache = FlowCache::with_capacity(1);
        let _held = cache.acquire_flow().unwrap();

        assert!(cache.acquire_flow().is_none());
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_create_and_destroy_are_exact() {
        let mut cache = FlowCache::with_capacity(2);
        cache.create_flows(3);
        assert_eq!(cache.total_flows(), 5);

        assert_eq!(cache.destroy_flows(6), 0);
        assert_eq!(cache.destroy_flows(4), 4);
        assert_eq!(cache.total_flows(), 1);
    }
}
