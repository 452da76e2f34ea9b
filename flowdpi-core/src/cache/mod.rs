//! Bounded object pools.
//!
//! Per-flow state is never allocated on the packet path. Objects are
//! created up front with [`Cache::create`], handed out with
//! [`Cache::acquire`] and handed back with [`Cache::release`], which resets
//! them to their default value. When the pool is empty an acquire fails and
//! is counted as a miss, unless dynamic allocation was switched on.
//!
//! The flow pool ([`crate::flow::FlowCache`]) and the TCP state pool used by
//! [`crate::protocol::TcpProtocol`] are both built on this type.

use std::io::{self, Write};
use std::mem::size_of;

/// Statistics for an object pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Objects owned by the pool, idle or handed out.
    pub total: usize,
    /// Objects currently idle.
    pub idle: usize,
    /// Successful acquisitions.
    pub acquires: u64,
    /// Objects returned.
    pub releases: u64,
    /// Acquisitions that found the pool empty.
    pub fails: u64,
}

impl CacheStats {
    /// Objects handed out and not yet returned.
    pub fn in_use(&self) -> usize {
        self.total.saturating_sub(self.idle)
    }

    /// Share of the pool currently handed out.
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.in_use() as f64 / self.total as f64
        }
    }
}

/// Fixed-size pool of boxed `T` values.
#[derive(Debug)]
pub struct Cache<T> {
    name: &'static str,
    idle: Vec<Box<T>>,
    total: usize,
    acquires: u64,
    releases: u64,
    fails: u64,
    dynamic_allocated_memory: bool,
}

impl<T: Default> Cache<T> {
    /// Create an empty pool.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            idle: Vec::new(),
            total: 0,
            acquires: 0,
            releases: 0,
            fails: 0,
            dynamic_allocated_memory: false,
        }
    }

    /// Create a pool holding `count` idle objects.
    pub fn with_capacity(name: &'static str, count: usize) -> Self {
        let mut cache = Self::new(name);
        cache.create(count);
        cache
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Grow the pool by exactly `count` objects.
    pub fn create(&mut self, count: usize) {
        self.idle.reserve(count);
        for _ in 0..count {
            self.idle.push(Box::default());
        }
        self.total += count;
    }

    /// Shrink the pool by exactly `count` idle objects.
    ///
    /// Objects in use are never reclaimed: when fewer than `count` objects
    /// are idle nothing is destroyed. Returns the number destroyed.
    pub fn destroy(&mut self, count: usize) -> usize {
        if count > self.idle.len() {
            return 0;
        }
        let keep = self.idle.len() - count;
        self.idle.truncate(keep);
        self.total -= count;
        count
    }

    /// Take an idle object out of the pool.
    pub fn acquire(&mut self) -> Option<Box<T>> {
        match self.idle.pop() {
            Some(item) => {
                self.acquires += 1;
                Some(item)
            }
            None if self.dynamic_allocated_memory => {
                self.total += 1;
                self.acquires += 1;
                Some(Box::default())
            }
            None => {
                self.fails += 1;
                None
            }
        }
    }

    /// Reset an object and return it to the pool.
    ///
    /// Only objects obtained from [`Cache::acquire`] on the same pool may be
    /// released here.
    pub fn release(&mut self, mut item: Box<T>) {
        *item = T::default();
        self.idle.push(item);
        self.releases += 1;
    }

    pub fn set_dynamic_allocated_memory(&mut self, value: bool) {
        self.dynamic_allocated_memory = value;
    }

    pub fn is_dynamic_allocated_memory(&self) -> bool {
        self.dynamic_allocated_memory
    }

    #[inline]
    pub fn total_items(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn idle_items(&self) -> usize {
        self.idle.len()
    }

    #[inline]
    pub fn fails(&self) -> u64 {
        self.fails
    }

    /// Bytes owned by the pool.
    pub fn allocated_memory(&self) -> usize {
        self.total * size_of::<T>()
    }

    /// Bytes held by objects currently handed out.
    pub fn current_use_memory(&self) -> usize {
        (self.total - self.idle.len()) * size_of::<T>()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            total: self.total,
            idle: self.idle.len(),
            acquires: self.acquires,
            releases: self.releases,
            fails: self.fails,
        }
    }

    pub fn statistics(&self, out: &mut dyn Write) -> io::Result<()> {
        let stats = self.stats();
        writeln!(out, "{} statistics", self.name)?;
        writeln!(out, "\tTotal items:{:>18}", stats.total)?;
        writeln!(out, "\tIdle items:{:>19}", stats.idle)?;
        writeln!(out, "\tTotal acquires:{:>15}", stats.acquires)?;
        writeln!(out, "\tTotal releases:{:>15}", stats.releases)?;
        writeln!(out, "\tTotal fails:{:>18}", stats.fails)?;
        writeln!(out, "\tAllocated memory:{:>13}", self.allocated_memory())
    }
}
