//! Table of active flows.
//!
//! Flows are stored under the hash they were created with. Each one also
//! has an entry in a time index ordered by the time it was last indexed.
//! The index is only refreshed every few packets of a flow, so a sweep
//! rechecks the flow's real last-packet time before evicting it.

use std::collections::{BTreeSet, HashMap};
use std::io::{self, Write};
use std::mem::size_of;

use tracing::debug;

use super::{FiveTuple, Flow, flow_keys};

/// Default inactivity timeout, in seconds.
pub const DEFAULT_FLOW_TIMEOUT: i64 = 180;

#[derive(Debug)]
struct FlowEntry {
    flow: Box<Flow>,
    indexed_time: i64,
}

/// Owner of every active [`Flow`].
#[derive(Debug)]
pub struct FlowManager {
    flows: HashMap<u64, FlowEntry>,
    time_index: BTreeSet<(i64, u64)>,
    /// Inactivity timeout in seconds.
    timeout: i64,
    release_flows: bool,
    timeout_flows: u64,
}

impl Default for FlowManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowManager {
    pub fn new() -> Self {
        Self {
            flows: HashMap::new(),
            time_index: BTreeSet::new(),
            timeout: DEFAULT_FLOW_TIMEOUT,
            release_flows: true,
            timeout_flows: 0,
        }
    }

    /// Find the flow stored under `h1` or `h2`, in that order.
    pub fn find_flow(&self, h1: u64, h2: u64) -> Option<u64> {
        if self.flows.contains_key(&h1) {
            Some(h1)
        } else if self.flows.contains_key(&h2) {
            Some(h2)
        } else {
            None
        }
    }

    /// Find the flow a packet with this tuple and tag belongs to.
    pub fn lookup(&self, tuple: &FiveTuple, tag: Option<u32>) -> Option<&Flow> {
        let (h1, h2) = flow_keys(tuple, tag);
        self.find_flow(h1, h2).and_then(|key| self.get(key))
    }

    pub fn get(&self, key: u64) -> Option<&Flow> {
        self.flows.get(&key).map(|entry| entry.flow.as_ref())
    }

    pub fn get_mut(&mut self, key: u64) -> Option<&mut Flow> {
        self.flows.get_mut(&key).map(|entry| entry.flow.as_mut())
    }

    /// Insert a flow under its own hash.
    ///
    /// A flow already stored under that hash is displaced and returned so the
    /// caller can give it back to its pool.
    pub fn add_flow(&mut self, flow: Box<Flow>) -> Option<Box<Flow>> {
        let key = flow.id();
        let indexed_time = flow.last_packet_time;
        self.time_index.insert((indexed_time, key));
        let displaced = self.flows.insert(key, FlowEntry { flow, indexed_time });

        displaced.map(|old| {
            if old.indexed_time != indexed_time {
                self.time_index.remove(&(old.indexed_time, key));
            }
            old.flow
        })
    }

    /// Remove a flow from the table, handing ownership back to the caller.
    pub fn remove_flow(&mut self, key: u64) -> Option<Box<Flow>> {
        let entry = self.flows.remove(&key)?;
        self.time_index.remove(&(entry.indexed_time, key));
        Some(entry.flow)
    }

    /// Move the flow's index entry to `now`.
    pub fn update_flow_time(&mut self, key: u64, now: i64) {
        if let Some(entry) = self.flows.get_mut(&key) {
            entry.flow.last_packet_time = now;
            if entry.indexed_time != now {
                self.time_index.remove(&(entry.indexed_time, key));
                self.time_index.insert((now, key));
                entry.indexed_time = now;
            }
        }
    }

    /// Evict flows idle for longer than the timeout.
    ///
    /// Evicted flows are returned to the caller, which owns releasing them
    /// and anything attached to them.
    pub fn update_timers(&mut self, now: i64) -> Vec<Box<Flow>> {
        let cutoff = now.saturating_sub(self.timeout_us());
        let candidates: Vec<(i64, u64)> = self
            .time_index
            .range(..(cutoff, 0))
            .copied()
            .collect();

        let mut expired = Vec::new();
        for (indexed_time, key) in candidates {
            self.time_index.remove(&(indexed_time, key));
            let Some(entry) = self.flows.get_mut(&key) else {
                continue;
            };

            let last = entry.flow.last_packet_time;
            if last < cutoff {
                if let Some(entry) = self.flows.remove(&key) {
                    debug!(flow = %entry.flow.tuple(), idle_us = now - last, "flow timed out");
                    expired.push(entry.flow);
                }
            } else {
                // Packets arrived since the flow was last indexed
                entry.indexed_time = last;
                self.time_index.insert((last, key));
            }
        }

        self.timeout_flows += expired.len() as u64;
        expired
    }

    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values().map(|entry| entry.flow.as_ref())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Inactivity timeout in seconds.
    #[inline]
    pub fn timeout(&self) -> i64 {
        self.timeout
    }

    pub fn set_timeout(&mut self, seconds: i64) {
        self.timeout = seconds;
    }

    #[inline]
    pub fn timeout_us(&self) -> i64 {
        self.timeout.saturating_mul(1_000_000)
    }

    /// Whether closed flows are reclaimed as soon as they finish.
    #[inline]
    pub fn release_flows(&self) -> bool {
        self.release_flows
    }

    pub fn set_release_flows(&mut self, value: bool) {
        self.release_flows = value;
    }

    /// Flows evicted by sweeps so far.
    #[inline]
    pub fn timeout_flows(&self) -> u64 {
        self.timeout_flows
    }

    /// Bytes used by the table itself, flows included.
    pub fn allocated_memory(&self) -> usize {
        self.flows.capacity() * (size_of::<u64>() + size_of::<FlowEntry>())
            + self.flows.len() * size_of::<Flow>()
            + self.time_index.len() * size_of::<(i64, u64)>()
    }

    pub fn statistics(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "FlowManager statistics")?;
        writeln!(out, "\tTimeout:{:>22}", self.timeout)?;
        writeln!(out, "\tTotal flows:{:>18}", self.flows.len())?;
        writeln!(out, "\tTotal timeout flows:{:>10}", self.timeout_flows)?;
        writeln!(out, "\tAllocated memory:{:>13}", self.allocated_memory())
    }
}
