//! Flow bookkeeping shared by the transport decoders.
//!
//! TCP and UDP resolve flows the same way: symmetric lookup, creation from
//! the pool, first-packet IP-set lookup, forwarding to application
//! decoders and the same timer policy. [`FlowTracker`] holds that part; the
//! decoders add their own per-flow state through the `attach` and `detach`
//! closures.

use std::io::{self, Write};
use std::mem::size_of;
use std::sync::Arc;

use tracing::debug;

use crate::adaptor::{remove_once, write_update, DatabaseAdaptor, DEFAULT_PACKET_SAMPLING};
use crate::dispatch::FlowForwarderTree;
use crate::flow::{flow_keys, FiveTuple, Flow, FlowCache, FlowManager};
use crate::ipset::{attach_ip_set, IpSetLookup, RegexManager};
use crate::packet::Packet;

/// Packets of a flow between two refreshes of its time index entry.
pub const DEFAULT_FLOW_TIME_REFRESH_RATE: u64 = 32;

/// Called on a flow marked for rejection, once per rejected packet.
pub type RejectHook = Box<dyn FnMut(&mut Flow) + Send>;

pub(crate) struct FlowTracker {
    pub(crate) manager: FlowManager,
    pub(crate) cache: FlowCache,
    pub(crate) forwarder: FlowForwarderTree,
    adaptor: Option<Box<dyn DatabaseAdaptor>>,
    packet_sampling: u64,
    ipset: Option<Arc<dyn IpSetLookup>>,
    regex_manager: Option<Arc<dyn RegexManager>>,
    reject_hook: Option<RejectHook>,
    refresh_rate: u64,
    last_timeout: i64,
    last_packet_time: i64,
    ipset_matches: u64,
    released_flows: u64,
}

impl FlowTracker {
    pub(crate) fn new(name: &'static str, flows: usize) -> Self {
        Self {
            manager: FlowManager::new(),
            cache: FlowCache::with_capacity(flows),
            forwarder: FlowForwarderTree::new(name),
            adaptor: None,
            packet_sampling: DEFAULT_PACKET_SAMPLING,
            ipset: None,
            regex_manager: None,
            reject_hook: None,
            refresh_rate: DEFAULT_FLOW_TIME_REFRESH_RATE,
            last_timeout: 0,
            last_packet_time: 0,
            ipset_matches: 0,
            released_flows: 0,
        }
    }

    pub(crate) fn set_adaptor(&mut self, adaptor: Box<dyn DatabaseAdaptor>, packet_sampling: u64) {
        self.adaptor = Some(adaptor);
        self.packet_sampling = packet_sampling.max(1);
    }

    pub(crate) fn take_adaptor(&mut self) -> Option<Box<dyn DatabaseAdaptor>> {
        self.adaptor.take()
    }

    pub(crate) fn set_ipset_manager(&mut self, lookup: Arc<dyn IpSetLookup>) {
        self.ipset = Some(lookup);
    }

    pub(crate) fn set_regex_manager(&mut self, manager: Option<Arc<dyn RegexManager>>) {
        self.regex_manager = manager;
    }

    pub(crate) fn set_reject_hook(&mut self, hook: RejectHook) {
        self.reject_hook = Some(hook);
    }

    pub(crate) fn refresh_rate(&self) -> u64 {
        self.refresh_rate
    }

    pub(crate) fn set_refresh_rate(&mut self, rate: u64) {
        self.refresh_rate = rate.max(1);
    }

    pub(crate) fn last_packet_time(&self) -> i64 {
        self.last_packet_time
    }

    pub(crate) fn ipset_matches(&self) -> u64 {
        self.ipset_matches
    }

    pub(crate) fn released_flows(&self) -> u64 {
        self.released_flows
    }

    /// Find the flow of `tuple`, or create it.
    ///
    /// Returns the flow's key and whether it was created by this call, or
    /// `None` when a pool is exhausted. `attach` adds the decoder's own
    /// state to a new flow and returns false if it cannot.
    pub(crate) fn resolve(
        &mut self,
        tuple: FiveTuple,
        tag: Option<u32>,
        now: i64,
        attach: impl FnOnce(&mut Flow) -> bool,
    ) -> Option<(u64, bool)> {
        let (h1, h2) = flow_keys(&tuple, tag);
        if let Some(key) = self.manager.find_flow(h1, h2) {
            return Some((key, false));
        }

        let mut flow = self.cache.acquire_flow()?;
        if !attach(&mut flow) {
            self.cache.release_flow(flow);
            return None;
        }

        flow.init(h1, tuple, tag, now);
        flow.set_regex_manager(self.regex_manager.clone());
        if let Some(lookup) = self.ipset.as_deref() {
            if attach_ip_set(lookup, &mut flow) {
                self.ipset_matches += 1;
            }
        }
        if let Some(adaptor) = self.adaptor.as_mut() {
            adaptor.insert(&tuple.to_string());
        }
        debug!(flow = %tuple, ?tag, "flow created");

        if let Some(displaced) = self.manager.add_flow(flow) {
            self.cache.release_flow(displaced);
        }
        Some((h1, true))
    }

    /// Hand the payload of the flow stored under `key` to the forwarders.
    pub(crate) fn forward(&mut self, key: u64, payload: &[u8]) {
        if let Some(flow) = self.manager.get_mut(key) {
            self.forwarder.forward_flow(flow, payload);
        }
    }

    /// Drop the flow stored under `key` if the manager releases flows.
    ///
    /// The adaptor is told once in any case. Returns whether the flow left
    /// the table.
    pub(crate) fn retire(&mut self, key: u64, detach: impl FnMut(&mut Flow)) -> bool {
        if let (Some(adaptor), Some(flow)) = (self.adaptor.as_mut(), self.manager.get_mut(key)) {
            remove_once(&mut **adaptor, flow);
        }
        if !self.manager.release_flows() {
            return false;
        }
        let Some(flow) = self.manager.remove_flow(key) else {
            return false;
        };
        debug!(flow = %flow.tuple(), packets = flow.total_packets, "flow retired");
        self.release(flow, detach);
        true
    }

    fn release(&mut self, mut flow: Box<Flow>, mut detach: impl FnMut(&mut Flow)) {
        self.forwarder.release_flow_info(&mut flow);
        detach(&mut flow);
        self.cache.release_flow(flow);
        self.released_flows += 1;
    }

    /// Evict idle flows and give them back to the pool.
    pub(crate) fn update_timers(&mut self, now: i64, mut detach: impl FnMut(&mut Flow)) -> usize {
        let expired = self.manager.update_timers(now);
        let count = expired.len();
        for mut flow in expired {
            if let Some(adaptor) = self.adaptor.as_mut() {
                remove_once(&mut **adaptor, &mut flow);
            }
            self.release(flow, &mut detach);
        }
        count
    }

    /// Adaptor update, verdict propagation and reject hook.
    pub(crate) fn apply_verdict(&mut self, key: u64, packet: &mut Packet<'_>) {
        let Some(flow) = self.manager.get_mut(key) else {
            return;
        };

        if let Some(adaptor) = self.adaptor.as_deref_mut() {
            if packet.force_adaptor_write() || flow.total_packets % self.packet_sampling == 0 {
                write_update(adaptor, flow);
            }
        }

        packet.set_accept(flow.is_accept());
        packet.set_evidence(flow.have_evidence());

        if flow.is_reject() {
            if let Some(hook) = self.reject_hook.as_mut() {
                hook(flow);
            }
            flow.set_reject(false);
            flow.set_partial_reject(true);
        }
    }

    /// Advance the clocks for a packet of the flow under `key`.
    ///
    /// Returns true when a timeout sweep is due; the caller runs it with
    /// its own `detach`.
    pub(crate) fn schedule_timers(&mut self, key: u64, now: i64) -> bool {
        self.last_packet_time = now;
        let Some(flow) = self.manager.get_mut(key) else {
            return false;
        };
        flow.last_packet_time = now;
        let packets = flow.total_packets;

        if now.saturating_sub(self.manager.timeout_us()) > self.last_timeout {
            self.last_timeout = now;
            return true;
        }
        if packets % self.refresh_rate == 1 {
            self.manager.update_flow_time(key, now);
        }
        false
    }

    pub(crate) fn allocated_memory(&self) -> usize {
        size_of::<Self>()
            + self.cache.allocated_memory()
            + self.manager.allocated_memory()
            + self.forwarder.allocated_memory()
    }

    pub(crate) fn current_use_memory(&self) -> usize {
        size_of::<Self>() + self.cache.current_use_memory() + self.manager.allocated_memory()
    }

    pub(crate) fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()> {
        if level > 1 {
            writeln!(out, "\tActive flows:{:>17}", self.manager.len())?;
            writeln!(out, "\tReleased flows:{:>15}", self.released_flows)?;
            writeln!(out, "\tIP set matches:{:>15}", self.ipset_matches)?;
        }
        if level > 3 {
            self.cache.statistics(out)?;
            self.manager.statistics(out)?;
        }
        self.forwarder.statistics(out, level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn tuple(sport: u16, dport: u16) -> FiveTuple {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        FiveTuple::new(a, sport, 17, b, dport)
    }

    // Test 1: The reverse tuple resolves to the flow created by the forward one
    #[test]
    fn test_resolve_is_symmetric() {
        let mut tracker = FlowTracker::new("udp", 4);

        let (key, created) = tracker.resolve(tuple(5000, 53), None, 10, |_| true).unwrap();
        assert!(created);

        let (again, created) = tracker
            .resolve(tuple(5000, 53).reversed(), None, 20, |_| true)
            .unwrap();
        assert!(!created);
        assert_eq!(key, again);
        assert_eq!(tracker.manager.len(), 1);
    }

    // Test 2: A failing attach gives the flow back
    #[test]
    fn test_failed_attach_releases_flow() {
        let mut tracker = FlowTracker::new("tcp", 1);

        assert!(tracker.resolve(tuple(1, 2), None, 0, |_| false).is_none());
        assert_eq!(tracker.cache.idle_flows(), 1);
        assert!(tracker.manager.is_empty());
    }

    #[test]
    fn test_exhausted_pool() {
        let mut tracker = FlowTracker::new("udp", 1);

        assert!(tracker.resolve(tuple(1, 2), None, 0, |_| true).is_some());
        assert!(tracker.resolve(tuple(3, 4), None, 0, |_| true).is_none());
        assert_eq!(tracker.cache.misses(), 1);
    }

    #[test]
    fn test_retire_respects_release_flag() {
        let mut tracker = FlowTracker::new("udp", 2);
        let (key, _) = tracker.resolve(tuple(1, 2), None, 0, |_| true).unwrap();

        tracker.manager.set_release_flows(false);
        assert!(!tracker.retire(key, |_| {}));
        assert_eq!(tracker.manager.len(), 1);

        tracker.manager.set_release_flows(true);
        assert!(tracker.retire(key, |_| {}));
        assert_eq!(tracker.cache.idle_flows(), 2);
        assert_eq!(tracker.released_flows(), 1);
    }

    #[test]
    fn test_reject_becomes_partial_reject() {
        let mut tracker = FlowTracker::new("udp", 1);
        let (key, _) = tracker.resolve(tuple(1, 2), None, 0, |_| true).unwrap();
        tracker.set_reject_hook(Box::new(|flow: &mut Flow| flow.set_accept(false)));
        tracker.manager.get_mut(key).unwrap().set_reject(true);

        let frame = [0u8; 4];
        let mut packet = Packet::new(&frame, 0);
        tracker.apply_verdict(key, &mut packet);

        let flow = tracker.manager.get(key).unwrap();
        assert!(!flow.is_reject());
        assert!(flow.is_partial_reject());
        // The hook's verdict shows from the next packet on
        tracker.apply_verdict(key, &mut packet);
        assert!(!packet.is_accept());
    }

    #[test]
    fn test_sweep_is_scheduled_once_per_timeout() {
        let mut tracker = FlowTracker::new("udp", 1);
        let (key, _) = tracker.resolve(tuple(1, 2), None, 0, |_| true).unwrap();
        let timeout = tracker.manager.timeout_us();

        assert!(!tracker.schedule_timers(key, timeout));
        assert!(tracker.schedule_timers(key, timeout + 1));
        assert!(!tracker.schedule_timers(key, timeout + 2));
        assert_eq!(tracker.last_packet_time(), timeout + 2);
    }
}
