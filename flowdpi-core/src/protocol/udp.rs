//! UDP decoder.

use std::io::{self, Write};
use std::mem::size_of;
use std::sync::Arc;

use etherparse::UdpHeaderSlice;

use super::transport::{FlowTracker, RejectHook};
use super::{write_statistics, NextLayer, PacketProtocol, Protocol, ProtocolStats};
use crate::adaptor::DatabaseAdaptor;
use crate::anomaly::{AnomalyManager, PacketAnomaly};
use crate::dispatch::FlowForwarderTree;
use crate::flow::{FiveTuple, FlowCache, FlowDirection, FlowManager};
use crate::ipset::{IpSetLookup, RegexManager};
use crate::packet::Packet;

/// IP protocol number for UDP.
pub const IP_PROTO_UDP: u8 = 17;

const HEADER_LEN: usize = 8;

/// UDP transport decoder.
///
/// Flows are resolved like TCP ones but carry no connection state, so
/// they only leave the table through the inactivity sweep.
pub struct UdpProtocol {
    stats: ProtocolStats,
    anomaly: Arc<AnomalyManager>,
    flows: FlowTracker,
}

impl UdpProtocol {
    pub fn new(anomaly: Arc<AnomalyManager>) -> Self {
        Self::with_capacity(anomaly, 0)
    }

    pub fn with_capacity(anomaly: Arc<AnomalyManager>, flows: usize) -> Self {
        Self {
            stats: ProtocolStats::default(),
            anomaly,
            flows: FlowTracker::new("udp", flows),
        }
    }

    pub fn flow_manager(&self) -> &FlowManager {
        &self.flows.manager
    }

    pub fn flow_manager_mut(&mut self) -> &mut FlowManager {
        &mut self.flows.manager
    }

    pub fn flow_cache(&self) -> &FlowCache {
        &self.flows.cache
    }

    pub fn forwarder(&self) -> &FlowForwarderTree {
        &self.flows.forwarder
    }

    pub fn forwarder_mut(&mut self) -> &mut FlowForwarderTree {
        &mut self.flows.forwarder
    }

    pub fn set_adaptor(&mut self, adaptor: Box<dyn DatabaseAdaptor>, packet_sampling: u64) {
        self.flows.set_adaptor(adaptor, packet_sampling);
    }

    pub fn take_adaptor(&mut self) -> Option<Box<dyn DatabaseAdaptor>> {
        self.flows.take_adaptor()
    }

    pub fn set_ipset_manager(&mut self, lookup: Arc<dyn IpSetLookup>) {
        self.flows.set_ipset_manager(lookup);
    }

    pub fn set_regex_manager(&mut self, manager: Option<Arc<dyn RegexManager>>) {
        self.flows.set_regex_manager(manager);
    }

    pub fn set_reject_hook(&mut self, hook: RejectHook) {
        self.flows.set_reject_hook(hook);
    }

    pub fn flow_time_refresh_rate(&self) -> u64 {
        self.flows.refresh_rate()
    }

    pub fn set_flow_time_refresh_rate(&mut self, rate: u64) {
        self.flows.set_refresh_rate(rate);
    }

    pub fn last_packet_time(&self) -> i64 {
        self.flows.last_packet_time()
    }

    pub fn ipset_matches(&self) -> u64 {
        self.flows.ipset_matches()
    }

    /// Flows given back to the pool, by retirement or timeout.
    pub fn released_flows(&self) -> u64 {
        self.flows.released_flows()
    }

    pub fn update_timers(&mut self, now: i64) -> usize {
        self.flows.update_timers(now, |_| {})
    }
}

impl Protocol for UdpProtocol {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn stats(&self) -> ProtocolStats {
        self.stats
    }

    fn allocated_memory(&self) -> usize {
        size_of::<Self>() + self.flows.allocated_memory()
    }

    fn current_use_memory(&self) -> usize {
        size_of::<Self>() + self.flows.current_use_memory()
    }

    fn increase_allocated_memory(&mut self, count: usize) {
        self.flows.cache.create_flows(count);
    }

    fn decrease_allocated_memory(&mut self, count: usize) {
        self.flows.cache.destroy_flows(count);
    }

    fn set_dynamic_allocated_memory(&mut self, value: bool) {
        self.flows.cache.set_dynamic_allocated_memory(value);
    }

    fn total_cache_misses(&self) -> u64 {
        self.flows.cache.misses()
    }

    fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()> {
        write_statistics(out, self.name(), &self.stats, self.allocated_memory(), level)?;
        self.flows.statistics(out, level)
    }
}

impl PacketProtocol for UdpProtocol {
    fn is_valid(&mut self, packet: &mut Packet<'_>) -> bool {
        let data = packet.payload();
        if data.len() < HEADER_LEN {
            return self.stats.count_valid(false);
        }

        let length = usize::from(u16::from_be_bytes([data[4], data[5]]));
        if length < HEADER_LEN || length > data.len() {
            packet.anomaly = PacketAnomaly::UdpBogusHeader;
            self.anomaly.inc_anomaly(PacketAnomaly::UdpBogusHeader);
            return self.stats.count_valid(false);
        }
        self.stats.count_valid(true)
    }

    fn process_packet(&mut self, packet: &mut Packet<'_>) -> Option<NextLayer> {
        let header = UdpHeaderSlice::from_slice(packet.payload()).ok()?;
        let length = usize::from(header.length()).min(packet.length());
        let payload = length.saturating_sub(HEADER_LEN);
        let now = packet.timestamp();

        self.stats.count_packet(packet.length());
        packet.set_ports(header.source_port(), header.destination_port());

        let network = packet.network()?;
        let tuple = FiveTuple::new(
            network.source,
            header.source_port(),
            IP_PROTO_UDP,
            network.destination,
            header.destination_port(),
        );

        let (key, created) = self.flows.resolve(tuple, packet.tag(), now, |_| true)?;
        {
            let flow = self.flows.manager.get_mut(key)?;
            let direction = if created {
                FlowDirection::Forward
            } else {
                flow.direction_of(header.source_port())
            };
            flow.set_direction(direction);
            flow.total_bytes += payload as u64;
            flow.total_packets += 1;
            if !packet.anomaly.is_none() {
                flow.set_anomaly(packet.anomaly);
            }
        }

        if payload > 0 {
            packet.narrow(HEADER_LEN);
            packet.truncate(payload);
            self.flows.forward(key, packet.payload());
        }

        self.flows.apply_verdict(key, packet);
        if self.flows.schedule_timers(key, now) {
            self.update_timers(now);
        }
        None
    }
}
