//! TCP decoder.
//!
//! Resolves the flow of every segment, attaches a [`TcpInfo`] to new flows,
//! runs the connection state machine and hands payload to the application
//! forwarders. Flows are retired when both their previous and current state
//! are closed, or by the inactivity sweep.

mod info;
mod state;

use std::io::{self, Write};
use std::mem::size_of;
use std::sync::Arc;

use etherparse::TcpHeaderSlice;
use tracing::trace;

pub use info::{TcpInfo, TcpQos};
pub use state::{next_state, TcpFlagClass, TcpState};

use super::transport::{FlowTracker, RejectHook};
use super::{write_statistics, NextLayer, PacketProtocol, Protocol, ProtocolStats};
use crate::adaptor::DatabaseAdaptor;
use crate::anomaly::{AnomalyManager, PacketAnomaly};
use crate::cache::Cache;
use crate::dispatch::FlowForwarderTree;
use crate::flow::{FiveTuple, Flow, FlowCache, FlowDirection, FlowManager};
use crate::ipset::{IpSetLookup, RegexManager};
use crate::packet::Packet;

/// IP protocol number for TCP.
pub const IP_PROTO_TCP: u8 = 6;

const MIN_HEADER_LEN: usize = 20;

/// Retirement also needs more packets than a bare handshake.
const MIN_PACKETS_TO_RETIRE: u64 = 4;

const MICROS_PER_SECOND: i64 = 1_000_000;

/// TCP flags bit positions.
#[allow(dead_code)]
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;
}

/// Decoder wide segment counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpCounters {
    pub packets: u64,
    pub bytes: u64,
    pub syns: u64,
    pub synacks: u64,
    pub acks: u64,
    pub fins: u64,
    pub rsts: u64,
}

/// Running sums of the per-flow QoS metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TcpQosTotals {
    /// Sum of connection setup times, in microseconds.
    pub connection_setup_time: i64,
    /// Sum of application response times, in microseconds.
    pub application_response_time: i64,
    /// Sum of sampled reset rates.
    pub server_reset_rate: f64,
}

/// Flag bits of one segment.
#[derive(Debug, Clone, Copy)]
struct Segment {
    syn: bool,
    ack: bool,
    fin: bool,
    rst: bool,
    psh: bool,
    seq: u32,
    payload: usize,
}

impl Segment {
    fn from_header(header: &TcpHeaderSlice<'_>, payload: usize) -> Self {
        Self {
            syn: header.syn(),
            ack: header.ack(),
            fin: header.fin(),
            rst: header.rst(),
            psh: header.psh(),
            seq: header.sequence_number(),
            payload,
        }
    }
}

/// TCP transport decoder.
pub struct TcpProtocol {
    stats: ProtocolStats,
    counters: TcpCounters,
    qos_totals: TcpQosTotals,
    anomaly: Arc<AnomalyManager>,
    flows: FlowTracker,
    tcp_info_cache: Cache<TcpInfo>,
    qos_metrics: bool,
}

impl TcpProtocol {
    /// Decoder with empty pools; grow them with `increase_allocated_memory`.
    pub fn new(anomaly: Arc<AnomalyManager>) -> Self {
        Self::with_capacity(anomaly, 0)
    }

    /// Decoder with `flows` preallocated flows and TCP states.
    pub fn with_capacity(anomaly: Arc<AnomalyManager>, flows: usize) -> Self {
        Self {
            stats: ProtocolStats::default(),
            counters: TcpCounters::default(),
            qos_totals: TcpQosTotals::default(),
            anomaly,
            flows: FlowTracker::new("tcp", flows),
            tcp_info_cache: Cache::with_capacity("tcp info", flows),
            qos_metrics: false,
        }
    }

    pub fn counters(&self) -> TcpCounters {
        self.counters
    }

    /// QoS sums over every flow, filled only while QoS metrics are on.
    pub fn qos_totals(&self) -> TcpQosTotals {
        self.qos_totals
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

    pub fn tcp_info_cache(&self) -> &Cache<TcpInfo> {
        &self.tcp_info_cache
    }

    /// Flow forwarders of application decoders reached over TCP.
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

    /// Regex manager given to new flows that no IP set overrides.
    pub fn set_regex_manager(&mut self, manager: Option<Arc<dyn RegexManager>>) {
        self.flows.set_regex_manager(manager);
    }

    pub fn set_reject_hook(&mut self, hook: RejectHook) {
        self.flows.set_reject_hook(hook);
    }

    pub fn qos_metrics(&self) -> bool {
        self.qos_metrics
    }

    pub fn set_qos_metrics(&mut self, value: bool) {
        self.qos_metrics = value;
    }

    pub fn flow_time_refresh_rate(&self) -> u64 {
        self.flows.refresh_rate()
    }

    pub fn set_flow_time_refresh_rate(&mut self, rate: u64) {
        self.flows.set_refresh_rate(rate);
    }

    /// Capture time of the last segment seen, in microseconds.
    pub fn last_packet_time(&self) -> i64 {
        self.flows.last_packet_time()
    }

    /// Flows that matched an IP set on their first packet.
    pub fn ipset_matches(&self) -> u64 {
        self.flows.ipset_matches()
    }

    /// Flows given back to the pool, by retirement or timeout.
    pub fn released_flows(&self) -> u64 {
        self.flows.released_flows()
    }

    /// Evict flows idle for longer than the timeout.
    pub fn update_timers(&mut self, now: i64) -> usize {
        let tcp_info_cache = &mut self.tcp_info_cache;
        self.flows.update_timers(now, |flow| {
            if let Some(info) = flow.take_tcp_info() {
                tcp_info_cache.release(info);
            }
        })
    }

    fn retire_flow(&mut self, key: u64) -> bool {
        let tcp_info_cache = &mut self.tcp_info_cache;
        self.flows.retire(key, |flow| {
            if let Some(info) = flow.take_tcp_info() {
                tcp_info_cache.release(info);
            }
        })
    }
}

/// Run one segment through the flow's TCP state.
fn update_tcp_state(
    flow: &mut Flow,
    segment: Segment,
    direction: FlowDirection,
    now: i64,
    anomaly: &AnomalyManager,
    counters: &mut TcpCounters,
    qos_totals: Option<&mut TcpQosTotals>,
) {
    if segment.syn && (segment.fin || segment.rst) {
        anomaly.inc_flow_anomaly(flow, PacketAnomaly::TcpBadFlags);
    }

    let lifetime = now - flow.arrive_time;
    let tuple = *flow.tuple();
    let Some(info) = flow.tcp_info_mut() else {
        return;
    };

    if segment.syn {
        if segment.ack {
            info.syn_ack += 1;
            counters.synacks += 1;
        } else {
            info.syn += 1;
            counters.syns += 1;
        }
        if segment.fin {
            info.fin += 1;
            counters.fins += 1;
        }
    } else {
        if segment.fin {
            info.fin += 1;
            counters.fins += 1;
        } else if segment.ack {
            info.ack += 1;
            counters.acks += 1;
        }
        if segment.psh {
            info.push += 1;
        }
    }
    if segment.rst {
        info.rst += 1;
        counters.rsts += 1;
    }

    let dir = direction.index();
    if segment.syn {
        info.seq_num[dir] = Some(segment.seq.wrapping_add(1));
    } else {
        if info.seq_num[dir].is_some_and(|expected| expected != segment.seq) {
            info.out_of_sequence += 1;
        }
        info.seq_num[dir] = Some(segment.seq.wrapping_add(segment.payload as u32));
    }

    let previous = info.state_curr;
    if segment.rst {
        info.state_prev = TcpState::Closed;
        info.state_curr = TcpState::Closed;
    } else {
        let class = TcpFlagClass::classify(segment.syn, segment.ack, segment.fin);
        info.state_prev = info.state_curr;
        info.state_curr = next_state(info.state_curr, direction, class).unwrap_or(info.state_curr);
    }
    if previous != info.state_curr {
        trace!(flow = %tuple, from = %previous, to = %info.state_curr, "tcp state change");
    }

    if let Some(totals) = qos_totals {
        let rsts = info.rst;
        let qos = &mut info.qos;
        if segment.syn && !segment.ack {
            qos.syn_time = Some(now);
        } else if segment.ack && !segment.syn && qos.connection_setup_time.is_none() {
            if let Some(syn_time) = qos.syn_time {
                let setup = now - syn_time;
                qos.connection_setup_time = Some(setup);
                totals.connection_setup_time += setup;
            }
        }
        if segment.payload > 0 {
            match (direction, qos.last_client_data_time) {
                (FlowDirection::Forward, _) => qos.last_client_data_time = Some(now),
                (FlowDirection::Backward, Some(client_time)) => {
                    let response = now - client_time;
                    qos.application_response_time = Some(response);
                    totals.application_response_time += response;
                }
                (FlowDirection::Backward, None) => {}
            }
        }
        if now - qos.last_sample_time >= MICROS_PER_SECOND {
            qos.last_sample_time = now;
            if lifetime > 0 {
                qos.reset_rate = f64::from(rsts) * MICROS_PER_SECOND as f64 / lifetime as f64;
                totals.server_reset_rate += qos.reset_rate;
            }
        }
    }
}

impl Protocol for TcpProtocol {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn stats(&self) -> ProtocolStats {
        self.stats
    }

    fn allocated_memory(&self) -> usize {
        size_of::<Self>() + self.flows.allocated_memory() + self.tcp_info_cache.allocated_memory()
    }

    fn current_use_memory(&self) -> usize {
        size_of::<Self>()
            + self.flows.current_use_memory()
            + self.tcp_info_cache.current_use_memory()
    }

    fn increase_allocated_memory(&mut self, count: usize) {
        self.flows.cache.create_flows(count);
        self.tcp_info_cache.create(count);
    }

    fn decrease_allocated_memory(&mut self, count: usize) {
        self.flows.cache.destroy_flows(count);
        self.tcp_info_cache.destroy(count);
    }

    fn set_dynamic_allocated_memory(&mut self, value: bool) {
        self.flows.cache.set_dynamic_allocated_memory(value);
        self.tcp_info_cache.set_dynamic_allocated_memory(value);
    }

    fn total_cache_misses(&self) -> u64 {
        self.flows.cache.misses() + self.tcp_info_cache.fails()
    }

    fn release_flow_info(&mut self, flow: &mut Flow) {
        if let Some(info) = flow.take_tcp_info() {
            self.tcp_info_cache.release(info);
        }
    }

    fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()> {
        write_statistics(out, self.name(), &self.stats, self.allocated_memory(), level)?;
        if level > 3 {
            let c = &self.counters;
            writeln!(out, "\tTotal syns:{:>19}", c.syns)?;
            writeln!(out, "\tTotal synacks:{:>16}", c.synacks)?;
            writeln!(out, "\tTotal acks:{:>19}", c.acks)?;
            writeln!(out, "\tTotal fins:{:>19}", c.fins)?;
            writeln!(out, "\tTotal rsts:{:>19}", c.rsts)?;
            self.tcp_info_cache.statistics(out)?;
        }
        if self.qos_metrics && level > 1 {
            let q = &self.qos_totals;
            writeln!(out, "\tTotal setup time:{:>13} us", q.connection_setup_time)?;
            writeln!(out, "\tTotal response time:{:>10} us", q.application_response_time)?;
            writeln!(out, "\tTotal reset rate:{:>13.3}", q.server_reset_rate)?;
        }
        self.flows.statistics(out, level)
    }
}

impl PacketProtocol for TcpProtocol {
    fn is_valid(&mut self, packet: &mut Packet<'_>) -> bool {
        let data = packet.payload();
        if data.len() < MIN_HEADER_LEN {
            return self.stats.count_valid(false);
        }

        let header_len = usize::from(data[12] >> 4) * 4;
        if header_len < MIN_HEADER_LEN || header_len > data.len() {
            packet.anomaly = PacketAnomaly::TcpBogusHeader;
            self.anomaly.inc_anomaly(PacketAnomaly::TcpBogusHeader);
            return self.stats.count_valid(false);
        }
        self.stats.count_valid(true)
    }

    fn process_packet(&mut self, packet: &mut Packet<'_>) -> Option<NextLayer> {
        let header = TcpHeaderSlice::from_slice(packet.payload()).ok()?;
        let header_length = header.slice().len();
        let payload = packet.length().saturating_sub(header_length);
        let now = packet.timestamp();

        self.stats.count_packet(packet.length());
        self.counters.packets += 1;
        self.counters.bytes += payload as u64;
        packet.set_ports(header.source_port(), header.destination_port());

        let network = packet.network()?;
        let tuple = FiveTuple::new(
            network.source,
            header.source_port(),
            IP_PROTO_TCP,
            network.destination,
            header.destination_port(),
        );

        let tcp_info_cache = &mut self.tcp_info_cache;
        let (key, created) = self.flows.resolve(tuple, packet.tag(), now, |flow| {
            match tcp_info_cache.acquire() {
                Some(info) => {
                    flow.set_tcp_info(info);
                    true
                }
                None => false,
            }
        })?;

        let retire = {
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

            update_tcp_state(
                flow,
                Segment::from_header(&header, payload),
                direction,
                now,
                &self.anomaly,
                &mut self.counters,
                self.qos_metrics.then_some(&mut self.qos_totals),
            );

            flow.tcp_info().is_some_and(TcpInfo::is_closed)
                && flow.total_packets > MIN_PACKETS_TO_RETIRE
        };

        if retire && self.retire_flow(key) {
            return None;
        }

        if payload > 0 {
            packet.narrow(header_length);
            self.flows.forward(key, packet.payload());
        }

        self.flows.apply_verdict(key, packet);
        if self.flows.schedule_timers(key, now) {
            self.update_timers(now);
        }
        None
    }
}
