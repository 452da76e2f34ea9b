//! A complete Ethernet/IP/TCP/UDP pipeline.
//!
//! [`Stack`] owns one multiplexer tree wired as
//!
//! ```text
//! ethernet ─┬─ vlan ─┬─ ipv4 ─┬─ tcp
//!           │        └─ ipv6 ─┴─ udp
//!           ├─ ipv4
//!           └─ ipv6
//! ```
//!
//! plus the flow tables and pools of both transport decoders. A stack is
//! `Send` but not shared: run one per thread.

use std::io::{self, Write};
use std::sync::Arc;

use tracing::info;

use crate::adaptor::{DatabaseAdaptor, DEFAULT_PACKET_SAMPLING};
use crate::anomaly::AnomalyManager;
use crate::dispatch::{MultiplexerTree, MuxId};
use crate::flow::{Flow, DEFAULT_FLOW_TIMEOUT};
use crate::ipset::{IpSetLookup, RegexManager};
use crate::packet::Packet;
use crate::pcap::RawPacket;
use crate::protocol::{
    ethertype, BuiltinProtocol, EthernetProtocol, Ipv4Protocol, Ipv6Protocol, Protocol,
    TcpProtocol, UdpProtocol, VlanProtocol, DEFAULT_FLOW_TIME_REFRESH_RATE, IP_PROTO_TCP,
    IP_PROTO_UDP, LINKTYPE_ETHERNET,
};

/// Sizing and behaviour of a [`Stack`].
#[derive(Debug, Clone, PartialEq)]
pub struct StackConfig {
    /// Preallocated TCP flows (and TCP states).
    pub tcp_flows: usize,
    /// Preallocated UDP flows.
    pub udp_flows: usize,
    /// Inactivity timeout in seconds.
    pub flow_timeout: i64,
    /// Packets of a flow between two refreshes of its timer entry.
    pub flow_time_refresh_rate: u64,
    pub qos_metrics: bool,
    /// Reclaim closed TCP flows as soon as they finish.
    pub release_flows: bool,
    /// Let the pools grow past their preallocated size.
    pub dynamic_allocated_memory: bool,
    /// Packets of a flow between two adaptor updates.
    pub packet_sampling: u64,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            tcp_flows: 16384,
            udp_flows: 16384,
            flow_timeout: DEFAULT_FLOW_TIMEOUT,
            flow_time_refresh_rate: DEFAULT_FLOW_TIME_REFRESH_RATE,
            qos_metrics: false,
            release_flows: true,
            dynamic_allocated_memory: false,
            packet_sampling: DEFAULT_PACKET_SAMPLING,
        }
    }
}

/// One packet processing pipeline.
pub struct Stack {
    config: StackConfig,
    anomaly: Arc<AnomalyManager>,
    ipset: Option<Arc<dyn IpSetLookup>>,
    tree: MultiplexerTree,
    ethernet: MuxId,
    tcp: MuxId,
    udp: MuxId,
    total_packets: u64,
    total_bytes: u64,
    unsupported_packets: u64,
}

impl Default for Stack {
    fn default() -> Self {
        Self::new()
    }
}

impl Stack {
    pub fn new() -> Self {
        Self::with_config(StackConfig::default())
    }

    pub fn with_config(config: StackConfig) -> Self {
        let anomaly = Arc::new(AnomalyManager::new());
        let mut tree = MultiplexerTree::new();

        let mut tcp = TcpProtocol::with_capacity(Arc::clone(&anomaly), config.tcp_flows);
        tcp.set_qos_metrics(config.qos_metrics);
        tcp.set_flow_time_refresh_rate(config.flow_time_refresh_rate);
        tcp.set_dynamic_allocated_memory(config.dynamic_allocated_memory);
        tcp.flow_manager_mut().set_timeout(config.flow_timeout);
        tcp.flow_manager_mut().set_release_flows(config.release_flows);

        let mut udp = UdpProtocol::with_capacity(Arc::clone(&anomaly), config.udp_flows);
        udp.set_flow_time_refresh_rate(config.flow_time_refresh_rate);
        udp.set_dynamic_allocated_memory(config.dynamic_allocated_memory);
        udp.flow_manager_mut().set_timeout(config.flow_timeout);

        let ethernet = tree.add(EthernetProtocol::new());
        let vlan = tree.add(VlanProtocol::new());
        let ipv4 = tree.add(Ipv4Protocol::new(Arc::clone(&anomaly)));
        let ipv6 = tree.add(Ipv6Protocol::new(Arc::clone(&anomaly)));
        let tcp = tree.add(tcp);
        let udp = tree.add(udp);

        tree.set_protocol_identifier(vlan, ethertype::VLAN);
        tree.set_protocol_identifier(ipv4, ethertype::IPV4);
        tree.set_protocol_identifier(ipv6, ethertype::IPV6);
        tree.set_protocol_identifier(tcp, u16::from(IP_PROTO_TCP));
        tree.set_protocol_identifier(udp, u16::from(IP_PROTO_UDP));

        tree.link(ethernet, vlan);
        tree.add_up_multiplexer(ethernet, vlan, ethertype::QINQ);
        tree.link(ethernet, ipv4);
        tree.link(ethernet, ipv6);
        tree.add_up_multiplexer(vlan, vlan, ethertype::VLAN);
        tree.link(vlan, ipv4);
        tree.link(vlan, ipv6);
        for ip in [ipv4, ipv6] {
            tree.link(ip, tcp);
            tree.link(ip, udp);
        }

        info!(
            tcp_flows = config.tcp_flows,
            udp_flows = config.udp_flows,
            timeout = config.flow_timeout,
            "stack ready"
        );

        Self {
            config,
            anomaly,
            ipset: None,
            tree,
            ethernet,
            tcp,
            udp,
            total_packets: 0,
            total_bytes: 0,
            unsupported_packets: 0,
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Run one Ethernet frame through the pipeline.
    ///
    /// Returns whether every layer the frame reached found it valid.
    pub fn process_packet(&mut self, data: &[u8], timestamp_us: i64) -> bool {
        let mut packet = Packet::new(data, timestamp_us);
        self.dispatch(&mut packet)
    }

    /// Like [`Stack::process_packet`], leaving the verdict flags on `packet`.
    pub fn dispatch(&mut self, packet: &mut Packet<'_>) -> bool {
        self.total_packets += 1;
        self.total_bytes += packet.length() as u64;
        self.tree.dispatch(self.ethernet, packet)
    }

    /// Run a frame read from a capture file; only Ethernet is decoded.
    pub fn process_raw(&mut self, raw: &RawPacket) -> bool {
        if raw.link_type != LINKTYPE_ETHERNET {
            self.unsupported_packets += 1;
            return false;
        }
        self.process_packet(&raw.data, raw.timestamp_us)
    }

    pub fn tcp(&self) -> Option<&TcpProtocol> {
        self.tree.protocol(self.tcp).and_then(BuiltinProtocol::as_tcp)
    }

    pub fn tcp_mut(&mut self) -> Option<&mut TcpProtocol> {
        self.tree.protocol_mut(self.tcp).and_then(BuiltinProtocol::as_tcp_mut)
    }

    pub fn udp(&self) -> Option<&UdpProtocol> {
        self.tree.protocol(self.udp).and_then(BuiltinProtocol::as_udp)
    }

    pub fn udp_mut(&mut self) -> Option<&mut UdpProtocol> {
        self.tree.protocol_mut(self.udp).and_then(BuiltinProtocol::as_udp_mut)
    }

    pub fn multiplexers(&self) -> &MultiplexerTree {
        &self.tree
    }

    pub fn multiplexers_mut(&mut self) -> &mut MultiplexerTree {
        &mut self.tree
    }

    pub fn anomaly_manager(&self) -> &Arc<AnomalyManager> {
        &self.anomaly
    }

    pub fn set_ipset_manager(&mut self, lookup: Arc<dyn IpSetLookup>) {
        if let Some(tcp) = self.tcp_mut() {
            tcp.set_ipset_manager(Arc::clone(&lookup));
        }
        if let Some(udp) = self.udp_mut() {
            udp.set_ipset_manager(Arc::clone(&lookup));
        }
        self.ipset = Some(lookup);
    }

    pub fn set_regex_manager(&mut self, manager: Option<Arc<dyn RegexManager>>) {
        if let Some(tcp) = self.tcp_mut() {
            tcp.set_regex_manager(manager.clone());
        }
        if let Some(udp) = self.udp_mut() {
            udp.set_regex_manager(manager);
        }
    }

    pub fn set_tcp_adaptor(&mut self, adaptor: Box<dyn DatabaseAdaptor>) {
        let sampling = self.config.packet_sampling;
        if let Some(tcp) = self.tcp_mut() {
            tcp.set_adaptor(adaptor, sampling);
        }
    }

    pub fn set_udp_adaptor(&mut self, adaptor: Box<dyn DatabaseAdaptor>) {
        let sampling = self.config.packet_sampling;
        if let Some(udp) = self.udp_mut() {
            udp.set_adaptor(adaptor, sampling);
        }
    }

    /// Change the inactivity timeout of both flow tables, in seconds.
    pub fn set_flows_timeout(&mut self, seconds: i64) {
        self.config.flow_timeout = seconds;
        if let Some(tcp) = self.tcp_mut() {
            tcp.flow_manager_mut().set_timeout(seconds);
        }
        if let Some(udp) = self.udp_mut() {
            udp.flow_manager_mut().set_timeout(seconds);
        }
    }

    /// Sweep both flow tables; returns the number of flows evicted.
    pub fn update_timers(&mut self, now: i64) -> usize {
        let tcp = self.tcp_mut().map_or(0, |tcp| tcp.update_timers(now));
        let udp = self.udp_mut().map_or(0, |udp| udp.update_timers(now));
        tcp + udp
    }

    /// Active TCP flows followed by active UDP flows.
    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        let tcp = self.tcp().into_iter().flat_map(|tcp| tcp.flow_manager().flows());
        let udp = self.udp().into_iter().flat_map(|udp| udp.flow_manager().flows());
        tcp.chain(udp)
    }

    pub fn total_flows(&self) -> usize {
        self.tcp().map_or(0, |tcp| tcp.flow_manager().len())
            + self.udp().map_or(0, |udp| udp.flow_manager().len())
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Frames skipped for a link type other than Ethernet.
    pub fn unsupported_packets(&self) -> u64 {
        self.unsupported_packets
    }

    pub fn allocated_memory(&self) -> usize {
        self.tree
            .iter()
            .filter_map(|(_, node)| node.protocol())
            .map(|p| p.allocated_memory())
            .sum()
    }

    pub fn total_cache_misses(&self) -> u64 {
        self.tree
            .iter()
            .filter_map(|(_, node)| node.protocol())
            .map(|p| p.total_cache_misses())
            .sum()
    }

    /// Write the report of every decoder; see [`Protocol::statistics`].
    pub fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()> {
        if level == 0 {
            return Ok(());
        }
        writeln!(out, "Stack statistics")?;
        writeln!(out, "\tTotal packets:{:>16}", self.total_packets)?;
        writeln!(out, "\tTotal bytes:{:>18}", self.total_bytes)?;
        writeln!(out, "\tTotal allocated:{:>14}", self.allocated_memory())?;
        if self.unsupported_packets > 0 {
            writeln!(out, "\tUnsupported packets:{:>10}", self.unsupported_packets)?;
        }
        self.tree.statistics(out, level)?;
        self.anomaly.statistics(out)?;
        if level > 1 {
            if let Some(ipset) = self.ipset.as_deref() {
                ipset.statistics(out)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_utils::{build_tcp_packet, build_udp_packet, EthernetBuilder};
    use bytes::Bytes;

    fn small() -> Stack {
        Stack::with_config(StackConfig {
            tcp_flows: 8,
            udp_flows: 8,
            ..Default::default()
        })
    }

    fn assert_send<T: Send>() {}

    #[test]
    fn test_stack_is_send() {
        assert_send::<Stack>();
    }

    // Test 1: A TCP frame reaches the TCP flow table
    #[test]
    fn test_tcp_frame_creates_flow() {
        let mut stack = small();
        let frame = build_tcp_packet([10, 0, 0, 1], [10, 0, 0, 2], 40000, 80, 0x02);

        assert!(stack.process_packet(&frame, 1));
        assert_eq!(stack.tcp().unwrap().flow_manager().len(), 1);
        assert_eq!(stack.udp().unwrap().flow_manager().len(), 0);
        assert_eq!(stack.total_flows(), 1);
    }

    // Test 2: A UDP frame reaches the UDP flow table
    #[test]
    fn test_udp_frame_creates_flow() {
        let mut stack = small();
        let frame = build_udp_packet([10, 0, 0, 1], [8, 8, 8, 8], 5353, 53, vec![0; 20]);

        assert!(stack.process_packet(&frame, 1));
        assert_eq!(stack.udp().unwrap().flow_manager().len(), 1);
        assert_eq!(stack.flows().count(), 1);
    }

    #[test]
    fn test_non_ethernet_link_is_skipped() {
        let mut stack = small();
        let raw = RawPacket {
            frame_number: 1,
            timestamp_us: 0,
            captured_length: 4,
            original_length: 4,
            link_type: 113,
            data: Bytes::from_static(&[0, 0, 0, 0]),
        };

        assert!(!stack.process_raw(&raw));
        assert_eq!(stack.unsupported_packets(), 1);
        assert_eq!(stack.total_packets(), 0);
    }

    #[test]
    fn test_unknown_ethertype_is_not_invalid() {
        let mut stack = small();
        let frame = EthernetBuilder::new().ethertype(0x0806).payload(vec![0; 28]).build();

        assert!(stack.process_packet(&frame, 1));
        assert_eq!(stack.total_flows(), 0);
    }

    #[test]
    fn test_config_reaches_decoders() {
        let stack = Stack::with_config(StackConfig {
            tcp_flows: 3,
            udp_flows: 2,
            flow_timeout: 30,
            flow_time_refresh_rate: 4,
            qos_metrics: true,
            release_flows: false,
            ..Default::default()
        });

        let tcp = stack.tcp().unwrap();
        assert_eq!(tcp.flow_cache().total_flows(), 3);
        assert_eq!(tcp.flow_manager().timeout(), 30);
        assert_eq!(tcp.flow_time_refresh_rate(), 4);
        assert!(tcp.qos_metrics());
        assert!(!tcp.flow_manager().release_flows());
        assert_eq!(stack.udp().unwrap().flow_cache().total_flows(), 2);
    }

    #[test]
    fn test_huge_timeout_does_not_overflow() {
        let mut stack = Stack::with_config(StackConfig {
            tcp_flows: 2,
            udp_flows: 2,
            flow_timeout: i64::MAX / 1000,
            ..Default::default()
        });
        let frame = build_tcp_packet([10, 0, 0, 1], [10, 0, 0, 2], 40000, 80, 0x02);

        assert!(stack.process_packet(&frame, 1));
        assert_eq!(stack.update_timers(i64::MAX), 0);
        assert_eq!(stack.total_flows(), 1);
    }

    #[test]
    fn test_statistics_report() {
        let mut stack = small();
        let frame = build_tcp_packet([10, 0, 0, 1], [10, 0, 0, 2], 40000, 80, 0x02);
        stack.process_packet(&frame, 1);

        let mut out = Vec::new();
        stack.statistics(&mut out, 2).unwrap();
        let report = String::from_utf8(out).unwrap();
        assert!(report.contains("Stack statistics"));
        assert!(report.contains("tcp statistics"));
        assert!(report.contains("Total valid packets"));
    }
}
