//! Bidirectional flows.
//!
//! A [`Flow`] is the record of one conversation between two endpoints. It is
//! identified by the hash of its five-tuple as seen on the first packet;
//! packets travelling the other way find it through the swapped hash, see
//! [`flow_keys`].
//!
//! Flows are pooled: idle ones live in a [`FlowCache`], active ones in a
//! [`FlowManager`]. A flow is moved between the two as a `Box<Flow>`, so it
//! can never be owned by both.

mod cache;
mod manager;

pub use cache::FlowCache;
pub use manager::{FlowManager, DEFAULT_FLOW_TIMEOUT};

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use crate::anomaly::PacketAnomaly;
use crate::dispatch::ForwarderId;
use crate::ipset::{IpSet, RegexManager};
use crate::protocol::TcpInfo;

/// Direction of a packet relative to the packet that created its flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlowDirection {
    #[default]
    Forward,
    Backward,
}

impl FlowDirection {
    /// Index into per-direction arrays.
    #[inline]
    pub fn index(&self) -> usize {
        match self {
            FlowDirection::Forward => 0,
            FlowDirection::Backward => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowDirection::Forward => "forward",
            FlowDirection::Backward => "backward",
        }
    }
}

/// Endpoints and transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub source: IpAddr,
    pub source_port: u16,
    pub destination: IpAddr,
    pub destination_port: u16,
    pub protocol: u8,
}

impl Default for FiveTuple {
    fn default() -> Self {
        Self {
            source: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            source_port: 0,
            destination: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            destination_port: 0,
            protocol: 0,
        }
    }
}

impl FiveTuple {
    pub fn new(
        source: IpAddr,
        source_port: u16,
        protocol: u8,
        destination: IpAddr,
        destination_port: u16,
    ) -> Self {
        Self {
            source,
            source_port,
            destination,
            destination_port,
            protocol,
        }
    }

    /// The same conversation seen from the other endpoint.
    pub fn reversed(&self) -> Self {
        Self {
            source: self.destination,
            source_port: self.destination_port,
            destination: self.source,
            destination_port: self.source_port,
            protocol: self.protocol,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.source.is_ipv6()
    }

    /// Ordered hash: `hash(src, sport, proto, dst, dport)`.
    pub fn ordered_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.source.hash(&mut hasher);
        self.source_port.hash(&mut hasher);
        self.protocol.hash(&mut hasher);
        self.destination.hash(&mut hasher);
        self.destination_port.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.source, self.source_port, self.protocol, self.destination, self.destination_port
        )
    }
}

/// Lookup keys for a packet: its own ordered hash and the swapped one.
///
/// Both are XORed with the tag, so the same five-tuple under two tags maps
/// to two flows.
pub fn flow_keys(tuple: &FiveTuple, tag: Option<u32>) -> (u64, u64) {
    let salt = tag.map_or(0, u64::from);
    (
        tuple.ordered_hash() ^ salt,
        tuple.reversed().ordered_hash() ^ salt,
    )
}

/// One bidirectional conversation.
#[derive(Debug, Default)]
pub struct Flow {
    id: u64,
    tag: Option<u32>,
    tuple: FiveTuple,
    direction: FlowDirection,
    /// Arrival time of the first packet, in microseconds.
    pub arrive_time: i64,
    /// Time of the most recent packet, in microseconds.
    pub last_packet_time: i64,
    pub total_bytes: u64,
    pub total_packets: u64,
    tcp_info: Option<Box<TcpInfo>>,
    forwarder: Option<ForwarderId>,
    ipset: Option<Arc<IpSet>>,
    regex_manager: Option<Arc<dyn RegexManager>>,
    anomaly: PacketAnomaly,
    anomaly_count: u32,
    accept: Option<bool>,
    reject: bool,
    partial_reject: bool,
    evidence: bool,
    /// The persistence adaptor was already told to drop this flow.
    adaptor_removed: bool,
}

impl Flow {
    /// Fill a pooled flow for a new conversation.
    pub fn init(&mut self, id: u64, tuple: FiveTuple, tag: Option<u32>, now: i64) {
        self.id = id;
        self.tuple = tuple;
        self.tag = tag;
        self.direction = FlowDirection::Forward;
        self.arrive_time = now;
        self.last_packet_time = now;
    }

    /// Hash the flow is stored under.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn tag(&self) -> Option<u32> {
        self.tag
    }

    #[inline]
    pub fn tuple(&self) -> &FiveTuple {
        &self.tuple
    }

    #[inline]
    pub fn source_port(&self) -> u16 {
        self.tuple.source_port
    }

    #[inline]
    pub fn destination_port(&self) -> u16 {
        self.tuple.destination_port
    }

    /// Direction of a packet sent from `source_port`.
    #[inline]
    pub fn direction_of(&self, source_port: u16) -> FlowDirection {
        if source_port == self.tuple.source_port {
            FlowDirection::Forward
        } else {
            FlowDirection::Backward
        }
    }

    /// Direction of the packet being processed.
    #[inline]
    pub fn direction(&self) -> FlowDirection {
        self.direction
    }

    pub fn set_direction(&mut self, direction: FlowDirection) {
        self.direction = direction;
    }

    /// Microseconds between the first and the last packet.
    pub fn duration(&self) -> i64 {
        self.last_packet_time - self.arrive_time
    }

    pub fn tcp_info(&self) -> Option<&TcpInfo> {
        self.tcp_info.as_deref()
    }

    pub fn tcp_info_mut(&mut self) -> Option<&mut TcpInfo> {
        self.tcp_info.as_deref_mut()
    }

    pub fn set_tcp_info(&mut self, info: Box<TcpInfo>) {
        self.tcp_info = Some(info);
    }

    pub fn take_tcp_info(&mut self) -> Option<Box<TcpInfo>> {
        self.tcp_info.take()
    }

    /// Terminal forwarder this flow was last routed through.
    #[inline]
    pub fn forwarder(&self) -> Option<ForwarderId> {
        self.forwarder
    }

    pub fn set_forwarder(&mut self, forwarder: Option<ForwarderId>) {
        self.forwarder = forwarder;
    }

    pub fn ipset(&self) -> Option<&Arc<IpSet>> {
        self.ipset.as_ref()
    }

    pub fn set_ipset(&mut self, ipset: Arc<IpSet>) {
        self.ipset = Some(ipset);
    }

    pub fn regex_manager(&self) -> Option<&Arc<dyn RegexManager>> {
        self.regex_manager.as_ref()
    }

    pub fn set_regex_manager(&mut self, manager: Option<Arc<dyn RegexManager>>) {
        self.regex_manager = manager;
    }

    #[inline]
    pub fn anomaly(&self) -> PacketAnomaly {
        self.anomaly
    }

    /// Stamp the category if the flow has none yet.
    pub fn set_anomaly(&mut self, anomaly: PacketAnomaly) {
        if self.anomaly.is_none() {
            self.anomaly = anomaly;
        }
    }

    #[inline]
    pub fn anomaly_count(&self) -> u32 {
        self.anomaly_count
    }

    pub(crate) fn record_anomaly(&mut self, anomaly: PacketAnomaly) {
        self.set_anomaly(anomaly);
        self.anomaly_count += 1;
    }

    /// Verdict for packets of this flow; flows accept until told otherwise.
    #[inline]
    pub fn is_accept(&self) -> bool {
        self.accept.unwrap_or(true)
    }

    pub fn set_accept(&mut self, accept: bool) {
        self.accept = Some(accept);
    }

    #[inline]
    pub fn is_reject(&self) -> bool {
        self.reject
    }

    pub fn set_reject(&mut self, reject: bool) {
        self.reject = reject;
    }

    #[inline]
    pub fn is_partial_reject(&self) -> bool {
        self.partial_reject
    }

    pub fn set_partial_reject(&mut self, partial_reject: bool) {
        self.partial_reject = partial_reject;
    }

    #[inline]
    pub fn have_evidence(&self) -> bool {
        self.evidence
    }

    pub fn set_evidence(&mut self, evidence: bool) {
        self.evidence = evidence;
    }

    #[inline]
    pub fn is_adaptor_removed(&self) -> bool {
        self.adaptor_removed
    }

    pub fn set_adaptor_removed(&mut self, removed: bool) {
        self.adaptor_removed = removed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn tuple() -> FiveTuple {
        FiveTuple::new(
            "10.0.0.1".parse().unwrap(),
            40000,
            6,
            "10.0.0.2".parse().unwrap(),
            80,
        )
    }

    // Test 1: Both directions produce the same key pair, swapped
    #[test]
    fn test_flow_keys_are_symmetric() {
        let forward = tuple();
        let backward = forward.reversed();

        let (f1, f2) = flow_keys(&forward, None);
        let (b1, b2) = flow_keys(&backward, None);

        assert_eq!(f1, b2);
        assert_eq!(f2, b1);
        assert_ne!(f1, f2);
    }

    // Test 2: The tag separates otherwise identical tuples
    #[test]
    fn test_tag_changes_keys() {
        let (plain, _) = flow_keys(&tuple(), None);
        let (tagged, _) = flow_keys(&tuple(), Some(7));
        assert_ne!(plain, tagged);

        let (again, _) = flow_keys(&tuple(), Some(7));
        assert_eq!(tagged, again);
    }

    #[test]
    fn test_ipv6_tuple_hashes() {
        let t = FiveTuple::new(
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            1234,
            17,
            IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            53,
        );
        assert!(t.is_ipv6());
        let (h1, h2) = flow_keys(&t, None);
        assert_eq!(h1, flow_keys(&t.reversed(), None).1);
        assert_ne!(h1, h2);
    }

    // Test 3: Direction depends only on the source port
    #[test]
    fn test_direction_by_source_port() {
        let mut flow = Flow::default();
        flow.init(1, tuple(), None, 0);

        assert_eq!(flow.direction_of(40000), FlowDirection::Forward);
        assert_eq!(flow.direction_of(80), FlowDirection::Backward);
        assert_eq!(flow.direction_of(40000), FlowDirection::Forward);
    }

    #[test]
    fn test_display_tuple() {
        assert_eq!(tuple().to_string(), "10.0.0.1:40000:6:10.0.0.2:80");
    }
}
