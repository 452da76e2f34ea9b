//! Flow level dispatch tree.

use std::io::{self, Write};

use smallvec::SmallVec;
use tracing::trace;

use crate::flow::Flow;
use crate::protocol::{FlowProtocol, Protocol};

/// Index of a node in a [`FlowForwarderTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForwarderId(usize);

impl ForwarderId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Custom payload check replacing the bound decoder's.
pub type FlowChecker = Box<dyn FnMut(&Flow, &[u8]) -> bool + Send>;

/// Custom handler replacing the bound decoder's `process_flow`.
pub type FlowFunction = Box<dyn FnMut(&mut Flow, &[u8]) + Send>;

/// Per-node flow counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    pub received: u64,
    pub forwarded: u64,
    pub failed: u64,
}

/// One node of the flow dispatch tree.
pub struct FlowForwarder {
    name: &'static str,
    protocol: Option<Box<dyn FlowProtocol>>,
    checker: Option<FlowChecker>,
    flow_function: Option<FlowFunction>,
    up: SmallVec<[ForwarderId; 4]>,
    down: Option<ForwarderId>,
    stats: ForwarderStats,
}

impl FlowForwarder {
    fn new(name: &'static str, protocol: Option<Box<dyn FlowProtocol>>) -> Self {
        Self {
            name,
            protocol,
            checker: None,
            flow_function: None,
            up: SmallVec::new(),
            down: None,
            stats: ForwarderStats::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn protocol(&self) -> Option<&dyn FlowProtocol> {
        self.protocol.as_deref()
    }

    pub fn protocol_mut(&mut self) -> Option<&mut (dyn FlowProtocol + 'static)> {
        self.protocol.as_deref_mut()
    }

    pub fn down(&self) -> Option<ForwarderId> {
        self.down
    }

    pub fn up(&self) -> &[ForwarderId] {
        &self.up
    }

    pub fn stats(&self) -> ForwarderStats {
        self.stats
    }

    fn accepts(&mut self, flow: &Flow, payload: &[u8]) -> bool {
        match (self.checker.as_mut(), self.protocol.as_mut()) {
            (Some(checker), _) => checker(flow, payload),
            (None, Some(protocol)) => protocol.is_valid(flow, payload),
            (None, None) => false,
        }
    }

    fn handle(&mut self, flow: &mut Flow, payload: &[u8]) {
        match (self.flow_function.as_mut(), self.protocol.as_mut()) {
            (Some(function), _) => function(flow, payload),
            (None, Some(protocol)) => protocol.process_flow(flow, payload),
            (None, None) => {}
        }
    }
}

/// Arena of forwarders rooted at a transport decoder.
///
/// The root stands for the transport layer itself: it has no checker and
/// only fans out to the application forwarders registered on it.
pub struct FlowForwarderTree {
    nodes: Vec<FlowForwarder>,
}

impl FlowForwarderTree {
    /// Create a tree whose root is named after the transport decoder.
    pub fn new(root_name: &'static str) -> Self {
        Self {
            nodes: vec![FlowForwarder::new(root_name, None)],
        }
    }

    pub fn root(&self) -> ForwarderId {
        ForwarderId(0)
    }

    /// Add a forwarder bound to an application decoder.
    pub fn add(&mut self, protocol: Box<dyn FlowProtocol>) -> ForwarderId {
        let name = protocol.name();
        self.nodes.push(FlowForwarder::new(name, Some(protocol)));
        ForwarderId(self.nodes.len() - 1)
    }

    /// Add a forwarder with no decoder; give it a checker and a flow function.
    pub fn add_empty(&mut self, name: &'static str) -> ForwarderId {
        self.nodes.push(FlowForwarder::new(name, None));
        ForwarderId(self.nodes.len() - 1)
    }

    pub fn get(&self, id: ForwarderId) -> Option<&FlowForwarder> {
        self.nodes.get(id.0)
    }

    pub fn get_mut(&mut self, id: ForwarderId) -> Option<&mut FlowForwarder> {
        self.nodes.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_checker(&mut self, id: ForwarderId, checker: FlowChecker) {
        if let Some(node) = self.get_mut(id) {
            node.checker = Some(checker);
        }
    }

    pub fn add_flow_function(&mut self, id: ForwarderId, function: FlowFunction) {
        if let Some(node) = self.get_mut(id) {
            node.flow_function = Some(function);
        }
    }

    /// Append `next` to the candidates tried after `id`; order matters.
    pub fn add_up_flow_forwarder(&mut self, id: ForwarderId, next: ForwarderId) {
        if next.0 >= self.nodes.len() || next == id {
            return;
        }
        if let Some(node) = self.get_mut(id) {
            if !node.up.contains(&next) {
                node.up.push(next);
            }
        }
        if let Some(node) = self.get_mut(next) {
            node.down.get_or_insert(id);
        }
    }

    /// Route `payload` of `flow` to an application decoder.
    ///
    /// A flow already routed to a terminal forwarder goes straight to it.
    /// Otherwise candidates are tried in registration order; the first one
    /// accepting the payload handles it and becomes the flow's forwarder,
    /// then its own candidates are tried in turn.
    pub fn forward_flow(&mut self, flow: &mut Flow, payload: &[u8]) {
        if let Some(id) = flow.forwarder() {
            if let Some(node) = self.nodes.get_mut(id.0) {
                if node.up.is_empty() {
                    node.stats.received += 1;
                    node.handle(flow, payload);
                    return;
                }
            }
        }

        let mut current = flow.forwarder().unwrap_or(self.root());
        for _ in 0..self.nodes.len() {
            let candidates = match self.nodes.get_mut(current.0) {
                Some(node) => {
                    node.stats.received += 1;
                    node.up.clone()
                }
                None => return,
            };
            if candidates.is_empty() {
                return;
            }

            let accepted = candidates.iter().copied().find(|next| {
                self.nodes
                    .get_mut(next.0)
                    .is_some_and(|node| node.accepts(flow, payload))
            });

            let Some(next) = accepted else {
                self.nodes[current.0].stats.failed += 1;
                return;
            };

            self.nodes[current.0].stats.forwarded += 1;
            flow.set_forwarder(Some(next));
            trace!(forwarder = self.nodes[next.0].name, flow = %flow.tuple(), "flow forwarded");
            self.nodes[next.0].handle(flow, payload);
            current = next;
        }
    }

    /// Let the decoder that handled `flow` drop its per-flow state.
    pub fn release_flow_info(&mut self, flow: &mut Flow) {
        let Some(id) = flow.forwarder() else {
            return;
        };
        if let Some(protocol) = self.nodes.get_mut(id.0).and_then(FlowForwarder::protocol_mut) {
            protocol.release_flow_info(flow);
        }
        flow.set_forwarder(None);
    }

    /// Memory owned by the application decoders.
    pub fn allocated_memory(&self) -> usize {
        self.nodes
            .iter()
            .filter_map(FlowForwarder::protocol)
            .map(|p| p.allocated_memory())
            .sum()
    }

    pub fn total_cache_misses(&self) -> u64 {
        self.nodes
            .iter()
            .filter_map(FlowForwarder::protocol)
            .map(|p| p.total_cache_misses())
            .sum()
    }

    pub fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()> {
        for node in &self.nodes {
            if level > 2 {
                writeln!(
                    out,
                    "\tFlowForwarder {}: received {} forwarded {} failed {}",
                    node.name, node.stats.received, node.stats.forwarded, node.stats.failed
                )?;
            }
            if let Some(protocol) = node.protocol() {
                protocol.statistics(out, level)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolStats;

    /// Decoder matching payloads that start with a fixed prefix.
    struct PrefixProtocol {
        name: &'static str,
        prefix: &'static [u8],
        flows: u64,
        released: u64,
    }

    impl PrefixProtocol {
        fn boxed(name: &'static str, prefix: &'static [u8]) -> Box<Self> {
            Box::new(Self {
                name,
                prefix,
                flows: 0,
                released: 0,
            })
        }
    }

    impl Protocol for PrefixProtocol {
        fn name(&self) -> &'static str {
            self.name
        }

        fn stats(&self) -> ProtocolStats {
            ProtocolStats {
                total_packets: self.flows,
                ..Default::default()
            }
        }

        fn allocated_memory(&self) -> usize {
            0
        }

        fn release_flow_info(&mut self, _flow: &mut Flow) {
            self.released += 1;
        }
    }

    impl FlowProtocol for PrefixProtocol {
        fn is_valid(&mut self, _flow: &Flow, payload: &[u8]) -> bool {
            payload.starts_with(self.prefix)
        }

        fn process_flow(&mut self, _flow: &mut Flow, _payload: &[u8]) {
            self.flows += 1;
        }
    }

    fn handled(tree: &FlowForwarderTree, id: ForwarderId) -> u64 {
        tree.get(id).unwrap().protocol().unwrap().stats().total_packets
    }

    // Test 1: First accepting candidate wins and is remembered
    #[test]
    fn test_first_match_wins() {
        let mut tree = FlowForwarderTree::new("tcp");
        let root = tree.root();
        let http = tree.add(PrefixProtocol::boxed("http", b"GET "));
        let catch_all = tree.add(PrefixProtocol::boxed("any", b""));
        tree.add_up_flow_forwarder(root, http);
        tree.add_up_flow_forwarder(root, catch_all);

        let mut flow = Flow::default();
        tree.forward_flow(&mut flow, b"GET / HTTP/1.1\r\n");

        assert_eq!(flow.forwarder(), Some(http));
        assert_eq!(handled(&tree, http), 1);
        assert_eq!(handled(&tree, catch_all), 0);
    }

    // Test 2: Later packets skip the checkers
    #[test]
    fn test_remembered_forwarder_is_reused() {
        let mut tree = FlowForwarderTree::new("tcp");
        let root = tree.root();
        let http = tree.add(PrefixProtocol::boxed("http", b"GET "));
        tree.add_up_flow_forwarder(root, http);

        let mut flow = Flow::default();
        tree.forward_flow(&mut flow, b"GET /");
        tree.forward_flow(&mut flow, b"not a request line");

        assert_eq!(handled(&tree, http), 2);
        assert_eq!(tree.get(root).unwrap().stats().received, 1);
    }

    // Test 3: Nothing accepts the payload
    #[test]
    fn test_no_match_counts_failure() {
        let mut tree = FlowForwarderTree::new("udp");
        let root = tree.root();
        let dns = tree.add(PrefixProtocol::boxed("dns", b"\x00\x01"));
        tree.add_up_flow_forwarder(root, dns);

        let mut flow = Flow::default();
        tree.forward_flow(&mut flow, b"\xff\xff");

        assert!(flow.forwarder().is_none());
        assert_eq!(tree.get(root).unwrap().stats().failed, 1);
    }

    // Test 4: Forwarding continues into nested chains
    #[test]
    fn test_nested_chain() {
        let mut tree = FlowForwarderTree::new("tcp");
        let root = tree.root();
        let tls = tree.add(PrefixProtocol::boxed("tls", b"\x16\x03"));
        let tls13 = tree.add(PrefixProtocol::boxed("tls13", b"\x16\x03\x01"));
        tree.add_up_flow_forwarder(root, tls);
        tree.add_up_flow_forwarder(tls, tls13);

        let mut flow = Flow::default();
        tree.forward_flow(&mut flow, b"\x16\x03\x01\x02");

        assert_eq!(flow.forwarder(), Some(tls13));
        assert_eq!(handled(&tree, tls), 1);
        assert_eq!(handled(&tree, tls13), 1);
        assert_eq!(tree.get(tls13).unwrap().down(), Some(tls));
    }

    #[test]
    fn test_custom_checker_and_function() {
        let mut tree = FlowForwarderTree::new("udp");
        let root = tree.root();
        let probe = tree.add_empty("probe");
        tree.add_checker(probe, Box::new(|_flow: &Flow, payload: &[u8]| payload.len() > 2));
        tree.add_flow_function(
            probe,
            Box::new(|flow: &mut Flow, _payload: &[u8]| flow.set_evidence(true)),
        );
        tree.add_up_flow_forwarder(root, probe);

        let mut flow = Flow::default();
        tree.forward_flow(&mut flow, b"ab");
        assert!(!flow.have_evidence());

        tree.forward_flow(&mut flow, b"abc");
        assert!(flow.have_evidence());
    }

    #[test]
    fn test_release_flow_info_reaches_decoder() {
        let mut tree = FlowForwarderTree::new("tcp");
        let root = tree.root();
        let http = tree.add(PrefixProtocol::boxed("http", b"GET "));
        tree.add_up_flow_forwarder(root, http);

        let mut flow = Flow::default();
        tree.forward_flow(&mut flow, b"GET /");
        tree.release_flow_info(&mut flow);

        assert!(flow.forwarder().is_none());
        let mut out = Vec::new();
        tree.statistics(&mut out, 3).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("FlowForwarder http"));
    }
}
