//! Packet level dispatch tree.

use std::io::{self, Write};

use smallvec::SmallVec;
use tracing::trace;

use crate::packet::Packet;
use crate::protocol::{BuiltinProtocol, NextLayer, PacketProtocol, Protocol};

/// Index of a node in a [`MultiplexerTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MuxId(usize);

impl MuxId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Custom validity check replacing the bound protocol's.
pub type PacketChecker = Box<dyn FnMut(&mut Packet<'_>) -> bool + Send>;

/// Custom handler replacing the bound protocol's `process_packet`.
pub type PacketFunction = Box<dyn FnMut(&mut Packet<'_>) -> Option<NextLayer> + Send>;

/// Per-node packet counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiplexerStats {
    pub received: u64,
    pub forwarded: u64,
    pub failed: u64,
}

/// One node of the packet dispatch tree.
pub struct Multiplexer {
    protocol_id: u16,
    protocol: Option<BuiltinProtocol>,
    checker: Option<PacketChecker>,
    packet_function: Option<PacketFunction>,
    up: SmallVec<[(u16, MuxId); 4]>,
    down: Option<MuxId>,
    stats: MultiplexerStats,
}

impl Multiplexer {
    fn new(protocol: Option<BuiltinProtocol>) -> Self {
        Self {
            protocol_id: 0,
            protocol,
            checker: None,
            packet_function: None,
            up: SmallVec::new(),
            down: None,
            stats: MultiplexerStats::default(),
        }
    }

    /// Identifier the parent uses to reach this node.
    pub fn protocol_id(&self) -> u16 {
        self.protocol_id
    }

    pub fn protocol(&self) -> Option<&BuiltinProtocol> {
        self.protocol.as_ref()
    }

    pub fn protocol_mut(&mut self) -> Option<&mut BuiltinProtocol> {
        self.protocol.as_mut()
    }

    /// Parent node; used for lookups only, dispatch never goes down.
    pub fn down(&self) -> Option<MuxId> {
        self.down
    }

    pub fn up(&self, protocol_id: u16) -> Option<MuxId> {
        self.up
            .iter()
            .find(|(id, _)| *id == protocol_id)
            .map(|(_, child)| *child)
    }

    pub fn up_count(&self) -> usize {
        self.up.len()
    }

    pub fn stats(&self) -> MultiplexerStats {
        self.stats
    }

    fn check(&mut self, packet: &mut Packet<'_>) -> bool {
        match (self.checker.as_mut(), self.protocol.as_mut()) {
            (Some(checker), _) => checker(packet),
            (None, Some(protocol)) => protocol.is_valid(packet),
            (None, None) => true,
        }
    }

    fn process(&mut self, packet: &mut Packet<'_>) -> Option<NextLayer> {
        match (self.packet_function.as_mut(), self.protocol.as_mut()) {
            (Some(function), _) => function(packet),
            (None, Some(protocol)) => protocol.process_packet(packet),
            (None, None) => None,
        }
    }

    fn name(&self) -> &'static str {
        self.protocol.as_ref().map_or("multiplexer", |p| p.name())
    }
}

/// Arena holding every multiplexer of a pipeline.
#[derive(Default)]
pub struct MultiplexerTree {
    nodes: Vec<Multiplexer>,
}

impl MultiplexerTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node bound to `protocol`.
    pub fn add(&mut self, protocol: impl Into<BuiltinProtocol>) -> MuxId {
        self.push(Multiplexer::new(Some(protocol.into())))
    }

    /// Add a node with no protocol; it needs a checker and packet function
    /// to do anything but pass packets through.
    pub fn add_empty(&mut self) -> MuxId {
        self.push(Multiplexer::new(None))
    }

    fn push(&mut self, node: Multiplexer) -> MuxId {
        self.nodes.push(node);
        MuxId(self.nodes.len() - 1)
    }

    pub fn get(&self, id: MuxId) -> Option<&Multiplexer> {
        self.nodes.get(id.0)
    }

    pub fn get_mut(&mut self, id: MuxId) -> Option<&mut Multiplexer> {
        self.nodes.get_mut(id.0)
    }

    pub fn protocol(&self, id: MuxId) -> Option<&BuiltinProtocol> {
        self.get(id).and_then(Multiplexer::protocol)
    }

    pub fn protocol_mut(&mut self, id: MuxId) -> Option<&mut BuiltinProtocol> {
        self.get_mut(id).and_then(Multiplexer::protocol_mut)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MuxId, &Multiplexer)> {
        self.nodes.iter().enumerate().map(|(i, node)| (MuxId(i), node))
    }

    pub fn set_protocol_identifier(&mut self, id: MuxId, protocol_id: u16) {
        if let Some(node) = self.get_mut(id) {
            node.protocol_id = protocol_id;
        }
    }

    pub fn add_checker(&mut self, id: MuxId, checker: PacketChecker) {
        if let Some(node) = self.get_mut(id) {
            node.checker = Some(checker);
        }
    }

    pub fn add_packet_function(&mut self, id: MuxId, function: PacketFunction) {
        if let Some(node) = self.get_mut(id) {
            node.packet_function = Some(function);
        }
    }

    /// Register `child` under `protocol_id` on `id`, replacing any child
    /// already registered under that identifier.
    pub fn add_up_multiplexer(&mut self, id: MuxId, child: MuxId, protocol_id: u16) {
        if child.0 >= self.nodes.len() {
            return;
        }
        if let Some(node) = self.get_mut(id) {
            node.up.retain(|(key, _)| *key != protocol_id);
            node.up.push((protocol_id, child));
        }
    }

    pub fn add_down_multiplexer(&mut self, id: MuxId, parent: MuxId) {
        if parent.0 >= self.nodes.len() {
            return;
        }
        if let Some(node) = self.get_mut(id) {
            node.down = Some(parent);
        }
    }

    /// Connect `child` above `parent` under the child's protocol identifier.
    pub fn link(&mut self, parent: MuxId, child: MuxId) {
        let Some(protocol_id) = self.get(child).map(Multiplexer::protocol_id) else {
            return;
        };
        self.add_up_multiplexer(parent, child, protocol_id);
        if self.get(child).and_then(Multiplexer::down).is_none() {
            self.add_down_multiplexer(child, parent);
        }
    }

    /// Run `packet` up the tree starting at `root`.
    ///
    /// Returns the validity verdict of the deepest node reached. A node
    /// with no child for the reported protocol ends the walk normally.
    pub fn dispatch(&mut self, root: MuxId, packet: &mut Packet<'_>) -> bool {
        let mut current = root;

        // A well-formed tree is never deeper than its node count
        for _ in 0..self.nodes.len() {
            let Some(node) = self.nodes.get_mut(current.0) else {
                return false;
            };
            node.stats.received += 1;

            if !node.check(packet) {
                node.stats.failed += 1;
                trace!(layer = node.name(), "packet rejected");
                return false;
            }

            let Some(next) = node.process(packet) else {
                return true;
            };
            let Some(child) = node.up(next.protocol_id) else {
                return true;
            };

            node.stats.forwarded += 1;
            packet.narrow(next.header_length);
            current = child;
        }
        true
    }

    /// Report every node; counters from level 3.
    pub fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()> {
        for node in &self.nodes {
            if let Some(protocol) = node.protocol() {
                protocol.statistics(out, level)?;
            }
            if level > 2 {
                writeln!(
                    out,
                    "\tMultiplexer {:#06x}: received {} forwarded {} failed {}",
                    node.protocol_id, node.stats.received, node.stats.forwarded, node.stats.failed
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_utils::{EthernetBuilder, Ipv4Builder};
    use crate::protocol::{ethertype, EthernetProtocol};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ethernet_tree() -> (MultiplexerTree, MuxId) {
        let mut tree = MultiplexerTree::new();
        let eth = tree.add(EthernetProtocol::new());
        (tree, eth)
    }

    // Test 1: A custom checker failing stops the walk and counts a failure
    #[test]
    fn test_failed_check_stops() {
        let (mut tree, eth) = ethernet_tree();
        let ip = tree.add_empty();
        tree.set_protocol_identifier(ip, ethertype::IPV4);
        tree.add_checker(ip, Box::new(|_packet: &mut Packet<'_>| false));
        tree.link(eth, ip);

        let frame = EthernetBuilder::new().payload(vec![0; 20]).build();
        let mut packet = Packet::new(&frame, 0);

        assert!(!tree.dispatch(eth, &mut packet));
        assert_eq!(tree.get(eth).unwrap().stats().forwarded, 1);
        assert_eq!(tree.get(ip).unwrap().stats().failed, 1);
    }

    // Test 2: The child sees its header at offset zero
    #[test]
    fn test_child_receives_narrowed_packet() {
        let (mut tree, eth) = ethernet_tree();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = Arc::clone(&seen);

        let ip = tree.add_empty();
        tree.set_protocol_identifier(ip, ethertype::IPV4);
        tree.add_packet_function(
            ip,
            Box::new(move |packet: &mut Packet<'_>| {
                seen_in_handler.store(packet.offset(), Ordering::Relaxed);
                assert_eq!(packet.payload()[0], 0x45);
                None
            }),
        );
        tree.link(eth, ip);

        let frame = EthernetBuilder::new()
            .payload(Ipv4Builder::new().build())
            .build();
        let mut packet = Packet::new(&frame, 0);

        assert!(tree.dispatch(eth, &mut packet));
        assert_eq!(seen.load(Ordering::Relaxed), 14);
    }

    // Test 3: No child for the reported protocol is not an error
    #[test]
    fn test_missing_child_ends_walk() {
        let (mut tree, eth) = ethernet_tree();
        let frame = EthernetBuilder::new().ethertype(0x0806).payload(vec![0; 28]).build();
        let mut packet = Packet::new(&frame, 0);

        assert!(tree.dispatch(eth, &mut packet));
        let stats = tree.get(eth).unwrap().stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.forwarded, 0);
    }

    #[test]
    fn test_link_sets_parent() {
        let (mut tree, eth) = ethernet_tree();
        let ip = tree.add_empty();
        tree.set_protocol_identifier(ip, ethertype::IPV6);
        tree.link(eth, ip);

        assert_eq!(tree.get(ip).unwrap().down(), Some(eth));
        assert_eq!(tree.get(eth).unwrap().up(ethertype::IPV6), Some(ip));
        assert_eq!(tree.get(eth).unwrap().up(ethertype::IPV4), None);
    }

    #[test]
    fn test_cycle_terminates() {
        let mut tree = MultiplexerTree::new();
        let a = tree.add_empty();
        let b = tree.add_empty();
        let to_b: PacketFunction = Box::new(|_p: &mut Packet<'_>| {
            Some(NextLayer {
                protocol_id: 1,
                header_length: 0,
            })
        });
        let to_a: PacketFunction = Box::new(|_p: &mut Packet<'_>| {
            Some(NextLayer {
                protocol_id: 1,
                header_length: 0,
            })
        });
        tree.add_packet_function(a, to_b);
        tree.add_packet_function(b, to_a);
        tree.add_up_multiplexer(a, b, 1);
        tree.add_up_multiplexer(b, a, 1);

        let mut packet = Packet::new(&[], 0);
        assert!(tree.dispatch(a, &mut packet));
    }
}
