//! IEEE 802.1Q VLAN tag decoder.

use std::mem::size_of;

use etherparse::SingleVlanHeaderSlice;

use super::{NextLayer, PacketProtocol, Protocol, ProtocolStats};
use crate::packet::Packet;

const TAG_LEN: usize = 4;

/// 802.1Q VLAN tag decoder.
///
/// The TPID was consumed by the Ethernet decoder, so the window starts at
/// the TCI followed by the inner EtherType. The VLAN id becomes the packet
/// tag, which keeps identical tuples on different VLANs in separate flows.
#[derive(Debug, Default)]
pub struct VlanProtocol {
    stats: ProtocolStats,
}

impl VlanProtocol {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Protocol for VlanProtocol {
    fn name(&self) -> &'static str {
        "vlan"
    }

    fn stats(&self) -> ProtocolStats {
        self.stats
    }

    fn allocated_memory(&self) -> usize {
        size_of::<Self>()
    }
}

impl PacketProtocol for VlanProtocol {
    fn is_valid(&mut self, packet: &mut Packet<'_>) -> bool {
        self.stats.count_valid(packet.length() >= TAG_LEN)
    }

    fn process_packet(&mut self, packet: &mut Packet<'_>) -> Option<NextLayer> {
        let header = SingleVlanHeaderSlice::from_slice(packet.payload()).ok()?;
        self.stats.count_packet(packet.length());
        packet.set_tag(u32::from(header.vlan_identifier().value()));

        Some(NextLayer {
            protocol_id: header.ether_type().0,
            header_length: TAG_LEN,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ethertype;

    #[test]
    fn test_vlan_sets_tag() {
        // PCP 0, VID 100, inner IPv4
        let data = [0x00, 0x64, 0x08, 0x00];
        let mut packet = Packet::new(&data, 0);
        let mut vlan = VlanProtocol::new();

        assert!(vlan.is_valid(&mut packet));
        let next = vlan.process_packet(&mut packet).unwrap();
        assert_eq!(next.protocol_id, ethertype::IPV4);
        assert_eq!(packet.tag(), Some(100));
    }

    #[test]
    fn test_truncated_tag_is_invalid() {
        let data = [0x00, 0x64];
        let mut packet = Packet::new(&data, 0);
        assert!(!VlanProtocol::new().is_valid(&mut packet));
    }
}
