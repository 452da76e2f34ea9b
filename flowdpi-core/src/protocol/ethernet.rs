//! Ethernet II decoder.

use std::mem::size_of;

use etherparse::Ethernet2HeaderSlice;

use super::{NextLayer, PacketProtocol, Protocol, ProtocolStats};
use crate::packet::Packet;

/// Link type constant for Ethernet.
pub const LINKTYPE_ETHERNET: u16 = 1;

/// EtherType values the pipeline dispatches on.
pub mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
    pub const VLAN: u16 = 0x8100;
    pub const IPV6: u16 = 0x86DD;
    pub const QINQ: u16 = 0x88A8;
}

const HEADER_LEN: usize = 14;

/// Ethernet II decoder.
#[derive(Debug, Default)]
pub struct EthernetProtocol {
    stats: ProtocolStats,
}

impl EthernetProtocol {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Protocol for EthernetProtocol {
    fn name(&self) -> &'static str {
        "ethernet"
    }

    fn stats(&self) -> ProtocolStats {
        self.stats
    }

    fn allocated_memory(&self) -> usize {
        size_of::<Self>()
    }
}

impl PacketProtocol for EthernetProtocol {
    fn is_valid(&mut self, packet: &mut Packet<'_>) -> bool {
        self.stats.count_valid(packet.length() >= HEADER_LEN)
    }

    fn process_packet(&mut self, packet: &mut Packet<'_>) -> Option<NextLayer> {
        let header = Ethernet2HeaderSlice::from_slice(packet.payload()).ok()?;
        self.stats.count_packet(packet.length());

        Some(NextLayer {
            protocol_id: header.ether_type().0,
            header_length: header.slice().len(),
        })
    }
}
