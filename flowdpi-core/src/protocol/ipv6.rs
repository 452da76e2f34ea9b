//! IPv6 decoder with extension header skipping.

use std::mem::size_of;
use std::net::IpAddr;
use std::sync::Arc;

use etherparse::Ipv6HeaderSlice;

use super::{NextLayer, PacketProtocol, Protocol, ProtocolStats};
use crate::anomaly::{AnomalyManager, PacketAnomaly};
use crate::packet::{NetworkLayer, Packet};

const HEADER_LEN: usize = 40;

/// IPv6 Next Header values.
pub mod next_header {
    pub const HOP_BY_HOP: u8 = 0;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const ROUTING: u8 = 43;
    pub const FRAGMENT: u8 = 44;
    pub const ICMPV6: u8 = 58;
    pub const NO_NEXT_HEADER: u8 = 59;
    pub const DESTINATION: u8 = 60;
}

/// Walk the extension header chain.
///
/// Returns the upper layer protocol and the bytes taken by extension
/// headers, or `None` if the chain runs past the available data.
fn skip_extension_headers(first: u8, data: &[u8]) -> Option<(u8, usize)> {
    let mut current = first;
    let mut offset = 0;

    loop {
        let len = match current {
            next_header::HOP_BY_HOP | next_header::ROUTING | next_header::DESTINATION => {
                let ext = data.get(offset..offset + 2)?;
                (usize::from(ext[1]) + 1) * 8
            }
            next_header::FRAGMENT => 8,
            _ => return Some((current, offset)),
        };
        let ext = data.get(offset..offset + len)?;
        current = ext[0];
        offset += len;
    }
}

/// IPv6 decoder.
#[derive(Debug)]
pub struct Ipv6Protocol {
    stats: ProtocolStats,
    anomaly: Arc<AnomalyManager>,
}

impl Ipv6Protocol {
    pub fn new(anomaly: Arc<AnomalyManager>) -> Self {
        Self {
            stats: ProtocolStats::default(),
            anomaly,
        }
    }
}

impl Protocol for Ipv6Protocol {
    fn name(&self) -> &'static str {
        "ipv6"
    }

    fn stats(&self) -> ProtocolStats {
        self.stats
    }

    fn allocated_memory(&self) -> usize {
        size_of::<Self>()
    }
}

impl PacketProtocol for Ipv6Protocol {
    fn is_valid(&mut self, packet: &mut Packet<'_>) -> bool {
        let data = packet.payload();
        if data.len() < HEADER_LEN {
            return self.stats.count_valid(false);
        }
        if data[0] >> 4 != 6 {
            packet.anomaly = PacketAnomaly::Ipv6BogusHeader;
            self.anomaly.inc_anomaly(PacketAnomaly::Ipv6BogusHeader);
            return self.stats.count_valid(false);
        }
        self.stats.count_valid(true)
    }

    fn process_packet(&mut self, packet: &mut Packet<'_>) -> Option<NextLayer> {
        let header = Ipv6HeaderSlice::from_slice(packet.payload()).ok()?;
        let total_length =
            (HEADER_LEN + usize::from(header.payload_length())).min(packet.length());

        self.stats.count_packet(total_length);
        packet.truncate(total_length);

        let after_header = &packet.payload()[HEADER_LEN..];
        let Some((protocol, ext_length)) =
            skip_extension_headers(header.next_header().0, after_header)
        else {
            packet.anomaly = PacketAnomaly::Ipv6BogusHeader;
            self.anomaly.inc_anomaly(PacketAnomaly::Ipv6BogusHeader);
            return None;
        };
        let header_length = HEADER_LEN + ext_length;

        packet.set_network(NetworkLayer {
            source: IpAddr::V6(header.source_addr()),
            destination: IpAddr::V6(header.destination_addr()),
            protocol,
            header_length,
            payload_length: total_length - header_length,
        });

        Some(NextLayer {
            protocol_id: u16::from(protocol),
            header_length,
        })
    }
}
