//! IPv4 decoder.

use std::mem::size_of;
use std::net::IpAddr;
use std::sync::Arc;

use etherparse::Ipv4HeaderSlice;

use super::{NextLayer, PacketProtocol, Protocol, ProtocolStats};
use crate::anomaly::{AnomalyManager, PacketAnomaly};
use crate::packet::{NetworkLayer, Packet};

const MIN_HEADER_LEN: usize = 20;

/// IPv4 decoder.
///
/// Leaves the addresses and payload length on the packet for the transport
/// decoders and trims link layer padding past the declared total length.
/// Non-first fragments are counted but not passed up.
#[derive(Debug)]
pub struct Ipv4Protocol {
    stats: ProtocolStats,
    anomaly: Arc<AnomalyManager>,
    fragments: u64,
}

impl Ipv4Protocol {
    pub fn new(anomaly: Arc<AnomalyManager>) -> Self {
        Self {
            stats: ProtocolStats::default(),
            anomaly,
            fragments: 0,
        }
    }

    /// Non-first fragments seen.
    pub fn fragments(&self) -> u64 {
        self.fragments
    }

    fn header_is_sane(data: &[u8]) -> bool {
        let version = data[0] >> 4;
        let header_len = usize::from(data[0] & 0x0f) * 4;
        let total_len = usize::from(u16::from_be_bytes([data[2], data[3]]));

        version == 4
            && header_len >= MIN_HEADER_LEN
            && header_len <= data.len()
            && total_len >= header_len
    }
}

impl Protocol for Ipv4Protocol {
    fn name(&self) -> &'static str {
        "ipv4"
    }

    fn stats(&self) -> ProtocolStats {
        self.stats
    }

    fn allocated_memory(&self) -> usize {
        size_of::<Self>()
    }
}

impl PacketProtocol for Ipv4Protocol {
    fn is_valid(&mut self, packet: &mut Packet<'_>) -> bool {
        let data = packet.payload();
        if data.len() < MIN_HEADER_LEN {
            return self.stats.count_valid(false);
        }

        if !Self::header_is_sane(data) {
            packet.anomaly = PacketAnomaly::Ipv4BogusHeader;
            self.anomaly.inc_anomaly(PacketAnomaly::Ipv4BogusHeader);
            return self.stats.count_valid(false);
        }
        self.stats.count_valid(true)
    }

    fn process_packet(&mut self, packet: &mut Packet<'_>) -> Option<NextLayer> {
        let header = Ipv4HeaderSlice::from_slice(packet.payload()).ok()?;
        let header_length = header.slice().len();
        let total_length = usize::from(header.total_len()).min(packet.length());

        self.stats.count_packet(total_length);
        packet.truncate(total_length);
        packet.set_network(NetworkLayer {
            source: IpAddr::V4(header.source_addr()),
            destination: IpAddr::V4(header.destination_addr()),
            protocol: header.protocol().0,
            header_length,
            payload_length: total_length - header_length,
        });

        if header.fragments_offset().value() > 0 {
            self.fragments += 1;
            return None;
        }

        Some(NextLayer {
            protocol_id: u16::from(header.protocol().0),
            header_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_utils::Ipv4Builder;

    fn decoder() -> (Ipv4Protocol, Arc<AnomalyManager>) {
        let anomaly = Arc::new(AnomalyManager::new());
        (Ipv4Protocol::new(Arc::clone(&anomaly)), anomaly)
    }

    // Test 1: Context is left on the packet for the transport layer
    #[test]
    fn test_sets_network_layer() {
        let data = Ipv4Builder::new()
            .udp()
            .src_ip([10, 0, 0, 1])
            .dst_ip([10, 0, 0, 2])
            .payload(vec![0; 8])
            .build();
        let mut packet = Packet::new(&data, 0);
        let (mut ipv4, _) = decoder();

        assert!(ipv4.is_valid(&mut packet));
        let next = ipv4.process_packet(&mut packet).unwrap();
        assert_eq!(next.protocol_id, 17);
        assert_eq!(next.header_length, 20);

        let net = packet.network().unwrap();
        assert_eq!(net.source, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(net.destination, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(net.payload_length, 8);
    }

    // Test 2: Trailing padding is trimmed
    #[test]
    fn test_trims_padding() {
        let mut data = Ipv4Builder::new().payload(vec![1; 20]).build();
        data.extend_from_slice(&[0; 6]);
        let mut packet = Packet::new(&data, 0);
        let (mut ipv4, _) = decoder();

        assert!(ipv4.is_valid(&mut packet));
        ipv4.process_packet(&mut packet).unwrap();
        assert_eq!(packet.length(), 40);
    }

    // Test 3: Inconsistent header fields are an anomaly
    #[test]
    fn test_bogus_header_records_anomaly() {
        let mut data = Ipv4Builder::new().payload(vec![0; 20]).build();
        data[0] = 0x4f; // IHL 60 bytes, more than available
        let mut packet = Packet::new(&data, 0);
        let (mut ipv4, anomaly) = decoder();

        assert!(!ipv4.is_valid(&mut packet));
        assert_eq!(packet.anomaly, PacketAnomaly::Ipv4BogusHeader);
        assert_eq!(anomaly.count(PacketAnomaly::Ipv4BogusHeader), 1);
    }

    #[test]
    fn test_short_packet_is_invalid_without_anomaly() {
        let data = [0x45u8; 12];
        let mut packet = Packet::new(&data, 0);
        let (mut ipv4, anomaly) = decoder();

        assert!(!ipv4.is_valid(&mut packet));
        assert_eq!(anomaly.total(), 0);
    }

    #[test]
    fn test_non_first_fragment_stops() {
        let mut data = Ipv4Builder::new().payload(vec![0; 16]).build();
        data[6] = 0x00;
        data[7] = 0x10; // offset 16 * 8 bytes
        let mut packet = Packet::new(&data, 0);
        let (mut ipv4, _) = decoder();

        assert!(ipv4.is_valid(&mut packet));
        assert!(ipv4.process_packet(&mut packet).is_none());
        assert_eq!(ipv4.fragments(), 1);
    }
}
