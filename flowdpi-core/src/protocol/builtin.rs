//! Static dispatch over the built-in decoders.

use std::io::{self, Write};

use super::{
    EthernetProtocol, Ipv4Protocol, Ipv6Protocol, NextLayer, PacketProtocol, Protocol,
    ProtocolStats, TcpProtocol, UdpProtocol, VlanProtocol,
};
use crate::flow::Flow;
use crate::packet::Packet;

/// Enum of all decoders a multiplexer can be bound to.
///
/// The built-in decoders are matched statically; anything else goes
/// through [`BuiltinProtocol::Custom`]. The transport decoders are boxed
/// since they own their pools and flow table.
pub enum BuiltinProtocol {
    Ethernet(EthernetProtocol),
    Vlan(VlanProtocol),
    Ipv4(Ipv4Protocol),
    Ipv6(Ipv6Protocol),
    Tcp(Box<TcpProtocol>),
    Udp(Box<UdpProtocol>),
    Custom(Box<dyn PacketProtocol>),
}

/// Macro to delegate trait methods to inner types.
macro_rules! delegate_protocol {
    ($self:expr, $method:ident $(, $arg:expr)*) => {
        match $self {
            BuiltinProtocol::Ethernet(p) => p.$method($($arg),*),
            BuiltinProtocol::Vlan(p) => p.$method($($arg),*),
            BuiltinProtocol::Ipv4(p) => p.$method($($arg),*),
            BuiltinProtocol::Ipv6(p) => p.$method($($arg),*),
            BuiltinProtocol::Tcp(p) => p.$method($($arg),*),
            BuiltinProtocol::Udp(p) => p.$method($($arg),*),
            BuiltinProtocol::Custom(p) => p.$method($($arg),*),
        }
    };
}

impl BuiltinProtocol {
    pub fn as_tcp(&self) -> Option<&TcpProtocol> {
        match self {
            BuiltinProtocol::Tcp(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_tcp_mut(&mut self) -> Option<&mut TcpProtocol> {
        match self {
            BuiltinProtocol::Tcp(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_udp(&self) -> Option<&UdpProtocol> {
        match self {
            BuiltinProtocol::Udp(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_udp_mut(&mut self) -> Option<&mut UdpProtocol> {
        match self {
            BuiltinProtocol::Udp(p) => Some(p),
            _ => None,
        }
    }
}

impl Protocol for BuiltinProtocol {
    #[inline]
    fn name(&self) -> &'static str {
        delegate_protocol!(self, name)
    }

    fn stats(&self) -> ProtocolStats {
        delegate_protocol!(self, stats)
    }

    fn allocated_memory(&self) -> usize {
        delegate_protocol!(self, allocated_memory)
    }

    fn current_use_memory(&self) -> usize {
        delegate_protocol!(self, current_use_memory)
    }

    fn increase_allocated_memory(&mut self, count: usize) {
        delegate_protocol!(self, increase_allocated_memory, count)
    }

    fn decrease_allocated_memory(&mut self, count: usize) {
        delegate_protocol!(self, decrease_allocated_memory, count)
    }

    fn set_dynamic_allocated_memory(&mut self, value: bool) {
        delegate_protocol!(self, set_dynamic_allocated_memory, value)
    }

    fn total_cache_misses(&self) -> u64 {
        delegate_protocol!(self, total_cache_misses)
    }

    fn release_flow_info(&mut self, flow: &mut Flow) {
        delegate_protocol!(self, release_flow_info, flow)
    }

    fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()> {
        delegate_protocol!(self, statistics, out, level)
    }
}

impl PacketProtocol for BuiltinProtocol {
    #[inline]
    fn is_valid(&mut self, packet: &mut Packet<'_>) -> bool {
        delegate_protocol!(self, is_valid, packet)
    }

    #[inline]
    fn process_packet(&mut self, packet: &mut Packet<'_>) -> Option<NextLayer> {
        delegate_protocol!(self, process_packet, packet)
    }
}

impl From<EthernetProtocol> for BuiltinProtocol {
    fn from(p: EthernetProtocol) -> Self {
        BuiltinProtocol::Ethernet(p)
    }
}

impl From<VlanProtocol> for BuiltinProtocol {
    fn from(p: VlanProtocol) -> Self {
        BuiltinProtocol::Vlan(p)
    }
}

impl From<Ipv4Protocol> for BuiltinProtocol {
    fn from(p: Ipv4Protocol) -> Self {
        BuiltinProtocol::Ipv4(p)
    }
}

impl From<Ipv6Protocol> for BuiltinProtocol {
    fn from(p: Ipv6Protocol) -> Self {
        BuiltinProtocol::Ipv6(p)
    }
}

impl From<TcpProtocol> for BuiltinProtocol {
    fn from(p: TcpProtocol) -> Self {
        BuiltinProtocol::Tcp(Box::new(p))
    }
}

impl From<UdpProtocol> for BuiltinProtocol {
    fn from(p: UdpProtocol) -> Self {
        BuiltinProtocol::Udp(Box::new(p))
    }
}

impl From<Box<dyn PacketProtocol>> for BuiltinProtocol {
    fn from(p: Box<dyn PacketProtocol>) -> Self {
        BuiltinProtocol::Custom(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_utils::EthernetBuilder;
    use std::sync::Arc;

    use crate::anomaly::AnomalyManager;

    #[test]
    fn test_delegates_to_inner_decoder() {
        let mut eth = BuiltinProtocol::from(EthernetProtocol::new());
        let frame = EthernetBuilder::new().payload(vec![0; 20]).build();
        let mut packet = Packet::new(&frame, 0);

        assert_eq!(eth.name(), "ethernet");
        assert!(eth.is_valid(&mut packet));
        assert!(eth.process_packet(&mut packet).is_some());
        assert_eq!(eth.stats().total_packets, 1);
    }

    #[test]
    fn test_transport_accessors() {
        let anomaly = Arc::new(AnomalyManager::new());
        let mut tcp = BuiltinProtocol::from(TcpProtocol::new(Arc::clone(&anomaly)));
        let udp = BuiltinProtocol::from(UdpProtocol::new(anomaly));

        assert!(tcp.as_tcp().is_some());
        assert!(tcp.as_tcp_mut().is_some());
        assert!(tcp.as_udp().is_none());
        assert!(udp.as_udp().is_some());
        assert_eq!(udp.name(), "udp");
    }
}
