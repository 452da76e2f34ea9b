//! Protocol decoders.
//!
//! This module provides:
//! - [`Protocol`], the capability every decoder implements (statistics,
//!   memory hooks, release hook)
//! - [`PacketProtocol`] for decoders driven by the multiplexer tree
//! - [`FlowProtocol`] for application decoders driven by flow forwarders
//! - [`BuiltinProtocol`], static dispatch over the built-in decoders
//!
//! ## Built-in decoders
//!
//! | Layer | Protocols |
//! |-------|-----------|
//! | Link | Ethernet, VLAN (802.1Q) |
//! | Network | IPv4, IPv6 |
//! | Transport | TCP, UDP |
//!
//! Application decoders are not built in; they plug into the flow
//! forwarders of the transport decoders as `Box<dyn FlowProtocol>`.

mod builtin;
mod ethernet;
mod ipv4;
mod ipv6;
mod tcp;
mod transport;
mod udp;
mod vlan;

pub mod test_utils;

use std::io::{self, Write};

use crate::flow::Flow;
use crate::packet::Packet;

pub use builtin::BuiltinProtocol;
pub use ethernet::{ethertype, EthernetProtocol, LINKTYPE_ETHERNET};
pub use ipv4::Ipv4Protocol;
pub use ipv6::{next_header, Ipv6Protocol};
pub use tcp::{
    flags as tcp_flags, next_state, TcpCounters, TcpFlagClass, TcpInfo, TcpProtocol, TcpQos,
    TcpQosTotals, TcpState, IP_PROTO_TCP,
};
pub use transport::{RejectHook, DEFAULT_FLOW_TIME_REFRESH_RATE};
pub use udp::{UdpProtocol, IP_PROTO_UDP};
pub use vlan::VlanProtocol;

/// Result of processing one header: where the packet goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextLayer {
    /// Identifier of the upper protocol (EtherType, IP protocol number).
    pub protocol_id: u16,
    /// Bytes consumed by the header just parsed.
    pub header_length: usize,
}

/// Counters kept by every decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolStats {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub total_valid_packets: u64,
    pub total_invalid_packets: u64,
}

impl ProtocolStats {
    #[inline]
    pub fn count_valid(&mut self, valid: bool) -> bool {
        if valid {
            self.total_valid_packets += 1;
        } else {
            self.total_invalid_packets += 1;
        }
        valid
    }

    #[inline]
    pub fn count_packet(&mut self, bytes: usize) {
        self.total_packets += 1;
        self.total_bytes += bytes as u64;
    }
}

/// Capability shared by every decoder.
pub trait Protocol: Send {
    /// Unique identifier for this protocol (e.g., "tcp", "ethernet").
    fn name(&self) -> &'static str;

    fn stats(&self) -> ProtocolStats;

    /// Bytes owned by the decoder, pools included.
    fn allocated_memory(&self) -> usize;

    /// Bytes currently in use by live flows.
    fn current_use_memory(&self) -> usize {
        self.allocated_memory()
    }

    /// Grow the decoder's pools by `count` objects each.
    fn increase_allocated_memory(&mut self, _count: usize) {}

    /// Shrink the decoder's pools by `count` idle objects each.
    fn decrease_allocated_memory(&mut self, _count: usize) {}

    /// Let the decoder's pools grow on demand instead of failing.
    fn set_dynamic_allocated_memory(&mut self, _value: bool) {}

    /// Pool acquisitions that failed for lack of free objects.
    fn total_cache_misses(&self) -> u64 {
        0
    }

    /// Drop any per-flow state the decoder keeps for `flow`.
    fn release_flow_info(&mut self, _flow: &mut Flow) {}

    /// Write a plain text report; higher levels add detail.
    fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()> {
        write_statistics(out, self.name(), &self.stats(), self.allocated_memory(), level)
    }
}

/// Decoder driven by a [`crate::dispatch::Multiplexer`].
pub trait PacketProtocol: Protocol {
    /// Validate the header at the start of the packet window.
    ///
    /// Malformed headers are recorded as anomalies on the packet, never
    /// raised.
    fn is_valid(&mut self, packet: &mut Packet<'_>) -> bool;

    /// Consume the header and report the next layer, if any.
    fn process_packet(&mut self, packet: &mut Packet<'_>) -> Option<NextLayer>;
}

/// Application decoder driven by a [`crate::dispatch::FlowForwarder`].
pub trait FlowProtocol: Protocol {
    /// Whether `payload` looks like this protocol.
    fn is_valid(&mut self, flow: &Flow, payload: &[u8]) -> bool;

    fn process_flow(&mut self, flow: &mut Flow, payload: &[u8]);
}

/// Shared layout of the per-protocol statistics report.
pub fn write_statistics(
    out: &mut dyn Write,
    name: &str,
    stats: &ProtocolStats,
    allocated_memory: usize,
    level: u8,
) -> io::Result<()> {
    if level == 0 {
        return Ok(());
    }
    writeln!(out, "{name} statistics")?;
    writeln!(out, "\tTotal allocated:{:>14}", allocated_memory)?;
    writeln!(out, "\tTotal packets:{:>16}", stats.total_packets)?;
    writeln!(out, "\tTotal bytes:{:>18}", stats.total_bytes)?;
    if level > 1 {
        writeln!(out, "\tTotal valid packets:{:>10}", stats.total_valid_packets)?;
        writeln!(out, "\tTotal invalid packets:{:>8}", stats.total_invalid_packets)?;
    }
    Ok(())
}
