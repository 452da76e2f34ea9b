//! # flowdpi-core
//!
//! Flow tracking engine for deep packet inspection.
//!
//! Packets enter a tree of protocol decoders (Ethernet, VLAN, IPv4, IPv6,
//! TCP, UDP). The transport decoders resolve every packet to a
//! bidirectional [`Flow`], track the TCP connection state, and hand the
//! payload to application decoders through a flow forwarder tree.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowdpi_core::prelude::*;
//!
//! let mut stack = Stack::new();
//! let reader = PcapReader::open("capture.pcap").unwrap();
//!
//! for packet in reader {
//!     let packet = packet.unwrap();
//!     stack.process_raw(&packet);
//! }
//!
//! println!("{} active flows", stack.total_flows());
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        flowdpi-core                                 |
//! +---------------------------------------------------------------------+
//! |  stack       - Ready-made Ethernet/IP/TCP/UDP pipeline              |
//! |  dispatch/   - Multiplexer tree, flow forwarder tree                |
//! |  protocol/   - Protocol capability, built-in decoders, TCP states   |
//! |  flow/       - Flow, five-tuple, flow pool and flow table           |
//! |  cache/      - Generic preallocated object pool                     |
//! |  packet      - Packet view over a captured frame                    |
//! |  anomaly     - Anomaly kinds and counters                           |
//! |  ipset       - Address sets attached to new flows                   |
//! |  adaptor     - Flow table persistence                               |
//! |  pcap/       - PCAP/PCAPNG reading, gzip                            |
//! |  error       - Error types                                          |
//! +---------------------------------------------------------------------+
//! ```

pub mod adaptor;
pub mod anomaly;
pub mod cache;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod ipset;
pub mod packet;
pub mod pcap;
pub mod prelude;
pub mod protocol;
pub mod stack;

// Re-export commonly used types at crate root for convenience
pub use adaptor::{DatabaseAdaptor, FlowRecord, JsonLinesAdaptor, DEFAULT_PACKET_SAMPLING};
pub use anomaly::{AnomalyManager, PacketAnomaly};
pub use cache::{Cache, CacheStats};
pub use dispatch::{
    FlowForwarder, FlowForwarderTree, ForwarderId, Multiplexer, MultiplexerTree, MuxId,
};
pub use error::{AdaptorError, Error, PcapError, Result};
pub use flow::{FiveTuple, Flow, FlowCache, FlowDirection, FlowManager, DEFAULT_FLOW_TIMEOUT};
pub use ipset::{IpSet, IpSetLookup, IpSetManager, RegexManager};
pub use packet::{NetworkLayer, Packet};
pub use pcap::{PcapReader, RawPacket};
pub use protocol::{
    BuiltinProtocol, FlowProtocol, NextLayer, PacketProtocol, Protocol, ProtocolStats, TcpInfo,
    TcpProtocol, TcpState, UdpProtocol,
};
pub use stack::{Stack, StackConfig};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
