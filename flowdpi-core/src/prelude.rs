//! Convenient re-exports for common usage.
//!
//! ```rust,no_run
//! use flowdpi_core::prelude::*;
//!
//! let mut stack = Stack::with_config(StackConfig {
//!     qos_metrics: true,
//!     ..Default::default()
//! });
//! ```

// Pipeline
pub use crate::stack::{Stack, StackConfig};

// Protocol types
pub use crate::protocol::{
    BuiltinProtocol, FlowProtocol, PacketProtocol, Protocol, TcpProtocol, TcpState, UdpProtocol,
};

// Flow types
pub use crate::flow::{FiveTuple, Flow, FlowDirection};

// Input
pub use crate::packet::Packet;
pub use crate::pcap::{PcapReader, RawPacket};

// Error types
pub use crate::error::{Error, Result};
