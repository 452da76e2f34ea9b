//! Packet and flow dispatch.
//!
//! Two trees route traffic through the decoders:
//!
//! - [`MultiplexerTree`]: packet level. Each node validates and consumes one
//!   header, then hands the narrowed packet to the child registered under
//!   the upper protocol identifier (EtherType, IP protocol number).
//! - [`FlowForwarderTree`]: flow level. Each transport decoder owns one; it
//!   routes a flow's payload to the first application decoder whose checker
//!   accepts it, and remembers that choice on the flow.
//!
//! Both trees are index arenas. Parent links and the flow's forwarder
//! reference are plain ids, so nothing is shared or reference counted.

mod forwarder;
mod multiplexer;

pub use forwarder::{
    FlowChecker, FlowForwarder, FlowForwarderTree, FlowFunction, ForwarderId, ForwarderStats,
};
pub use multiplexer::{
    Multiplexer, MultiplexerStats, MultiplexerTree, MuxId, PacketChecker, PacketFunction,
};
