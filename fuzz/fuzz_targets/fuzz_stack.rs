//! Fuzz target for the packet pipeline.
//!
//! Every frame enters at the Ethernet layer, so this exercises:
//! - Header bounds checking in each decoder
//! - VLAN, IPv4 and IPv6 demultiplexing
//! - TCP and UDP flow creation on arbitrary headers

#![no_main]

use libfuzzer_sys::fuzz_target;
use flowdpi_core::{Stack, StackConfig};

fuzz_target!(|data: &[u8]| {
    let mut stack = Stack::with_config(StackConfig {
        tcp_flows: 4,
        udp_flows: 4,
        ..Default::default()
    });

    let _ = stack.process_packet(data, 0);
    // The same frame again hits the existing flow
    let _ = stack.process_packet(data, 1);
});
