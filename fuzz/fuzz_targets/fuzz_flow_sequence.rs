//! Fuzz target for flow state across many packets.
//!
//! The input is split into frames on a length prefix, so one run drives a
//! sequence of packets (and timer sweeps) through the same flow tables.

#![no_main]

use libfuzzer_sys::fuzz_target;
use flowdpi_core::{Stack, StackConfig};

fuzz_target!(|data: &[u8]| {
    let mut stack = Stack::with_config(StackConfig {
        tcp_flows: 2,
        udp_flows: 2,
        flow_timeout: 1,
        flow_time_refresh_rate: 2,
        qos_metrics: true,
        ..Default::default()
    });

    let mut rest = data;
    let mut now = 0i64;
    while let Some((&len, tail)) = rest.split_first() {
        let len = usize::from(len).min(tail.len());
        let (frame, tail) = tail.split_at(len);
        now += 400_000;
        let _ = stack.process_packet(frame, now);
        rest = tail;
    }

    stack.update_timers(now + 2_000_000);
    assert_eq!(stack.total_flows(), 0);
});
