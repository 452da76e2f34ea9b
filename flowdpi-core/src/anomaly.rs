//! Anomaly accounting.
//!
//! Decoders report malformed or unexpected conditions to an
//! [`AnomalyManager`] instead of failing. One manager is shared (through an
//! `Arc`) by all decoders of a pipeline; counters are atomics so they can be
//! read from another thread while packets are being processed.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::flow::Flow;

/// Category of a malformed or unexpected packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PacketAnomaly {
    #[default]
    None,
    Ipv4BogusHeader,
    Ipv6BogusHeader,
    TcpBogusHeader,
    TcpBadFlags,
    UdpBogusHeader,
}

impl PacketAnomaly {
    /// All real categories, in counter order.
    pub const ALL: [PacketAnomaly; 5] = [
        PacketAnomaly::Ipv4BogusHeader,
        PacketAnomaly::Ipv6BogusHeader,
        PacketAnomaly::TcpBogusHeader,
        PacketAnomaly::TcpBadFlags,
        PacketAnomaly::UdpBogusHeader,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PacketAnomaly::None => "none",
            PacketAnomaly::Ipv4BogusHeader => "ipv4_bogus_header",
            PacketAnomaly::Ipv6BogusHeader => "ipv6_bogus_header",
            PacketAnomaly::TcpBogusHeader => "tcp_bogus_header",
            PacketAnomaly::TcpBadFlags => "tcp_bad_flags",
            PacketAnomaly::UdpBogusHeader => "udp_bogus_header",
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, PacketAnomaly::None)
    }

    fn slot(&self) -> Option<usize> {
        match self {
            PacketAnomaly::None => None,
            PacketAnomaly::Ipv4BogusHeader => Some(0),
            PacketAnomaly::Ipv6BogusHeader => Some(1),
            PacketAnomaly::TcpBogusHeader => Some(2),
            PacketAnomaly::TcpBadFlags => Some(3),
            PacketAnomaly::UdpBogusHeader => Some(4),
        }
    }
}

impl fmt::Display for PacketAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic anomaly counters, global and per flow.
#[derive(Debug, Default)]
pub struct AnomalyManager {
    counts: [AtomicU64; PacketAnomaly::ALL.len()],
}

impl AnomalyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one occurrence of `anomaly`. `PacketAnomaly::None` is ignored.
    pub fn inc_anomaly(&self, anomaly: PacketAnomaly) {
        if let Some(slot) = anomaly.slot() {
            self.counts[slot].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count `anomaly` globally and against `flow`.
    ///
    /// The flow keeps the first category it was stamped with; later
    /// anomalies only bump its per-flow count.
    pub fn inc_flow_anomaly(&self, flow: &mut Flow, anomaly: PacketAnomaly) {
        if anomaly.is_none() {
            return;
        }
        self.inc_anomaly(anomaly);
        flow.record_anomaly(anomaly);
    }

    pub fn count(&self, anomaly: PacketAnomaly) -> u64 {
        anomaly
            .slot()
            .map_or(0, |slot| self.counts[slot].load(Ordering::Relaxed))
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn statistics(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Anomaly manager statistics")?;
        for anomaly in PacketAnomaly::ALL {
            writeln!(out, "\t{:<24}{:>10}", anomaly.as_str(), self.count(anomaly))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Counters start at zero and only move on real categories
    #[test]
    fn test_none_is_not_counted() {
        let manager = AnomalyManager::new();
        manager.inc_anomaly(PacketAnomaly::None);
        assert_eq!(manager.total(), 0);
        assert_eq!(manager.count(PacketAnomaly::None), 0);
    }

    // Test 2: Global counters are per category
    #[test]
    fn test_counts_per_category() {
        let manager = AnomalyManager::new();
        manager.inc_anomaly(PacketAnomaly::TcpBadFlags);
        manager.inc_anomaly(PacketAnomaly::TcpBadFlags);
        manager.inc_anomaly(PacketAnomaly::UdpBogusHeader);

        assert_eq!(manager.count(PacketAnomaly::TcpBadFlags), 2);
        assert_eq!(manager.count(PacketAnomaly::UdpBogusHeader), 1);
        assert_eq!(manager.count(PacketAnomaly::TcpBogusHeader), 0);
        assert_eq!(manager.total(), 3);
    }

    // Test 3: The first anomaly sticks to the flow
    #[test]
    fn test_flow_keeps_first_category() {
        let manager = AnomalyManager::new();
        let mut flow = Flow::default();

        manager.inc_flow_anomaly(&mut flow, PacketAnomaly::TcpBadFlags);
        manager.inc_flow_anomaly(&mut flow, PacketAnomaly::TcpBogusHeader);

        assert_eq!(flow.anomaly(), PacketAnomaly::TcpBadFlags);
        assert_eq!(flow.anomaly_count(), 2);
        assert_eq!(manager.total(), 2);
    }

    #[test]
    fn test_statistics_lists_every_category() {
        let manager = AnomalyManager::new();
        manager.inc_anomaly(PacketAnomaly::Ipv4BogusHeader);

        let mut out = Vec::new();
        manager.statistics(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        for anomaly in PacketAnomaly::ALL {
            assert!(text.contains(anomaly.as_str()));
        }
    }
}
