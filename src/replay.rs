//! Capture replay.
//!
//! Reads a capture file frame by frame and pushes every frame through a
//! [`Stack`], collecting a [`ReplaySummary`] on the way.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use flowdpi_core::protocol::LINKTYPE_ETHERNET;
use flowdpi_core::{PcapError, PcapReader, RawPacket, Stack};

/// Totals of one replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub packets: u64,
    pub bytes: u64,
    /// Frames some layer rejected as malformed.
    pub invalid: u64,
    /// Timestamp of the first frame, in microseconds.
    pub first_timestamp: i64,
    pub last_timestamp: i64,
    /// Flows evicted by the final sweep.
    pub swept_flows: usize,
}

impl ReplaySummary {
    /// Capture time covered, in microseconds.
    pub fn duration(&self) -> i64 {
        self.last_timestamp - self.first_timestamp
    }
}

/// Options of a replay.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayOptions {
    /// Stop after this many frames.
    pub limit: Option<u64>,
    /// Evict every remaining flow once the capture ends.
    pub final_sweep: bool,
}

/// Replay every frame of `packets` through `stack`.
pub fn replay<I>(stack: &mut Stack, packets: I, options: ReplayOptions) -> Result<ReplaySummary>
where
    I: IntoIterator<Item = flowdpi_core::Result<RawPacket>>,
{
    let mut summary = ReplaySummary::default();
    let mut link_type = LINKTYPE_ETHERNET;

    for packet in packets {
        if options.limit.is_some_and(|limit| summary.packets >= limit) {
            debug!(limit = summary.packets, "packet limit reached");
            break;
        }
        let packet = packet.context("Failed to read packet")?;

        if summary.packets == 0 {
            summary.first_timestamp = packet.timestamp_us;
        }
        summary.packets += 1;
        summary.bytes += packet.data.len() as u64;
        summary.last_timestamp = packet.timestamp_us;
        link_type = packet.link_type;

        if !stack.process_raw(&packet) {
            summary.invalid += 1;
        }
    }

    if summary.packets > 0 && stack.unsupported_packets() == summary.packets {
        return Err(PcapError::UnsupportedLinkType { link_type }.into());
    }

    if options.final_sweep {
        // Everything is idle once the timeout has passed the last frame
        let timeout_us = stack.config().flow_timeout.saturating_mul(1_000_000);
        let now = summary.last_timestamp.saturating_add(timeout_us).saturating_add(1);
        summary.swept_flows = stack.update_timers(now);
    }

    info!(
        packets = summary.packets,
        bytes = summary.bytes,
        invalid = summary.invalid,
        flows = stack.total_flows(),
        "replay finished"
    );
    Ok(summary)
}

/// Open `path` and replay it through `stack`.
pub fn replay_file(
    stack: &mut Stack,
    path: &Path,
    options: ReplayOptions,
) -> Result<ReplaySummary> {
    let reader = PcapReader::open(path)
        .with_context(|| format!("Failed to open capture: {}", path.display()))?;
    info!(path = %path.display(), format = ?reader.format(), "replaying capture");

    replay(stack, reader, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use flowdpi_core::protocol::test_utils::build_udp_packet;
    use flowdpi_core::StackConfig;

    fn raw(
        frame_number: u64,
        timestamp_us: i64,
        data: Vec<u8>,
    ) -> flowdpi_core::Result<RawPacket> {
        Ok(RawPacket {
            frame_number,
            timestamp_us,
            captured_length: data.len() as u32,
            original_length: data.len() as u32,
            link_type: 1,
            data: Bytes::from(data),
        })
    }

    fn stack() -> Stack {
        Stack::with_config(StackConfig {
            tcp_flows: 4,
            udp_flows: 4,
            ..Default::default()
        })
    }

    #[test]
    fn test_replay_counts_frames() {
        let mut stack = stack();
        let packets = vec![
            raw(1, 1_000, build_udp_packet([10, 0, 0, 1], [10, 0, 0, 2], 1000, 53, vec![0; 8])),
            raw(2, 5_000, vec![0; 6]),
        ];

        let summary = replay(&mut stack, packets, ReplayOptions::default()).unwrap();
        assert_eq!(summary.packets, 2);
        assert_eq!(summary.invalid, 1);
        assert_eq!(summary.duration(), 4_000);
        assert_eq!(stack.total_flows(), 1);
    }

    #[test]
    fn test_limit_and_final_sweep() {
        let mut stack = stack();
        let packets = (0..5u16).map(|i| {
            let frame = build_udp_packet([10, 0, 0, 1], [10, 0, 0, 2], 1000 + i, 53, vec![0; 8]);
            raw(u64::from(i) + 1, i64::from(i), frame)
        });
        let options = ReplayOptions {
            limit: Some(3),
            final_sweep: true,
        };

        let summary = replay(&mut stack, packets, options).unwrap();
        assert_eq!(summary.packets, 3);
        assert_eq!(summary.swept_flows, 3);
        assert_eq!(stack.total_flows(), 0);
    }

    #[test]
    fn test_foreign_link_type_is_an_error() {
        let mut stack = stack();
        let mut packet = raw(1, 0, vec![0; 20]).unwrap();
        packet.link_type = 113;

        let err = replay(&mut stack, vec![Ok(packet)], ReplayOptions::default()).unwrap_err();
        assert!(err.to_string().contains("113"));
    }

    #[test]
    fn test_read_error_is_reported() {
        let mut stack = stack();
        let packets = vec![Err(flowdpi_core::Error::Pcap(
            flowdpi_core::PcapError::InvalidFormat {
                reason: "truncated".to_string(),
            },
        ))];

        assert!(replay(&mut stack, packets, ReplayOptions::default()).is_err());
    }
}
