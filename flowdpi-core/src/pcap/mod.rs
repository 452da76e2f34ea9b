//! Capture file input.
//!
//! The main types are:
//! - [`PcapReader`] - File reader for PCAP and PCAPNG, optionally gzipped
//! - [`RawPacket`] - One captured frame with its metadata

mod format;
mod reader;

use bytes::Bytes;

pub use format::{Compression, PcapFormat};
pub use reader::PcapReader;

/// One frame read from a capture file.
#[derive(Debug, Clone)]
pub struct RawPacket {
    /// 1-based position in the capture.
    pub frame_number: u64,
    /// Capture time in microseconds since the epoch.
    pub timestamp_us: i64,
    pub captured_length: u32,
    pub original_length: u32,
    /// Link type of the interface the frame was captured on.
    pub link_type: u16,
    pub data: Bytes,
}
