//! Fuzz target for capture format detection.
//!
//! Magic numbers are matched on raw file bytes, before any decompression.

#![no_main]

use libfuzzer_sys::fuzz_target;
use flowdpi_core::pcap::{Compression, PcapFormat};

fuzz_target!(|data: &[u8]| {
    let _ = Compression::detect(data);

    if let Ok(format) = PcapFormat::detect(data) {
        let _ = format.is_pcapng();
    }
});
