//! Compression and capture format detection.

use crate::error::{Error, PcapError};

/// Compression wrapping a capture file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// No compression
    None,
    /// Gzip (.gz)
    Gzip,
}

impl Compression {
    /// Detect compression format from magic bytes.
    pub fn detect(data: &[u8]) -> Self {
        match data {
            [0x1f, 0x8b, ..] => Compression::Gzip,
            _ => Compression::None,
        }
    }
}

/// Format of the capture after decompression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcapFormat {
    /// Classic PCAP, microsecond timestamps
    LegacyMicro,
    /// Classic PCAP, nanosecond timestamps
    LegacyNano,
    /// PCAPNG format
    PcapNg,
}

impl PcapFormat {
    /// Detect the format from the magic number, in either byte order.
    pub fn detect(data: &[u8]) -> Result<Self, Error> {
        let Some(magic) = data.get(..4) else {
            return Err(Error::Pcap(PcapError::InvalidFormat {
                reason: "Data too small for PCAP magic".into(),
            }));
        };
        let magic = u32::from_le_bytes([magic[0], magic[1], magic[2], magic[3]]);

        match magic {
            0xa1b2c3d4 | 0xd4c3b2a1 => Ok(PcapFormat::LegacyMicro),
            0xa1b23c4d | 0x4d3cb2a1 => Ok(PcapFormat::LegacyNano),
            0x0a0d0d0a => Ok(PcapFormat::PcapNg),
            _ => Err(Error::Pcap(PcapError::InvalidFormat {
                reason: format!("Unknown PCAP magic: 0x{:08x}", magic),
            })),
        }
    }

    pub fn is_pcapng(&self) -> bool {
        matches!(self, PcapFormat::PcapNg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_detection() {
        let gzip_data = [0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00];
        assert_eq!(Compression::detect(&gzip_data), Compression::Gzip);

        let pcap_data = [0xd4, 0xc3, 0xb2, 0xa1, 0x00, 0x00];
        assert_eq!(Compression::detect(&pcap_data), Compression::None);
        assert_eq!(Compression::detect(&[0x1f]), Compression::None);
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            PcapFormat::detect(&[0xd4, 0xc3, 0xb2, 0xa1]).unwrap(),
            PcapFormat::LegacyMicro
        );
        assert_eq!(
            PcapFormat::detect(&[0xa1, 0xb2, 0xc3, 0xd4]).unwrap(),
            PcapFormat::LegacyMicro
        );
        assert_eq!(
            PcapFormat::detect(&[0x4d, 0x3c, 0xb2, 0xa1]).unwrap(),
            PcapFormat::LegacyNano
        );
        assert!(PcapFormat::detect(&[0x0a, 0x0d, 0x0d, 0x0a]).unwrap().is_pcapng());
        assert!(PcapFormat::detect(&[0, 1, 2, 3]).is_err());
        assert!(PcapFormat::detect(&[0xd4]).is_err());
    }
}
