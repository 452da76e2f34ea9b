//! PCAP file reader with automatic compression handling.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use bytes::Bytes;
use flate2::read::GzDecoder;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapNGReader};
use tracing::debug;

use super::{Compression, PcapFormat, RawPacket};
use crate::error::{Error, PcapError};

/// Buffer size for pcap_parser readers (256KB).
const BUFFER_SIZE: usize = 262144;

type Source = BufReader<Box<dyn Read + Send>>;

enum ReaderInner {
    Legacy(LegacyPcapReader<Source>),
    Ng(PcapNGReader<Source>),
}

/// Reader for PCAP and PCAPNG files, plain or gzip-compressed.
///
/// # Example
///
/// ```ignore
/// use flowdpi_core::pcap::PcapReader;
///
/// let mut reader = PcapReader::open("capture.pcap.gz")?;
/// while let Some(packet) = reader.next_packet()? {
///     println!("Frame {}: {} bytes", packet.frame_number, packet.data.len());
/// }
/// ```
pub struct PcapReader {
    inner: ReaderInner,
    format: PcapFormat,
    frame_number: u64,
    link_type: u16,
}

fn open_source(path: &Path, compression: Compression) -> Result<Box<dyn Read + Send>, Error> {
    let file = File::open(path).map_err(|_| {
        Error::Pcap(PcapError::FileNotFound {
            path: path.display().to_string(),
        })
    })?;
    Ok(match compression {
        Compression::None => Box::new(file),
        Compression::Gzip => Box::new(GzDecoder::new(file)),
    })
}

fn invalid(reason: String) -> Error {
    Error::Pcap(PcapError::InvalidFormat { reason })
}

impl PcapReader {
    /// Open a capture file for reading.
    ///
    /// Gzip compression is detected from the file's first bytes.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();

        let mut header = [0u8; 6];
        let mut file = open_source(path, Compression::None)?;
        let bytes_read = file.read(&mut header)?;
        if bytes_read < 4 {
            return Err(invalid("File too short".to_string()));
        }
        let compression = Compression::detect(&header[..bytes_read]);

        // The magic number is only visible after decompression
        let mut magic = [0u8; 4];
        open_source(path, compression)?
            .read_exact(&mut magic)
            .map_err(|_| invalid("File too short to read magic number".to_string()))?;
        let format = PcapFormat::detect(&magic)?;

        let source = BufReader::with_capacity(BUFFER_SIZE, open_source(path, compression)?);
        let inner = if format.is_pcapng() {
            let reader = PcapNGReader::new(BUFFER_SIZE, source)
                .map_err(|e| invalid(format!("Failed to parse PCAPNG: {}", e)))?;
            ReaderInner::Ng(reader)
        } else {
            let reader = LegacyPcapReader::new(BUFFER_SIZE, source)
                .map_err(|e| invalid(format!("Failed to parse legacy PCAP: {}", e)))?;
            ReaderInner::Legacy(reader)
        };

        debug!(path = %path.display(), ?compression, ?format, "capture opened");
        Ok(Self {
            inner,
            format,
            frame_number: 0,
            // Default to Ethernet, will be updated from headers
            link_type: 1,
        })
    }

    /// Link type of the capture (e.g., 1 = Ethernet).
    #[inline]
    pub fn link_type(&self) -> u16 {
        self.link_type
    }

    /// Frames read so far.
    #[inline]
    pub fn frame_count(&self) -> u64 {
        self.frame_number
    }

    pub fn format(&self) -> PcapFormat {
        self.format
    }

    /// Read the next packet.
    ///
    /// Returns `Ok(None)` at end of file.
    pub fn next_packet(&mut self) -> Result<Option<RawPacket>, Error> {
        let nanosecond = self.format == PcapFormat::LegacyNano;
        match &mut self.inner {
            ReaderInner::Legacy(reader) => read_legacy_packet(
                reader,
                nanosecond,
                &mut self.frame_number,
                &mut self.link_type,
            ),
            ReaderInner::Ng(reader) => {
                read_pcapng_packet(reader, &mut self.frame_number, &mut self.link_type)
            }
        }
    }
}

fn read_legacy_packet(
    reader: &mut LegacyPcapReader<Source>,
    nanosecond: bool,
    frame_number: &mut u64,
    link_type: &mut u16,
) -> Result<Option<RawPacket>, Error> {
    use pcap_parser::PcapError as PcapParserError;

    loop {
        match reader.next() {
            Ok((offset, block)) => match block {
                PcapBlockOwned::Legacy(packet) => {
                    *frame_number += 1;

                    let fraction = if nanosecond {
                        i64::from(packet.ts_usec) / 1_000
                    } else {
                        i64::from(packet.ts_usec)
                    };
                    let raw = RawPacket {
                        frame_number: *frame_number,
                        timestamp_us: i64::from(packet.ts_sec) * 1_000_000 + fraction,
                        captured_length: packet.caplen,
                        original_length: packet.origlen,
                        link_type: *link_type,
                        data: Bytes::copy_from_slice(packet.data),
                    };

                    reader.consume(offset);
                    return Ok(Some(raw));
                }
                PcapBlockOwned::LegacyHeader(header) => {
                    *link_type = header.network.0 as u16;
                    reader.consume(offset);
                }
                _ => reader.consume(offset),
            },
            Err(PcapParserError::Eof) => return Ok(None),
            Err(PcapParserError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| invalid(format!("Legacy PCAP refill error: {}", e)))?;
            }
            Err(e) => return Err(invalid(format!("Legacy PCAP parse error: {}", e))),
        }
    }
}

fn read_pcapng_packet(
    reader: &mut PcapNGReader<Source>,
    frame_number: &mut u64,
    link_type: &mut u16,
) -> Result<Option<RawPacket>, Error> {
    use pcap_parser::pcapng::Block;
    use pcap_parser::PcapError as PcapParserError;

    loop {
        match reader.next() {
            Ok((offset, PcapBlockOwned::NG(block))) => match block {
                Block::InterfaceDescription(idb) => {
                    *link_type = idb.linktype.0 as u16;
                    reader.consume(offset);
                }
                Block::EnhancedPacket(epb) => {
                    *frame_number += 1;

                    let packet = RawPacket {
                        frame_number: *frame_number,
                        timestamp_us: (i64::from(epb.ts_high) << 32) | i64::from(epb.ts_low),
                        captured_length: epb.caplen,
                        original_length: epb.origlen,
                        link_type: *link_type,
                        data: Bytes::copy_from_slice(epb.data),
                    };

                    reader.consume(offset);
                    return Ok(Some(packet));
                }
                Block::SimplePacket(spb) => {
                    *frame_number += 1;

                    let packet = RawPacket {
                        frame_number: *frame_number,
                        timestamp_us: 0,
                        captured_length: spb.data.len() as u32,
                        original_length: spb.origlen,
                        link_type: *link_type,
                        data: Bytes::copy_from_slice(spb.data),
                    };

                    reader.consume(offset);
                    return Ok(Some(packet));
                }
                _ => reader.consume(offset),
            },
            Ok((offset, _)) => reader.consume(offset),
            Err(PcapParserError::Eof) => return Ok(None),
            Err(PcapParserError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| invalid(format!("PCAPNG refill error: {}", e)))?;
            }
            Err(e) => return Err(invalid(format!("PCAPNG parse error: {}", e))),
        }
    }
}

/// Iterator adapter for PcapReader.
impl Iterator for PcapReader {
    type Item = Result<RawPacket, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_packet().transpose()
    }
}
