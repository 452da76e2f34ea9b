//! Borrowed view over one captured frame.
//!
//! A [`Packet`] travels through the multiplexer tree once. Every layer
//! narrows its payload window past the header it consumed, so the next
//! layer always sees its own header at offset zero. Layers also leave
//! context behind for the layers above them (addresses, ports, tag).

use std::net::IpAddr;

use crate::anomaly::PacketAnomaly;

/// Network layer context left on the packet by the IP decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkLayer {
    pub source: IpAddr,
    pub destination: IpAddr,
    /// IP protocol number of the payload.
    pub protocol: u8,
    pub header_length: usize,
    /// Payload length declared by the IP header, clamped to captured bytes.
    pub payload_length: usize,
}

/// A packet moving through the pipeline.
#[derive(Debug, Clone)]
pub struct Packet<'a> {
    frame: &'a [u8],
    offset: usize,
    length: usize,
    /// Capture time in microseconds.
    timestamp: i64,
    tag: Option<u32>,
    network: Option<NetworkLayer>,
    source_port: u16,
    destination_port: u16,
    pub anomaly: PacketAnomaly,
    accept: bool,
    evidence: bool,
    force_adaptor_write: bool,
}

impl<'a> Packet<'a> {
    pub fn new(frame: &'a [u8], timestamp: i64) -> Self {
        Self {
            frame,
            offset: 0,
            length: frame.len(),
            timestamp,
            tag: None,
            network: None,
            source_port: 0,
            destination_port: 0,
            anomaly: PacketAnomaly::None,
            accept: true,
            evidence: false,
            force_adaptor_write: false,
        }
    }

    /// Bytes of the current window.
    ///
    /// The slice borrows the frame, not the packet, so it stays usable while
    /// the packet itself is mutated.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let frame: &'a [u8] = self.frame;
        &frame[self.offset..self.offset + self.length]
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Move the window start past `header_length` bytes.
    pub fn narrow(&mut self, header_length: usize) {
        let step = header_length.min(self.length);
        self.offset += step;
        self.length -= step;
    }

    /// Drop trailing bytes beyond `length` (link layer padding).
    pub fn truncate(&mut self, length: usize) {
        self.length = self.length.min(length);
    }

    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[inline]
    pub fn tag(&self) -> Option<u32> {
        self.tag
    }

    pub fn set_tag(&mut self, tag: u32) {
        self.tag = Some(tag);
    }

    #[inline]
    pub fn network(&self) -> Option<&NetworkLayer> {
        self.network.as_ref()
    }

    pub fn set_network(&mut self, network: NetworkLayer) {
        self.network = Some(network);
    }

    #[inline]
    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    #[inline]
    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }

    pub fn set_ports(&mut self, source: u16, destination: u16) {
        self.source_port = source;
        self.destination_port = destination;
    }

    #[inline]
    pub fn is_accept(&self) -> bool {
        self.accept
    }

    pub fn set_accept(&mut self, accept: bool) {
        self.accept = accept;
    }

    #[inline]
    pub fn have_evidence(&self) -> bool {
        self.evidence
    }

    pub fn set_evidence(&mut self, evidence: bool) {
        self.evidence = evidence;
    }

    #[inline]
    pub fn force_adaptor_write(&self) -> bool {
        self.force_adaptor_write
    }

    pub fn set_force_adaptor_write(&mut self, force: bool) {
        self.force_adaptor_write = force;
    }
}
