//! Error types for flowdpi-core.
//!
//! The packet path never returns errors: malformed input is counted as an
//! anomaly or an invalid packet and processing continues. The types here
//! cover the fallible edges around it:
//!
//! - [`enum@Error`] - Main error enum that wraps all error types
//! - [`PcapError`] - Errors from capture file reading
//! - [`AdaptorError`] - Errors from persistence adaptors

use thiserror::Error;

/// Main error type for flowdpi-core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Error reading or parsing a capture file
    #[error("PCAP error: {0}")]
    Pcap(#[from] PcapError),

    /// Error talking to a persistence adaptor
    #[error("Adaptor error: {0}")]
    Adaptor(#[from] AdaptorError),

    /// Malformed network given to an IP set
    #[error("Invalid network: {0}")]
    InvalidNetwork(#[from] ipnetwork::IpNetworkError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to capture file reading.
#[derive(Error, Debug)]
pub enum PcapError {
    /// File not found
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    /// Invalid PCAP format
    #[error("Invalid PCAP format: {reason}")]
    InvalidFormat { reason: String },

    /// Unsupported link type
    #[error("Unsupported link type: {link_type}")]
    UnsupportedLinkType { link_type: u16 },
}

/// Errors raised by persistence adaptors.
#[derive(Error, Debug)]
pub enum AdaptorError {
    /// The adaptor could not reach its backing store
    #[error("cannot connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    /// The adaptor was used before `connect`
    #[error("adaptor is not connected")]
    NotConnected,

    /// A flow record could not be serialized
    #[error("cannot serialize flow record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
