//! flowdpi - Replay packet captures through a flow-tracking DPI pipeline.
//!
//! This library holds the command-line front end around
//! [`flowdpi_core::Stack`]: argument parsing, capture replay and the flow
//! listing output.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use flowdpi::replay::{replay_file, ReplayOptions};
//! use flowdpi_core::Stack;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut stack = Stack::new();
//!     let summary = replay_file(&mut stack, Path::new("capture.pcap"), ReplayOptions::default())?;
//!     println!("{} packets, {} flows", summary.packets, stack.total_flows());
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod replay;

pub use replay::{replay, replay_file, ReplayOptions, ReplaySummary};
