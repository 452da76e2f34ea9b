//! Command-line interface module.
//!
//! This module handles:
//! - Argument parsing via clap
//! - Output formatting of flow listings (table, CSV, JSON)

mod args;
mod output;

pub use args::{parse_ip_set, Args};
pub use output::{FlowRow, OutputFormat, OutputFormatter};
