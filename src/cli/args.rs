//! Command-line argument definitions.

use clap::Parser;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use flowdpi_core::{IpSet, StackConfig};

use super::OutputFormat;

/// Longest accepted flow timeout, one year in seconds.
const MAX_FLOW_TIMEOUT: i64 = 365 * 24 * 3600;

/// Replay a packet capture through the flow tracking pipeline.
#[derive(Parser, Debug)]
#[command(name = "flowdpi")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// PCAP or PCAPNG file to replay (optionally gzip-compressed)
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Preallocated TCP flows
    #[arg(long = "tcp-flows", default_value = "16384")]
    pub tcp_flows: usize,

    /// Preallocated UDP flows
    #[arg(long = "udp-flows", default_value = "16384")]
    pub udp_flows: usize,

    /// Flow inactivity timeout in seconds
    #[arg(
        short = 't',
        long = "timeout",
        default_value = "180",
        value_parser = clap::value_parser!(i64).range(1..=MAX_FLOW_TIMEOUT)
    )]
    pub timeout: i64,

    /// Packets of a flow between two refreshes of its timer
    #[arg(long = "refresh-rate", default_value = "32")]
    pub refresh_rate: u64,

    /// Compute TCP connection setup and response times
    #[arg(long = "qos")]
    pub qos: bool,

    /// Keep closed TCP flows until they time out
    #[arg(long = "no-release-flows")]
    pub no_release_flows: bool,

    /// Let flow pools grow past their preallocated size
    #[arg(long = "dynamic-memory")]
    pub dynamic_memory: bool,

    /// Packets of a flow between two adaptor updates
    #[arg(long = "packet-sampling", default_value = "64")]
    pub packet_sampling: u64,

    /// Address set attached to matching flows, as NAME=CIDR[,CIDR...]
    #[arg(long = "ipset", value_name = "NAME=CIDRS")]
    pub ipsets: Vec<String>,

    /// Mirror the TCP flow table as JSON lines into this file
    #[arg(long = "tcp-adaptor", value_name = "PATH")]
    pub tcp_adaptor: Option<PathBuf>,

    /// Mirror the UDP flow table as JSON lines into this file
    #[arg(long = "udp-adaptor", value_name = "PATH")]
    pub udp_adaptor: Option<PathBuf>,

    /// Stop after this many packets
    #[arg(short = 'c', long = "count", value_name = "PACKETS")]
    pub limit: Option<u64>,

    /// Sweep every flow once the capture ends
    #[arg(long = "final-sweep")]
    pub final_sweep: bool,

    /// Statistics detail (0 disables the report)
    #[arg(short = 's', long = "stats-level", default_value = "1")]
    pub stats_level: u8,

    /// Print the active flows when the replay ends
    #[arg(long = "show-flows")]
    pub show_flows: bool,

    /// Output format for the flow listing
    #[arg(long = "format", value_enum, default_value = "table")]
    pub format: OutputFormat,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Pipeline configuration selected by the flags.
    pub fn stack_config(&self) -> StackConfig {
        StackConfig {
            tcp_flows: self.tcp_flows,
            udp_flows: self.udp_flows,
            flow_timeout: self.timeout,
            flow_time_refresh_rate: self.refresh_rate,
            qos_metrics: self.qos,
            release_flows: !self.no_release_flows,
            dynamic_allocated_memory: self.dynamic_memory,
            packet_sampling: self.packet_sampling,
        }
    }

    /// Parse every `--ipset` flag.
    pub fn ip_sets(&self) -> Result<Vec<IpSet>> {
        self.ipsets.iter().map(|arg| parse_ip_set(arg)).collect()
    }
}

/// Parse `NAME=CIDR[,CIDR...]` into an address set.
pub fn parse_ip_set(arg: &str) -> Result<IpSet> {
    let Some((name, addresses)) = arg.split_once('=') else {
        bail!("Invalid ipset '{arg}': expected NAME=CIDR[,CIDR...]");
    };
    if name.is_empty() {
        bail!("Invalid ipset '{arg}': empty name");
    }

    let mut set = IpSet::new(name);
    for address in addresses.split(',').filter(|a| !a.trim().is_empty()) {
        set.add_address(address)
            .with_context(|| format!("Invalid address '{address}' in ipset '{name}'"))?;
    }
    if set.is_empty() {
        bail!("Invalid ipset '{arg}': no addresses");
    }
    Ok(set)
}
