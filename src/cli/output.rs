//! Output formatting for flow listings.
//!
//! Flows are flattened into [`FlowRow`]s and printed as a table, CSV, or
//! JSON lines.

use std::io::Write;

use clap::ValueEnum;
use serde_json::json;

use flowdpi_core::Flow;

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed table (default)
    Table,
    /// Comma-separated values
    Csv,
    /// JSON Lines (one JSON object per flow)
    Json,
}

const COLUMNS: [&str; 11] = [
    "protocol",
    "source",
    "destination",
    "vlan",
    "packets",
    "bytes",
    "duration_us",
    "state",
    "ipset",
    "anomaly",
    "evidence",
];

/// One flow, flattened for display.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRow {
    pub protocol: &'static str,
    pub source: String,
    pub destination: String,
    pub vlan: Option<u32>,
    pub packets: u64,
    pub bytes: u64,
    pub duration_us: i64,
    pub state: Option<&'static str>,
    pub ipset: Option<String>,
    pub anomaly: Option<&'static str>,
    pub evidence: bool,
}

impl FlowRow {
    pub fn from_flow(flow: &Flow) -> Self {
        let tuple = flow.tuple();
        let protocol = match tuple.protocol {
            6 => "tcp",
            17 => "udp",
            _ => "other",
        };
        let anomaly = flow.anomaly();

        Self {
            protocol,
            source: endpoint(tuple.source, tuple.source_port),
            destination: endpoint(tuple.destination, tuple.destination_port),
            vlan: flow.tag(),
            packets: flow.total_packets,
            bytes: flow.total_bytes,
            duration_us: flow.duration(),
            state: flow.tcp_info().map(|info| info.state_curr.as_str()),
            ipset: flow.ipset().map(|set| set.name().to_string()),
            anomaly: (!anomaly.is_none()).then(|| anomaly.as_str()),
            evidence: flow.have_evidence(),
        }
    }

    fn values(&self) -> [String; 11] {
        [
            self.protocol.to_string(),
            self.source.clone(),
            self.destination.clone(),
            self.vlan.map(|v| v.to_string()).unwrap_or_default(),
            self.packets.to_string(),
            self.bytes.to_string(),
            self.duration_us.to_string(),
            self.state.unwrap_or_default().to_string(),
            self.ipset.clone().unwrap_or_default(),
            self.anomaly.unwrap_or_default().to_string(),
            self.evidence.to_string(),
        ]
    }
}

fn endpoint(address: std::net::IpAddr, port: u16) -> String {
    if address.is_ipv6() {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}

/// Formats flow listings.
pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    /// Create a new formatter with the specified format.
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Write `rows` to the given writer.
    pub fn write<W: Write>(&self, rows: &[FlowRow], writer: &mut W) -> std::io::Result<()> {
        match self.format {
            OutputFormat::Table => self.write_table(rows, writer),
            OutputFormat::Csv => self.write_csv(rows, writer),
            OutputFormat::Json => self.write_json(rows, writer),
        }
    }

    fn write_table<W: Write>(&self, rows: &[FlowRow], writer: &mut W) -> std::io::Result<()> {
        use comfy_table::{Cell, Table};

        let mut table = Table::new();
        table.set_header(COLUMNS.iter().map(|c| Cell::new(c)).collect::<Vec<_>>());

        for row in rows {
            table.add_row(row.values().into_iter().map(Cell::new).collect::<Vec<_>>());
        }

        writeln!(writer, "{table}")
    }

    fn write_csv<W: Write>(&self, rows: &[FlowRow], writer: &mut W) -> std::io::Result<()> {
        writeln!(writer, "{}", COLUMNS.join(","))?;

        for row in rows {
            let values: Vec<String> = row
                .values()
                .into_iter()
                .map(|value| {
                    // Escape commas and quotes
                    if value.contains(',') || value.contains('"') || value.contains('\n') {
                        format!("\"{}\"", value.replace('"', "\"\""))
                    } else {
                        value
                    }
                })
                .collect();
            writeln!(writer, "{}", values.join(","))?;
        }

        Ok(())
    }

    fn write_json<W: Write>(&self, rows: &[FlowRow], writer: &mut W) -> std::io::Result<()> {
        for row in rows {
            let obj = json!({
                "protocol": row.protocol,
                "source": row.source,
                "destination": row.destination,
                "vlan": row.vlan,
                "packets": row.packets,
                "bytes": row.bytes,
                "duration_us": row.duration_us,
                "state": row.state,
                "ipset": row.ipset,
                "anomaly": row.anomaly,
                "evidence": row.evidence,
            });
            writeln!(writer, "{obj}")?;
        }

        Ok(())
    }
}
