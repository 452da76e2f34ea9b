//! flowdpi CLI entry point.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowdpi::cli::{Args, FlowRow, OutputFormatter};
use flowdpi::replay::{replay_file, ReplayOptions, ReplaySummary};
use flowdpi_core::{DatabaseAdaptor, IpSetManager, JsonLinesAdaptor, Stack};

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Set up logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();

    let mut stack = Stack::with_config(args.stack_config());

    let ip_sets = args.ip_sets()?;
    if !ip_sets.is_empty() {
        let mut manager = IpSetManager::new();
        for set in ip_sets {
            info!(name = set.name(), networks = set.len(), "ipset loaded");
            manager.add_ip_set(set);
        }
        stack.set_ipset_manager(Arc::new(manager));
    }

    if let Some(path) = &args.tcp_adaptor {
        stack.set_tcp_adaptor(open_adaptor(path)?);
    }
    if let Some(path) = &args.udp_adaptor {
        stack.set_udp_adaptor(open_adaptor(path)?);
    }

    let options = ReplayOptions {
        limit: args.limit,
        final_sweep: args.final_sweep,
    };
    let summary = replay_file(&mut stack, &args.file, options)?;

    let mut stdout = io::stdout().lock();
    if args.show_flows {
        let rows: Vec<FlowRow> = stack.flows().map(FlowRow::from_flow).collect();
        OutputFormatter::new(args.format).write(&rows, &mut stdout)?;
    }

    if args.stats_level > 0 {
        print_summary(&summary, &stack, &mut stdout)?;
        stack.statistics(&mut stdout, args.stats_level)?;
    }

    Ok(())
}

fn open_adaptor(path: &std::path::Path) -> Result<Box<dyn DatabaseAdaptor>> {
    let mut adaptor = JsonLinesAdaptor::new();
    adaptor
        .connect(&path.to_string_lossy())
        .with_context(|| format!("Failed to open adaptor output: {}", path.display()))?;
    Ok(Box::new(adaptor))
}

fn print_summary(summary: &ReplaySummary, stack: &Stack, out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "Replay summary")?;
    writeln!(out, "\tPackets:{:>22}", summary.packets)?;
    writeln!(out, "\tBytes:{:>24}", summary.bytes)?;
    writeln!(out, "\tInvalid packets:{:>14}", summary.invalid)?;
    writeln!(out, "\tCapture duration (us):{:>8}", summary.duration())?;
    writeln!(out, "\tActive flows:{:>17}", stack.total_flows())?;
    if summary.swept_flows > 0 {
        writeln!(out, "\tSwept flows:{:>18}", summary.swept_flows)?;
    }
    Ok(())
}
