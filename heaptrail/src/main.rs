//! # Heaptrail - Report Binary
//!
//! Thin front-end over the capture decoder and the analysis queries. Three
//! subcommands:
//!
//! - `dump <file>`: raw record dump in a fixed text format, useful when a
//!   capture itself is under suspicion
//! - `stats <file>`: peak-memory watermark and leak summary, optionally as
//!   JSON and with per-site stack traces
//! - `live <host:port>`: connect to a running capture and print periodic
//!   snapshots of the live heap until the tracked process exits
//!
//! Exits non-zero on I/O, format or version errors.

use anyhow::{Context as _, Result};
use clap::Parser;
use heaptrail::analysis::{self, SnapshotRow};
use heaptrail::cli::{Args, Command};
use heaptrail::io::{FileSource, SocketSource};
use heaptrail::live::BackgroundReader;
use heaptrail::reader::{RecordReader, TraceContext};
use std::io::Write;
use std::time::Duration;

/// Frames rendered per site in leak and snapshot listings.
const TRACE_DEPTH: usize = 16;

fn main() -> Result<()> {
    env_logger::init();

    match Args::parse().command {
        Command::Dump { file } => {
            let source = FileSource::open(&file)
                .with_context(|| format!("failed to open {}", file.display()))?;
            let mut reader = RecordReader::open(Box::new(source))
                .context("failed to read capture header")?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            reader.dump_all_records(&mut out)?;
            out.flush()?;
        }

        Command::Stats { file, json, leaks, merge_threads } => {
            let source = FileSource::open(&file)
                .with_context(|| format!("failed to open {}", file.display()))?;
            let mut reader = RecordReader::open(Box::new(source))
                .context("failed to read capture header")?;
            let context = reader.context();
            let allocations = reader.read_all().context("malformed capture stream")?;

            let stats = analysis::summarize(&allocations);
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                let header = reader.header();
                println!("capture of pid {} ({})", header.pid, header.command_line);
                println!("  events:        {}", stats.total_events);
                println!(
                    "  allocations:   {} ({} deallocations)",
                    stats.total_allocations, stats.total_deallocations
                );
                println!(
                    "  peak memory:   {} bytes at event {}",
                    stats.peak_memory, stats.peak_index
                );
                println!(
                    "  leaked:        {} bytes in {} allocations",
                    stats.leaked_bytes, stats.leaked_allocations
                );
            }

            if leaks {
                let rows = analysis::leaks(&allocations, merge_threads);
                println!("\nleaked allocation sites:");
                print_rows(&rows, &context);
            }
        }

        Command::Live { address, interval, merge_threads } => {
            let source = SocketSource::connect(&address)
                .with_context(|| format!("failed to connect to {address}"))?;
            let cancel = source.cancel_handle()?;
            let reader = RecordReader::open(Box::new(source))
                .context("failed to read capture header")?;
            println!(
                "following pid {} ({})",
                reader.header().pid,
                reader.header().command_line
            );

            let live = BackgroundReader::spawn(reader, Some(cancel));
            let context = live.context();
            let ticker = crossbeam_channel::tick(Duration::from_secs(interval.max(1)));
            while live.is_active() {
                if ticker.recv().is_err() {
                    break;
                }
                let rows = live.snapshot(merge_threads);
                println!(
                    "\n[{} events] {} live sites:",
                    live.allocation_count(),
                    rows.len()
                );
                print_rows(&rows, &context);
            }

            println!("\ncapture ended; outstanding allocations:");
            let rows = live.snapshot(merge_threads);
            print_rows(&rows, &context);
        }
    }

    Ok(())
}

fn print_rows(rows: &[SnapshotRow], context: &TraceContext) {
    for row in rows {
        let thread = match row.tid {
            Some(tid) => format!("{tid} "),
            None => String::new(),
        };
        println!(
            "  {}{}: {} allocations, {} bytes",
            thread,
            row.allocator.name(),
            row.n_allocations,
            row.total_size
        );
        for frame in context.stack_trace(row.frame_index, TRACE_DEPTH) {
            println!("      {} ({}:{})", frame.function_name, frame.filename, frame.lineno);
        }
    }
}
