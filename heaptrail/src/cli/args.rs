//! CLI argument definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "heaptrail", about = "Inspect and follow heaptrail allocation captures")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print every record of a capture file in a fixed text format
    Dump {
        /// Capture file to dump
        file: PathBuf,
    },

    /// Summarize a capture: peak memory watermark and outstanding leaks
    Stats {
        /// Capture file to analyze
        file: PathBuf,

        /// Emit the summary as JSON instead of text
        #[arg(long)]
        json: bool,

        /// List the leaked allocation sites with their stack traces
        #[arg(long)]
        leaks: bool,

        /// Merge report rows across threads
        #[arg(long)]
        merge_threads: bool,
    },

    /// Follow a live capture over TCP, printing periodic heap snapshots
    Live {
        /// Address of the tracked process's capture server, host:port
        address: String,

        /// Seconds between snapshots
        #[arg(long, default_value = "5")]
        interval: u64,

        /// Merge snapshot rows across threads
        #[arg(long)]
        merge_threads: bool,
    },
}
