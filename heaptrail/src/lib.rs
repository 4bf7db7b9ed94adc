//! # Heaptrail - Streaming Memory-Allocation Trace Recorder and Analyzer
//!
//! Heaptrail captures allocator activity of an interpreted process as a
//! compact binary record stream and reconstructs it into a queryable
//! allocation history. The stream carries allocations together with an
//! interned interpreter call stack, optional native stack references and
//! the process's memory map, so every allocation can later be attributed to
//! the exact source line and native frame it came from.
//!
//! ## Architecture Overview
//!
//! ```text
//!  tracked process                          analysis side
//! ┌──────────────────┐                   ┌──────────────────────┐
//! │ allocator hooks  │                   │ RecordReader         │
//! │ profile hooks    │                   │  frame map           │
//! │       │          │   file or TCP     │  stack tree          │
//! │       ▼          │  ═══════════════▶ │  symbol resolver     │
//! │ RecordWriter     │   record stream   │       │              │
//! │  (frame deltas,  │                   │       ▼              │
//! │   interned defs) │                   │ analysis: watermark, │
//! └──────────────────┘                   │ snapshots, leaks     │
//!                                        └──────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`records`]: wire-level record types, tags, magic and version
//! - [`io`]: file and TCP transports for the stream ([`io::Source`],
//!   [`io::Sink`])
//! - [`frames`]: frame interner and the append-only stack tree
//! - [`symbolization`]: generation-aware native symbol resolver (DWARF)
//! - [`writer`]: encoder state machine fed by the host-runtime hooks
//! - [`reader`]: decoder state machine and lazy trace rendering
//! - [`analysis`]: watermark, snapshot and leak queries
//! - [`live`]: background thread consuming a live socket capture
//! - [`domain`]: newtype ids and error taxonomies
//! - [`cli`]: argument surface of the report binary
//!
//! ## Concurrency Model
//!
//! The decoder is single-threaded; one thread drives one reader. Decoder
//! state shared with trace queries sits behind one coarse mutex, held per
//! record update or per query walk and never across source I/O. The live
//! consumer runs the decoder on a worker thread and exposes snapshots to
//! the foreground through the same mutex.

pub mod analysis;
pub mod cli;
pub mod domain;
pub mod frames;
pub mod io;
pub mod live;
pub mod reader;
pub mod records;
pub mod symbolization;
pub mod writer;
