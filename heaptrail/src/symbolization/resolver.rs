//! Generation-aware symbol resolver for native frames
//!
//! The traced process can load and unload shared objects while a capture is
//! running. Every MEMORY_MAP_START in the stream rotates the resolver to a
//! fresh generation; segments registered afterwards belong to the new
//! generation, and native frames recorded earlier keep resolving against the
//! generation that was current when they were captured. Old generations are
//! therefore retained for the lifetime of the decode.

use super::interval_map::IntervalMap;
use crate::domain::Generation;
use crate::records::Segment;
use addr2line::Context;
use gimli::{EndianArcSlice, RunTimeEndian};
use log::debug;
use object::{Object, ObjectSection};
use rustc_demangle::demangle;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

/// One symbolicated native frame. An instruction pointer may expand to
/// several of these when the compiler inlined calls at that address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub function: String,
    pub file: String,
    pub lineno: i32,
}

/// A shared object registered from one SEGMENT_HEADER run.
#[derive(Debug, Clone)]
pub struct LoadedObject {
    pub filename: String,
    pub base_address: u64,
    pub segments: Vec<Segment>,
    pub generation: Generation,
}

type DwarfContext = Context<EndianArcSlice<RunTimeEndian>>;

/// Resolves instruction pointers to native frames across memory-map
/// rotations.
pub struct SymbolResolver {
    current: Generation,
    generations: HashMap<Generation, IntervalMap<Arc<LoadedObject>>>,
    /// DWARF contexts cached per object file; `None` records a file whose
    /// debug info could not be loaded so we do not retry on every frame.
    contexts: HashMap<String, Option<DwarfContext>>,
}

impl SymbolResolver {
    #[must_use]
    pub fn new() -> SymbolResolver {
        let mut generations = HashMap::new();
        generations.insert(Generation::default(), IntervalMap::new());
        SymbolResolver { current: Generation::default(), generations, contexts: HashMap::new() }
    }

    #[must_use]
    pub fn current_generation(&self) -> Generation {
        self.current
    }

    /// Rotate to a fresh, empty generation. Previously registered objects
    /// stay resolvable under their original generation.
    pub fn clear_segments(&mut self) {
        self.current = self.current.next();
        self.generations.insert(self.current, IntervalMap::new());
        debug!("memory map rotated, now at {}", self.current);
    }

    /// Register one loaded object at the current generation.
    pub fn add_segments(&mut self, filename: String, base_address: u64, segments: Vec<Segment>) {
        let object = Arc::new(LoadedObject {
            filename,
            base_address,
            segments,
            generation: self.current,
        });
        let map = self
            .generations
            .get_mut(&self.current)
            .expect("current generation always registered");
        for segment in &object.segments {
            let start = base_address + segment.vaddr;
            map.insert(start, start + segment.memsz, Arc::clone(&object));
        }
    }

    /// The loaded object containing `ip` at `generation`, if any.
    #[must_use]
    pub fn locate(&self, ip: u64, generation: Generation) -> Option<&Arc<LoadedObject>> {
        self.generations.get(&generation)?.query(ip)
    }

    /// Symbolicate `ip` against the memory map of `generation`.
    ///
    /// Returns `None` when `ip` falls in no segment of that generation (a
    /// non-fatal miss; the frame is simply absent from the output trace).
    /// When the object is found but carries no usable debug info, a single
    /// placeholder frame naming the object is returned instead.
    pub fn resolve(&mut self, ip: u64, generation: Generation) -> Option<Vec<ResolvedFrame>> {
        let object = Arc::clone(self.generations.get(&generation)?.query(ip)?);
        let offset = ip - object.base_address;

        let frames = match self.context_for(&object.filename) {
            Some(ctx) => symbolicate(ctx, offset),
            None => Vec::new(),
        };
        if frames.is_empty() {
            return Some(vec![ResolvedFrame {
                function: format!("{ip:#x}"),
                file: object.filename.clone(),
                lineno: 0,
            }]);
        }
        Some(frames)
    }

    fn context_for(&mut self, filename: &str) -> Option<&DwarfContext> {
        if !self.contexts.contains_key(filename) {
            let ctx = load_context(filename);
            if ctx.is_none() {
                debug!("no debug info for {filename}");
            }
            self.contexts.insert(filename.to_string(), ctx);
        }
        self.contexts.get(filename).and_then(Option::as_ref)
    }
}

impl Default for SymbolResolver {
    fn default() -> SymbolResolver {
        SymbolResolver::new()
    }
}

fn load_context(filename: &str) -> Option<DwarfContext> {
    let binary_data = fs::read(filename).ok()?;
    let obj_file = object::File::parse(&*binary_data).ok()?;

    let endian =
        if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

    let load_section = |id: gimli::SectionId| -> Result<EndianArcSlice<RunTimeEndian>, gimli::Error> {
        let data = obj_file
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
        Ok(EndianArcSlice::new(Arc::from(&*data), endian))
    };

    let dwarf = gimli::Dwarf::load(&load_section).ok()?;
    Context::from_dwarf(dwarf).ok()
}

fn symbolicate(ctx: &DwarfContext, offset: u64) -> Vec<ResolvedFrame> {
    let mut result = Vec::new();

    if let Ok(mut frame_iter) = ctx.find_frames(offset).skip_all_loads() {
        while let Ok(Some(frame)) = frame_iter.next() {
            let function = frame
                .function
                .and_then(|f| f.raw_name().ok().map(|s| format!("{:#}", demangle(&s))))
                .unwrap_or_else(|| "<unknown>".to_string());

            let (file, lineno) = frame
                .location
                .map(|loc| {
                    (
                        loc.file.map(str::to_string).unwrap_or_default(),
                        loc.line.map_or(0, |l| l as i32),
                    )
                })
                .unwrap_or_default();

            result.push(ResolvedFrame { function, file, lineno });
        }
    }

    result
}
