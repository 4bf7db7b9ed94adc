//! Capture decoder: record stream in, materialized allocations out
//!
//! The reader validates the stream header up front (bad magic or a version
//! mismatch fails before any record is read), then iterates records one tag
//! at a time. Intermediate record types update decoder state invisibly; only
//! ALLOCATION records surface, each fully decorated with its stack-tree
//! index and the symbol-resolver generation that was current when it was
//! captured.
//!
//! End-of-stream discipline: running out of bytes exactly at a tag boundary
//! is a clean end (no log). Running out mid-payload ends iteration too, but
//! is logged as a truncation if the source is still open; an externally
//! cancelled socket stays silent. Malformed content (unknown tag, duplicate
//! frame id, pop past an empty stack) is a hard error and is never
//! swallowed.
//!
//! Decoder maps (frame map, stack tree, native frames, symbol resolver,
//! thread names) live behind one coarse mutex shared with [`TraceContext`]
//! handles, so materialized allocations can render their traces lazily while
//! a background thread keeps decoding. The lock is held for one record's
//! state update or one query walk, never across source I/O.

mod context;
mod dump;

pub use context::{StackFrame, TraceContext};

use crate::domain::{FrameId, Generation, RecordError, ThreadId};
use crate::frames::{FrameInterner, StackTree};
use crate::io::Source;
use crate::records::{
    AllocationRecord, AllocatorKind, Frame, HeaderRecord, RecordType, Segment, StreamStats,
    UnresolvedNativeFrame, CURRENT_VERSION, MAGIC,
};
use crate::symbolization::SymbolResolver;
use log::error;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One materialized allocation event.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub record: AllocationRecord,
    /// Index of the top stack-tree node of the interpreter stack at the
    /// moment of the allocation; 0 when the thread had no frames.
    pub frame_index: u32,
    /// Resolver generation current when the allocation was recorded.
    pub native_segment_generation: Generation,
}

/// Decoder state shared between the reading thread and trace queries.
pub(crate) struct TraceState {
    pub(crate) frame_map: HashMap<FrameId, Frame>,
    pub(crate) allocation_frames: FrameInterner,
    pub(crate) stack_tree: StackTree,
    pub(crate) native_frames: Vec<UnresolvedNativeFrame>,
    pub(crate) resolver: SymbolResolver,
    pub(crate) thread_names: HashMap<ThreadId, String>,
}

impl TraceState {
    fn new() -> TraceState {
        TraceState {
            frame_map: HashMap::new(),
            allocation_frames: FrameInterner::with_first_id(FrameId::ALLOCATION_BASE),
            stack_tree: StackTree::new(),
            native_frames: Vec::new(),
            resolver: SymbolResolver::new(),
            thread_names: HashMap::new(),
        }
    }

    /// Replace the top of `stack` with a clone of its frame specialized to
    /// the allocation line, interning the clone in the reserved id
    /// partition. A top whose definition has not arrived yet is left alone
    /// (FRAME_PUSH ids may be defined lazily).
    fn specialize_top(&mut self, stack: &mut [FrameId], lineno: i32) {
        let Some(top) = stack.last_mut() else {
            return;
        };
        let Some(partial) = self.frame_map.get(top) else {
            return;
        };
        let allocation_frame = Frame { lineno, ..partial.clone() };
        let (id, is_new) = self.allocation_frames.intern(&allocation_frame);
        if is_new {
            self.frame_map.insert(id, allocation_frame);
        }
        *top = id;
    }
}

/// Streaming decoder for one capture stream.
pub struct RecordReader {
    source: Box<dyn Source>,
    header: HeaderRecord,
    /// Per-thread live stacks. Only the decoding thread touches these, so
    /// they stay outside the shared mutex.
    stacks: HashMap<ThreadId, Vec<FrameId>>,
    state: Arc<Mutex<TraceState>>,
}

impl std::fmt::Debug for RecordReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordReader").finish_non_exhaustive()
    }
}

impl RecordReader {
    /// Read and validate the stream header.
    ///
    /// # Errors
    /// Fails with [`RecordError::BadMagic`] or
    /// [`RecordError::VersionMismatch`] before any record is consumed, or
    /// [`RecordError::TruncatedHeader`] if the header itself is cut short.
    pub fn open(mut source: Box<dyn Source>) -> Result<RecordReader, RecordError> {
        let header = read_header(source.as_mut())?;
        Ok(RecordReader {
            source,
            header,
            stacks: HashMap::new(),
            state: Arc::new(Mutex::new(TraceState::new())),
        })
    }

    #[must_use]
    pub fn header(&self) -> &HeaderRecord {
        &self.header
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.source.is_open()
    }

    pub fn close(&mut self) {
        self.source.close();
    }

    /// Shared handle for rendering traces of materialized allocations.
    #[must_use]
    pub fn context(&self) -> TraceContext {
        TraceContext::new(Arc::clone(&self.state))
    }

    /// Consume records until the next ALLOCATION is produced or the stream
    /// ends. `Ok(None)` is end of stream (clean or truncated, see the module
    /// docs); `Err` is a malformed stream.
    ///
    /// # Errors
    /// Returns a [`RecordError`] on any format violation.
    pub fn next_allocation(&mut self) -> Result<Option<Allocation>, RecordError> {
        loop {
            let mut tag = [0u8; 1];
            if !self.source.read(&mut tag) {
                return Ok(None);
            }
            let Some(record_type) = RecordType::from_u8(tag[0]) else {
                return Err(RecordError::UnknownRecordType(tag[0]));
            };

            match record_type {
                RecordType::Allocation => {
                    let Some(record) = self.parse_allocation()? else {
                        return self.truncated("allocation");
                    };
                    return Ok(Some(self.materialize(record)));
                }
                RecordType::FramePush => {
                    if self.parse_frame_push().is_none() {
                        return self.truncated("frame push");
                    }
                }
                RecordType::FramePop => {
                    let Some(parsed) = self.parse_frame_pop() else {
                        return self.truncated("frame pop");
                    };
                    parsed?;
                }
                RecordType::FrameIndex => {
                    let Some(parsed) = self.parse_frame_index() else {
                        return self.truncated("frame index");
                    };
                    parsed?;
                }
                RecordType::NativeTraceIndex => {
                    if self.parse_native_frame_index().is_none() {
                        return self.truncated("native frame index");
                    }
                }
                RecordType::MemoryMapStart => {
                    self.state.lock().unwrap().resolver.clear_segments();
                }
                RecordType::SegmentHeader => {
                    let Some(parsed) = self.parse_segment_header() else {
                        return self.truncated("segment header");
                    };
                    parsed?;
                }
                RecordType::Segment => {
                    // SEGMENT only appears inside a SEGMENT_HEADER run.
                    return Err(RecordError::UnknownRecordType(tag[0]));
                }
                RecordType::ThreadRecord => {
                    if self.parse_thread_record().is_none() {
                        return self.truncated("thread record");
                    }
                }
            }
        }
    }

    /// Decode the rest of the stream, collecting every allocation.
    ///
    /// # Errors
    /// Returns a [`RecordError`] on any format violation.
    pub fn read_all(&mut self) -> Result<Vec<Allocation>, RecordError> {
        let mut allocations = Vec::new();
        while let Some(allocation) = self.next_allocation()? {
            allocations.push(allocation);
        }
        Ok(allocations)
    }

    /// Stamp an allocation record with its stack-tree index and the current
    /// resolver generation.
    fn materialize(&mut self, record: AllocationRecord) -> Allocation {
        let mut state = self.state.lock().unwrap();
        let frame_index = match self.stacks.get_mut(&record.tid) {
            None => 0,
            Some(stack) => {
                if record.py_lineno != 0 {
                    state.specialize_top(stack, record.py_lineno);
                }
                state.stack_tree.trace_index(stack)
            }
        };
        let native_segment_generation = state.resolver.current_generation();
        Allocation { record, frame_index, native_segment_generation }
    }

    fn parse_allocation(&mut self) -> Result<Option<AllocationRecord>, RecordError> {
        let source = self.source.as_mut();
        let Some(tid) = read_u64(source) else { return Ok(None) };
        let Some(address) = read_u64(source) else { return Ok(None) };
        let Some(size) = read_u64(source) else { return Ok(None) };
        let Some(allocator_tag) = read_u8(source) else { return Ok(None) };
        let Some(py_lineno) = read_i32(source) else { return Ok(None) };
        let Some(native_frame_id) = read_u32(source) else { return Ok(None) };

        let allocator = AllocatorKind::from_u8(allocator_tag)
            .ok_or(RecordError::UnknownAllocator(allocator_tag))?;
        Ok(Some(AllocationRecord {
            tid: ThreadId(tid),
            address,
            size,
            allocator,
            py_lineno,
            native_frame_id,
        }))
    }

    fn parse_frame_push(&mut self) -> Option<()> {
        let tid = ThreadId(read_u64(self.source.as_mut())?);
        let frame_id = FrameId(read_u32(self.source.as_mut())?);
        self.stacks.entry(tid).or_default().push(frame_id);
        Some(())
    }

    fn parse_frame_pop(&mut self) -> Option<Result<(), RecordError>> {
        let tid = ThreadId(read_u64(self.source.as_mut())?);
        let count = read_u16(self.source.as_mut())? as usize;
        if count == 0 {
            return Some(Ok(()));
        }
        let stack = self.stacks.get_mut(&tid);
        match stack {
            Some(stack) if stack.len() >= count => {
                stack.truncate(stack.len() - count);
                Some(Ok(()))
            }
            _ => Some(Err(RecordError::PopEmptyStack(tid))),
        }
    }

    fn parse_frame_index(&mut self) -> Option<Result<(), RecordError>> {
        let source = self.source.as_mut();
        let frame_id = FrameId(read_u32(source)?);
        let function_name = source.getline(0)?;
        let filename = source.getline(0)?;
        let parent_lineno = read_i32(source)?;

        if frame_id.is_allocation_frame() {
            return Some(Err(RecordError::ReservedFrameId(frame_id)));
        }
        let frame = Frame { function_name, filename, parent_lineno, lineno: 0 };
        let mut state = self.state.lock().unwrap();
        if state.frame_map.insert(frame_id, frame).is_some() {
            return Some(Err(RecordError::DuplicateFrameId(frame_id)));
        }
        Some(Ok(()))
    }

    fn parse_native_frame_index(&mut self) -> Option<()> {
        let ip = read_u64(self.source.as_mut())?;
        let parent_index = read_u32(self.source.as_mut())?;
        let mut state = self.state.lock().unwrap();
        state.native_frames.push(UnresolvedNativeFrame { ip, parent_index });
        Some(())
    }

    fn parse_segment_header(&mut self) -> Option<Result<(), RecordError>> {
        let source = self.source.as_mut();
        let filename = source.getline(0)?;
        let num_segments = read_u32(source)?;
        let base_address = read_u64(source)?;

        let mut segments = Vec::with_capacity(num_segments as usize);
        for _ in 0..num_segments {
            let tag = read_u8(source)?;
            if RecordType::from_u8(tag) != Some(RecordType::Segment) {
                return Some(Err(RecordError::UnexpectedSegmentRecord(tag)));
            }
            let vaddr = read_u64(source)?;
            let memsz = read_u64(source)?;
            segments.push(Segment { vaddr, memsz });
        }

        let mut state = self.state.lock().unwrap();
        state.resolver.add_segments(filename, base_address, segments);
        Some(Ok(()))
    }

    fn parse_thread_record(&mut self) -> Option<()> {
        let tid = ThreadId(read_u64(self.source.as_mut())?);
        let name = self.source.getline(0)?;
        let mut state = self.state.lock().unwrap();
        state.thread_names.insert(tid, name);
        Some(())
    }

    /// Short read mid-payload: end iteration, logging iff the source is
    /// still open (a closed source means deliberate teardown, not damage).
    fn truncated(&self, what: &str) -> Result<Option<Allocation>, RecordError> {
        if self.source.is_open() {
            error!("failed to parse {what} record: truncated stream");
        }
        Ok(None)
    }
}

fn read_header(source: &mut dyn Source) -> Result<HeaderRecord, RecordError> {
    let mut magic = [0u8; 8];
    if !source.read(&mut magic) || magic != MAGIC {
        return Err(RecordError::BadMagic);
    }
    let version = read_u16(source).ok_or(RecordError::TruncatedHeader)?;
    if version != CURRENT_VERSION {
        return Err(RecordError::VersionMismatch { expected: CURRENT_VERSION, found: version });
    }
    let native_traces = read_u8(source).ok_or(RecordError::TruncatedHeader)? != 0;
    let stats = StreamStats {
        n_allocations: read_u64(source).ok_or(RecordError::TruncatedHeader)?,
        n_frames: read_u64(source).ok_or(RecordError::TruncatedHeader)?,
        start_time_ms: read_u64(source).ok_or(RecordError::TruncatedHeader)?,
        end_time_ms: read_u64(source).ok_or(RecordError::TruncatedHeader)?,
    };
    let command_line = source.getline(0).ok_or(RecordError::TruncatedHeader)?;
    let pid = read_u32(source).ok_or(RecordError::TruncatedHeader)?;
    Ok(HeaderRecord { magic, version, native_traces, stats, command_line, pid })
}

fn read_u8(source: &mut dyn Source) -> Option<u8> {
    let mut buf = [0u8; 1];
    source.read(&mut buf).then(|| buf[0])
}

fn read_u16(source: &mut dyn Source) -> Option<u16> {
    let mut buf = [0u8; 2];
    source.read(&mut buf).then(|| u16::from_ne_bytes(buf))
}

fn read_u32(source: &mut dyn Source) -> Option<u32> {
    let mut buf = [0u8; 4];
    source.read(&mut buf).then(|| u32::from_ne_bytes(buf))
}

fn read_i32(source: &mut dyn Source) -> Option<i32> {
    let mut buf = [0u8; 4];
    source.read(&mut buf).then(|| i32::from_ne_bytes(buf))
}

fn read_u64(source: &mut dyn Source) -> Option<u64> {
    let mut buf = [0u8; 8];
    source.read(&mut buf).then(|| u64::from_ne_bytes(buf))
}
