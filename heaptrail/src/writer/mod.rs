//! Capture encoder: allocator events in, record stream out
//!
//! The writer sits between the host runtime's hooks and a [`Sink`]. Profile
//! hooks report frame entry/exit, which only updates an in-memory shadow
//! stack per thread; the stream is synchronized lazily when an allocation
//! actually happens, emitting the frame delta since the previous event. This
//! keeps idle interpreter activity out of the stream entirely.
//!
//! Ordering invariant: definitions precede uses. A FRAME_INDEX is written
//! before the first FRAME_PUSH of its id, and a NATIVE_TRACE_INDEX before
//! any ALLOCATION referencing it.

use crate::domain::{CaptureError, FrameId, ThreadId};
use crate::frames::FrameInterner;
use crate::io::Sink;
use crate::records::{
    AllocatorKind, Frame, HeaderRecord, RecordType, Segment, StreamStats, CURRENT_VERSION, MAGIC,
};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// One allocator hook firing, as delivered by the interception layer.
#[derive(Debug, Clone, Copy)]
pub struct AllocationEvent {
    pub tid: ThreadId,
    pub address: u64,
    pub size: u64,
    pub allocator: AllocatorKind,
    /// Interpreter line of the allocation site; 0 outside interpreter code.
    pub py_lineno: i32,
    /// 1-based native frame reference from `record_native_frame`; 0 for none.
    pub native_frame_id: u32,
}

/// A shared object reported by the memory-map scan of the traced process.
#[derive(Debug, Clone)]
pub struct MappedObject {
    pub filename: String,
    pub base_address: u64,
    pub segments: Vec<Segment>,
}

static CAPTURE_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Process-wide exclusivity token: at most one capture may be live at a time.
///
/// The capture installer (the allocator interception layer) acquires the
/// guard before building its [`RecordWriter`] and holds it for the life of
/// the capture; dropping it releases the slot for the next capture.
#[derive(Debug)]
pub struct CaptureGuard(());

impl CaptureGuard {
    /// Claim the capture slot for this process.
    ///
    /// # Errors
    /// Returns [`CaptureError::AlreadyActive`] while a previous capture is
    /// still live.
    pub fn acquire() -> Result<CaptureGuard, CaptureError> {
        if CAPTURE_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::AlreadyActive);
        }
        Ok(CaptureGuard(()))
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        CAPTURE_ACTIVE.store(false, Ordering::Release);
    }
}

/// Per-thread shadow of the interpreter stack.
#[derive(Default)]
struct ThreadStack {
    /// The host's live stack, updated by the profile hooks without I/O.
    current: Vec<FrameId>,
    /// The prefix the stream already reflects.
    emitted: Vec<FrameId>,
}

/// Encoder state machine writing the capture stream.
pub struct RecordWriter<S: Sink> {
    sink: S,
    interner: FrameInterner,
    /// Frame definitions interned but not yet written.
    pending_defs: Vec<(FrameId, Frame)>,
    stacks: HashMap<ThreadId, ThreadStack>,
    native_frames: HashMap<(u64, u32), u32>,
    thread_names: HashMap<ThreadId, String>,
}

impl<S: Sink> RecordWriter<S> {
    /// Write the stream header and return the ready encoder.
    ///
    /// # Errors
    /// Fails if the header cannot be written.
    pub fn new(
        sink: S,
        native_traces: bool,
        stats: StreamStats,
        command_line: String,
        pid: u32,
    ) -> std::io::Result<RecordWriter<S>> {
        let mut writer = RecordWriter {
            sink,
            interner: FrameInterner::new(),
            pending_defs: Vec::new(),
            stacks: HashMap::new(),
            native_frames: HashMap::new(),
            thread_names: HashMap::new(),
        };
        writer.write_header(&HeaderRecord {
            magic: MAGIC,
            version: CURRENT_VERSION,
            native_traces,
            stats,
            command_line,
            pid,
        })?;
        Ok(writer)
    }

    /// Profile-hook entry: push `frame` on `tid`'s shadow stack. No I/O.
    pub fn enter_frame(&mut self, tid: ThreadId, frame: Frame) {
        let (id, is_new) = self.interner.intern(&frame);
        if is_new {
            self.pending_defs.push((id, frame));
        }
        self.stacks.entry(tid).or_default().current.push(id);
    }

    /// Profile-hook exit: pop `tid`'s shadow stack. No I/O.
    pub fn leave_frame(&mut self, tid: ThreadId) {
        if let Some(stack) = self.stacks.get_mut(&tid) {
            stack.current.pop();
        }
    }

    /// Emit the frame delta for `event.tid`, then one ALLOCATION record. A
    /// thread observed for the first time is announced with a THREAD_RECORD
    /// (unnamed until the host reports a name).
    ///
    /// # Errors
    /// Returns an error if the sink rejects any record.
    pub fn record_allocation(&mut self, event: &AllocationEvent) -> std::io::Result<()> {
        if !self.thread_names.contains_key(&event.tid) {
            self.set_thread_name(event.tid, "")?;
        }
        self.sync_thread_stack(event.tid)?;
        self.put_tag(RecordType::Allocation)?;
        self.put_u64(event.tid.0)?;
        self.put_u64(event.address)?;
        self.put_u64(event.size)?;
        self.sink.write(&[event.allocator as u8])?;
        self.put_i32(event.py_lineno)?;
        self.put_u32(event.native_frame_id)?;
        Ok(())
    }

    /// Intern one native frame, emitting its NATIVE_TRACE_INDEX on first
    /// sight, and return its 1-based id for use in [`AllocationEvent`].
    ///
    /// # Errors
    /// Returns an error if the sink rejects the record.
    pub fn record_native_frame(&mut self, ip: u64, parent_id: u32) -> std::io::Result<u32> {
        if let Some(&id) = self.native_frames.get(&(ip, parent_id)) {
            return Ok(id);
        }
        self.put_tag(RecordType::NativeTraceIndex)?;
        self.put_u64(ip)?;
        self.put_u32(parent_id)?;
        let id = self.native_frames.len() as u32 + 1;
        self.native_frames.insert((ip, parent_id), id);
        Ok(id)
    }

    /// Emit a memory-map rotation: MEMORY_MAP_START followed by one
    /// SEGMENT_HEADER + SEGMENT run per loaded object.
    ///
    /// # Errors
    /// Returns an error if the sink rejects any record.
    pub fn record_memory_mappings(&mut self, objects: &[MappedObject]) -> std::io::Result<()> {
        self.put_tag(RecordType::MemoryMapStart)?;
        for object in objects {
            self.put_tag(RecordType::SegmentHeader)?;
            self.put_str(&object.filename)?;
            self.put_u32(object.segments.len() as u32)?;
            self.put_u64(object.base_address)?;
            for segment in &object.segments {
                self.put_tag(RecordType::Segment)?;
                self.put_u64(segment.vaddr)?;
                self.put_u64(segment.memsz)?;
            }
        }
        debug!("memory map rotated: {} objects", objects.len());
        Ok(())
    }

    /// Emit a THREAD_RECORD. Repeats with an unchanged name are dropped;
    /// a changed name is re-emitted and the decoder takes last-wins.
    ///
    /// # Errors
    /// Returns an error if the sink rejects the record.
    pub fn set_thread_name(&mut self, tid: ThreadId, name: &str) -> std::io::Result<()> {
        if self.thread_names.get(&tid).is_some_and(|known| known == name) {
            return Ok(());
        }
        self.put_tag(RecordType::ThreadRecord)?;
        self.put_u64(tid.0)?;
        self.put_str(name)?;
        self.thread_names.insert(tid, name.to_string());
        Ok(())
    }

    /// Flush buffered records down to the sink.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.sink.flush()
    }

    /// Flush and release the sink.
    ///
    /// # Errors
    /// Returns an error if the final flush fails.
    pub fn close(&mut self) -> std::io::Result<()> {
        self.sink.close()
    }

    /// Bring the stream's view of `tid`'s stack up to date: pending frame
    /// definitions first, then one FRAME_POP for the retreat, then a
    /// FRAME_PUSH per newly entered frame.
    fn sync_thread_stack(&mut self, tid: ThreadId) -> std::io::Result<()> {
        for (id, frame) in std::mem::take(&mut self.pending_defs) {
            self.put_tag(RecordType::FrameIndex)?;
            self.put_u32(id.0)?;
            self.put_str(&frame.function_name)?;
            self.put_str(&frame.filename)?;
            self.put_i32(frame.parent_lineno)?;
        }

        let stack = self.stacks.entry(tid).or_default();
        let shared = stack
            .emitted
            .iter()
            .zip(stack.current.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let pops = stack.emitted.len() - shared;
        let pushes: Vec<FrameId> = stack.current[shared..].to_vec();
        stack.emitted = stack.current.clone();

        let mut remaining = pops;
        while remaining > 0 {
            let count = remaining.min(u16::MAX as usize) as u16;
            self.put_tag(RecordType::FramePop)?;
            self.put_u64(tid.0)?;
            self.sink.write(&count.to_ne_bytes())?;
            remaining -= count as usize;
        }
        for id in pushes {
            self.put_tag(RecordType::FramePush)?;
            self.put_u64(tid.0)?;
            self.put_u32(id.0)?;
        }
        Ok(())
    }

    fn write_header(&mut self, header: &HeaderRecord) -> std::io::Result<()> {
        self.sink.write(&header.magic)?;
        self.sink.write(&header.version.to_ne_bytes())?;
        self.sink.write(&[u8::from(header.native_traces)])?;
        self.put_u64(header.stats.n_allocations)?;
        self.put_u64(header.stats.n_frames)?;
        self.put_u64(header.stats.start_time_ms)?;
        self.put_u64(header.stats.end_time_ms)?;
        self.put_str(&header.command_line)?;
        self.put_u32(header.pid)?;
        Ok(())
    }

    fn put_tag(&mut self, ty: RecordType) -> std::io::Result<()> {
        self.sink.write(&[ty as u8])
    }

    fn put_u64(&mut self, v: u64) -> std::io::Result<()> {
        self.sink.write(&v.to_ne_bytes())
    }

    fn put_u32(&mut self, v: u32) -> std::io::Result<()> {
        self.sink.write(&v.to_ne_bytes())
    }

    fn put_i32(&mut self, v: i32) -> std::io::Result<()> {
        self.sink.write(&v.to_ne_bytes())
    }

    fn put_str(&mut self, s: &str) -> std::io::Result<()> {
        self.sink.write(s.as_bytes())?;
        self.sink.write(&[0])
    }
}
