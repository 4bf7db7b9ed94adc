//! Capture stream record types and binary layout
//!
//! A capture stream is a header followed by a flat sequence of records. Each
//! record is one type-tag byte and a type-specific payload. Fixed-width
//! numeric fields travel in host byte order (the stream lives for one process
//! or is read by a same-architecture peer; there is no cross-endian promise),
//! and strings are NUL-terminated.
//!
//! ```text
//! ┌────────┬─────────┬─────────┬─────────┬──────┐
//! │ HEADER │ record  │ record  │ record  │ ...  │
//! └────────┴─────────┴─────────┴─────────┴──────┘
//!            ▲ 1 tag byte + payload each
//! ```

use crate::domain::ThreadId;

/// Literal magic bytes opening every capture stream: 7 ASCII bytes + NUL.
pub const MAGIC: [u8; 8] = *b"heaptrl\0";

/// Stream format version. Readers hard-fail on any mismatch.
pub const CURRENT_VERSION: u16 = 1;

/// Record type tags. The tag values are the ASCII mnemonics so a raw capture
/// stays greppable in a hex dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Allocation = b'A',
    FramePush = b'P',
    FramePop = b'O',
    FrameIndex = b'I',
    NativeTraceIndex = b'N',
    MemoryMapStart = b'M',
    SegmentHeader = b'H',
    Segment = b'S',
    ThreadRecord = b'T',
}

impl RecordType {
    #[must_use]
    pub fn from_u8(tag: u8) -> Option<RecordType> {
        match tag {
            b'A' => Some(RecordType::Allocation),
            b'P' => Some(RecordType::FramePush),
            b'O' => Some(RecordType::FramePop),
            b'I' => Some(RecordType::FrameIndex),
            b'N' => Some(RecordType::NativeTraceIndex),
            b'M' => Some(RecordType::MemoryMapStart),
            b'H' => Some(RecordType::SegmentHeader),
            b'S' => Some(RecordType::Segment),
            b'T' => Some(RecordType::ThreadRecord),
            _ => None,
        }
    }

    /// Name used by the raw-dump report.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            RecordType::Allocation => "ALLOCATION",
            RecordType::FramePush => "FRAME_PUSH",
            RecordType::FramePop => "FRAME_POP",
            RecordType::FrameIndex => "FRAME_ID",
            RecordType::NativeTraceIndex => "NATIVE_FRAME_ID",
            RecordType::MemoryMapStart => "MEMORY_MAP_START",
            RecordType::SegmentHeader => "SEGMENT_HEADER",
            RecordType::Segment => "SEGMENT",
            RecordType::ThreadRecord => "THREAD",
        }
    }
}

/// Allocator entry points the capture hooks intercept.
///
/// `Free` and `Munmap` release memory; every other kind acquires it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AllocatorKind {
    Malloc = 1,
    Free = 2,
    Calloc = 3,
    Realloc = 4,
    PosixMemalign = 5,
    Memalign = 6,
    Valloc = 7,
    Pvalloc = 8,
    Mmap = 9,
    Munmap = 10,
}

impl AllocatorKind {
    #[must_use]
    pub fn from_u8(tag: u8) -> Option<AllocatorKind> {
        match tag {
            1 => Some(AllocatorKind::Malloc),
            2 => Some(AllocatorKind::Free),
            3 => Some(AllocatorKind::Calloc),
            4 => Some(AllocatorKind::Realloc),
            5 => Some(AllocatorKind::PosixMemalign),
            6 => Some(AllocatorKind::Memalign),
            7 => Some(AllocatorKind::Valloc),
            8 => Some(AllocatorKind::Pvalloc),
            9 => Some(AllocatorKind::Mmap),
            10 => Some(AllocatorKind::Munmap),
            _ => None,
        }
    }

    /// Printable allocator name, as reported by the raw dump and summaries.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            AllocatorKind::Malloc => "malloc",
            AllocatorKind::Free => "free",
            AllocatorKind::Calloc => "calloc",
            AllocatorKind::Realloc => "realloc",
            AllocatorKind::PosixMemalign => "posix_memalign",
            AllocatorKind::Memalign => "memalign",
            AllocatorKind::Valloc => "valloc",
            AllocatorKind::Pvalloc => "pvalloc",
            AllocatorKind::Mmap => "mmap",
            AllocatorKind::Munmap => "munmap",
        }
    }

    /// True for kinds that release memory rather than acquire it.
    #[must_use]
    pub fn is_deallocation(self) -> bool {
        matches!(self, AllocatorKind::Free | AllocatorKind::Munmap)
    }
}

/// Fixed-width payload of an ALLOCATION record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub tid: ThreadId,
    pub address: u64,
    pub size: u64,
    pub allocator: AllocatorKind,
    /// Interpreter source line of the allocation site; 0 when the allocation
    /// happened outside any interpreter frame.
    pub py_lineno: i32,
    /// 1-based reference into the native-frame list; 0 means no native stack.
    pub native_frame_id: u32,
}

/// One interned interpreter frame.
///
/// `parent_lineno` is the line in the *caller* at which this function was
/// invoked. `lineno` is 0 for the canonical frame of a function; an
/// allocation frame is a clone with `lineno` set to the allocation site line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    pub function_name: String,
    pub filename: String,
    pub parent_lineno: i32,
    pub lineno: i32,
}

/// One entry of the native-frame linked list. `parent_index` is a 1-based
/// reference into the same list; 0 terminates the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnresolvedNativeFrame {
    pub ip: u64,
    pub parent_index: u32,
}

/// One loadable segment of a shared object, relative to its base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub memsz: u64,
}

/// Aggregate counters stamped into the stream header at capture start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub n_allocations: u64,
    pub n_frames: u64,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
}

/// Stream header, written once at stream start and read once at open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub magic: [u8; 8],
    pub version: u16,
    pub native_traces: bool,
    pub stats: StreamStats,
    pub command_line: String,
    pub pid: u32,
}

impl HeaderRecord {
    /// Magic rendered as text with the trailing NUL stripped, for reports.
    #[must_use]
    pub fn magic_str(&self) -> String {
        String::from_utf8_lossy(&self.magic)
            .trim_end_matches('\0')
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_round_trip() {
        for tag in [b'A', b'P', b'O', b'I', b'N', b'M', b'H', b'S', b'T'] {
            let ty = RecordType::from_u8(tag).unwrap();
            assert_eq!(ty as u8, tag);
        }
        assert_eq!(RecordType::from_u8(b'Z'), None);
        assert_eq!(RecordType::from_u8(0), None);
    }

    #[test]
    fn test_allocator_round_trip() {
        for tag in 1..=10 {
            let kind = AllocatorKind::from_u8(tag).unwrap();
            assert_eq!(kind as u8, tag);
        }
        assert_eq!(AllocatorKind::from_u8(0), None);
        assert_eq!(AllocatorKind::from_u8(11), None);
    }

    #[test]
    fn test_deallocation_kinds() {
        assert!(AllocatorKind::Free.is_deallocation());
        assert!(AllocatorKind::Munmap.is_deallocation());
        assert!(!AllocatorKind::Malloc.is_deallocation());
        assert!(!AllocatorKind::Mmap.is_deallocation());
        assert!(!AllocatorKind::Realloc.is_deallocation());
    }

    #[test]
    fn test_magic_str_strips_nul() {
        let header = HeaderRecord {
            magic: MAGIC,
            version: CURRENT_VERSION,
            native_traces: false,
            stats: StreamStats::default(),
            command_line: String::new(),
            pid: 0,
        };
        assert_eq!(header.magic_str(), "heaptrl");
    }
}
