//! End-to-end decode tests over capture files: writer/reader round trips,
//! hand-crafted streams for the wire-level corner cases, and the header
//! validation rules.

use heaptrail::domain::{RecordError, ThreadId};
use heaptrail::io::{FileSink, FileSource};
use heaptrail::reader::RecordReader;
use heaptrail::records::{AllocatorKind, Frame, StreamStats, CURRENT_VERSION, MAGIC};
use heaptrail::writer::{AllocationEvent, RecordWriter};
use std::io::Write;
use tempfile::NamedTempFile;

/// Hand-assembled capture stream for byte-level control over the input.
struct RawStream {
    bytes: Vec<u8>,
}

impl RawStream {
    fn new() -> RawStream {
        RawStream::with_header(CURRENT_VERSION, "python app.py")
    }

    fn with_header(version: u16, command_line: &str) -> RawStream {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&version.to_ne_bytes());
        bytes.push(0); // native_traces = false
        for word in [0u64; 4] {
            bytes.extend_from_slice(&word.to_ne_bytes());
        }
        bytes.extend_from_slice(command_line.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&4242u32.to_ne_bytes());
        RawStream { bytes }
    }

    fn frame_index(mut self, id: u32, function: &str, filename: &str, parent_lineno: i32) -> Self {
        self.bytes.push(b'I');
        self.bytes.extend_from_slice(&id.to_ne_bytes());
        self.bytes.extend_from_slice(function.as_bytes());
        self.bytes.push(0);
        self.bytes.extend_from_slice(filename.as_bytes());
        self.bytes.push(0);
        self.bytes.extend_from_slice(&parent_lineno.to_ne_bytes());
        self
    }

    fn frame_push(mut self, tid: u64, id: u32) -> Self {
        self.bytes.push(b'P');
        self.bytes.extend_from_slice(&tid.to_ne_bytes());
        self.bytes.extend_from_slice(&id.to_ne_bytes());
        self
    }

    fn frame_pop(mut self, tid: u64, count: u16) -> Self {
        self.bytes.push(b'O');
        self.bytes.extend_from_slice(&tid.to_ne_bytes());
        self.bytes.extend_from_slice(&count.to_ne_bytes());
        self
    }

    fn allocation(mut self, tid: u64, address: u64, size: u64, py_lineno: i32) -> Self {
        self.bytes.push(b'A');
        self.bytes.extend_from_slice(&tid.to_ne_bytes());
        self.bytes.extend_from_slice(&address.to_ne_bytes());
        self.bytes.extend_from_slice(&size.to_ne_bytes());
        self.bytes.push(AllocatorKind::Malloc as u8);
        self.bytes.extend_from_slice(&py_lineno.to_ne_bytes());
        self.bytes.extend_from_slice(&0u32.to_ne_bytes());
        self
    }

    fn thread_record(mut self, tid: u64, name: &str) -> Self {
        self.bytes.push(b'T');
        self.bytes.extend_from_slice(&tid.to_ne_bytes());
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self
    }

    fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }
}

fn open_stream(bytes: &[u8]) -> (NamedTempFile, Result<RecordReader, RecordError>) {
    let mut tmp = NamedTempFile::new().unwrap();
    tmp.write_all(bytes).unwrap();
    tmp.flush().unwrap();
    let source = FileSource::open(tmp.path()).unwrap();
    (tmp, RecordReader::open(Box::new(source)))
}

fn reader_for(stream: RawStream) -> (NamedTempFile, RecordReader) {
    let (tmp, reader) = open_stream(&stream.bytes);
    (tmp, reader.expect("stream header should be valid"))
}

#[test]
fn test_minimal_trace() {
    let stream = RawStream::new()
        .frame_index(1, "f", "a.py", 10)
        .frame_push(7, 1)
        .allocation(7, 0x100, 64, 12)
        .frame_pop(7, 1);
    let (_tmp, mut reader) = reader_for(stream);
    let context = reader.context();

    let allocation = reader.next_allocation().unwrap().expect("one allocation");
    assert_eq!(allocation.record.tid, ThreadId(7));
    assert_eq!(allocation.record.address, 0x100);
    assert_eq!(allocation.record.size, 64);
    assert_eq!(allocation.record.allocator, AllocatorKind::Malloc);
    assert_eq!(allocation.record.py_lineno, 12);
    assert_ne!(allocation.frame_index, 0);

    let trace = context.stack_trace(allocation.frame_index, 10);
    assert_eq!(trace.len(), 1);
    assert_eq!(trace[0].function_name, "f");
    assert_eq!(trace[0].filename, "a.py");
    assert_eq!(trace[0].lineno, 12);

    // The trailing FRAME_POP is consumed, then the stream ends cleanly.
    assert!(reader.next_allocation().unwrap().is_none());
}

#[test]
fn test_allocation_frame_specialization() {
    let stream = RawStream::new()
        .frame_index(1, "f", "a.py", 10)
        .frame_push(7, 1)
        .allocation(7, 0x100, 64, 12)
        .allocation(7, 0x200, 32, 15)
        .frame_pop(7, 1);
    let (_tmp, mut reader) = reader_for(stream);
    let context = reader.context();

    let first = reader.next_allocation().unwrap().unwrap();
    let second = reader.next_allocation().unwrap().unwrap();

    // Same function, different allocation lines: distinct tree indices.
    assert_ne!(first.frame_index, second.frame_index);

    let trace1 = context.stack_trace(first.frame_index, 10);
    let trace2 = context.stack_trace(second.frame_index, 10);
    assert_eq!(trace1[0].function_name, trace2[0].function_name);
    assert_eq!(trace1[0].filename, trace2[0].filename);
    assert_eq!(trace1[0].lineno, 12);
    assert_eq!(trace2[0].lineno, 15);
}

#[test]
fn test_caller_reports_call_site_line() {
    // f (called at line 3 of <module>) calls g at line 10; g allocates at 21.
    let stream = RawStream::new()
        .frame_index(1, "f", "a.py", 3)
        .frame_index(2, "g", "a.py", 10)
        .frame_push(7, 1)
        .frame_push(7, 2)
        .allocation(7, 0x100, 64, 21);
    let (_tmp, mut reader) = reader_for(stream);
    let context = reader.context();

    let allocation = reader.next_allocation().unwrap().unwrap();
    let trace = context.stack_trace(allocation.frame_index, 10);
    assert_eq!(trace.len(), 2);
    assert_eq!((trace[0].function_name.as_str(), trace[0].lineno), ("g", 21));
    assert_eq!((trace[1].function_name.as_str(), trace[1].lineno), ("f", 10));
}

#[test]
fn test_topmost_canonical_frame_reports_sentinel_line() {
    // py_lineno 0: no specialization, the top frame has no line of its own.
    let stream = RawStream::new()
        .frame_index(1, "f", "a.py", 10)
        .frame_push(7, 1)
        .allocation(7, 0x100, 64, 0);
    let (_tmp, mut reader) = reader_for(stream);
    let context = reader.context();

    let allocation = reader.next_allocation().unwrap().unwrap();
    let trace = context.stack_trace(allocation.frame_index, 10);
    assert_eq!(trace[0].lineno, -1);
}

#[test]
fn test_writer_reader_round_trip() {
    let tmp = NamedTempFile::new().unwrap();
    let sink = FileSink::create(tmp.path()).unwrap();
    let stats = StreamStats {
        n_allocations: 3,
        n_frames: 2,
        start_time_ms: 1_000,
        end_time_ms: 2_000,
    };
    let mut writer =
        RecordWriter::new(sink, true, stats, "python -m app".to_string(), 1234).unwrap();

    let tid = ThreadId(7);
    let frame = |name: &str, parent_lineno| Frame {
        function_name: name.to_string(),
        filename: "app.py".to_string(),
        parent_lineno,
        lineno: 0,
    };
    writer.enter_frame(tid, frame("main", 0));
    writer.enter_frame(tid, frame("work", 40));
    let events = [
        AllocationEvent {
            tid,
            address: 0x1000,
            size: 128,
            allocator: AllocatorKind::Malloc,
            py_lineno: 41,
            native_frame_id: 0,
        },
        AllocationEvent {
            tid,
            address: 0x2000,
            size: 256,
            allocator: AllocatorKind::Calloc,
            py_lineno: 42,
            native_frame_id: 0,
        },
        AllocationEvent {
            tid,
            address: 0x1000,
            size: 0,
            allocator: AllocatorKind::Free,
            py_lineno: 43,
            native_frame_id: 0,
        },
    ];
    for event in &events {
        writer.record_allocation(event).unwrap();
    }
    writer.close().unwrap();

    let source = FileSource::open(tmp.path()).unwrap();
    let mut reader = RecordReader::open(Box::new(source)).unwrap();

    let header = reader.header().clone();
    assert_eq!(header.version, CURRENT_VERSION);
    assert!(header.native_traces);
    assert_eq!(header.stats, stats);
    assert_eq!(header.command_line, "python -m app");
    assert_eq!(header.pid, 1234);

    // Allocations emerge in order with identical field values.
    let decoded = reader.read_all().unwrap();
    assert_eq!(decoded.len(), events.len());
    for (event, allocation) in events.iter().zip(&decoded) {
        assert_eq!(allocation.record.tid, event.tid);
        assert_eq!(allocation.record.address, event.address);
        assert_eq!(allocation.record.size, event.size);
        assert_eq!(allocation.record.allocator, event.allocator);
        assert_eq!(allocation.record.py_lineno, event.py_lineno);
        assert_eq!(allocation.record.native_frame_id, event.native_frame_id);
    }

    // Both allocations happened under main -> work.
    let context = reader.context();
    let trace = context.stack_trace(decoded[0].frame_index, 10);
    assert_eq!(trace.len(), 2);
    assert_eq!(trace[0].function_name, "work");
    assert_eq!(trace[1].function_name, "main");
}

#[test]
fn test_decoded_stack_depth_tracks_pushes_and_pops() {
    // 3 pushes minus 1 pop leaves a depth-2 stack.
    let stream = RawStream::new()
        .frame_index(1, "a", "x.py", 1)
        .frame_index(2, "b", "x.py", 2)
        .frame_index(3, "c", "x.py", 3)
        .frame_push(7, 1)
        .frame_push(7, 2)
        .frame_push(7, 3)
        .frame_pop(7, 1)
        .allocation(7, 0x100, 8, 0);
    let (_tmp, mut reader) = reader_for(stream);
    let context = reader.context();

    let allocation = reader.next_allocation().unwrap().unwrap();
    let trace = context.stack_trace(allocation.frame_index, 10);
    assert_eq!(trace.len(), 2);
    assert_eq!(trace[0].function_name, "b");
    assert_eq!(trace[1].function_name, "a");
}

#[test]
fn test_empty_command_line() {
    let stream = RawStream::with_header(CURRENT_VERSION, "").allocation(1, 0x10, 1, 0);
    let (_tmp, reader) = open_stream(&stream.bytes);
    let mut reader = reader.unwrap();
    assert_eq!(reader.header().command_line, "");
    assert_eq!(reader.header().pid, 4242);
    assert!(reader.next_allocation().unwrap().is_some());
}

#[test]
fn test_version_mismatch_fails_before_any_record() {
    let stream = RawStream::with_header(CURRENT_VERSION + 1, "app").allocation(1, 0x10, 1, 0);
    let (_tmp, result) = open_stream(&stream.bytes);
    match result {
        Err(RecordError::VersionMismatch { expected, found }) => {
            assert_eq!(expected, CURRENT_VERSION);
            assert_eq!(found, CURRENT_VERSION + 1);
        }
        other => panic!("expected version mismatch, got {other:?}"),
    }
}

#[test]
fn test_bad_magic() {
    let (_tmp, result) = open_stream(b"notmine\0rest-of-the-file");
    assert!(matches!(result, Err(RecordError::BadMagic)));
}

#[test]
fn test_truncated_header() {
    let (_tmp, result) = open_stream(&RawStream::new().bytes[..12]);
    assert!(matches!(result, Err(RecordError::TruncatedHeader)));
}

#[test]
fn test_eof_at_tag_boundary_is_clean() {
    let (_tmp, mut reader) = reader_for(RawStream::new());
    assert!(reader.next_allocation().unwrap().is_none());
    // The source is merely exhausted, not closed.
    assert!(reader.is_open());
}

#[test]
fn test_truncation_mid_payload_ends_iteration() {
    // A tag byte plus half an allocation payload.
    let stream = RawStream::new().raw(b"A\x01\x02\x03");
    let (_tmp, mut reader) = reader_for(stream);
    assert!(reader.next_allocation().unwrap().is_none());
}

#[test]
fn test_unknown_tag_is_fatal() {
    let stream = RawStream::new().raw(b"Z");
    let (_tmp, mut reader) = reader_for(stream);
    assert!(matches!(
        reader.next_allocation(),
        Err(RecordError::UnknownRecordType(b'Z'))
    ));
}

#[test]
fn test_unknown_allocator_is_fatal() {
    let mut stream = RawStream::new();
    stream.bytes.push(b'A');
    stream.bytes.extend_from_slice(&7u64.to_ne_bytes());
    stream.bytes.extend_from_slice(&0x100u64.to_ne_bytes());
    stream.bytes.extend_from_slice(&64u64.to_ne_bytes());
    stream.bytes.push(99); // no such allocator
    stream.bytes.extend_from_slice(&0i32.to_ne_bytes());
    stream.bytes.extend_from_slice(&0u32.to_ne_bytes());
    let (_tmp, mut reader) = reader_for(stream);
    assert!(matches!(
        reader.next_allocation(),
        Err(RecordError::UnknownAllocator(99))
    ));
}

#[test]
fn test_pop_past_empty_stack_is_fatal() {
    let stream = RawStream::new()
        .frame_index(1, "f", "a.py", 1)
        .frame_push(7, 1)
        .frame_pop(7, 2);
    let (_tmp, mut reader) = reader_for(stream);
    assert!(matches!(
        reader.next_allocation(),
        Err(RecordError::PopEmptyStack(ThreadId(7)))
    ));
}

#[test]
fn test_pop_count_zero_is_noop() {
    let stream = RawStream::new().frame_pop(7, 0).allocation(7, 0x10, 1, 0);
    let (_tmp, mut reader) = reader_for(stream);
    let allocation = reader.next_allocation().unwrap().unwrap();
    assert_eq!(allocation.frame_index, 0);
}

#[test]
fn test_duplicate_frame_index_is_fatal() {
    let stream = RawStream::new()
        .frame_index(1, "f", "a.py", 1)
        .frame_index(1, "g", "b.py", 2);
    let (_tmp, mut reader) = reader_for(stream);
    assert!(matches!(
        reader.next_allocation(),
        Err(RecordError::DuplicateFrameId(_))
    ));
}

#[test]
fn test_allocation_with_no_frames_gets_root_index() {
    let stream = RawStream::new().allocation(9, 0x100, 64, 5);
    let (_tmp, mut reader) = reader_for(stream);
    let allocation = reader.next_allocation().unwrap().unwrap();
    assert_eq!(allocation.frame_index, 0);
    assert!(reader.context().stack_trace(0, 10).is_empty());
}

#[test]
fn test_thread_record_last_wins() {
    let stream = RawStream::new()
        .thread_record(7, "worker")
        .thread_record(7, "worker-renamed")
        .allocation(7, 0x10, 1, 0);
    let (_tmp, mut reader) = reader_for(stream);
    let context = reader.context();
    reader.next_allocation().unwrap().unwrap();
    assert_eq!(context.thread_name(ThreadId(7)), "worker-renamed");
    assert_eq!(context.thread_name(ThreadId(8)), "");
}
