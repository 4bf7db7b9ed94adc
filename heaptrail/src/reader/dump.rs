//! Raw record dump in a fixed text format
//!
//! One line for the header, then one line per record with the tag name and
//! every decoded field. The dump decodes fields without interpreting them
//! (it never touches the frame map or the resolver), so it stays usable on
//! streams whose semantics are under investigation. Unknown content ends the
//! dump with a note instead of an error.

use super::{read_i32, read_u16, read_u32, read_u64, read_u8, RecordReader};
use crate::records::{AllocatorKind, RecordType};
use std::io::Write;

impl RecordReader {
    /// Write the header line and every remaining record of the stream to
    /// `out`. Each record line leads with [`RecordType::name`].
    ///
    /// # Errors
    /// Returns an error only when writing to `out` fails; a truncated or
    /// malformed stream simply ends the dump.
    pub fn dump_all_records<W: Write>(&mut self, out: &mut W) -> std::io::Result<()> {
        let header = &self.header;
        writeln!(
            out,
            "HEADER magic={} version={} native_traces={} n_allocations={} n_frames={} \
             start_time={} end_time={} pid={} command_line={}",
            header.magic_str(),
            header.version,
            header.native_traces,
            header.stats.n_allocations,
            header.stats.n_frames,
            header.stats.start_time_ms,
            header.stats.end_time_ms,
            header.pid,
            header.command_line,
        )?;

        loop {
            let source = self.source.as_mut();
            let Some(tag) = read_u8(source) else {
                return Ok(());
            };
            let Some(record_type) = RecordType::from_u8(tag) else {
                writeln!(out, "UNKNOWN RECORD TYPE {tag}")?;
                return Ok(());
            };
            let name = record_type.name();

            match record_type {
                RecordType::Allocation => {
                    let (Some(tid), Some(address), Some(size), Some(allocator), Some(py_lineno), Some(native_frame_id)) = (
                        read_u64(source),
                        read_u64(source),
                        read_u64(source),
                        read_u8(source),
                        read_i32(source),
                        read_u32(source),
                    ) else {
                        return Ok(());
                    };
                    let allocator = AllocatorKind::from_u8(allocator).map_or_else(
                        || format!("<unknown allocator {allocator}>"),
                        |kind| kind.name().to_string(),
                    );
                    writeln!(
                        out,
                        "{name} tid={tid} address={address:#x} size={size} \
                         allocator={allocator} py_lineno={py_lineno} \
                         native_frame_id={native_frame_id}"
                    )?;
                }
                RecordType::FramePush => {
                    let (Some(tid), Some(frame_id)) = (read_u64(source), read_u32(source)) else {
                        return Ok(());
                    };
                    writeln!(out, "{name} tid={tid} frame_id={frame_id}")?;
                }
                RecordType::FramePop => {
                    let (Some(tid), Some(count)) = (read_u64(source), read_u16(source)) else {
                        return Ok(());
                    };
                    writeln!(out, "{name} tid={tid} count={count}")?;
                }
                RecordType::FrameIndex => {
                    let Some(frame_id) = read_u32(source) else { return Ok(()) };
                    let Some(function_name) = source.getline(0) else { return Ok(()) };
                    let Some(filename) = source.getline(0) else { return Ok(()) };
                    let Some(parent_lineno) = read_i32(source) else { return Ok(()) };
                    writeln!(
                        out,
                        "{name} frame_id={frame_id} function_name={function_name} \
                         filename={filename} parent_lineno={parent_lineno}"
                    )?;
                }
                RecordType::NativeTraceIndex => {
                    let (Some(ip), Some(index)) = (read_u64(source), read_u32(source)) else {
                        return Ok(());
                    };
                    writeln!(out, "{name} ip={ip:#x} index={index}")?;
                }
                RecordType::MemoryMapStart => {
                    writeln!(out, "{name}")?;
                }
                RecordType::SegmentHeader => {
                    let Some(filename) = source.getline(0) else { return Ok(()) };
                    let (Some(num_segments), Some(addr)) = (read_u32(source), read_u64(source))
                    else {
                        return Ok(());
                    };
                    writeln!(
                        out,
                        "{name} filename={filename} num_segments={num_segments} addr={addr:#x}"
                    )?;
                }
                RecordType::Segment => {
                    let (Some(vaddr), Some(memsz)) = (read_u64(source), read_u64(source)) else {
                        return Ok(());
                    };
                    writeln!(out, "{name} {vaddr:#x} {memsz}")?;
                }
                RecordType::ThreadRecord => {
                    let Some(tid) = read_u64(source) else { return Ok(()) };
                    let Some(thread_name) = source.getline(0) else { return Ok(()) };
                    writeln!(out, "{name} {tid} {thread_name}")?;
                }
            }
        }
    }
}
