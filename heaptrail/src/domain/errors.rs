//! Structured error types for heaptrail
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::{FrameId, ThreadId};
use thiserror::Error;

/// Errors produced while decoding or encoding a capture stream.
///
/// Format errors are fatal: the decode loop terminates and the error is
/// surfaced to the caller. Truncation and graceful end-of-stream are *not*
/// errors; they end iteration without a value.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("the input does not look like a heaptrail capture (bad magic)")]
    BadMagic,

    #[error("capture format version {found} is incompatible with this build (expected {expected})")]
    VersionMismatch { expected: u16, found: u16 },

    #[error("truncated stream header")]
    TruncatedHeader,

    #[error("unknown record type {0:#04x}")]
    UnknownRecordType(u8),

    #[error("expected a SEGMENT record inside a segment run, found {0:#04x}")]
    UnexpectedSegmentRecord(u8),

    #[error("unknown allocator tag {0}")]
    UnknownAllocator(u8),

    #[error("two frame records with the same id ({0})")]
    DuplicateFrameId(FrameId),

    #[error("frame record uses id {0}, which is reserved for allocation frames")]
    ReservedFrameId(FrameId),

    #[error("frame pop past an empty stack for {0}")]
    PopEmptyStack(ThreadId),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised when installing a capture on the running process.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("another capture is already active in this process")]
    AlreadyActive,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_mismatch_display() {
        let err = RecordError::VersionMismatch { expected: 1, found: 3 };
        assert_eq!(
            err.to_string(),
            "capture format version 3 is incompatible with this build (expected 1)"
        );
    }

    #[test]
    fn test_pop_empty_stack_display() {
        let err = RecordError::PopEmptyStack(ThreadId(9));
        assert!(err.to_string().contains("TID:9"));
    }

    #[test]
    fn test_io_error_is_transparent() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = RecordError::from(io);
        assert_eq!(err.to_string(), "gone");
    }
}
