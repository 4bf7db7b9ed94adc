//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a thread id where
//! a frame id is expected, and make function signatures more expressive.

use std::fmt;

/// OS thread ID of the traced process
///
/// Thread ids are assigned by the kernel of the traced process and are only
/// meaningful within one capture stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Interned interpreter frame ID
///
/// `FrameId(0)` is the reserved sentinel meaning "no frame / stack root".
/// Ids below [`FrameId::ALLOCATION_BASE`] are assigned by the writer and
/// travel on the wire in FRAME_INDEX records; ids at or above it are minted
/// locally by the decoder for allocation-specialized frames, so the two
/// populations can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl FrameId {
    /// Sentinel: no frame / root of the stack tree.
    pub const ROOT: FrameId = FrameId(0);

    /// First id of the decoder-local allocation-frame partition.
    pub const ALLOCATION_BASE: u32 = 1 << 31;

    /// Returns true for ids in the decoder-local allocation-frame partition.
    #[must_use]
    pub fn is_allocation_frame(self) -> bool {
        self.0 >= Self::ALLOCATION_BASE
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

/// Symbol resolver generation
///
/// Bumped every time the traced process rotates its memory map. A native
/// frame resolves only against the generation that was current when its
/// allocation was recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

impl Generation {
    #[must_use]
    pub fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}
