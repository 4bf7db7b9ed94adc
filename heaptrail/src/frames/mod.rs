//! Frame interning and the stack tree
//!
//! Streaming a full call stack with every allocation would dwarf the
//! allocations themselves. Instead, every distinct frame is interned to a
//! dense [`FrameId`] once, and every distinct call stack is a path in a
//! single append-only tree of `(frame_id, parent)` nodes. An allocation then
//! carries just the index of its top tree node.

use crate::domain::FrameId;
use crate::records::Frame;
use std::collections::HashMap;

/// Injective `Frame → FrameId` interner.
///
/// Identical frames always receive the same id and distinct frames never
/// share one. The first id handed out is configurable so the decoder can
/// partition its allocation-frame ids away from wire-assigned ids.
pub struct FrameInterner {
    ids: HashMap<Frame, FrameId>,
    next: u32,
}

impl FrameInterner {
    /// Interner whose first id is 1 (0 stays the root sentinel).
    #[must_use]
    pub fn new() -> FrameInterner {
        FrameInterner::with_first_id(1)
    }

    #[must_use]
    pub fn with_first_id(first: u32) -> FrameInterner {
        FrameInterner { ids: HashMap::new(), next: first }
    }

    /// Intern `frame`, returning its id and whether it was newly inserted.
    pub fn intern(&mut self, frame: &Frame) -> (FrameId, bool) {
        if let Some(&id) = self.ids.get(frame) {
            return (id, false);
        }
        let id = FrameId(self.next);
        self.next += 1;
        self.ids.insert(frame.clone(), id);
        (id, true)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Default for FrameInterner {
    fn default() -> FrameInterner {
        FrameInterner::new()
    }
}

/// One node of the stack tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackTreeNode {
    pub frame_id: FrameId,
    pub parent_index: u32,
}

/// Append-only arena of every distinct call stack observed.
///
/// Node 0 is the root sentinel. Nodes are immortal: popping a thread's stack
/// only retreats that thread's cursor, the tree itself never shrinks, so a
/// stored tree index stays valid for the lifetime of the decode.
pub struct StackTree {
    nodes: Vec<StackTreeNode>,
    children: HashMap<(u32, FrameId), u32>,
}

impl StackTree {
    #[must_use]
    pub fn new() -> StackTree {
        StackTree {
            nodes: vec![StackTreeNode { frame_id: FrameId::ROOT, parent_index: 0 }],
            children: HashMap::new(),
        }
    }

    /// Index of the child of `parent` carrying `frame_id`, growing the tree
    /// if that child does not exist yet. The first-inserted child wins;
    /// later lookups return it.
    pub fn descend(&mut self, parent: u32, frame_id: FrameId) -> u32 {
        if let Some(&child) = self.children.get(&(parent, frame_id)) {
            return child;
        }
        let child = self.nodes.len() as u32;
        self.nodes.push(StackTreeNode { frame_id, parent_index: parent });
        self.children.insert((parent, frame_id), child);
        child
    }

    /// Index of the tree node terminating `path` (root to top), growing the
    /// tree as needed. The empty path maps to the root sentinel 0.
    pub fn trace_index(&mut self, path: &[FrameId]) -> u32 {
        path.iter().fold(0, |parent, &frame_id| self.descend(parent, frame_id))
    }

    /// Walk one step toward the root.
    #[must_use]
    pub fn next_node(&self, index: u32) -> StackTreeNode {
        self.nodes[index as usize]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when only the root sentinel exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }
}

impl Default for StackTree {
    fn default() -> StackTree {
        StackTree::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(name: &str) -> Frame {
        Frame {
            function_name: name.to_string(),
            filename: "app.py".to_string(),
            parent_lineno: 1,
            lineno: 0,
        }
    }

    #[test]
    fn test_interner_is_injective() {
        let mut interner = FrameInterner::new();
        let (a1, new_a) = interner.intern(&frame("a"));
        let (b, new_b) = interner.intern(&frame("b"));
        let (a2, again) = interner.intern(&frame("a"));

        assert!(new_a && new_b);
        assert!(!again);
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn test_interner_distinguishes_lineno() {
        let mut interner = FrameInterner::new();
        let canonical = frame("f");
        let specialized = Frame { lineno: 12, ..canonical.clone() };
        let (id1, _) = interner.intern(&canonical);
        let (id2, _) = interner.intern(&specialized);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_interner_first_id_partition() {
        let mut interner = FrameInterner::with_first_id(FrameId::ALLOCATION_BASE);
        let (id, _) = interner.intern(&frame("f"));
        assert!(id.is_allocation_frame());
    }

    #[test]
    fn test_empty_path_is_root() {
        let mut tree = StackTree::new();
        assert_eq!(tree.trace_index(&[]), 0);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_trace_index_is_deterministic() {
        // Two identical paths yield the same index regardless of what was
        // inserted in between.
        let mut tree = StackTree::new();
        let path = [FrameId(1), FrameId(2), FrameId(3)];
        let first = tree.trace_index(&path);
        tree.trace_index(&[FrameId(9), FrameId(2)]);
        tree.trace_index(&[FrameId(1), FrameId(7)]);
        let second = tree.trace_index(&path);
        assert_eq!(first, second);
    }

    #[test]
    fn test_shared_prefixes_share_nodes() {
        let mut tree = StackTree::new();
        let ab = tree.trace_index(&[FrameId(1), FrameId(2)]);
        let ac = tree.trace_index(&[FrameId(1), FrameId(3)]);
        assert_ne!(ab, ac);
        // Both second-level nodes hang off the same parent.
        assert_eq!(tree.next_node(ab).parent_index, tree.next_node(ac).parent_index);
        // a, b, c plus the root sentinel.
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_walk_toward_root() {
        let mut tree = StackTree::new();
        let top = tree.trace_index(&[FrameId(5), FrameId(6)]);
        let node = tree.next_node(top);
        assert_eq!(node.frame_id, FrameId(6));
        let parent = tree.next_node(node.parent_index);
        assert_eq!(parent.frame_id, FrameId(5));
        assert_eq!(parent.parent_index, 0);
    }
}
