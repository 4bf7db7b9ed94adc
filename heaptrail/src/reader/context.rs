//! Lazy trace rendering over shared decoder state
//!
//! A [`TraceContext`] is a cheap, cloneable handle onto the decoder's maps.
//! Materialized allocations carry only a stack-tree index and a generation;
//! turning those into human-readable traces happens on demand here, under
//! the same coarse mutex the decoding thread uses for its state updates.

use super::TraceState;
use crate::domain::{Generation, ThreadId};
use crate::symbolization::ResolvedFrame;
use std::sync::{Arc, Mutex, MutexGuard};

/// One rendered interpreter stack frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function_name: String,
    pub filename: String,
    pub lineno: i32,
}

/// Shared, reference-counted view of the decoder state for trace queries.
#[derive(Clone)]
pub struct TraceContext {
    state: Arc<Mutex<TraceState>>,
}

impl TraceContext {
    pub(crate) fn new(state: Arc<Mutex<TraceState>>) -> TraceContext {
        TraceContext { state }
    }

    fn lock(&self) -> MutexGuard<'_, TraceState> {
        self.state.lock().unwrap()
    }

    /// Render the interpreter stack ending at stack-tree node `index`, top
    /// frame first, up to `max_depth` frames.
    ///
    /// Line-number convention: a frame reports the line currently executing
    /// in it. For an allocation-specialized frame that is its own `lineno`;
    /// for any other frame it is the line at which it invoked its callee
    /// (the callee's `parent_lineno`). A canonical topmost frame has neither
    /// and reports -1.
    #[must_use]
    pub fn stack_trace(&self, index: u32, max_depth: usize) -> Vec<StackFrame> {
        let state = self.lock();
        walk_stack(&state, index, max_depth, |_| true)
    }

    /// Render the native stack ending at native frame `index` (1-based; 0
    /// means no native stack), resolving each instruction pointer against
    /// the memory map of `generation`. Inlined frames are expanded in
    /// place; unresolvable pointers are skipped.
    #[must_use]
    pub fn native_stack_trace(
        &self,
        index: u32,
        generation: Generation,
        max_depth: usize,
    ) -> Vec<ResolvedFrame> {
        let mut state = self.lock();
        let mut out = Vec::new();
        let mut current = index as usize;
        let mut walked = 0;
        while current != 0 && walked < max_depth {
            walked += 1;
            let Some(frame) = state.native_frames.get(current - 1).copied() else {
                break;
            };
            current = frame.parent_index as usize;
            if let Some(resolved) = state.resolver.resolve(frame.ip, generation) {
                out.extend(resolved);
            }
        }
        out
    }

    /// Render a combined native + interpreter stack. Native frames are
    /// walked as in [`native_stack_trace`]; every frame recognized as the
    /// interpreter's eval-loop trampoline is substituted with the next
    /// frame of the pure interpreter stack, and interpreter frames living
    /// in compiled glue rather than source files are dropped from that
    /// substitution queue.
    #[must_use]
    pub fn hybrid_stack_trace(
        &self,
        frame_index: u32,
        native_index: u32,
        generation: Generation,
        max_depth: usize,
    ) -> Vec<StackFrame> {
        self.hybrid_stack_trace_with(
            frame_index,
            native_index,
            generation,
            max_depth,
            is_eval_trampoline,
        )
    }

    fn hybrid_stack_trace_with(
        &self,
        frame_index: u32,
        native_index: u32,
        generation: Generation,
        max_depth: usize,
        is_trampoline: impl Fn(&str) -> bool,
    ) -> Vec<StackFrame> {
        let mut state = self.lock();

        let interpreter =
            walk_stack(&state, frame_index, usize::MAX, |frame| frame.filename.ends_with(".py"));
        let mut interpreter = interpreter.into_iter();

        let mut out = Vec::new();
        let mut current = native_index as usize;
        let mut walked = 0;
        while current != 0 && walked < max_depth {
            walked += 1;
            let Some(frame) = state.native_frames.get(current - 1).copied() else {
                break;
            };
            current = frame.parent_index as usize;
            let Some(resolved) = state.resolver.resolve(frame.ip, generation) else {
                continue;
            };
            for native in resolved {
                if is_trampoline(&native.function) {
                    if let Some(frame) = interpreter.next() {
                        out.push(frame);
                    }
                } else {
                    out.push(StackFrame {
                        function_name: native.function,
                        filename: native.file,
                        lineno: native.lineno,
                    });
                }
            }
        }
        out
    }

    /// Last-recorded name of `tid`, empty when the stream never named it.
    #[must_use]
    pub fn thread_name(&self, tid: ThreadId) -> String {
        self.lock().thread_names.get(&tid).cloned().unwrap_or_default()
    }
}

/// Symbol-name predicate for the interpreter's frame-evaluation trampoline.
/// Platform ports may need to widen this match.
fn is_eval_trampoline(symbol: &str) -> bool {
    symbol.contains("_PyEval_EvalFrameDefault") || symbol.contains("PyEval_EvalFrameEx")
}

fn walk_stack(
    state: &TraceState,
    index: u32,
    max_depth: usize,
    keep: impl Fn(&StackFrame) -> bool,
) -> Vec<StackFrame> {
    let mut out = Vec::new();
    let mut current = index;
    let mut walk_lineno = -1;
    while current != 0 && out.len() < max_depth {
        let node = state.stack_tree.next_node(current);
        let Some(frame) = state.frame_map.get(&node.frame_id) else {
            break;
        };
        let lineno = if frame.lineno != 0 { frame.lineno } else { walk_lineno };
        let rendered = StackFrame {
            function_name: frame.function_name.clone(),
            filename: frame.filename.clone(),
            lineno,
        };
        if keep(&rendered) {
            out.push(rendered);
        }
        walk_lineno = frame.parent_lineno;
        current = node.parent_index;
    }
    out
}
