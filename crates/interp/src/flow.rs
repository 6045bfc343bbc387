//! Flow-control and call stack records
//!
//! One stack carries everything that opens and closes during execution:
//! block records for `for` / `while` / `if` chains, call frames for user
//! functions (owning the local slot storage), pseudo-frames for `eval()`
//! re-entry and debug suspension. A discriminating enum stands in for
//! type-tagged variable-size list elements.

use crate::tables::CmdCode;
use rill_core::{ArrayId, Scope, Slot};

/// Mid-statement execution state, saved across user function calls so
/// the caller's statement (active command, pending block test, stack
/// base) resumes where it left off.
#[derive(Debug, Clone, Default)]
pub struct StmtState {
    /// Evaluation stack depth at statement start
    pub stmt_base: usize,
    /// Command keyword driving the current statement
    pub active_cmd: Option<(CmdCode, usize)>,
    /// A block-start statement awaiting its condition/init at the
    /// separator
    pub pending_block: Option<PendingBlock>,
}

/// Block-start statement whose separator triggers the test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBlock {
    pub kind: BlockKind,
    pub kw_pos: usize,
}

/// Where a variable slot physically lives at run time. Local slots are
/// addressed by their owning call frame's position on the flow stack,
/// so by-reference parameters stay valid while the frame does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    User(usize),
    Global(usize),
    Static(usize),
    Local { frame: usize, index: usize },
}

impl Target {
    /// Accounting scope of the slot behind this target.
    pub fn scope(&self) -> Scope {
        match self {
            Target::User(_) => Scope::User,
            Target::Global(_) => Scope::Global,
            Target::Static(_) => Scope::Static,
            Target::Local { .. } => Scope::Local,
        }
    }
}

/// Open block kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    For,
    While,
    If,
}

/// One open `for` / `while` / `if` block.
#[derive(Debug)]
pub struct BlockRecord {
    pub kind: BlockKind,
    /// Position of the block-start keyword token
    pub start_pos: usize,
    /// First token of the body (after the block-start statement)
    pub body_pos: usize,
    /// `for` control variable
    pub control: Option<Target>,
    /// `for` step (defaults to long 1)
    pub step: f64,
    /// `for` end value
    pub end_val: f64,
    /// Control variable iterates in float
    pub float_control: bool,
    /// An `if` / `elseif` branch already ran (skip the rest of the chain)
    pub branch_taken: bool,
}

/// One user-function call frame. Owns the local slot array; arrays
/// allocated for local array variables are freed when the frame pops.
#[derive(Debug)]
pub struct CallFrame {
    pub func_index: usize,
    /// Token to resume at after `return`
    pub return_pos: usize,
    /// Evaluation stack depth at call time
    pub eval_depth: usize,
    /// Parameter + local slots, in `FunctionDef::locals` order
    pub locals: Vec<Slot>,
    /// By-reference parameters: the caller's slot, by local index
    pub ref_params: Vec<(usize, Target)>,
    /// Arrays owned by this frame (by-reference array parameters are
    /// aliases and are not listed here)
    pub local_arrays: Vec<ArrayId>,
    /// Statement to resume at while this frame is suspended
    pub resume_pos: usize,
    /// Supplied argument count at the call site
    pub arg_count: u8,
    /// Caller's mid-statement state, restored on return
    pub saved_stmt: StmtState,
}

/// `eval()` pseudo-frame: unwinds like a function call.
#[derive(Debug)]
pub struct EvalFrame {
    pub eval_depth: usize,
}

/// Debug pseudo-frame: pushed when a program suspends (stop statement or
/// breakpoint hit); everything above it belongs to later activity.
#[derive(Debug)]
pub struct DebugFrame {
    /// Statement the suspended program continues at
    pub resume_pos: usize,
    /// Flow stack depth of the suspended program's frames
    pub flow_depth: usize,
    /// Evaluation stack depth at suspension
    pub eval_depth: usize,
    /// Interrupted statement state of the suspended activity
    pub saved_stmt: StmtState,
}

#[derive(Debug)]
pub enum FlowRecord {
    Block(BlockRecord),
    Call(CallFrame),
    Eval(EvalFrame),
    Debug(DebugFrame),
}

impl FlowRecord {
    pub fn as_block(&self) -> Option<&BlockRecord> {
        match self {
            FlowRecord::Block(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_call(&self) -> Option<&CallFrame> {
        match self {
            FlowRecord::Call(c) => Some(c),
            _ => None,
        }
    }
}

/// Convenience queries over the flow stack.
pub trait FlowStack {
    fn records(&self) -> &[FlowRecord];

    /// Index of the innermost open loop above the innermost call/debug
    /// boundary (for `break` / `continue`).
    fn innermost_loop(&self) -> Option<usize> {
        for (i, rec) in self.records().iter().enumerate().rev() {
            match rec {
                FlowRecord::Block(b) if matches!(b.kind, BlockKind::For | BlockKind::While) => {
                    return Some(i)
                }
                FlowRecord::Block(_) => continue,
                _ => return None,
            }
        }
        None
    }

    /// Index of the innermost call frame (for `return` and locals).
    fn innermost_call(&self) -> Option<usize> {
        self.records().iter().rposition(|r| matches!(r, FlowRecord::Call(_)))
    }

    /// Call depth (number of call frames) of the running program.
    fn call_depth(&self) -> usize {
        self.records()
            .iter()
            .filter(|r| matches!(r, FlowRecord::Call(_)))
            .count()
    }

    /// Index of the deepest debug frame, if any program is suspended.
    fn deepest_debug(&self) -> Option<usize> {
        self.records().iter().rposition(|r| matches!(r, FlowRecord::Debug(_)))
    }
}

impl FlowStack for Vec<FlowRecord> {
    fn records(&self) -> &[FlowRecord] {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(kind: BlockKind) -> FlowRecord {
        FlowRecord::Block(BlockRecord {
            kind,
            start_pos: 0,
            body_pos: 0,
            control: None,
            step: 1.0,
            end_val: 0.0,
            float_control: false,
            branch_taken: false,
        })
    }

    fn call() -> FlowRecord {
        FlowRecord::Call(CallFrame {
            func_index: 0,
            return_pos: 0,
            eval_depth: 0,
            locals: Vec::new(),
            ref_params: Vec::new(),
            local_arrays: Vec::new(),
            resume_pos: 0,
            arg_count: 0,
            saved_stmt: StmtState::default(),
        })
    }

    #[test]
    fn test_innermost_loop_stops_at_call_boundary() {
        let stack = vec![block(BlockKind::While), call(), block(BlockKind::If)];
        // the while loop belongs to the caller; break inside the callee
        // must not see it
        assert_eq!(stack.innermost_loop(), None);

        let stack = vec![call(), block(BlockKind::For), block(BlockKind::If)];
        assert_eq!(stack.innermost_loop(), Some(1));
    }

    #[test]
    fn test_call_depth() {
        let stack = vec![call(), block(BlockKind::While), call()];
        assert_eq!(stack.call_depth(), 2);
        assert_eq!(stack.innermost_call(), Some(2));
    }
}
