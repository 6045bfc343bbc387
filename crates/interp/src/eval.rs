//! Token-stream executor
//!
//! One fetch-decode-dispatch loop drives everything: expression
//! evaluation, commands, block flow and user function calls all share it.
//! Operator precedence is resolved at run time: operators are pushed on
//! the evaluation stack and applied as soon as the next token's priority
//! allows, which is exactly how the parser emitted them (source order).
//!
//! A user function call does not recurse into the interpreter; it pushes
//! a call frame, saves the caller's mid-statement state and jumps. Only
//! `eval()` re-enters the loop, behind an immediate-area snapshot.

use crate::error::{Event, ExecError, Interrupt};
use crate::flow::{
    BlockKind, BlockRecord, CallFrame, EvalFrame, FlowRecord, FlowStack, PendingBlock, StmtState,
    Target,
};
use crate::machine::{ensure_terminated, Machine, StepCondition};
use crate::parser::{ParseCtx, ParseMode, Parser};
use crate::tables::{command, term, CmdCode, CmdWhere, FnCode, OpFlags, SymVal, OPERATORS};
use crate::token::{varinfo, Tok};
use rill_core::{ArrayId, Scope, Slot, StringClass, Value, VarAttr};

bitflags::bitflags! {
    /// Evaluation-stack entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u8 {
        /// The entry owns an intermediate heap string
        const INTERMEDIATE = 0x01;
        /// Printing modifier: advance to the next tab stop
        const PRINT_TAB    = 0x02;
        /// Printing modifier: go to an absolute column
        const PRINT_COL    = 0x04;
    }
}

/// A writable variable reference carried by an operand.
#[derive(Debug, Clone, PartialEq)]
pub struct VarHandle {
    pub target: Target,
    pub is_const: bool,
    /// The slot holds this array
    pub array_id: Option<ArrayId>,
    /// Subscripts resolving an element of `array_id`
    pub elem: Option<Vec<i32>>,
}

/// One operand on the evaluation stack.
#[derive(Debug, Clone, PartialEq)]
pub struct StackEntry {
    pub value: Value,
    pub flags: EntryFlags,
    pub var: Option<VarHandle>,
}

/// Why an open-parenthesis marker sits on the evaluation stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenKind {
    Grouping,
    Subscript,
    Internal(u8),
    External(u8, u8),
    User(usize),
}

/// Evaluation stack element.
#[derive(Debug)]
pub enum EvalEntry {
    Operand(StackEntry),
    Operator { code: u8, prefix: bool },
    /// `(` marker; arguments accumulate above it
    Open { kind: OpenKind, commas: u8 },
    /// A function token waiting for its `(`
    Func(OpenKind),
}

/// Where the run loop continues after a statement-level action.
pub(crate) enum Next {
    /// Next statement (boundary checks apply)
    Stmt(usize),
    /// Continue mid-expression (a return value was just pushed)
    Expr(usize),
    /// Stop executing the current area
    EndRun,
}

/// The priority `(` carries on the stack (nothing reduces past it).
const LEFT_PAR_PRIO: u8 = 0x10;

impl Machine {
    /// Build an operand entry, tallying intermediate string ownership.
    pub(crate) fn make_operand(&mut self, value: Value) -> StackEntry {
        let mut flags = EntryFlags::empty();
        if matches!(value, Value::Str(Some(_))) {
            self.audit.on_create(StringClass::Intermediate);
            flags |= EntryFlags::INTERMEDIATE;
        }
        StackEntry {
            value,
            flags,
            var: None,
        }
    }

    /// Release an operand entry.
    pub(crate) fn drop_operand(&mut self, entry: StackEntry) {
        if entry.flags.contains(EntryFlags::INTERMEDIATE) {
            self.audit.on_destroy(StringClass::Intermediate);
        }
    }

    /// Drop all evaluation stack elements above `depth`.
    pub(crate) fn drop_eval_above(&mut self, depth: usize) {
        while self.eval.len() > depth {
            if let Some(EvalEntry::Operand(e)) = self.eval.pop() {
                self.drop_operand(e);
            }
        }
    }

    // --- slot access ---

    pub(crate) fn slot_value(&self, target: Target) -> Option<&Value> {
        let slot = match target {
            Target::User(i) => self.store.user_slot(i),
            Target::Global(i) => self.store.global_slot(i),
            Target::Static(i) => self.store.static_slot(i),
            Target::Local { frame, index } => match &self.flow[frame] {
                FlowRecord::Call(c) => &c.locals[index],
                _ => return None,
            },
        };
        slot.value.as_ref()
    }

    /// Write a scalar value through a target, with string accounting.
    pub(crate) fn write_scalar(&mut self, target: Target, value: Value) -> Result<(), ExecError> {
        let scope = target.scope();
        let Machine {
            ref mut store,
            ref mut flow,
            ref mut audit,
            ..
        } = *self;
        let slot = match target {
            Target::User(i) => store.user_slot_mut(i),
            Target::Global(i) => store.global_slot_mut(i),
            Target::Static(i) => store.static_slot_mut(i),
            Target::Local { frame, index } => match &mut flow[frame] {
                FlowRecord::Call(c) => &mut c.locals[index],
                _ => return Err(ExecError::ArgTypeWrong),
            },
        };
        rill_core::VarStore::assign_scalar(slot, value, scope, audit);
        Ok(())
    }

    /// Write through a variable handle (scalar slot or array element).
    /// Returns the stored value for the result operand.
    pub(crate) fn store_write(
        &mut self,
        handle: &VarHandle,
        value: Value,
    ) -> Result<Value, ExecError> {
        if handle.is_const {
            return Err(ExecError::CannotChangeConstant);
        }
        match (&handle.elem, handle.array_id) {
            (Some(subs), Some(id)) => {
                let scope = handle.target.scope();
                self.store
                    .assign_array_elem(id, subs, value.clone(), scope, &mut self.audit)
                    .map_err(|e| match e {
                        rill_core::store::ArrayAssignError::TypeFixed => {
                            ExecError::ArrayValueTypeFixed
                        }
                        rill_core::store::ArrayAssignError::BadSubscript => {
                            ExecError::ArraySubscriptOutOfRange
                        }
                    })?;
                Ok(value)
            }
            _ => {
                self.write_scalar(handle.target, value.clone())?;
                Ok(value)
            }
        }
    }

    // --- run entry points ---

    /// Execute tokens from `start` until the area sentinel. `capture`
    /// routes top-level results into `eval_captured` instead of the FIFO
    /// (nested `eval()` runs).
    pub(crate) fn run(&mut self, start: usize, capture: bool) -> Result<(), Interrupt> {
        let st = StmtState {
            stmt_base: self.eval.len(),
            active_cmd: None,
            pending_block: None,
        };
        self.run_inner(start, st, capture, true)
    }

    /// Resume a suspended program with its interrupted statement state.
    /// The first statement runs without boundary checks so the statement
    /// that stopped (or the breakpoint that fired) does not re-trigger.
    pub(crate) fn resume_run(&mut self, start: usize, st: StmtState) -> Result<(), Interrupt> {
        self.run_inner(start, st, false, false)
    }

    fn run_inner(
        &mut self,
        start: usize,
        mut st: StmtState,
        capture: bool,
        check_first: bool,
    ) -> Result<(), Interrupt> {
        let entry_flow_depth = self.flow.len();
        let mut pos = start;
        let mut at_boundary = check_first;

        loop {
            if at_boundary {
                at_boundary = false;
                match self.statement_boundary(pos, &st) {
                    Ok(()) => {}
                    Err(int) => return Err(int),
                }
            }

            let step_result = self.exec_token(pos, &mut st, capture, entry_flow_depth);
            match step_result {
                Ok(Next::EndRun) => {
                    // unwind block records this run opened
                    while self.flow.len() > entry_flow_depth {
                        match self.flow.last() {
                            Some(FlowRecord::Block(_)) => {
                                self.flow.pop();
                            }
                            _ => break,
                        }
                    }
                    return Ok(());
                }
                Ok(Next::Stmt(next)) => {
                    pos = next;
                    at_boundary = true;
                }
                Ok(Next::Expr(next)) => {
                    pos = next;
                }
                Err(Interrupt::Error(e)) if self.trap_errors => {
                    // trapped: remember the code, resume at the next
                    // statement
                    self.trapped_error = e.code();
                    self.drop_eval_above(st.stmt_base);
                    st.active_cmd = None;
                    st.pending_block = None;
                    match self.next_statement_after(pos) {
                        Some(next) => {
                            pos = next;
                            at_boundary = true;
                        }
                        None => return Ok(()),
                    }
                }
                Err(int) => return Err(int),
            }
        }
    }

    /// Position just past the next statement separator, if any.
    fn next_statement_after(&self, pos: usize) -> Option<usize> {
        let sep = self.img.tokens.find_token(pos, |t| {
            matches!(t, Tok::Terminal { code } if term::is_semicolon(*code))
        })?;
        let next = self.img.tokens.step(sep);
        match self.img.tokens.at(next) {
            Tok::None => None,
            _ => Some(next),
        }
    }

    /// Statement-boundary bookkeeping: housekeeping poll, one-shot step
    /// conditions, breakpoint detection.
    fn statement_boundary(&mut self, pos: usize, st: &StmtState) -> Result<(), Interrupt> {
        self.statements_since_poll += 1;
        if self.statements_since_poll >= 16 {
            self.poll_housekeeping()?;
        }
        if matches!(self.img.tokens.at(pos), Tok::None) {
            return Ok(());
        }

        let in_program = self.img.tokens.in_program_area(pos);

        if in_program {
            if let Some(cond) = self.step_condition {
                let fire = match cond {
                    StepCondition::Next => true,
                    StepCondition::NextAtDepth(d) => self.flow.call_depth() <= d,
                    StepCondition::Shallower(d) => self.flow.call_depth() < d,
                    StepCondition::BlockExit(depth) => self.flow.len() < depth,
                };
                if fire {
                    self.step_condition = None;
                    return Err(self.suspend(pos, st.clone(), Event::StopForDebug));
                }
            }
        }

        // breakpoint: the separator byte directly before a program
        // statement marks it
        if in_program && pos > 0 {
            let before = self.img.tokens.at(pos - 1);
            if matches!(before, Tok::Terminal { code } if code == term::SEMICOLON_BP_SET) {
                return self.check_breakpoint_hit(pos, st);
            }
        }
        Ok(())
    }

    fn check_breakpoint_hit(&mut self, pos: usize, st: &StmtState) -> Result<(), Interrupt> {
        if !self.bp.is_active() || self.bp.is_draft() {
            return Ok(());
        }
        let idx = match self.bp.row_for_statement(pos) {
            Some(i) => i,
            None => return Ok(()),
        };
        if !self.bp.row(idx).enabled {
            return Ok(());
        }
        let trigger = self.bp.row(idx).trigger.as_ref().map(|s| s.to_string());
        let fire = if let Some(trigger) = trigger {
            match self.eval_watch_string(&trigger) {
                Ok(Some(v)) => v.is_truthy(),
                _ => false,
            }
        } else if self.bp.row(idx).hit_target > 0 {
            let row = self.bp.row_mut(idx);
            row.hit_count += 1;
            if row.hit_count >= row.hit_target {
                row.hit_count = 0;
                true
            } else {
                false
            }
        } else {
            true
        };
        if fire {
            tracing::trace!(token_pos = pos, "breakpoint fired");
            return Err(self.suspend(pos, st.clone(), Event::StopForBreakpoint));
        }
        Ok(())
    }

    // --- token dispatch ---

    fn exec_token(
        &mut self,
        pos: usize,
        st: &mut StmtState,
        capture: bool,
        entry_flow_depth: usize,
    ) -> Result<Next, Interrupt> {
        let tok = self.img.tokens.at(pos);
        match tok {
            Tok::None => Ok(Next::EndRun),

            Tok::LongConst(v) => self.push_operand_tok(pos, Value::Long(v), st.stmt_base),
            Tok::FloatConst(v) => self.push_operand_tok(pos, Value::Float(v), st.stmt_base),
            Tok::StringConst { str_index } => {
                let s = self.img.parsed_string(pos, str_index).to_string();
                self.push_operand_tok(pos, Value::str_from(&s), st.stmt_base)
            }
            Tok::SymConst { code } => {
                let value = match crate::tables::sym_const(code).value {
                    SymVal::Long(v) => Value::Long(v),
                    SymVal::Float(v) => Value::Float(v),
                    SymVal::Str(s) => Value::str_from(s),
                };
                self.push_operand_tok(pos, value, st.stmt_base)
            }
            Tok::GenericName { .. } => {
                // only occurs in statements the executor skips
                Ok(Next::Expr(self.img.tokens.step(pos)))
            }

            Tok::VarRef {
                info,
                name_index: _,
                value_index,
            } => {
                let handle = self.resolve_var_token(info, value_index)?;
                let value = self
                    .slot_value(handle.target)
                    .cloned()
                    .unwrap_or(Value::Long(0));
                let mut entry = self.make_operand(value);
                entry.var = Some(handle);
                self.eval.push(EvalEntry::Operand(entry));
                let next = self.img.tokens.step(pos);
                self.reduce(st.stmt_base, self.peek_prio(next))?;
                Ok(Next::Expr(next))
            }

            Tok::InternalFn { code } => {
                self.eval.push(EvalEntry::Func(OpenKind::Internal(code)));
                Ok(Next::Expr(self.img.tokens.step(pos)))
            }
            Tok::ExternalFn { bucket, index } => {
                self.eval
                    .push(EvalEntry::Func(OpenKind::External(bucket, index)));
                Ok(Next::Expr(self.img.tokens.step(pos)))
            }
            Tok::UserFn { index } => {
                self.eval.push(EvalEntry::Func(OpenKind::User(index as usize)));
                Ok(Next::Expr(self.img.tokens.step(pos)))
            }

            Tok::Keyword { code, ofs } => self.exec_keyword(code, ofs, pos, st),

            Tok::Terminal { code } => self.exec_terminal(code, pos, st, capture, entry_flow_depth),
        }
    }

    fn push_operand_tok(
        &mut self,
        pos: usize,
        value: Value,
        stmt_base: usize,
    ) -> Result<Next, Interrupt> {
        let entry = self.make_operand(value);
        self.eval.push(EvalEntry::Operand(entry));
        let next = self.img.tokens.step(pos);
        self.reduce(stmt_base, self.peek_prio(next))?;
        Ok(Next::Expr(next))
    }

    // --- terminals ---

    fn exec_terminal(
        &mut self,
        code: u8,
        pos: usize,
        st: &mut StmtState,
        capture: bool,
        entry_flow_depth: usize,
    ) -> Result<Next, Interrupt> {
        if term::is_semicolon(code) {
            return self.end_statement(pos, st, capture, entry_flow_depth);
        }
        match code {
            term::LEFT_PAR => {
                let kind = match self.eval.last() {
                    Some(EvalEntry::Func(kind)) => {
                        let kind = *kind;
                        self.eval.pop();
                        kind
                    }
                    Some(EvalEntry::Operand(e))
                        if e.var.as_ref().is_some_and(|v| {
                            v.array_id.is_some() && v.elem.is_none()
                        }) =>
                    {
                        OpenKind::Subscript
                    }
                    _ => OpenKind::Grouping,
                };
                self.eval.push(EvalEntry::Open { kind, commas: 0 });
                Ok(Next::Expr(self.img.tokens.step(pos)))
            }
            term::COMMA => {
                self.reduce(st.stmt_base, 0)?;
                // bump the innermost open frame's comma count (command
                // arguments at statement level have no frame); never
                // look below the statement base
                for i in (st.stmt_base..self.eval.len()).rev() {
                    match &mut self.eval[i] {
                        EvalEntry::Open { commas, .. } => {
                            *commas += 1;
                            break;
                        }
                        EvalEntry::Operand(_) => continue,
                        _ => break,
                    }
                }
                Ok(Next::Expr(self.img.tokens.step(pos)))
            }
            term::RIGHT_PAR => {
                self.reduce(st.stmt_base, 0)?;
                let next = self.close_paren(pos, st)?;
                Ok(next)
            }
            op => {
                let def = &OPERATORS[op as usize];
                let top_is_operand = matches!(self.eval.last(), Some(EvalEntry::Operand(_)))
                    && self.eval.len() > st.stmt_base;
                if !top_is_operand {
                    // prefix
                    self.eval.push(EvalEntry::Operator {
                        code: op,
                        prefix: true,
                    });
                    return Ok(Next::Expr(self.img.tokens.step(pos)));
                }
                let top_is_var = matches!(
                    self.eval.last(),
                    Some(EvalEntry::Operand(e)) if e.var.is_some()
                );
                if def.postfix_prio != 0 && top_is_var {
                    // postfix ++/--
                    let entry = match self.eval.pop() {
                        Some(EvalEntry::Operand(e)) => e,
                        _ => unreachable!(),
                    };
                    let result = self.apply_incr_decr(entry, op, false)?;
                    self.eval.push(EvalEntry::Operand(result));
                    let next = self.img.tokens.step(pos);
                    self.reduce(st.stmt_base, self.peek_prio(next))?;
                    return Ok(Next::Expr(next));
                }
                if def.infix_prio == 0 {
                    return Err(ExecError::ArgTypeWrong.into());
                }
                self.eval.push(EvalEntry::Operator {
                    code: op,
                    prefix: false,
                });
                Ok(Next::Expr(self.img.tokens.step(pos)))
            }
        }
    }

    /// Priority of the terminal at `pos` as seen from a just-pushed
    /// operand (drives operator reduction).
    fn peek_prio(&self, pos: usize) -> u8 {
        match self.img.tokens.at(pos) {
            Tok::Terminal { code } => {
                if code == term::LEFT_PAR {
                    return LEFT_PAR_PRIO;
                }
                if term::is_semicolon(code)
                    || code == term::COMMA
                    || code == term::RIGHT_PAR
                {
                    return 0;
                }
                let def = &OPERATORS[code as usize];
                if def.infix_prio != 0 {
                    def.infix_prio
                } else {
                    def.postfix_prio
                }
            }
            _ => 0,
        }
    }

    /// Apply stacked operators whose priority wins against `min_prio`.
    fn reduce(&mut self, base: usize, min_prio: u8) -> Result<(), Interrupt> {
        loop {
            let n = self.eval.len();
            if n < 2 || n - 2 < base {
                return Ok(());
            }
            if !matches!(self.eval[n - 1], EvalEntry::Operand(_)) {
                return Ok(());
            }
            let (code, prefix) = match &self.eval[n - 2] {
                EvalEntry::Operator { code, prefix } => (*code, *prefix),
                _ => return Ok(()),
            };
            let def = &OPERATORS[code as usize];
            let (prio, right_assoc) = if prefix {
                (def.prefix_prio, true)
            } else {
                (def.infix_prio, def.flags.contains(OpFlags::RTOL))
            };
            let apply = if right_assoc {
                prio > min_prio
            } else {
                prio >= min_prio
            };
            if !apply {
                return Ok(());
            }

            if prefix {
                let operand = match self.eval.pop() {
                    Some(EvalEntry::Operand(e)) => e,
                    _ => unreachable!(),
                };
                self.eval.pop(); // the operator
                let result = self.apply_prefix(code, operand)?;
                self.eval.push(EvalEntry::Operand(result));
            } else {
                if n < 3 || n - 3 < base || !matches!(self.eval[n - 3], EvalEntry::Operand(_)) {
                    return Ok(());
                }
                let right = match self.eval.pop() {
                    Some(EvalEntry::Operand(e)) => e,
                    _ => unreachable!(),
                };
                self.eval.pop(); // the operator
                let left = match self.eval.pop() {
                    Some(EvalEntry::Operand(e)) => e,
                    _ => unreachable!(),
                };
                let result = self.apply_infix(code, left, right)?;
                self.eval.push(EvalEntry::Operand(result));
            }
        }
    }

    // --- operator application ---

    fn apply_prefix(&mut self, code: u8, operand: StackEntry) -> Result<StackEntry, Interrupt> {
        match code {
            term::INCR | term::DECR => {
                let result = self.apply_incr_decr(operand, code, true)?;
                return Ok(result);
            }
            _ => {}
        }
        let value = match (code, &operand.value) {
            (term::PLUS, Value::Long(v)) => Value::Long(*v),
            (term::PLUS, Value::Float(v)) => Value::Float(*v),
            (term::MINUS, Value::Long(v)) => Value::Long(
                v.checked_neg().ok_or(ExecError::Overflow)?,
            ),
            (term::MINUS, Value::Float(v)) => Value::Float(-v),
            (term::NOT, v) if v.is_numeric() => Value::Long(if v.is_truthy() { 0 } else { 1 }),
            (term::BIT_COMPL, v) => {
                let l = v.coerce_long().ok_or(ExecError::ArgTypeWrong)?;
                Value::Long(!l)
            }
            _ => return Err(ExecError::ArgTypeWrong.into()),
        };
        self.drop_operand(operand);
        Ok(self.make_operand(value))
    }

    fn apply_incr_decr(
        &mut self,
        operand: StackEntry,
        code: u8,
        prefix: bool,
    ) -> Result<StackEntry, Interrupt> {
        let handle = operand.var.clone().ok_or(ExecError::ArgTypeWrong)?;
        let delta: f64 = if code == term::INCR { 1.0 } else { -1.0 };
        let old = operand.value.clone();
        let new = match &old {
            Value::Long(v) => Value::Long(
                v.checked_add(delta as i32).ok_or(ExecError::Overflow)?,
            ),
            Value::Float(v) => Value::Float(v + delta as f32),
            _ => return Err(ExecError::ArgTypeWrong.into()),
        };
        self.store_write(&handle, new.clone())?;
        self.drop_operand(operand);
        let result = if prefix { new } else { old };
        Ok(self.make_operand(result))
    }

    fn apply_infix(
        &mut self,
        code: u8,
        left: StackEntry,
        right: StackEntry,
    ) -> Result<StackEntry, Interrupt> {
        let def = &OPERATORS[code as usize];

        if def.flags.contains(OpFlags::ASSIGN) {
            let handle = left.var.clone().ok_or(ExecError::ArgTypeWrong)?;
            let value = if def.compound_base != 0xFF {
                self.compute_binary(def.compound_base, &left.value, &right.value)?
            } else {
                right.value.clone()
            };
            let stored = self.store_write(&handle, value)?;
            self.drop_operand(left);
            self.drop_operand(right);
            let mut entry = self.make_operand(stored);
            entry.var = Some(handle);
            return Ok(entry);
        }

        let value = self.compute_binary(code, &left.value, &right.value)?;
        self.drop_operand(left);
        self.drop_operand(right);
        Ok(self.make_operand(value))
    }

    /// Binary operator on raw values (shared with compound assignment).
    fn compute_binary(&self, code: u8, left: &Value, right: &Value) -> Result<Value, Interrupt> {
        let def = &OPERATORS[code as usize];

        if def.flags.contains(OpFlags::LONG_ONLY) {
            let l = left.coerce_long().ok_or(ExecError::ArgTypeWrong)?;
            let r = right.coerce_long().ok_or(ExecError::ArgTypeWrong)?;
            let v = match code {
                term::BIT_AND => l & r,
                term::BIT_OR => l | r,
                term::BIT_XOR => l ^ r,
                term::SHL => l.wrapping_shl(r as u32 & 31),
                term::SHR => l.wrapping_shr(r as u32 & 31),
                term::MOD => {
                    if r == 0 {
                        return Err(ExecError::ModByZero.into());
                    }
                    l.wrapping_rem(r)
                }
                _ => return Err(ExecError::ArgTypeWrong.into()),
            };
            return Ok(Value::Long(v));
        }

        match code {
            term::AND | term::OR => {
                if !left.is_numeric() || !right.is_numeric() {
                    return Err(ExecError::ArgTypeWrong.into());
                }
                let v = if code == term::AND {
                    left.is_truthy() && right.is_truthy()
                } else {
                    left.is_truthy() || right.is_truthy()
                };
                Ok(Value::Long(v as i32))
            }

            term::EQ | term::NE | term::LT | term::GT | term::LTOE | term::GTOE => {
                let ord = match (left, right) {
                    (Value::Str(_), Value::Str(_)) => left.as_str().cmp(right.as_str()),
                    _ => {
                        let l = left.as_f64().ok_or(ExecError::ArgTypeWrong)?;
                        let r = right.as_f64().ok_or(ExecError::ArgTypeWrong)?;
                        l.partial_cmp(&r).ok_or(ExecError::Overflow)?
                    }
                };
                let v = match code {
                    term::EQ => ord.is_eq(),
                    term::NE => ord.is_ne(),
                    term::LT => ord.is_lt(),
                    term::GT => ord.is_gt(),
                    term::LTOE => ord.is_le(),
                    _ => ord.is_ge(),
                };
                Ok(Value::Long(v as i32))
            }

            term::PLUS if left.is_string() || right.is_string() => {
                if !(left.is_string() && right.is_string()) {
                    return Err(ExecError::ArgTypeWrong.into());
                }
                let mut s = String::with_capacity(left.as_str().len() + right.as_str().len());
                s.push_str(left.as_str());
                s.push_str(right.as_str());
                if s.len() > rill_core::MAX_ALPHA_CST_LEN {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                Ok(Value::str_from(&s))
            }

            term::PLUS | term::MINUS | term::MULT | term::DIV => {
                match (left, right) {
                    (Value::Long(l), Value::Long(r)) => {
                        let v = match code {
                            term::PLUS => l.checked_add(*r),
                            term::MINUS => l.checked_sub(*r),
                            term::MULT => l.checked_mul(*r),
                            _ => {
                                if *r == 0 {
                                    return Err(ExecError::DivByZero.into());
                                }
                                l.checked_div(*r)
                            }
                        };
                        Ok(Value::Long(v.ok_or(ExecError::Overflow)?))
                    }
                    _ => {
                        let l = left.as_f64().ok_or(ExecError::ArgTypeWrong)? as f32;
                        let r = right.as_f64().ok_or(ExecError::ArgTypeWrong)? as f32;
                        if code == term::DIV && r == 0.0 {
                            return Err(ExecError::DivByZero.into());
                        }
                        let v = match code {
                            term::PLUS => l + r,
                            term::MINUS => l - r,
                            term::MULT => l * r,
                            _ => l / r,
                        };
                        if !v.is_finite() {
                            return Err(ExecError::Overflow.into());
                        }
                        Ok(Value::Float(v))
                    }
                }
            }

            term::POW => {
                let l = left.as_f64().ok_or(ExecError::ArgTypeWrong)?;
                let r = right.as_f64().ok_or(ExecError::ArgTypeWrong)?;
                let v = l.powf(r);
                if !v.is_finite() {
                    return Err(ExecError::Overflow.into());
                }
                let both_long =
                    matches!(left, Value::Long(_)) && matches!(right, Value::Long(_));
                if both_long && v.fract() == 0.0 && v >= i32::MIN as f64 && v <= i32::MAX as f64 {
                    Ok(Value::Long(v as i32))
                } else {
                    Ok(Value::Float(v as f32))
                }
            }

            _ => Err(ExecError::ArgTypeWrong.into()),
        }
    }

    // --- variable token resolution ---

    fn resolve_var_token(&self, info: u8, value_index: u16) -> Result<VarHandle, Interrupt> {
        let scope = Scope::from_u8(info & varinfo::SCOPE_MASK).ok_or(ExecError::ArgTypeWrong)?;
        let is_const = info & varinfo::IS_CONST != 0;
        let forced = info & varinfo::FORCED_FUNC != 0;

        let target = match scope {
            Scope::User => Target::User(value_index as usize),
            Scope::Global => Target::Global(value_index as usize),
            Scope::Static => Target::Static(value_index as usize),
            Scope::Local | Scope::Param => {
                let frame_idx = if forced {
                    // the stopped function's frame: the innermost call
                    // below the deepest debug frame; while the program
                    // still runs (trigger strings) it is simply the
                    // innermost call
                    match self.flow.deepest_debug() {
                        Some(debug_at) => self.flow[..debug_at]
                            .iter()
                            .rposition(|r| matches!(r, FlowRecord::Call(_)))
                            .ok_or(ExecError::NoProgramStopped)?,
                        None => self
                            .flow
                            .innermost_call()
                            .ok_or(ExecError::NoProgramStopped)?,
                    }
                } else {
                    self.flow
                        .innermost_call()
                        .ok_or(ExecError::ArgTypeWrong)?
                };
                let index = value_index as usize;
                match &self.flow[frame_idx] {
                    FlowRecord::Call(c) => {
                        match c.ref_params.iter().find(|(i, _)| *i == index) {
                            Some((_, target)) => *target,
                            None => Target::Local {
                                frame: frame_idx,
                                index,
                            },
                        }
                    }
                    _ => return Err(ExecError::ArgTypeWrong.into()),
                }
            }
        };

        let array_id = match self.slot_value(target) {
            Some(Value::Array(id)) => Some(*id),
            _ => None,
        };
        Ok(VarHandle {
            target,
            is_const,
            array_id,
            elem: None,
        })
    }

    // --- parenthesis closing ---

    /// Pop the arguments above the innermost open frame, in order.
    fn pop_args(&mut self) -> (OpenKind, Vec<StackEntry>) {
        let mut args = Vec::new();
        loop {
            match self.eval.pop() {
                Some(EvalEntry::Operand(e)) => args.push(e),
                Some(EvalEntry::Open { kind, .. }) => {
                    args.reverse();
                    return (kind, args);
                }
                Some(other) => {
                    // operators were all reduced before closing
                    debug_assert!(false, "unexpected {:?} under close paren", other);
                }
                None => {
                    args.reverse();
                    return (OpenKind::Grouping, args);
                }
            }
        }
    }

    fn close_paren(&mut self, pos: usize, st: &mut StmtState) -> Result<Next, Interrupt> {
        let (kind, mut args) = self.pop_args();
        let next = self.img.tokens.step(pos);
        match kind {
            OpenKind::Grouping => {
                // a grouping holds one expression, except directly under
                // a command keyword where it wraps the argument list;
                // all operands stay on the stack either way
                if args.is_empty() {
                    return Err(ExecError::ArgCountWrong.into());
                }
                for entry in args {
                    self.eval.push(EvalEntry::Operand(entry));
                }
                self.reduce(st.stmt_base, self.peek_prio(next))?;
                Ok(Next::Expr(next))
            }
            OpenKind::Subscript => {
                // the array operand sits directly below the frame
                let base = match self.eval.pop() {
                    Some(EvalEntry::Operand(e)) => e,
                    _ => return Err(ExecError::ArgTypeWrong.into()),
                };
                let handle = base.var.clone().ok_or(ExecError::ArgTypeWrong)?;
                let id = handle.array_id.ok_or(ExecError::ArgTypeWrong)?;
                let mut subs = Vec::with_capacity(args.len());
                for a in &args {
                    subs.push(a.value.coerce_long().ok_or(ExecError::ArgTypeWrong)?);
                }
                for a in args {
                    self.drop_operand(a);
                }
                self.drop_operand(base);
                let storage = self
                    .store
                    .array(id)
                    .ok_or(ExecError::ArraySubscriptOutOfRange)?;
                if subs.len() != storage.dim_count() {
                    return Err(ExecError::ArrayDimCountWrong.into());
                }
                let flat = storage
                    .flat_index(&subs)
                    .ok_or(ExecError::ArraySubscriptOutOfRange)?;
                let value = storage.elems[flat].clone();
                let mut entry = self.make_operand(value);
                entry.var = Some(VarHandle {
                    target: handle.target,
                    is_const: handle.is_const,
                    array_id: Some(id),
                    elem: Some(subs),
                });
                self.eval.push(EvalEntry::Operand(entry));
                self.reduce(st.stmt_base, self.peek_prio(next))?;
                Ok(Next::Expr(next))
            }
            OpenKind::Internal(code) => {
                let fn_code = crate::tables::internal_fn(code).code;
                if fn_code == FnCode::Eval {
                    let result = self.builtin_eval(args)?;
                    self.eval.push(EvalEntry::Operand(result));
                } else {
                    let result = self.call_internal(fn_code, args)?;
                    self.eval.push(EvalEntry::Operand(result));
                }
                self.reduce(st.stmt_base, self.peek_prio(next))?;
                Ok(Next::Expr(next))
            }
            OpenKind::External(bucket, index) => {
                let def = self
                    .host
                    .external
                    .get(bucket, index)
                    .ok_or(ExecError::UndefinedFunction)?;
                let values: Vec<Value> = args.iter().map(|a| a.value.clone()).collect();
                let result = (def.func)(&values);
                for a in args {
                    self.drop_operand(a);
                }
                let entry = self.make_operand(result);
                self.eval.push(EvalEntry::Operand(entry));
                self.reduce(st.stmt_base, self.peek_prio(next))?;
                Ok(Next::Expr(next))
            }
            OpenKind::User(fi) => self.call_user_function(fi, args, next, st),
        }
    }

    // --- user function calls ---

    fn call_user_function(
        &mut self,
        fi: usize,
        args: Vec<StackEntry>,
        return_pos: usize,
        st: &mut StmtState,
    ) -> Result<Next, Interrupt> {
        let (start, param_count, mandatory) = {
            let func = self.img.funcs.get(fi).ok_or(ExecError::UndefinedFunction)?;
            match func.start_token {
                Some(start) => (start, func.param_count as usize, func.mandatory_count as usize),
                None => {
                    for a in args {
                        self.drop_operand(a);
                    }
                    return Err(ExecError::UndefinedFunction.into());
                }
            }
        };
        if args.len() < mandatory || args.len() > param_count {
            for a in args {
                self.drop_operand(a);
            }
            return Err(ExecError::ArgCountWrong.into());
        }

        let local_defs: Vec<crate::program::LocalDef> = self.img.funcs[fi].locals.clone();
        let mut locals: Vec<Slot> = Vec::with_capacity(local_defs.len());
        let mut ref_params: Vec<(usize, Target)> = Vec::new();
        let mut local_arrays: Vec<ArrayId> = Vec::new();
        let arg_count = args.len() as u8;
        let mut args = args.into_iter();

        for (i, def) in local_defs.iter().enumerate() {
            if def.is_param && (i as u8) < arg_count {
                let arg = args.next().expect("counted above");
                // a bare non-const scalar variable passes by reference
                let ref_target = arg
                    .var
                    .as_ref()
                    .filter(|v| v.elem.is_none() && !v.is_const && v.array_id.is_none())
                    .map(|v| v.target);
                if def.is_array {
                    // arrays always pass by reference (shared handle)
                    let id = match &arg.value {
                        Value::Array(id) => *id,
                        _ => {
                            self.drop_operand(arg);
                            return Err(ExecError::ArgTypeWrong.into());
                        }
                    };
                    locals.push(Slot::new(Value::Array(id), VarAttr::IS_ARRAY));
                    self.drop_operand(arg);
                } else if let Some(target) = ref_target {
                    ref_params.push((i, target));
                    locals.push(Slot::new(Value::Long(0), VarAttr::empty()));
                    self.drop_operand(arg);
                } else {
                    // by value, deep-copying strings into local storage
                    let value = arg.value.clone();
                    if matches!(value, Value::Str(Some(_))) {
                        self.audit.on_create(StringClass::LocalVarStr);
                    }
                    locals.push(Slot::new(value, VarAttr::empty()));
                    self.drop_operand(arg);
                }
            } else {
                // omitted optional parameter or plain local
                let init = def.init.clone().unwrap_or(Value::Long(0));
                if def.is_array && !def.is_param {
                    let dims = &def.dims[..def.dim_count as usize];
                    let storage = if init.is_string() {
                        rill_core::ArrayStorage::new_string(dims)
                    } else {
                        rill_core::ArrayStorage::new_numeric(dims, init.clone())
                    }
                    .map_err(|_| ExecError::ArgOutsideRange)?;
                    let id = self.store.alloc_array(storage, Scope::Local, &mut self.audit);
                    local_arrays.push(id);
                    let mut attrs = VarAttr::IS_ARRAY;
                    if def.is_const {
                        attrs |= VarAttr::IS_CONST;
                    }
                    locals.push(Slot::new(Value::Array(id), attrs));
                } else {
                    if matches!(init, Value::Str(Some(_))) {
                        self.audit.on_create(StringClass::LocalVarStr);
                    }
                    let mut attrs = VarAttr::empty();
                    if def.is_const {
                        attrs |= VarAttr::IS_CONST;
                    }
                    locals.push(Slot::new(init, attrs));
                }
            }
        }
        debug_assert!(args.next().is_none());

        self.audit.on_create(StringClass::LocalBase);
        let frame = CallFrame {
            func_index: fi,
            return_pos,
            eval_depth: self.eval.len(),
            locals,
            ref_params,
            local_arrays,
            resume_pos: start,
            arg_count,
            saved_stmt: st.clone(),
        };
        self.flow.push(FlowRecord::Call(frame));

        // fresh statement state for the function body
        *st = StmtState {
            stmt_base: self.eval.len(),
            active_cmd: None,
            pending_block: None,
        };
        Ok(Next::Stmt(start))
    }

    /// `return [value]` and the implicit return at a function's `end`.
    pub(crate) fn return_from_function(
        &mut self,
        result: Option<StackEntry>,
        st: &mut StmtState,
    ) -> Result<Next, Interrupt> {
        let call_at = match self.flow.innermost_call() {
            Some(i) => i,
            None => {
                // return typed at the prompt: end the immediate line
                if let Some(e) = result {
                    self.drop_operand(e);
                }
                return Ok(Next::EndRun);
            }
        };
        // discard blocks opened inside the function
        while self.flow.len() > call_at + 1 {
            self.pop_flow_record();
        }
        let frame = match self.flow.pop() {
            Some(FlowRecord::Call(frame)) => frame,
            _ => return Err(ExecError::ArgTypeWrong.into()),
        };
        let return_pos = frame.return_pos;
        let eval_depth = frame.eval_depth;
        let saved = frame.saved_stmt.clone();
        self.release_call_frame(frame);

        let value = match result {
            Some(entry) => {
                let v = entry.value.clone();
                self.drop_operand(entry);
                v
            }
            None => Value::Long(0),
        };
        self.drop_eval_above(eval_depth);
        let entry = self.make_operand(value);
        self.eval.push(EvalEntry::Operand(entry));
        *st = saved;
        self.reduce(st.stmt_base, self.peek_prio(return_pos))?;
        Ok(Next::Expr(return_pos))
    }

    // --- eval() and watch strings ---

    /// Nested parse + run behind an immediate-area snapshot.
    fn run_nested_immediate(
        &mut self,
        src: &str,
        mode: ParseMode,
    ) -> Result<Option<Value>, Interrupt> {
        let bytes = self.img.tokens.snapshot_immediate();
        let strings = self.img.take_imm_strings();

        // watch strings see the stopped function's scope, or the one
        // currently executing (breakpoint trigger evaluation)
        let stopped_func = self.deepest_stopped_func().or_else(|| {
            self.flow
                .iter()
                .rev()
                .find_map(|r| r.as_call().map(|c| c.func_index))
        });
        let src = ensure_terminated(src);
        let parse_result = {
            let mut ctx = ParseCtx {
                img: &mut self.img,
                store: &mut self.store,
                bp: &mut self.bp,
                audit: &mut self.audit,
                ext: &self.host.external,
                stopped_func,
                pending: &mut self.pending,
            };
            Parser::new(&mut ctx, &src, mode).parse()
        };
        if let Err(diag) = parse_result {
            self.img.tokens.start_immediate();
            self.img.clear_imm_strings(&mut self.audit);
            self.img.tokens.restore_immediate(&bytes);
            self.img.restore_imm_strings(strings, &mut self.audit);
            return Err(ExecError::EvalSyntax(diag.error).into());
        }

        self.flow.push(FlowRecord::Eval(EvalFrame {
            eval_depth: self.eval.len(),
        }));
        let saved_captured = self.eval_captured.take();
        let imm_base = self.img.tokens.imm_base();
        let outcome = self.run(imm_base, true);
        let captured = self.eval_captured.take();
        self.eval_captured = saved_captured;

        // unwind the pseudo-frame and restore the snapshot
        if let Some(FlowRecord::Eval(frame)) = self.flow.pop() {
            self.drop_eval_above(frame.eval_depth);
        }
        self.img.clear_imm_strings(&mut self.audit);
        self.img.tokens.restore_immediate(&bytes);
        self.img.restore_imm_strings(strings, &mut self.audit);

        outcome?;
        Ok(captured)
    }

    /// The `eval(s)` built-in.
    fn builtin_eval(&mut self, mut args: Vec<StackEntry>) -> Result<StackEntry, Interrupt> {
        let arg = args.pop().ok_or(ExecError::ArgCountWrong)?;
        if !arg.value.is_string() {
            self.drop_operand(arg);
            return Err(ExecError::ArgTypeWrong.into());
        }
        let src = arg.value.as_str().to_string();
        self.drop_operand(arg);
        if src.is_empty() {
            return Err(ExecError::ArgNonEmptyStringExpected.into());
        }
        let result = self.run_nested_immediate(&src, ParseMode::Restricted)?;
        Ok(self.make_operand(result.unwrap_or(Value::Long(0))))
    }

    /// Evaluate a view / trigger expression string.
    pub(crate) fn eval_watch_string(&mut self, src: &str) -> Result<Option<Value>, Interrupt> {
        self.run_nested_immediate(src, ParseMode::Restricted)
    }

    // --- keywords ---

    fn exec_keyword(
        &mut self,
        code: u8,
        ofs: u16,
        pos: usize,
        st: &mut StmtState,
    ) -> Result<Next, Interrupt> {
        let cmd = match CmdCode::from_u8(code) {
            Some(c) => c,
            None => return Ok(Next::Expr(self.img.tokens.step(pos))),
        };
        let spec = command(cmd);

        if spec.where_allowed.contains(CmdWhere::SKIP_EXEC) {
            return Ok(match self.next_statement_after(pos) {
                Some(next) => Next::Stmt(next),
                None => Next::EndRun,
            });
        }

        match cmd {
            CmdCode::If => {
                self.flow.push(FlowRecord::Block(BlockRecord {
                    kind: BlockKind::If,
                    start_pos: pos,
                    body_pos: 0,
                    control: None,
                    step: 1.0,
                    end_val: 0.0,
                    float_control: false,
                    branch_taken: false,
                }));
                st.pending_block = Some(PendingBlock {
                    kind: BlockKind::If,
                    kw_pos: pos,
                });
                Ok(Next::Expr(self.img.tokens.step(pos)))
            }
            CmdCode::While => {
                let retest = matches!(
                    self.flow.last(),
                    Some(FlowRecord::Block(b)) if b.kind == BlockKind::While && b.start_pos == pos
                );
                if !retest {
                    self.flow.push(FlowRecord::Block(BlockRecord {
                        kind: BlockKind::While,
                        start_pos: pos,
                        body_pos: 0,
                        control: None,
                        step: 1.0,
                        end_val: 0.0,
                        float_control: false,
                        branch_taken: false,
                    }));
                }
                st.pending_block = Some(PendingBlock {
                    kind: BlockKind::While,
                    kw_pos: pos,
                });
                Ok(Next::Expr(self.img.tokens.step(pos)))
            }
            CmdCode::For => {
                self.flow.push(FlowRecord::Block(BlockRecord {
                    kind: BlockKind::For,
                    start_pos: pos,
                    body_pos: 0,
                    control: None,
                    step: 1.0,
                    end_val: 0.0,
                    float_control: false,
                    branch_taken: false,
                }));
                st.pending_block = Some(PendingBlock {
                    kind: BlockKind::For,
                    kw_pos: pos,
                });
                Ok(Next::Expr(self.img.tokens.step(pos)))
            }
            CmdCode::ElseIf => {
                let taken = self
                    .innermost_if_record()
                    .map(|b| b.branch_taken)
                    .unwrap_or(false);
                if taken {
                    // branch done: follow the chain to the closing end
                    Ok(Next::Stmt(self.chain_to_end(pos)))
                } else {
                    st.pending_block = Some(PendingBlock {
                        kind: BlockKind::If,
                        kw_pos: pos,
                    });
                    Ok(Next::Expr(self.img.tokens.step(pos)))
                }
            }
            CmdCode::Else => {
                let taken = self
                    .innermost_if_record()
                    .map(|b| b.branch_taken)
                    .unwrap_or(false);
                if taken {
                    Ok(Next::Stmt(self.chain_to_end(pos)))
                } else {
                    if let Some(b) = self.innermost_if_record_mut() {
                        b.branch_taken = true;
                    }
                    Ok(Next::Expr(self.img.tokens.step(pos)))
                }
            }
            CmdCode::End => self.exec_end(pos, ofs, st),
            CmdCode::Break | CmdCode::Continue => self.exec_loop_ctl(cmd, st),
            CmdCode::Return
            | CmdCode::Stop
            | CmdCode::Quit
            | CmdCode::RaiseError
            | CmdCode::TrapErrors
            | CmdCode::ClearError
            | CmdCode::Go
            | CmdCode::Step
            | CmdCode::StepOver
            | CmdCode::StepOut
            | CmdCode::BStepOut
            | CmdCode::Loop
            | CmdCode::SetNextLine
            | CmdCode::Abort
            | CmdCode::Debug
            | CmdCode::BpOn
            | CmdCode::BpOff
            | CmdCode::BpActivate
            | CmdCode::SetBp
            | CmdCode::ClearBp
            | CmdCode::EnableBp
            | CmdCode::DisableBp
            | CmdCode::MoveBp
            | CmdCode::ListBp
            | CmdCode::Cout
            | CmdCode::CoutLine
            | CmdCode::CoutList
            | CmdCode::Print
            | CmdCode::PrintLine
            | CmdCode::PrintList
            | CmdCode::Vprint
            | CmdCode::ListVars
            | CmdCode::ListCallStack
            | CmdCode::ListFiles
            | CmdCode::Info
            | CmdCode::Input
            | CmdCode::DispWidth
            | CmdCode::FloatFmt
            | CmdCode::IntFmt
            | CmdCode::DispMode
            | CmdCode::TabSize
            | CmdCode::AngleMode
            | CmdCode::LoadProg => {
                st.active_cmd = Some((cmd, pos));
                Ok(Next::Expr(self.img.tokens.step(pos)))
            }
            _ => Ok(Next::Expr(self.img.tokens.step(pos))),
        }
    }

    fn innermost_if_record(&self) -> Option<&BlockRecord> {
        match self.flow.last() {
            Some(FlowRecord::Block(b)) if b.kind == BlockKind::If => Some(b),
            _ => None,
        }
    }

    fn innermost_if_record_mut(&mut self) -> Option<&mut BlockRecord> {
        match self.flow.last_mut() {
            Some(FlowRecord::Block(b)) if b.kind == BlockKind::If => Some(b),
            _ => None,
        }
    }

    /// Follow the if / elseif / else chain from `pos` to the closing
    /// `end`, returning the statement after it.
    fn chain_to_end(&self, pos: usize) -> usize {
        let mut cur = pos;
        for _ in 0..256 {
            match self.img.tokens.at(cur) {
                Tok::Keyword { code, ofs } => {
                    if CmdCode::from_u8(code) == Some(CmdCode::End) {
                        // land on the end statement itself so its
                        // handler pops the record
                        return cur;
                    }
                    cur = ofs as usize;
                }
                _ => break,
            }
        }
        cur
    }

    fn exec_end(&mut self, pos: usize, ofs: u16, st: &mut StmtState) -> Result<Next, Interrupt> {
        match self.flow.last() {
            Some(FlowRecord::Block(b)) => match b.kind {
                BlockKind::If => {
                    self.flow.pop();
                    Ok(Next::Expr(self.img.tokens.step(pos)))
                }
                BlockKind::While => {
                    let start = b.start_pos;
                    debug_assert_eq!(start, ofs as usize);
                    Ok(Next::Stmt(start))
                }
                BlockKind::For => self.iterate_for(pos),
            },
            Some(FlowRecord::Call(_)) => self.return_from_function(None, st),
            _ => {
                // end typed at the prompt outside any block
                Ok(Next::Expr(self.img.tokens.step(pos)))
            }
        }
    }

    fn iterate_for(&mut self, end_pos: usize) -> Result<Next, Interrupt> {
        let (target, step, end_val, float_control, body_pos) = match self.flow.last() {
            Some(FlowRecord::Block(b)) if b.kind == BlockKind::For => (
                b.control,
                b.step,
                b.end_val,
                b.float_control,
                b.body_pos,
            ),
            _ => return Err(ExecError::ArgTypeWrong.into()),
        };
        let target = target.ok_or(ExecError::ArgTypeWrong)?;
        let current = self
            .slot_value(target)
            .and_then(|v| v.as_f64())
            .ok_or(ExecError::ArgTypeWrong)?;
        let new = current + step;
        let continues = if step >= 0.0 {
            new <= end_val
        } else {
            new >= end_val
        };
        if continues {
            let value = if float_control {
                Value::Float(new as f32)
            } else {
                if new < i32::MIN as f64 || new > i32::MAX as f64 {
                    return Err(ExecError::Overflow.into());
                }
                Value::Long(new as i32)
            };
            self.write_scalar(target, value)?;
            Ok(Next::Stmt(body_pos))
        } else {
            self.flow.pop();
            // past the end statement's separator
            let after_kw = self.img.tokens.step(end_pos);
            Ok(Next::Stmt(self.img.tokens.step(after_kw)))
        }
    }

    fn exec_loop_ctl(&mut self, cmd: CmdCode, _st: &mut StmtState) -> Result<Next, Interrupt> {
        // innermost loop record above the innermost call boundary
        let mut loop_at = None;
        for (i, rec) in self.flow.iter().enumerate().rev() {
            match rec {
                FlowRecord::Block(b) if matches!(b.kind, BlockKind::For | BlockKind::While) => {
                    loop_at = Some(i);
                    break;
                }
                FlowRecord::Block(_) => continue,
                _ => break,
            }
        }
        let loop_at = loop_at.ok_or(ExecError::ArgTypeWrong)?;
        // drop blocks nested inside the loop
        while self.flow.len() > loop_at + 1 {
            self.flow.pop();
        }
        let (kind, start_pos) = match self.flow.last() {
            Some(FlowRecord::Block(b)) => (b.kind, b.start_pos),
            _ => unreachable!(),
        };
        let end_pos = match self.img.tokens.at(start_pos) {
            Tok::Keyword { ofs, .. } => ofs as usize,
            _ => return Err(ExecError::ArgTypeWrong.into()),
        };
        if cmd == CmdCode::Break {
            self.flow.pop();
            let after_kw = self.img.tokens.step(end_pos);
            Ok(Next::Stmt(self.img.tokens.step(after_kw)))
        } else {
            // continue: re-test the loop
            match kind {
                BlockKind::While => Ok(Next::Stmt(start_pos)),
                BlockKind::For => self.iterate_for(end_pos),
                BlockKind::If => unreachable!(),
            }
        }
    }

    // --- statement end ---

    fn end_statement(
        &mut self,
        sep_pos: usize,
        st: &mut StmtState,
        capture: bool,
        _entry_flow_depth: usize,
    ) -> Result<Next, Interrupt> {
        self.reduce(st.stmt_base, 0)?;
        let next = self.img.tokens.step(sep_pos);

        if let Some(pending) = st.pending_block.take() {
            let jump = self.settle_pending_block(pending, next, st)?;
            self.drop_eval_above(st.stmt_base);
            return Ok(jump);
        }

        if let Some((cmd, kw_pos)) = st.active_cmd.take() {
            let args = self.take_statement_args(st.stmt_base);
            // the dispatcher owns the stack from here: `return` pushes
            // its result above the caller's statement base
            return self.dispatch_command(cmd, kw_pos, args, sep_pos, st);
        }

        // expression statement
        if self.eval.len() > st.stmt_base {
            let entry = match self.eval.pop() {
                Some(EvalEntry::Operand(e)) => e,
                Some(other) => {
                    self.eval.push(other);
                    self.drop_eval_above(st.stmt_base);
                    return Ok(self.next_or_end(next));
                }
                None => return Ok(self.next_or_end(next)),
            };
            let value = entry.value.clone();
            self.drop_operand(entry);
            self.drop_eval_above(st.stmt_base);
            if capture {
                self.eval_captured = Some(value);
            } else if self.at_immediate_top_level(sep_pos) {
                if self.settings.print_results {
                    let text = format!("{}\n", self.format_value(&value));
                    self.write_console(&text);
                }
                self.push_fifo(value);
            }
        }
        Ok(self.next_or_end(next))
    }

    pub(crate) fn next_or_end(&self, next: usize) -> Next {
        match self.img.tokens.at(next) {
            Tok::None => Next::EndRun,
            _ => Next::Stmt(next),
        }
    }

    /// Is the finishing statement a top-level immediate one (FIFO
    /// target)?
    fn at_immediate_top_level(&self, sep_pos: usize) -> bool {
        if self.img.tokens.in_program_area(sep_pos) {
            return false;
        }
        let above = self
            .flow
            .deepest_debug()
            .map(|i| i + 1)
            .unwrap_or(0);
        !self.flow[above..]
            .iter()
            .any(|r| matches!(r, FlowRecord::Call(_) | FlowRecord::Eval(_)))
    }

    /// Pop the comma-separated operands of the finished statement.
    pub(crate) fn take_statement_args(&mut self, base: usize) -> Vec<StackEntry> {
        let mut args = Vec::new();
        while self.eval.len() > base {
            match self.eval.pop() {
                Some(EvalEntry::Operand(e)) => args.push(e),
                Some(_) | None => break,
            }
        }
        args.reverse();
        args
    }

    fn settle_pending_block(
        &mut self,
        pending: PendingBlock,
        body_pos: usize,
        st: &mut StmtState,
    ) -> Result<Next, Interrupt> {
        match pending.kind {
            BlockKind::For => {
                let args = self.take_statement_args(st.stmt_base);
                if args.is_empty() {
                    return Err(ExecError::ArgCountWrong.into());
                }
                let control = args[0]
                    .var
                    .as_ref()
                    .map(|v| v.target)
                    .ok_or(ExecError::ArgTypeWrong)?;
                let init = args[0].value.as_f64().ok_or(ExecError::ArgTypeWrong)?;
                let float_control = matches!(args[0].value, Value::Float(_));
                let end_val = args
                    .get(1)
                    .and_then(|a| a.value.as_f64())
                    .ok_or(ExecError::ArgTypeWrong)?;
                let step = match args.get(2) {
                    Some(a) => a.value.as_f64().ok_or(ExecError::ArgTypeWrong)?,
                    None => 1.0,
                };
                for a in args {
                    self.drop_operand(a);
                }
                let terminated = if step >= 0.0 {
                    init > end_val
                } else {
                    init < end_val
                };
                let start_pos = pending.kw_pos;
                match self.flow.last_mut() {
                    Some(FlowRecord::Block(b))
                        if b.kind == BlockKind::For && b.start_pos == start_pos =>
                    {
                        b.control = Some(control);
                        b.step = step;
                        b.end_val = end_val;
                        b.float_control = float_control;
                        b.body_pos = body_pos;
                    }
                    _ => return Err(ExecError::ArgTypeWrong.into()),
                }
                if terminated {
                    self.flow.pop();
                    Ok(Next::Stmt(self.skip_past_end(start_pos)))
                } else {
                    Ok(Next::Stmt(body_pos))
                }
            }
            BlockKind::While | BlockKind::If => {
                let args = self.take_statement_args(st.stmt_base);
                let cond = args.last().ok_or(ExecError::ArgCountWrong)?;
                if !cond.value.is_numeric() {
                    return Err(ExecError::ArgTypeWrong.into());
                }
                let truthy = cond.value.is_truthy();
                for a in args {
                    self.drop_operand(a);
                }
                if truthy {
                    if pending.kind == BlockKind::If {
                        if let Some(b) = self.innermost_if_record_mut() {
                            b.branch_taken = true;
                        }
                    } else if let Some(FlowRecord::Block(b)) = self.flow.last_mut() {
                        b.body_pos = body_pos;
                    }
                    Ok(Next::Stmt(body_pos))
                } else if pending.kind == BlockKind::While {
                    self.flow.pop();
                    Ok(Next::Stmt(self.skip_past_end(pending.kw_pos)))
                } else {
                    // if / elseif: jump to the next alternative
                    match self.img.tokens.at(pending.kw_pos) {
                        Tok::Keyword { ofs, .. } => Ok(Next::Stmt(ofs as usize)),
                        _ => Err(ExecError::ArgTypeWrong.into()),
                    }
                }
            }
        }
    }

    /// Statement after the `end` closing the block that starts at
    /// `start_pos`.
    fn skip_past_end(&self, start_pos: usize) -> usize {
        let end_pos = match self.img.tokens.at(start_pos) {
            Tok::Keyword { ofs, .. } => ofs as usize,
            _ => return start_pos,
        };
        let after_kw = self.img.tokens.step(end_pos);
        self.img.tokens.step(after_kw)
    }
}
