//! The interpreter object
//!
//! One `Machine` owns every piece of interpreter state: the program
//! image, the variable store, the accounting counters, the breakpoint
//! subsystem, the flow-control and evaluation stacks and the host
//! interfaces. The prompt loop feeds it one line at a time through
//! [`Machine::process_line`]; everything else (program loads, debug
//! resumption, deferred commands) happens behind that call.

use crate::breakpoints::Breakpoints;
use crate::error::{Event, ExecError, Interrupt, ParseDiag};
use crate::eval::EvalEntry;
use crate::flow::{FlowRecord, FlowStack, StmtState};
use crate::host::{Host, HostFlags};
use crate::parser::{ParseCtx, ParseMode, Parser, PendingAction};
use crate::program::ProgramImage;
use rill_core::accounting::ALL_CLASSES;
use rill_core::{HeapAudit, LastResults, Scope, StringClass, Value, VarStore};

/// One-shot stop condition armed by the debug step commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCondition {
    /// Stop at the next statement (`step`)
    Next,
    /// Stop at the next statement at the same or a shallower call depth
    /// (`stepOver`)
    NextAtDepth(usize),
    /// Stop once the call depth drops below the given one (`stepOut`)
    Shallower(usize),
    /// Stop once the flow stack drops below the given depth (`bStepOut`,
    /// `loop`)
    BlockExit(usize),
}

/// Debug command noted while an immediate line executes, acted upon when
/// the line completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCmd {
    Go,
    Step,
    StepOver,
    StepOut,
    BStepOut,
    Loop,
    Abort,
    SetNextLine(u32),
    /// `debug`: launch `main` stopped before its first statement
    Debug,
}

/// Display and numeric formatting settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub disp_width: u16,
    pub tab_size: u8,
    pub angle_degrees: bool,
    /// Float display precision for the print commands (None = shortest)
    pub float_precision: Option<u8>,
    pub float_specifier: char,
    pub int_specifier: char,
    /// Echo input statements back to the console
    pub echo_input: bool,
    /// Print top-level expression results
    pub print_results: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            disp_width: 80,
            tab_size: 8,
            angle_degrees: false,
            float_precision: None,
            float_specifier: 'g',
            int_specifier: 'd',
            echo_input: false,
            print_results: false,
        }
    }
}

/// Immediate-area snapshot (the parsed-statement-line stack element).
#[derive(Debug)]
pub struct ImmSnapshot {
    pub bytes: Vec<u8>,
    pub strings: Vec<Box<str>>,
}

pub struct Machine {
    pub(crate) img: ProgramImage,
    pub(crate) store: VarStore,
    pub(crate) audit: HeapAudit,
    pub(crate) fifo: LastResults,
    pub(crate) bp: Breakpoints,
    pub(crate) flow: Vec<FlowRecord>,
    pub(crate) eval: Vec<EvalEntry>,
    pub(crate) snapshots: Vec<ImmSnapshot>,
    pub(crate) host: Host,
    pub(crate) settings: Settings,
    pub(crate) trap_errors: bool,
    pub(crate) trapped_error: u16,
    pub(crate) pending: Vec<PendingAction>,
    pub(crate) pending_load: Option<String>,
    pub(crate) debug_request: Option<DebugCmd>,
    pub(crate) step_condition: Option<StepCondition>,
    pub(crate) cold_start: bool,
    pub(crate) quit: bool,
    /// Console output column (tab / col / pos)
    pub(crate) out_col: usize,
    /// Statements executed since the last housekeeping poll
    pub(crate) statements_since_poll: u32,
    /// Result captured by a nested `eval()` run
    pub(crate) eval_captured: Option<Value>,
}

impl Machine {
    pub fn new(host: Host) -> Self {
        Machine {
            img: ProgramImage::new(),
            store: VarStore::new(),
            audit: HeapAudit::new(),
            fifo: LastResults::new(),
            bp: Breakpoints::new(),
            flow: Vec::new(),
            eval: Vec::new(),
            snapshots: Vec::new(),
            host,
            settings: Settings::default(),
            trap_errors: false,
            trapped_error: 0,
            pending: Vec::new(),
            pending_load: None,
            debug_request: None,
            step_condition: None,
            cold_start: true,
            quit: false,
            out_col: 0,
            statements_since_poll: 0,
            eval_captured: None,
        }
    }

    pub fn wants_quit(&self) -> bool {
        self.quit
    }

    pub fn host_mut(&mut self) -> &mut Host {
        &mut self.host
    }

    /// Number of suspended (stopped) programs.
    pub fn stopped_count(&self) -> usize {
        self.flow
            .iter()
            .filter(|r| matches!(r, FlowRecord::Debug(_)))
            .count()
    }

    // --- console helpers ---

    pub(crate) fn write_console(&mut self, s: &str) {
        for part in s.split_inclusive('\n') {
            if part.ends_with('\n') {
                self.out_col = 0;
            } else {
                self.out_col += part.chars().count();
            }
        }
        self.host.console.write_str(s);
    }

    pub(crate) fn write_stream(&mut self, num: i32, s: &str) -> Result<(), ExecError> {
        match num {
            0 => {
                self.write_console(s);
                Ok(())
            }
            -4..=-1 => match self.host.stream(num) {
                Some(stream) => {
                    stream.write_str(s);
                    Ok(())
                }
                None => Err(ExecError::InvalidFileNumber),
            },
            1..=5 => self.host.fs.write(num as u8, s),
            _ => Err(ExecError::InvalidFileNumber),
        }
    }

    // --- parsing entry points ---

    /// Index of the deepest stopped function (for `#` scope resolution).
    pub(crate) fn deepest_stopped_func(&self) -> Option<usize> {
        let debug_at = self.flow.deepest_debug()?;
        self.flow[..debug_at]
            .iter()
            .rev()
            .find_map(|r| r.as_call().map(|c| c.func_index))
    }

    fn parse_into_immediate(&mut self, src: &str, mode: ParseMode) -> Result<(), ParseDiag> {
        // the previous immediate line is done with its string constants
        self.img.clear_imm_strings(&mut self.audit);
        let stopped_func = self.deepest_stopped_func();
        let mut ctx = ParseCtx {
            img: &mut self.img,
            store: &mut self.store,
            bp: &mut self.bp,
            audit: &mut self.audit,
            ext: &self.host.external,
            stopped_func,
            pending: &mut self.pending,
        };
        let result = Parser::new(&mut ctx, src, mode).parse();
        if result.is_err() {
            // the whole line is discarded on a parse error, including
            // any parse-time actions it queued
            self.img.tokens.start_immediate();
            self.img.clear_imm_strings(&mut self.audit);
            self.pending.clear();
        }
        result
    }

    /// Load (parse) a full program source. On failure the program area
    /// is cleared and the error is returned.
    pub fn load_program(&mut self, src: &str) -> Result<(), ParseDiag> {
        self.clear_program_state();
        let mut ctx = ParseCtx {
            img: &mut self.img,
            store: &mut self.store,
            bp: &mut self.bp,
            audit: &mut self.audit,
            ext: &self.host.external,
            stopped_func: None,
            pending: &mut self.pending,
        };
        let result = Parser::new(&mut ctx, src, ParseMode::Program).parse();
        match result {
            Ok(()) => {
                tracing::debug!(
                    functions = self.img.funcs.len(),
                    bytes = self.img.tokens.prog_len(),
                    "program parsed"
                );
                let Machine {
                    ref mut bp,
                    ref mut img,
                    ref mut audit,
                    ..
                } = *self;
                bp.rearm(&mut img.tokens, audit);
                Ok(())
            }
            Err(e) => {
                self.clear_program_state();
                Err(e)
            }
        }
    }

    /// Drop the parsed program, its variables and its functions. User
    /// variables survive; breakpoint rows go draft.
    pub(crate) fn clear_program_state(&mut self) {
        // any suspended program dies with the program
        self.unwind_all_stopped();
        self.bp.mark_draft();
        self.img.clear_program(&mut self.audit);
        self.store.clear_program_vars(&mut self.audit);
    }

    /// Full reset: program, user variables, FIFO, breakpoints. The audit
    /// is verified and cleared last.
    pub(crate) fn reset_machine(&mut self) {
        tracing::debug!("full machine reset");
        self.clear_program_state();
        self.img.tokens.start_immediate();
        self.img.clear_imm_strings(&mut self.audit);
        self.bp.clear_all(&mut self.audit);
        self.fifo.clear(&mut self.audit);
        self.store.clear_user_vars(&mut self.audit);
        self.drop_eval_above(0);
        self.audit.audit_and_clear(&ALL_CLASSES);
        self.trap_errors = false;
        self.trapped_error = 0;
    }

    // --- immediate line pipeline ---

    /// Parse and execute one line typed at the prompt. Parse and
    /// execution errors are reported to the console; events are handled
    /// here.
    pub fn process_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let src = ensure_terminated(line);
        if let Err(diag) = self.parse_into_immediate(&src, ParseMode::Immediate) {
            let msg = format!("  {}\n", diag);
            self.write_console(&msg);
            return;
        }

        let imm_base = self.img.tokens.imm_base();
        let outcome = self.run(imm_base, false);
        self.handle_run_outcome(outcome);

        self.apply_pending_actions();
        if let Some(path) = self.pending_load.take() {
            self.load_program_from_path(&path);
        }
        while let Some(cmd) = self.debug_request.take() {
            self.apply_debug_command(cmd);
        }
        self.cold_start = false;
    }

    fn handle_run_outcome(&mut self, outcome: Result<(), Interrupt>) {
        // one-shot step conditions never outlive the run they armed
        self.step_condition = None;
        match outcome {
            Ok(()) => {}
            Err(Interrupt::Error(e)) => {
                let msg = format!("  error {}: {}\n", e.code(), e);
                self.write_console(&msg);
                self.abort_current();
            }
            Err(Interrupt::Event(ev)) => match ev {
                Event::StopForDebug | Event::StopForBreakpoint => {
                    // suspension already printed the break header
                }
                Event::Abort => {
                    self.abort_current();
                    self.write_console("  program aborted\n");
                }
                Event::Quit => {
                    self.quit = true;
                }
                Event::Kill => {
                    self.reset_machine();
                    self.quit = true;
                }
                Event::ConsoleReset => {
                    // the host owns the physical re-routing
                    self.write_console("  console reset\n");
                }
            },
        }
    }

    fn apply_pending_actions(&mut self) {
        let actions = std::mem::take(&mut self.pending);
        for action in actions {
            match action {
                PendingAction::DeleteVars(names) => {
                    for name in names {
                        match self.store.find_user_name(&name) {
                            Some(idx) => match self.store.delete_user_var(idx, &mut self.audit) {
                                Ok(removed) => self.renumber_user_vars(removed),
                                Err(_) => {
                                    let msg =
                                        format!("  cannot delete {}: in use by program\n", name);
                                    self.write_console(&msg);
                                }
                            },
                            None => {
                                let msg = format!("  no user variable {}\n", name);
                                self.write_console(&msg);
                            }
                        }
                    }
                }
                PendingAction::ClearProg => self.clear_program_state(),
                PendingAction::ClearMem => self.reset_machine(),
            }
        }
    }

    /// After deleting user variable `removed`, later entries shifted
    /// down; renumber matching variable-reference tokens in the program
    /// area.
    fn renumber_user_vars(&mut self, removed: usize) {
        use crate::token::{varinfo, Tok};
        let mut pos = 0usize;
        loop {
            match self.img.tokens.at(pos) {
                Tok::None => break,
                Tok::VarRef {
                    info, value_index, ..
                } => {
                    if info & varinfo::SCOPE_MASK == Scope::User as u8
                        && value_index as usize > removed
                    {
                        self.img
                            .tokens
                            .rewrite_var_value_index(pos, value_index - 1);
                    }
                    pos = self.img.tokens.step(pos);
                }
                _ => pos = self.img.tokens.step(pos),
            }
        }
    }

    fn load_program_from_path(&mut self, path: &str) {
        match self.host.fs.read_all(path) {
            Ok(src) => match self.load_program(&src) {
                Ok(()) => {
                    let n = self.img.funcs.len();
                    let msg = format!("  program loaded ({} functions)\n", n);
                    self.write_console(&msg);
                }
                Err(diag) => {
                    let msg = format!("  {}\n", diag);
                    self.write_console(&msg);
                }
            },
            Err(e) => {
                let msg = format!("  cannot load {}: {}\n", path, e);
                self.write_console(&msg);
            }
        }
    }

    // --- suspension and resumption ---

    /// Suspend the running activity: push a debug frame, snapshot the
    /// immediate area, print the break header.
    pub(crate) fn suspend(
        &mut self,
        resume_pos: usize,
        saved_stmt: StmtState,
        event: Event,
    ) -> Interrupt {
        let frame = crate::flow::DebugFrame {
            resume_pos,
            flow_depth: self.flow.len(),
            eval_depth: self.eval.len(),
            saved_stmt,
        };
        self.flow.push(FlowRecord::Debug(frame));
        let bytes = self.img.tokens.snapshot_immediate();
        let strings = self.img.take_imm_strings();
        self.snapshots.push(ImmSnapshot { bytes, strings });
        self.print_break_header(resume_pos, event);
        Interrupt::Event(event)
    }

    fn print_break_header(&mut self, resume_pos: usize, event: Event) {
        let is_bp = event == Event::StopForBreakpoint;
        let levels = self.stopped_count();
        let width = self.settings.disp_width.max(30) as usize;
        let mut header = String::from(if is_bp { "\n-- BREAK " } else { "\n-- STOP " });
        if levels > 1 {
            header.push_str(&format!("-- [{}] ", levels));
        }
        while header.len() < width {
            header.push('-');
        }
        header.push('\n');
        self.write_console(&header);

        // view expression of the firing breakpoint, if any
        if is_bp {
            if let Some(idx) = self.bp.row_for_statement(resume_pos) {
                if let Some(view) = self.bp.row(idx).view.as_ref().map(|s| s.to_string()) {
                    if let Ok(Some(v)) = self.eval_watch_string(&view) {
                        let msg = format!("{}\n", v);
                        self.write_console(&msg);
                    }
                }
            }
        }

        let func_name = self
            .deepest_stopped_func()
            .map(|fi| self.img.funcs[fi].name.to_string())
            .unwrap_or_default();
        let line = self
            .bp
            .row_for_statement(resume_pos)
            .map(|i| self.bp.row(i).line)
            .or_else(|| self.bp.line_for_statement(&self.img.tokens, resume_pos));
        let stmt = self.pretty_print_statement(resume_pos);
        let msg = match line {
            Some(line) => format!("line {}: [{}] {}\n", line, func_name, stmt),
            None => format!("[{}] {}\n", func_name, stmt),
        };
        self.write_console(&msg);
    }

    /// Act on a debug command noted during the immediate line.
    fn apply_debug_command(&mut self, cmd: DebugCmd) {
        match cmd {
            DebugCmd::Debug => {
                self.launch_main_stopped();
                return;
            }
            DebugCmd::Abort => {
                if self.flow.deepest_debug().is_none() {
                    self.report_exec_error(ExecError::NoProgramStopped);
                    return;
                }
                self.abort_stopped();
                self.write_console("  program aborted\n");
                return;
            }
            _ => {}
        }

        let debug_at = match self.flow.deepest_debug() {
            Some(i) => i,
            None => {
                self.report_exec_error(ExecError::NoProgramStopped);
                return;
            }
        };
        // everything above the debug frame belongs to finished immediate
        // activity
        while self.flow.len() > debug_at + 1 {
            self.pop_flow_record();
        }
        let (mut resume_pos, saved_stmt, eval_depth) = match self.flow.pop() {
            Some(FlowRecord::Debug(d)) => (d.resume_pos, d.saved_stmt, d.eval_depth),
            _ => return,
        };
        self.drop_eval_above(eval_depth);
        if let Some(snapshot) = self.snapshots.pop() {
            self.img.tokens.restore_immediate(&snapshot.bytes);
            self.img
                .restore_imm_strings(snapshot.strings, &mut self.audit);
        }

        let call_depth = self.flow.call_depth();
        self.step_condition = match cmd {
            DebugCmd::Go => None,
            DebugCmd::Step => Some(StepCondition::Next),
            DebugCmd::StepOver => Some(StepCondition::NextAtDepth(call_depth)),
            DebugCmd::StepOut => Some(StepCondition::Shallower(call_depth)),
            DebugCmd::BStepOut | DebugCmd::Loop => {
                Some(StepCondition::BlockExit(self.flow.len()))
            }
            DebugCmd::SetNextLine(line) => {
                match self.statement_pos_for_line(line) {
                    Some(pos) => resume_pos = pos,
                    None => {
                        self.report_exec_error(ExecError::BpNotFound);
                        // fall through and stay stopped at the old spot
                    }
                }
                // setNextLine leaves the program stopped
                let interrupted = self.suspend(resume_pos, saved_stmt, Event::StopForDebug);
                let _ = interrupted;
                return;
            }
            DebugCmd::Debug | DebugCmd::Abort => unreachable!(),
        };

        let outcome = self.resume_run(resume_pos, saved_stmt);
        self.handle_run_outcome(outcome);
    }

    fn statement_pos_for_line(&self, line: u32) -> Option<usize> {
        let index = self.bp.ranges.line_to_index(line)?;
        crate::breakpoints::find_statement_for_index(&self.img.tokens, index)
    }

    /// `debug` command: run `main` suspended before its first statement.
    fn launch_main_stopped(&mut self) {
        if self.img.program_name.is_none() {
            self.report_exec_error(ExecError::NoProgram);
            return;
        }
        let src = "main();";
        if self.parse_into_immediate(src, ParseMode::Immediate).is_err() {
            self.report_exec_error(ExecError::UndefinedFunction);
            return;
        }
        self.step_condition = Some(StepCondition::Next);
        let imm_base = self.img.tokens.imm_base();
        let outcome = self.run(imm_base, false);
        self.handle_run_outcome(outcome);
    }

    pub(crate) fn report_exec_error(&mut self, e: ExecError) {
        let msg = format!("  error {}: {}\n", e.code(), e);
        self.write_console(&msg);
    }

    /// Abort the deepest *stopped* program (debug `abort` command).
    fn abort_stopped(&mut self) {
        let debug_at = match self.flow.deepest_debug() {
            Some(i) => i,
            None => return,
        };
        // frames above the debug frame, the frame itself, then the
        // stopped program's own frames down to the previous suspension
        while self.flow.len() > debug_at {
            self.pop_flow_record();
        }
        if let Some(snapshot) = self.snapshots.pop() {
            self.img.tokens.restore_immediate(&snapshot.bytes);
            self.img
                .restore_imm_strings(snapshot.strings, &mut self.audit);
        }
        let base = self
            .flow
            .deepest_debug()
            .map(|i| i + 1)
            .unwrap_or(0);
        while self.flow.len() > base {
            self.pop_flow_record();
        }
        let eval_base = match self.flow.deepest_debug() {
            Some(i) => match &self.flow[i] {
                FlowRecord::Debug(d) => d.eval_depth,
                _ => 0,
            },
            None => 0,
        };
        self.drop_eval_above(eval_base);
    }

    /// Abort the currently running program (abort event while running).
    pub(crate) fn abort_current(&mut self) {
        let base = self
            .flow
            .deepest_debug()
            .map(|i| i + 1)
            .unwrap_or(0);
        while self.flow.len() > base {
            self.pop_flow_record();
        }
        let eval_base = match self.flow.deepest_debug() {
            Some(i) => match &self.flow[i] {
                FlowRecord::Debug(d) => d.eval_depth,
                _ => 0,
            },
            None => 0,
        };
        self.drop_eval_above(eval_base);
    }

    /// Unwind every suspended program (program clear, kill).
    fn unwind_all_stopped(&mut self) {
        while self.flow.deepest_debug().is_some() {
            self.abort_stopped();
        }
        while !self.flow.is_empty() {
            self.pop_flow_record();
        }
        self.drop_eval_above(0);
        self.step_condition = None;
        self.debug_request = None;
    }

    /// Pop one flow record, releasing owned storage.
    pub(crate) fn pop_flow_record(&mut self) {
        match self.flow.pop() {
            Some(FlowRecord::Call(frame)) => self.release_call_frame(frame),
            Some(_) | None => {}
        }
    }

    pub(crate) fn release_call_frame(&mut self, frame: crate::flow::CallFrame) {
        for slot in frame.locals {
            match &slot.value {
                // array parameters alias the caller's storage; only
                // arrays this frame allocated are freed
                Some(Value::Array(id)) if !frame.local_arrays.contains(id) => {}
                _ => self
                    .store
                    .release_slot_value(slot, Scope::Local, &mut self.audit),
            }
        }
        self.audit.on_destroy(StringClass::LocalBase);
    }

    /// Poll the housekeeping callback and turn raised flags into events.
    pub(crate) fn poll_housekeeping(&mut self) -> Result<(), Interrupt> {
        self.statements_since_poll = 0;
        let mut flags = HostFlags::empty();
        if let Some(cb) = self.host.housekeep.as_mut() {
            cb(&mut flags);
        }
        if flags.contains(HostFlags::KILL) {
            return Err(Interrupt::Event(Event::Kill));
        }
        if flags.contains(HostFlags::ABORT) {
            return Err(Interrupt::Event(Event::Abort));
        }
        if flags.contains(HostFlags::STOP) {
            // promoted to a stop at the next statement boundary
            self.step_condition = Some(StepCondition::Next);
        }
        if flags.contains(HostFlags::CONSOLE_RESET) {
            return Err(Interrupt::Event(Event::ConsoleReset));
        }
        Ok(())
    }

    pub(crate) fn push_fifo(&mut self, value: Value) {
        self.fifo.push(value, &mut self.audit);
    }

    /// Last-results access for the `last()` built-in.
    pub fn last_result(&self, k: usize) -> Option<Value> {
        self.fifo.get(k)
    }

    /// Heap audit access (tests and `sysVal`).
    pub fn audit(&self) -> &HeapAudit {
        &self.audit
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

/// Append a statement separator when the text lacks one (eval strings,
/// watch expressions typed without `;`).
pub(crate) fn ensure_terminated(src: &str) -> String {
    let trimmed = src.trim_end();
    if trimmed.ends_with(';') {
        trimmed.to_string()
    } else {
        format!("{};", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_terminated() {
        assert_eq!(ensure_terminated("a+1"), "a+1;");
        assert_eq!(ensure_terminated("a+1; "), "a+1;");
        assert_eq!(ensure_terminated("cout(1);"), "cout(1);");
    }

    #[test]
    fn test_fresh_machine_is_balanced() {
        let m = Machine::new(Host::default());
        assert!(m.audit().all_balanced());
        assert!(!m.wants_quit());
        assert_eq!(m.stopped_count(), 0);
    }
}
