//! Built-in functions and command execution
//!
//! The executor hands finished statements here: the command dispatcher
//! consumes the evaluated argument list of a command statement, and
//! `call_internal` implements the internal function table over popped
//! evaluation-stack entries. Formatting (value display, `fmt()`, the
//! token pretty-printer for break headers and `listBP`) lives here too.

use crate::breakpoints::BpAttributes;
use crate::error::{Event, ExecError, Interrupt};
use crate::eval::{EntryFlags, Next, StackEntry, VarHandle};
use crate::flow::{FlowRecord, StmtState};
use crate::lexer::scan_value_list;
use crate::machine::{DebugCmd, Machine};
use crate::tables::{CmdCode, FnCode};
use crate::token::{varinfo, Tok};
use rill_core::{Scope, Value, MAX_ALPHA_CST_LEN};

/// `fmt()` flag bits (C printf conventions).
mod fmtflags {
    pub const LEFT: i32 = 0x01;
    pub const SIGN: i32 = 0x02;
    pub const SPACE: i32 = 0x04;
    pub const POINT: i32 = 0x08;
    pub const ZEROPAD: i32 = 0x10;
}

impl Machine {
    // --- argument helpers ---

    fn arg_long(args: &[StackEntry], i: usize) -> Result<i32, ExecError> {
        args.get(i)
            .and_then(|a| a.value.coerce_long())
            .ok_or(ExecError::ArgTypeWrong)
    }

    fn arg_f64(args: &[StackEntry], i: usize) -> Result<f64, ExecError> {
        args.get(i)
            .and_then(|a| a.value.as_f64())
            .ok_or(ExecError::ArgTypeWrong)
    }

    fn arg_str<'a>(args: &'a [StackEntry], i: usize) -> Result<&'a str, ExecError> {
        match args.get(i).map(|a| &a.value) {
            Some(Value::Str(_)) => Ok(args[i].value.as_str()),
            _ => Err(ExecError::ArgTypeWrong),
        }
    }

    fn arg_handle(args: &[StackEntry], i: usize) -> Result<VarHandle, ExecError> {
        args.get(i)
            .and_then(|a| a.var.clone())
            .ok_or(ExecError::ArgTypeWrong)
    }

    fn drop_args(&mut self, args: Vec<StackEntry>) {
        for a in args {
            self.drop_operand(a);
        }
    }

    fn finish(
        &mut self,
        args: Vec<StackEntry>,
        value: Value,
    ) -> Result<StackEntry, Interrupt> {
        self.drop_args(args);
        Ok(self.make_operand(value))
    }

    // --- value display ---

    /// Render a value for the print commands, honouring `floatFmt` /
    /// `intFmt`.
    pub(crate) fn format_value(&self, v: &Value) -> String {
        match v {
            Value::Long(n) => match self.settings.int_specifier {
                'x' => format!("{:x}", n),
                'X' => format!("{:X}", n),
                _ => format!("{}", n),
            },
            Value::Float(f) => match self.settings.float_precision {
                Some(p) => match self.settings.float_specifier {
                    'e' => format!("{:.*e}", p as usize, f),
                    'E' => format!("{:.*e}", p as usize, f).to_uppercase(),
                    'f' => format!("{:.*}", p as usize, f),
                    _ => format!("{}", Value::Float(*f)),
                },
                None => format!("{}", Value::Float(*f)),
            },
            _ => format!("{}", v),
        }
    }

    /// Exact, re-parseable rendering (`quote`, `cStr`).
    fn format_value_exact(v: &Value) -> String {
        match v {
            Value::Long(n) => format!("{}", n),
            Value::Float(f) => {
                let s = format!("{}", f);
                if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("NaN") {
                    s
                } else {
                    format!("{}.0", s)
                }
            }
            Value::Str(_) => v.as_str().to_string(),
            Value::Array(_) => String::new(),
        }
    }

    /// One print-command argument, applying tab / col modifiers.
    fn format_print_entry(&mut self, entry: &StackEntry) -> String {
        if entry.flags.contains(EntryFlags::PRINT_TAB) {
            let count = match entry.value.coerce_long() {
                Some(n) if n > 0 => n as usize,
                _ => 1,
            };
            let tab = self.settings.tab_size.max(1) as usize;
            let mut col = self.out_col;
            let mut out = String::new();
            for _ in 0..count {
                let spaces = tab - (col % tab);
                out.push_str(&" ".repeat(spaces));
                col += spaces;
            }
            return out;
        }
        if entry.flags.contains(EntryFlags::PRINT_COL) {
            let target = entry.value.coerce_long().unwrap_or(1).max(1) as usize - 1;
            if target > self.out_col {
                return " ".repeat(target - self.out_col);
            }
            return String::new();
        }
        self.format_value(&entry.value)
    }

    // --- command dispatch ---

    pub(crate) fn dispatch_command(
        &mut self,
        cmd: CmdCode,
        _kw_pos: usize,
        mut args: Vec<StackEntry>,
        sep_pos: usize,
        st: &mut StmtState,
    ) -> Result<Next, Interrupt> {
        let next = self.img.tokens.step(sep_pos);
        match cmd {
            CmdCode::Return => {
                let result = args.pop();
                self.drop_args(args);
                return self.return_from_function(result, st);
            }
            CmdCode::Stop => {
                self.drop_args(args);
                let saved = StmtState {
                    stmt_base: self.eval.len(),
                    active_cmd: None,
                    pending_block: None,
                };
                return Err(self.suspend(next, saved, Event::StopForDebug));
            }
            CmdCode::Quit => {
                self.drop_args(args);
                return Err(Event::Quit.into());
            }
            CmdCode::RaiseError => {
                let n = Self::arg_long(&args, 0)?;
                self.drop_args(args);
                if !(1..=8999).contains(&n) {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                return Err(ExecError::UserError(n as u16).into());
            }
            CmdCode::TrapErrors => {
                let on = args.first().map(|a| a.value.is_truthy()).unwrap_or(false);
                self.drop_args(args);
                self.trap_errors = on;
            }
            CmdCode::ClearError => {
                self.drop_args(args);
                self.trapped_error = 0;
            }

            // debug commands act once the immediate line finishes
            CmdCode::Go => self.note_debug(args, DebugCmd::Go)?,
            CmdCode::Step => self.note_debug(args, DebugCmd::Step)?,
            CmdCode::StepOver => self.note_debug(args, DebugCmd::StepOver)?,
            CmdCode::StepOut => self.note_debug(args, DebugCmd::StepOut)?,
            CmdCode::BStepOut => self.note_debug(args, DebugCmd::BStepOut)?,
            CmdCode::Loop => self.note_debug(args, DebugCmd::Loop)?,
            CmdCode::Abort => self.note_debug(args, DebugCmd::Abort)?,
            CmdCode::Debug => self.note_debug(args, DebugCmd::Debug)?,
            CmdCode::SetNextLine => {
                let line = Self::arg_long(&args, 0)?;
                self.drop_args(args);
                if line < 1 {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                self.debug_request = Some(DebugCmd::SetNextLine(line as u32));
            }

            // breakpoint management
            CmdCode::BpOn => {
                self.drop_args(args);
                self.bp.set_active(true);
            }
            CmdCode::BpOff => {
                self.drop_args(args);
                self.bp.set_active(false);
            }
            CmdCode::BpActivate => {
                self.drop_args(args);
                let Machine {
                    ref mut bp,
                    ref mut img,
                    ref mut audit,
                    ..
                } = *self;
                bp.rearm(&mut img.tokens, audit);
            }
            CmdCode::SetBp => {
                let line = Self::arg_long(&args, 0)?;
                let mut attrs = BpAttributes::default();
                if let Some(a) = args.get(1) {
                    match &a.value {
                        Value::Str(_) => attrs.view = Some(a.value.as_str().to_string()),
                        _ => return Err(ExecError::ArgTypeWrong.into()),
                    }
                }
                if let Some(a) = args.get(2) {
                    match &a.value {
                        Value::Str(_) => attrs.trigger = Some(a.value.as_str().to_string()),
                        _ => {
                            let n = a.value.coerce_long().ok_or(ExecError::ArgTypeWrong)?;
                            if n < 0 {
                                return Err(ExecError::ArgOutsideRange.into());
                            }
                            attrs.hit_target = n as u32;
                        }
                    }
                }
                self.drop_args(args);
                if line < 1 {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let Machine {
                    ref mut bp,
                    ref mut img,
                    ref mut audit,
                    ..
                } = *self;
                bp.set(&mut img.tokens, audit, line as u32, attrs)?;
            }
            CmdCode::ClearBp | CmdCode::EnableBp | CmdCode::DisableBp => {
                let mut lines = Vec::new();
                for i in 0..args.len() {
                    lines.push(Self::arg_long(&args, i)?);
                }
                self.drop_args(args);
                for line in lines {
                    if line < 1 {
                        return Err(ExecError::ArgOutsideRange.into());
                    }
                    let line = line as u32;
                    match cmd {
                        CmdCode::ClearBp => {
                            let Machine {
                                ref mut bp,
                                ref mut img,
                                ref mut audit,
                                ..
                            } = *self;
                            bp.clear(&mut img.tokens, audit, line)?;
                        }
                        CmdCode::EnableBp => self.bp.enable(line, true)?,
                        _ => self.bp.enable(line, false)?,
                    }
                }
            }
            CmdCode::MoveBp => {
                let from = Self::arg_long(&args, 0)?;
                let to = Self::arg_long(&args, 1)?;
                self.drop_args(args);
                if from < 1 || to < 1 {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let Machine {
                    ref mut bp,
                    ref mut img,
                    ref mut audit,
                    ..
                } = *self;
                bp.move_bp(&mut img.tokens, audit, from as u32, to as u32)?;
            }
            CmdCode::ListBp => {
                self.drop_args(args);
                self.list_breakpoints();
            }

            // output; arguments write one at a time so the tab / col
            // modifiers see the live output column
            CmdCode::Cout | CmdCode::CoutLine | CmdCode::CoutList => {
                for i in 0..args.len() {
                    if cmd == CmdCode::CoutList && i > 0 {
                        self.write_console(", ");
                    }
                    let part = self.format_print_entry(&args[i]);
                    self.write_console(&part);
                }
                if cmd == CmdCode::CoutLine {
                    self.write_console("\n");
                }
                self.drop_args(args);
            }
            CmdCode::Print | CmdCode::PrintLine | CmdCode::PrintList => {
                let stream = Self::arg_long(&args, 0)?;
                for i in 1..args.len() {
                    if cmd == CmdCode::PrintList && i > 1 {
                        self.write_stream(stream, ", ")?;
                    }
                    let part = self.format_print_entry(&args[i]);
                    self.write_stream(stream, &part)?;
                }
                if cmd == CmdCode::PrintLine {
                    self.write_stream(stream, "\n")?;
                }
                self.drop_args(args);
            }
            CmdCode::Vprint => {
                let handle = Self::arg_handle(&args, 0)?;
                let mut out = String::new();
                for a in args.iter().skip(1) {
                    out.push_str(&self.format_value(&a.value));
                }
                self.drop_args(args);
                if out.len() > MAX_ALPHA_CST_LEN {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                self.store_write(&handle, Value::str_from(&out))?;
            }
            CmdCode::ListVars => {
                self.drop_args(args);
                self.list_variables();
            }
            CmdCode::ListCallStack => {
                self.drop_args(args);
                self.list_call_stack();
            }
            CmdCode::ListFiles => {
                self.drop_args(args);
                let files = self.host.fs.list_files();
                for (name, size) in files {
                    let line = format!("  {}  {}\n", name, size);
                    self.write_console(&line);
                }
            }
            CmdCode::Info => {
                let prompt = Self::arg_str(&args, 0)?.to_string();
                let flags_var = args.get(1).and_then(|a| a.var.clone());
                self.drop_args(args);
                self.write_console(&prompt);
                let got = self.host.console.read_line().is_some();
                self.write_console("\n");
                if let Some(handle) = flags_var {
                    self.store_write(&handle, Value::Long(got as i32))?;
                }
            }
            CmdCode::Input => {
                let prompt = Self::arg_str(&args, 0)?.to_string();
                let var = Self::arg_handle(&args, 1)?;
                let flags_var = Self::arg_handle(&args, 2)?;
                self.drop_args(args);
                self.write_console(&prompt);
                match self.host.console.read_line() {
                    Some(line) => {
                        self.write_console("\n");
                        self.store_write(&var, Value::str_from(&line))?;
                        self.store_write(&flags_var, Value::Long(1))?;
                    }
                    None => {
                        self.write_console("\n");
                        self.store_write(&flags_var, Value::Long(0))?;
                    }
                }
            }

            // settings
            CmdCode::DispWidth => {
                let n = Self::arg_long(&args, 0)?;
                self.drop_args(args);
                if !(10..=255).contains(&n) {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                self.settings.disp_width = n as u16;
            }
            CmdCode::TabSize => {
                let n = Self::arg_long(&args, 0)?;
                self.drop_args(args);
                if !(2..=30).contains(&n) {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                self.settings.tab_size = n as u8;
            }
            CmdCode::AngleMode => {
                let n = Self::arg_long(&args, 0)?;
                self.drop_args(args);
                if !(0..=1).contains(&n) {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                self.settings.angle_degrees = n == 1;
            }
            CmdCode::FloatFmt => {
                let p = Self::arg_long(&args, 0)?;
                let spec = args.get(1).map(|a| &a.value).and_then(|v| match v {
                    Value::Str(_) => v.as_str().chars().next(),
                    _ => None,
                });
                self.drop_args(args);
                if !(0..=8).contains(&p) {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                self.settings.float_precision = Some(p as u8);
                if let Some(c) = spec {
                    if !matches!(c, 'f' | 'e' | 'E' | 'g' | 'G') {
                        return Err(ExecError::ArgOutsideRange.into());
                    }
                    self.settings.float_specifier = c;
                }
            }
            CmdCode::IntFmt => {
                let spec = Self::arg_str(&args, 0)?.chars().next();
                self.drop_args(args);
                match spec {
                    Some(c @ ('d' | 'x' | 'X')) => self.settings.int_specifier = c,
                    _ => return Err(ExecError::ArgOutsideRange.into()),
                }
            }
            CmdCode::DispMode => {
                let echo = Self::arg_long(&args, 0)?;
                let results = Self::arg_long(&args, 1)?;
                self.drop_args(args);
                if !(0..=1).contains(&echo) || !(0..=1).contains(&results) {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                self.settings.echo_input = echo == 1;
                self.settings.print_results = results == 1;
            }

            CmdCode::LoadProg => {
                let path = match args.first().map(|a| &a.value) {
                    Some(Value::Str(Some(_))) => args[0].value.as_str().to_string(),
                    Some(_) => return Err(ExecError::ArgTypeWrong.into()),
                    None => return Err(ExecError::ArgNonEmptyStringExpected.into()),
                };
                self.drop_args(args);
                self.pending_load = Some(path);
            }

            _ => {
                self.drop_args(args);
            }
        }
        Ok(self.next_or_end(next))
    }

    fn note_debug(&mut self, args: Vec<StackEntry>, cmd: DebugCmd) -> Result<(), Interrupt> {
        self.drop_args(args);
        self.debug_request = Some(cmd);
        Ok(())
    }

    fn list_breakpoints(&mut self) {
        if self.bp.is_draft() {
            self.write_console("  breakpoints: draft (program cleared)\n");
        }
        let mut out = String::new();
        for row in self.bp.rows() {
            out.push_str(&format!(
                "  line {:>4}  {}{}",
                row.line,
                if row.enabled { "enabled " } else { "disabled" },
                if row.hit_target > 0 {
                    format!("  hits {}/{}", row.hit_count, row.hit_target)
                } else {
                    String::new()
                },
            ));
            if let Some(view) = &row.view {
                out.push_str(&format!("  view: {}", view));
            }
            if let Some(trigger) = &row.trigger {
                out.push_str(&format!("  trigger: {}", trigger));
            }
            out.push('\n');
        }
        if out.is_empty() {
            out.push_str("  no breakpoints\n");
        }
        self.write_console(&out);
    }

    fn list_variables(&mut self) {
        let mut out = String::new();
        for i in 0..self.store.user_count() {
            let slot = self.store.user_slot(i);
            let value = slot.value.clone().unwrap_or(Value::Long(0));
            out.push_str(&format!(
                "  user   {} = {}\n",
                self.store.user_name(i),
                self.describe_slot_value(&value)
            ));
        }
        for i in 0..self.store.prog_name_count() {
            if self
                .store
                .prog_name_attrs(i)
                .contains(rill_core::VarAttr::HAS_GLOBAL_VALUE)
            {
                let value = self
                    .store
                    .global_slot(i)
                    .value
                    .clone()
                    .unwrap_or(Value::Long(0));
                out.push_str(&format!(
                    "  global {} = {}\n",
                    self.store.prog_name(i),
                    self.describe_slot_value(&value)
                ));
            }
        }
        if out.is_empty() {
            out.push_str("  no variables\n");
        }
        self.write_console(&out);
    }

    fn describe_slot_value(&self, value: &Value) -> String {
        match value {
            Value::Array(id) => match self.store.array(*id) {
                Some(a) => {
                    let dims: Vec<String> = a.dims[..a.dim_count()]
                        .iter()
                        .map(|d| d.to_string())
                        .collect();
                    format!("array({})", dims.join(","))
                }
                None => "array(?)".to_string(),
            },
            v => self.format_value(v),
        }
    }

    fn list_call_stack(&mut self) {
        let mut out = String::new();
        let mut depth = 0;
        for rec in self.flow.iter().rev() {
            match rec {
                FlowRecord::Call(c) => {
                    let name = self
                        .img
                        .funcs
                        .get(c.func_index)
                        .map(|f| f.name.as_ref())
                        .unwrap_or("?");
                    out.push_str(&format!("  {}: [{}]\n", depth, name));
                    depth += 1;
                }
                FlowRecord::Debug(_) => out.push_str("  -- stopped --\n"),
                _ => {}
            }
        }
        if out.is_empty() {
            out.push_str("  call stack empty\n");
        }
        self.write_console(&out);
    }

    // --- internal functions ---

    pub(crate) fn call_internal(
        &mut self,
        code: FnCode,
        args: Vec<StackEntry>,
    ) -> Result<StackEntry, Interrupt> {
        use FnCode::*;
        match code {
            // math on one float
            Sqrt | Sin | Cos | Tan | Asin | Acos | Atan | Ln | Lnp1 | Log10 | Exp | Expm1
            | Round | Ceil | Floor | Trunc | Square => {
                let x = Self::arg_f64(&args, 0)?;
                let deg = self.settings.angle_degrees;
                let v = match code {
                    Sqrt => {
                        if x < 0.0 {
                            return Err(ExecError::ArgOutsideRange.into());
                        }
                        x.sqrt()
                    }
                    Sin => to_rad(x, deg).sin(),
                    Cos => to_rad(x, deg).cos(),
                    Tan => to_rad(x, deg).tan(),
                    Asin => {
                        if !(-1.0..=1.0).contains(&x) {
                            return Err(ExecError::ArgOutsideRange.into());
                        }
                        from_rad(x.asin(), deg)
                    }
                    Acos => {
                        if !(-1.0..=1.0).contains(&x) {
                            return Err(ExecError::ArgOutsideRange.into());
                        }
                        from_rad(x.acos(), deg)
                    }
                    Atan => from_rad(x.atan(), deg),
                    Ln => {
                        if x <= 0.0 {
                            return Err(ExecError::ArgOutsideRange.into());
                        }
                        x.ln()
                    }
                    Lnp1 => {
                        if x <= -1.0 {
                            return Err(ExecError::ArgOutsideRange.into());
                        }
                        x.ln_1p()
                    }
                    Log10 => {
                        if x <= 0.0 {
                            return Err(ExecError::ArgOutsideRange.into());
                        }
                        x.log10()
                    }
                    Exp => x.exp(),
                    Expm1 => x.exp_m1(),
                    Round => x.round(),
                    Ceil => x.ceil(),
                    Floor => x.floor(),
                    Trunc => x.trunc(),
                    Square => x * x,
                    _ => unreachable!(),
                };
                let v = v as f32;
                if !v.is_finite() {
                    return Err(ExecError::Overflow.into());
                }
                self.finish(args, Value::Float(v))
            }

            Abs => {
                let value = match args.first().map(|a| &a.value) {
                    Some(Value::Long(v)) => {
                        Value::Long(v.checked_abs().ok_or(ExecError::Overflow)?)
                    }
                    Some(Value::Float(v)) => Value::Float(v.abs()),
                    _ => return Err(ExecError::ArgTypeWrong.into()),
                };
                self.finish(args, value)
            }
            Sign => {
                let x = Self::arg_f64(&args, 0)?;
                let v = if x > 0.0 {
                    1
                } else if x < 0.0 {
                    -1
                } else {
                    0
                };
                self.finish(args, Value::Long(v))
            }
            Min | Max => {
                let a = Self::arg_f64(&args, 0)?;
                let b = Self::arg_f64(&args, 1)?;
                let take_first = if code == Min { a <= b } else { a >= b };
                let value = args[if take_first { 0 } else { 1 }].value.clone();
                self.finish(args, value)
            }
            Fmod => {
                let a = Self::arg_f64(&args, 0)?;
                let b = Self::arg_f64(&args, 1)?;
                if b == 0.0 {
                    return Err(ExecError::ModByZero.into());
                }
                self.finish(args, Value::Float((a % b) as f32))
            }
            Pow => {
                let a = Self::arg_f64(&args, 0)?;
                let b = Self::arg_f64(&args, 1)?;
                let v = a.powf(b) as f32;
                if !v.is_finite() {
                    return Err(ExecError::Overflow.into());
                }
                self.finish(args, Value::Float(v))
            }

            // lookup
            Ifte => {
                let mut i = 0;
                let value = loop {
                    if i + 1 >= args.len() {
                        break args.get(i).map(|a| a.value.clone()).unwrap_or(Value::Long(0));
                    }
                    if !args[i].value.is_numeric() {
                        return Err(ExecError::ArgTypeWrong.into());
                    }
                    if args[i].value.is_truthy() {
                        break args[i + 1].value.clone();
                    }
                    i += 2;
                };
                self.finish(args, value)
            }
            Switch => {
                let test = args.first().ok_or(ExecError::ArgCountWrong)?.value.clone();
                let mut i = 1;
                let value = loop {
                    if i + 1 >= args.len() {
                        break args.get(i).map(|a| a.value.clone()).unwrap_or(Value::Long(0));
                    }
                    if values_equal(&test, &args[i].value) {
                        break args[i + 1].value.clone();
                    }
                    i += 2;
                };
                self.finish(args, value)
            }
            Index => {
                let test = args.first().ok_or(ExecError::ArgCountWrong)?.value.clone();
                let mut found = 0i32;
                for (k, a) in args.iter().enumerate().skip(1) {
                    if values_equal(&test, &a.value) {
                        found = k as i32;
                        break;
                    }
                }
                self.finish(args, Value::Long(found))
            }
            Choose => {
                let n = Self::arg_long(&args, 0)?;
                if n < 1 || n as usize >= args.len() {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let value = args[n as usize].value.clone();
                self.finish(args, value)
            }

            // conversions
            CInt => {
                let value = match args.first().map(|a| &a.value) {
                    Some(Value::Long(v)) => Value::Long(*v),
                    Some(Value::Float(f)) => {
                        let t = f.trunc();
                        if t < i32::MIN as f32 || t > i32::MAX as f32 {
                            return Err(ExecError::Overflow.into());
                        }
                        Value::Long(t as i32)
                    }
                    _ => return Err(ExecError::ArgTypeWrong.into()),
                };
                self.finish(args, value)
            }
            CFloat => {
                let x = Self::arg_f64(&args, 0)?;
                self.finish(args, Value::Float(x as f32))
            }
            CStr => {
                let value = match args.first().map(|a| &a.value) {
                    Some(v @ (Value::Long(_) | Value::Float(_))) => {
                        Value::str_from(&Self::format_value_exact(v))
                    }
                    Some(Value::Str(_)) => args[0].value.clone(),
                    _ => return Err(ExecError::ArgTypeWrong.into()),
                };
                self.finish(args, value)
            }

            // timing
            Millis => {
                let v = self.host.clock.millis() as i32;
                self.finish(args, Value::Long(v))
            }
            Micros => {
                let v = self.host.clock.micros() as i32;
                self.finish(args, Value::Long(v))
            }
            Wait => {
                let ms = Self::arg_long(&args, 0)?;
                if ms < 0 {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                self.host.clock.delay_ms(ms as u32);
                self.poll_housekeeping()?;
                self.finish(args, Value::Long(ms))
            }

            // bits and bytes
            Bit => {
                let n = Self::arg_long(&args, 0)?;
                if !(0..=31).contains(&n) {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                self.finish(args, Value::Long(1i32.wrapping_shl(n as u32)))
            }
            BitRead => {
                let v = Self::arg_long(&args, 0)?;
                let b = Self::arg_long(&args, 1)?;
                if !(0..=31).contains(&b) {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                self.finish(args, Value::Long((v >> b) & 1))
            }
            BitSet | BitClear => {
                let handle = Self::arg_handle(&args, 0)?;
                let v = Self::arg_long(&args, 0)?;
                let b = Self::arg_long(&args, 1)?;
                if !(0..=31).contains(&b) {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let new = if code == BitSet {
                    v | (1 << b)
                } else {
                    v & !(1 << b)
                };
                self.store_write(&handle, Value::Long(new))?;
                self.finish(args, Value::Long(new))
            }
            BitWrite => {
                let handle = Self::arg_handle(&args, 0)?;
                let v = Self::arg_long(&args, 0)?;
                let b = Self::arg_long(&args, 1)?;
                let x = Self::arg_long(&args, 2)?;
                if !(0..=31).contains(&b) {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let new = if x != 0 { v | (1 << b) } else { v & !(1 << b) };
                self.store_write(&handle, Value::Long(new))?;
                self.finish(args, Value::Long(new))
            }
            ByteRead => {
                let v = Self::arg_long(&args, 0)?;
                let k = Self::arg_long(&args, 1)?;
                if !(0..=3).contains(&k) {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                self.finish(args, Value::Long((v >> (8 * k)) & 0xFF))
            }
            ByteWrite => {
                let handle = Self::arg_handle(&args, 0)?;
                let v = Self::arg_long(&args, 0)?;
                let k = Self::arg_long(&args, 1)?;
                let x = Self::arg_long(&args, 2)?;
                if !(0..=3).contains(&k) || !(0..=255).contains(&x) {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let new = (v & !(0xFF << (8 * k))) | (x << (8 * k));
                self.store_write(&handle, Value::Long(new))?;
                self.finish(args, Value::Long(new))
            }
            MaskedWordRead => {
                let v = Self::arg_long(&args, 0)?;
                let m = Self::arg_long(&args, 1)?;
                self.finish(args, Value::Long(v & m))
            }
            MaskedWordClear | MaskedWordSet => {
                let handle = Self::arg_handle(&args, 0)?;
                let v = Self::arg_long(&args, 0)?;
                let m = Self::arg_long(&args, 1)?;
                let new = if code == MaskedWordSet { v | m } else { v & !m };
                self.store_write(&handle, Value::Long(new))?;
                self.finish(args, Value::Long(new))
            }
            MaskedWordWrite => {
                let handle = Self::arg_handle(&args, 0)?;
                let v = Self::arg_long(&args, 0)?;
                let m = Self::arg_long(&args, 1)?;
                let x = Self::arg_long(&args, 2)?;
                let new = (v & !m) | (x & m);
                self.store_write(&handle, Value::Long(new))?;
                self.finish(args, Value::Long(new))
            }

            // strings
            Char => {
                let n = Self::arg_long(&args, 0)?;
                if !(1..=255).contains(&n) {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let s = ((n as u8) as char).to_string();
                self.finish(args, Value::str_from(&s))
            }
            Asc => {
                let s = Self::arg_str(&args, 0)?;
                if s.is_empty() {
                    return Err(ExecError::ArgNonEmptyStringExpected.into());
                }
                let pos = match args.get(1) {
                    Some(_) => Self::arg_long(&args, 1)?,
                    None => 1,
                };
                if pos < 1 || pos as usize > s.len() {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let byte = s.as_bytes()[pos as usize - 1] as i32;
                self.finish(args, Value::Long(byte))
            }
            Len => {
                let s = Self::arg_str(&args, 0)?;
                let n = s.len() as i32;
                self.finish(args, Value::Long(n))
            }
            Nl => self.finish(args, Value::str_from("\n")),
            Ltrim => {
                let s = Self::arg_str(&args, 0)?.trim_start().to_string();
                self.finish(args, Value::str_from(&s))
            }
            Rtrim => {
                let s = Self::arg_str(&args, 0)?.trim_end().to_string();
                self.finish(args, Value::str_from(&s))
            }
            Trim => {
                let s = Self::arg_str(&args, 0)?.trim().to_string();
                self.finish(args, Value::str_from(&s))
            }
            Left => {
                let s = Self::arg_str(&args, 0)?;
                let n = Self::arg_long(&args, 1)?;
                if n < 0 {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let out: String = s.chars().take(n as usize).collect();
                self.finish(args, Value::str_from(&out))
            }
            Right => {
                let s = Self::arg_str(&args, 0)?;
                let n = Self::arg_long(&args, 1)?;
                if n < 0 {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let len = s.chars().count();
                let skip = len.saturating_sub(n as usize);
                let out: String = s.chars().skip(skip).collect();
                self.finish(args, Value::str_from(&out))
            }
            Mid => {
                let s = Self::arg_str(&args, 0)?;
                let start = Self::arg_long(&args, 1)?;
                let n = Self::arg_long(&args, 2)?;
                if start < 1 || n < 0 {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let out: String = s
                    .chars()
                    .skip(start as usize - 1)
                    .take(n as usize)
                    .collect();
                self.finish(args, Value::str_from(&out))
            }
            ToUpper => {
                let s = Self::arg_str(&args, 0)?.to_uppercase();
                self.finish(args, Value::str_from(&s))
            }
            ToLower => {
                let s = Self::arg_str(&args, 0)?.to_lowercase();
                self.finish(args, Value::str_from(&s))
            }
            Space => {
                let n = Self::arg_long(&args, 0)?;
                if n < 0 || n as usize > MAX_ALPHA_CST_LEN {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                self.finish(args, Value::str_from(&" ".repeat(n as usize)))
            }
            RepeatChar => {
                let s = Self::arg_str(&args, 0)?;
                let n = Self::arg_long(&args, 1)?;
                if s.chars().count() != 1 {
                    return Err(ExecError::ArgNonEmptyStringExpected.into());
                }
                if n < 0 || n as usize > MAX_ALPHA_CST_LEN {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let out = s.repeat(n as usize);
                self.finish(args, Value::str_from(&out))
            }
            ReplaceChar => {
                let s = Self::arg_str(&args, 0)?;
                let from = Self::arg_str(&args, 1)?;
                let to = Self::arg_str(&args, 2)?;
                let (from_c, to_c) = match (from.chars().next(), to.chars().next()) {
                    (Some(f), Some(t)) if from.chars().count() == 1 && to.chars().count() == 1 => {
                        (f, t)
                    }
                    _ => return Err(ExecError::ArgNonEmptyStringExpected.into()),
                };
                let out: String = s
                    .chars()
                    .map(|c| if c == from_c { to_c } else { c })
                    .collect();
                self.finish(args, Value::str_from(&out))
            }
            ReplaceStr => {
                let s = Self::arg_str(&args, 0)?;
                let find = Self::arg_str(&args, 1)?;
                let repl = Self::arg_str(&args, 2)?;
                if find.is_empty() {
                    return Err(ExecError::ArgNonEmptyStringExpected.into());
                }
                let out = s.replace(find, repl);
                if out.len() > MAX_ALPHA_CST_LEN {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                self.finish(args, Value::str_from(&out))
            }
            FindStr => {
                let s = Self::arg_str(&args, 0)?;
                let find = Self::arg_str(&args, 1)?;
                if find.is_empty() {
                    return Err(ExecError::ArgNonEmptyStringExpected.into());
                }
                let start = match args.get(2) {
                    Some(_) => Self::arg_long(&args, 2)?,
                    None => 1,
                };
                if start < 1 || (start as usize) > s.len() + 1 {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let v = s[start as usize - 1..]
                    .find(find)
                    .map(|i| i as i32 + start)
                    .unwrap_or(0);
                self.finish(args, Value::Long(v))
            }
            StrCmp | StrCaseCmp => {
                let a = Self::arg_str(&args, 0)?;
                let b = Self::arg_str(&args, 1)?;
                let ord = if code == StrCmp {
                    a.cmp(b)
                } else {
                    a.to_lowercase().cmp(&b.to_lowercase())
                };
                let v = match ord {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                };
                self.finish(args, Value::Long(v))
            }
            AscToHexStr => {
                let s = Self::arg_str(&args, 0)?;
                if s.len() * 2 > MAX_ALPHA_CST_LEN {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let out: String = s.bytes().map(|b| format!("{:02X}", b)).collect();
                self.finish(args, Value::str_from(&out))
            }
            HexStrToAsc => {
                let s = Self::arg_str(&args, 0)?;
                if s.len() % 2 != 0 {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let mut out = String::with_capacity(s.len() / 2);
                for chunk in s.as_bytes().chunks(2) {
                    let hex = std::str::from_utf8(chunk).unwrap_or("");
                    let byte =
                        u8::from_str_radix(hex, 16).map_err(|_| ExecError::ArgTypeWrong)?;
                    out.push(byte as char);
                }
                self.finish(args, Value::str_from(&out))
            }
            Quote => {
                let value = match args.first().map(|a| &a.value) {
                    Some(v @ (Value::Long(_) | Value::Float(_))) => Self::format_value_exact(v),
                    Some(Value::Str(_)) => {
                        let s = args[0].value.as_str();
                        let mut out = String::with_capacity(s.len() + 2);
                        out.push('"');
                        for c in s.chars() {
                            match c {
                                '"' => out.push_str("\\\""),
                                '\\' => out.push_str("\\\\"),
                                c => out.push(c),
                            }
                        }
                        out.push('"');
                        out
                    }
                    _ => return Err(ExecError::ArgTypeWrong.into()),
                };
                if value.len() > MAX_ALPHA_CST_LEN {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                self.finish(args, Value::str_from(&value))
            }
            IsAlpha | IsAlphaNumeric | IsDigit | IsHexDigit | IsSpace | IsUpperCase
            | IsLowerCase => {
                let s = Self::arg_str(&args, 0)?;
                let c = s.chars().next().ok_or(ExecError::ArgNonEmptyStringExpected)?;
                let v = match code {
                    IsAlpha => c.is_ascii_alphabetic(),
                    IsAlphaNumeric => c.is_ascii_alphanumeric(),
                    IsDigit => c.is_ascii_digit(),
                    IsHexDigit => c.is_ascii_hexdigit(),
                    IsSpace => c.is_ascii_whitespace(),
                    IsUpperCase => c.is_ascii_uppercase(),
                    _ => c.is_ascii_lowercase(),
                };
                self.finish(args, Value::Long(v as i32))
            }

            // meta
            Ubound => {
                let id = match args.first().map(|a| &a.value) {
                    Some(Value::Array(id)) => *id,
                    _ => return Err(ExecError::ArgTypeWrong.into()),
                };
                let dim = Self::arg_long(&args, 1)?;
                let storage = self.store.array(id).ok_or(ExecError::ArgTypeWrong)?;
                let v = storage
                    .ubound(dim.max(0) as usize)
                    .ok_or(ExecError::ArgOutsideRange)?;
                self.finish(args, Value::Long(v))
            }
            Dims => {
                let id = match args.first().map(|a| &a.value) {
                    Some(Value::Array(id)) => *id,
                    _ => return Err(ExecError::ArgTypeWrong.into()),
                };
                let storage = self.store.array(id).ok_or(ExecError::ArgTypeWrong)?;
                let v = storage.dim_count() as i32;
                self.finish(args, Value::Long(v))
            }
            Type => {
                let v = match args.first().map(|a| &a.value) {
                    Some(Value::Long(_)) => 1,
                    Some(Value::Float(_)) => 2,
                    Some(Value::Str(_)) => 3,
                    Some(Value::Array(_)) => 4,
                    None => return Err(ExecError::ArgCountWrong.into()),
                };
                self.finish(args, Value::Long(v))
            }
            Last => {
                let k = match args.first() {
                    Some(_) => Self::arg_long(&args, 0)?,
                    None => 1,
                };
                if k < 1 {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let value = self
                    .fifo
                    .get(k as usize)
                    .ok_or(ExecError::ArgOutsideRange)?;
                self.finish(args, value)
            }
            ErrVal => {
                let v = self.trapped_error as i32;
                self.finish(args, Value::Long(v))
            }
            IsColdStart => {
                let v = self.cold_start as i32;
                self.finish(args, Value::Long(v))
            }
            SysVal => {
                let n = Self::arg_long(&args, 0)?;
                let value = self.sys_val(n)?;
                self.finish(args, value)
            }

            // formatting
            Fmt => self.builtin_fmt(args),
            Tab => {
                let n = match args.first() {
                    Some(_) => Self::arg_long(&args, 0)?,
                    None => 1,
                };
                if n < 1 {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let mut entry = self.make_operand(Value::Long(n));
                entry.flags |= EntryFlags::PRINT_TAB;
                self.drop_args(args);
                Ok(entry)
            }
            Col => {
                let n = Self::arg_long(&args, 0)?;
                if n < 1 {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let mut entry = self.make_operand(Value::Long(n));
                entry.flags |= EntryFlags::PRINT_COL;
                self.drop_args(args);
                Ok(entry)
            }
            Pos => {
                let v = self.out_col as i32 + 1;
                self.finish(args, Value::Long(v))
            }

            // stream I/O
            Cin => {
                let v = self.host.console.read_byte().map(|b| b as i32).unwrap_or(-1);
                self.finish(args, Value::Long(v))
            }
            CinLine => {
                let s = self.host.console.read_line().unwrap_or_default();
                self.finish(args, Value::str_from(&s))
            }
            Read => {
                let stream = Self::arg_long(&args, 0)?;
                let v = self.read_stream_byte(stream)?.map(|b| b as i32).unwrap_or(-1);
                self.finish(args, Value::Long(v))
            }
            ReadLine => {
                let stream = Self::arg_long(&args, 0)?;
                let s = self.read_stream_line(stream)?.unwrap_or_default();
                self.finish(args, Value::str_from(&s))
            }
            Peek => {
                let stream = Self::arg_long(&args, 0)?;
                let v = self.peek_stream_byte(stream)?.map(|b| b as i32).unwrap_or(-1);
                self.finish(args, Value::Long(v))
            }
            Available => {
                let stream = Self::arg_long(&args, 0)?;
                let v = self.stream_available(stream)?;
                self.finish(args, Value::Long(v))
            }
            Flush => {
                let stream = Self::arg_long(&args, 0)?;
                if let Some(s) = self.host.stream(stream) {
                    s.flush();
                }
                self.finish(args, Value::Long(0))
            }
            SetTimeout => {
                let stream = Self::arg_long(&args, 0)?;
                let ms = Self::arg_long(&args, 1)?;
                if ms < 0 {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                match self.host.stream(stream) {
                    Some(s) => s.set_timeout_ms(ms as u32),
                    None => return Err(ExecError::InvalidFileNumber.into()),
                }
                self.finish(args, Value::Long(ms))
            }
            GetTimeout => {
                let stream = Self::arg_long(&args, 0)?;
                let v = match self.host.stream(stream) {
                    Some(s) => s.timeout_ms() as i32,
                    None => return Err(ExecError::InvalidFileNumber.into()),
                };
                self.finish(args, Value::Long(v))
            }
            ReadList | CinList | VreadList => self.builtin_read_list(code, args),

            // files
            Open => {
                let path = Self::arg_str(&args, 0)?.to_string();
                if path.is_empty() {
                    return Err(ExecError::ArgNonEmptyStringExpected.into());
                }
                let mode = match args.get(1) {
                    Some(_) => Self::arg_long(&args, 1)?,
                    None => 0x01,
                };
                if !(0..=0x7F).contains(&mode) {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                let n = self.host.fs.open(&path, mode as u8)?;
                self.finish(args, Value::Long(n as i32))
            }
            Close => {
                let n = self.file_num_arg(&args, 0)?;
                self.host.fs.close(n)?;
                self.finish(args, Value::Long(0))
            }
            CloseAll => {
                self.host.fs.close_all();
                self.finish(args, Value::Long(0))
            }
            Position => {
                let n = self.file_num_arg(&args, 0)?;
                let v = self.host.fs.position(n)? as i32;
                self.finish(args, Value::Long(v))
            }
            Size => {
                let n = self.file_num_arg(&args, 0)?;
                let v = self.host.fs.size(n)? as i32;
                self.finish(args, Value::Long(v))
            }
            Seek => {
                let n = self.file_num_arg(&args, 0)?;
                let to = Self::arg_long(&args, 1)?;
                if to < 0 {
                    return Err(ExecError::ArgOutsideRange.into());
                }
                self.host.fs.seek(n, to as u32)?;
                self.finish(args, Value::Long(0))
            }
            Exists => {
                let path = Self::arg_str(&args, 0)?;
                let v = self.host.fs.exists(path) as i32;
                self.finish(args, Value::Long(v))
            }
            Remove => {
                let path = Self::arg_str(&args, 0)?.to_string();
                self.host.fs.remove(&path)?;
                self.finish(args, Value::Long(0))
            }
            FileNum => {
                let path = Self::arg_str(&args, 0)?;
                let v = self.host.fs.file_num_of(path) as i32;
                self.finish(args, Value::Long(v))
            }
            IsInUse => {
                let n = self.file_num_arg(&args, 0)?;
                let v = self.host.fs.is_open(n) as i32;
                self.finish(args, Value::Long(v))
            }

            // eval() is intercepted in the executor
            Eval => Err(ExecError::ArgTypeWrong.into()),
        }
    }

    fn file_num_arg(&self, args: &[StackEntry], i: usize) -> Result<u8, ExecError> {
        let n = Self::arg_long(args, i)?;
        if !(1..=5).contains(&n) {
            return Err(ExecError::InvalidFileNumber);
        }
        Ok(n as u8)
    }

    fn read_stream_byte(&mut self, num: i32) -> Result<Option<u8>, ExecError> {
        match num {
            1..=5 => self.host.fs.read_byte(num as u8),
            _ => self
                .host
                .stream(num)
                .ok_or(ExecError::InvalidFileNumber)
                .map(|s| s.read_byte()),
        }
    }

    fn peek_stream_byte(&mut self, num: i32) -> Result<Option<u8>, ExecError> {
        match num {
            1..=5 => self.host.fs.peek_byte(num as u8),
            _ => self
                .host
                .stream(num)
                .ok_or(ExecError::InvalidFileNumber)
                .map(|s| s.peek_byte()),
        }
    }

    fn read_stream_line(&mut self, num: i32) -> Result<Option<String>, ExecError> {
        match num {
            1..=5 => self.host.fs.read_line(num as u8),
            _ => self
                .host
                .stream(num)
                .ok_or(ExecError::InvalidFileNumber)
                .map(|s| s.read_line()),
        }
    }

    fn stream_available(&mut self, num: i32) -> Result<i32, ExecError> {
        match num {
            1..=5 => self.host.fs.available(num as u8).map(|v| v as i32),
            _ => self
                .host
                .stream(num)
                .ok_or(ExecError::InvalidFileNumber)
                .map(|s| s.available() as i32),
        }
    }

    /// `readList` / `cinList` / `vreadList`: lex a comma-separated value
    /// list and assign into the variable arguments. Returns the number
    /// of values assigned.
    fn builtin_read_list(
        &mut self,
        code: FnCode,
        args: Vec<StackEntry>,
    ) -> Result<StackEntry, Interrupt> {
        let (text, first_var) = match code {
            FnCode::CinList => {
                let s = self.host.console.read_line().unwrap_or_default();
                (s, 0)
            }
            FnCode::ReadList => {
                let stream = Self::arg_long(&args, 0)?;
                let s = self.read_stream_line(stream)?.unwrap_or_default();
                (s, 1)
            }
            _ => {
                let s = Self::arg_str(&args, 0)?.to_string();
                (s, 1)
            }
        };
        let values = scan_value_list(&text);
        let mut assigned = 0i32;
        for (value, arg) in values.into_iter().zip(args.iter().skip(first_var)) {
            let handle = arg.var.clone().ok_or(ExecError::ArgTypeWrong)?;
            self.store_write(&handle, value)?;
            assigned += 1;
        }
        self.finish(args, Value::Long(assigned))
    }

    fn sys_val(&self, n: i32) -> Result<Value, ExecError> {
        use rill_core::accounting::ALL_CLASSES;
        let value = match n {
            0 => Value::str_from(self.img.program_name.as_deref().unwrap_or("")),
            1 => Value::Long(self.stopped_count() as i32),
            2 => Value::Long(self.trap_errors as i32),
            3 => Value::Long(self.settings.disp_width as i32),
            4 => Value::Long(self.settings.tab_size as i32),
            5 => Value::Long(self.settings.angle_degrees as i32),
            // per-category heap audit error counters
            10..=22 => {
                let class = ALL_CLASSES[(n - 10) as usize];
                Value::Long(self.audit.error_count(class) as i32)
            }
            30 => Value::Long(self.audit.total_errors() as i32),
            40 => match self.host.rtc {
                Some(rtc) => Value::Long(rtc().0 as i32),
                None => Value::Long(0),
            },
            41 => match self.host.rtc {
                Some(rtc) => Value::Long(rtc().1 as i32),
                None => Value::Long(0),
            },
            _ => return Err(ExecError::ArgOutsideRange),
        };
        Ok(value)
    }

    /// `fmt(value [, width [, precision [, specifier [, flags]]]])`
    fn builtin_fmt(&mut self, args: Vec<StackEntry>) -> Result<StackEntry, Interrupt> {
        let value = args.first().map(|a| a.value.clone()).ok_or(ExecError::ArgCountWrong)?;
        let width = match args.get(1) {
            Some(_) => Self::arg_long(&args, 1)?,
            None => 0,
        };
        let precision = match args.get(2) {
            Some(_) => Some(Self::arg_long(&args, 2)?),
            None => None,
        };
        let spec = match args.get(3) {
            Some(a) => match &a.value {
                Value::Str(_) => a.value.as_str().chars().next(),
                _ => return Err(ExecError::ArgTypeWrong.into()),
            },
            None => None,
        };
        let flags = match args.get(4) {
            Some(_) => Self::arg_long(&args, 4)?,
            None => 0,
        };
        if width < 0 || width > MAX_ALPHA_CST_LEN as i32 {
            return Err(ExecError::ArgOutsideRange.into());
        }
        if let Some(p) = precision {
            if !(0..=30).contains(&p) {
                return Err(ExecError::ArgOutsideRange.into());
            }
        }

        let spec = spec.unwrap_or(match &value {
            Value::Long(_) => 'd',
            Value::Float(_) => 'g',
            _ => 's',
        });
        let body = match (&value, spec) {
            (Value::Long(v), 'd') => format_signed(*v, flags),
            (Value::Long(v), 'x') => {
                let mut s = String::new();
                if flags & fmtflags::POINT != 0 {
                    s.push_str("0x");
                }
                s.push_str(&format!("{:x}", v));
                s
            }
            (Value::Long(v), 'X') => {
                let mut s = String::new();
                if flags & fmtflags::POINT != 0 {
                    s.push_str("0X");
                }
                s.push_str(&format!("{:X}", v));
                s
            }
            (Value::Float(v), 'f') => {
                format_signed_str(&format!("{:.*}", precision.unwrap_or(2) as usize, v), *v, flags)
            }
            (Value::Float(v), 'e') => {
                format_signed_str(&format!("{:.*e}", precision.unwrap_or(2) as usize, v), *v, flags)
            }
            (Value::Float(v), 'E') => format_signed_str(
                &format!("{:.*e}", precision.unwrap_or(2) as usize, v).to_uppercase(),
                *v,
                flags,
            ),
            (Value::Float(v), 'g' | 'G') => {
                let s = match precision {
                    Some(p) => trim_g(&format!("{:.*}", p as usize, v)),
                    None => format!("{}", Value::Float(*v)),
                };
                let s = if spec == 'G' { s.to_uppercase() } else { s };
                format_signed_str(&s, *v, flags)
            }
            (Value::Str(_), 's') => {
                let s = value.as_str();
                match precision {
                    Some(p) => s.chars().take(p as usize).collect(),
                    None => s.to_string(),
                }
            }
            _ => return Err(ExecError::ArgTypeWrong.into()),
        };

        let width = width as usize;
        let out = if body.len() >= width {
            body
        } else if flags & fmtflags::LEFT != 0 {
            format!("{:<width$}", body, width = width)
        } else if flags & fmtflags::ZEROPAD != 0 && !matches!(value, Value::Str(_)) {
            zero_pad(&body, width)
        } else {
            format!("{:>width$}", body, width = width)
        };
        if out.len() > MAX_ALPHA_CST_LEN {
            return Err(ExecError::ArgOutsideRange.into());
        }
        self.finish(args, Value::str_from(&out))
    }

    // --- token pretty-printing ---

    /// Reconstruct source text for one statement (break headers, lists).
    pub(crate) fn pretty_print_statement(&self, pos: usize) -> String {
        use crate::tables::{command, internal_fn, sym_const, CmdCode, TERMINAL_LEXEMES};
        let mut out = String::new();
        let mut cur = pos;
        loop {
            match self.img.tokens.at(cur) {
                Tok::None => break,
                Tok::Terminal { code } if crate::tables::term::is_semicolon(code) => break,
                Tok::Keyword { code, .. } => {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    if let Some(c) = CmdCode::from_u8(code) {
                        out.push_str(command(c).name);
                        out.push(' ');
                    }
                }
                Tok::Terminal { code } => {
                    if code == crate::tables::term::COMMA {
                        out.push(',');
                    } else if let Some((text, _)) =
                        TERMINAL_LEXEMES.iter().find(|(_, c)| *c == code)
                    {
                        out.push_str(text);
                    }
                }
                Tok::LongConst(v) => out.push_str(&v.to_string()),
                Tok::FloatConst(v) => out.push_str(&Self::format_value_exact(&Value::Float(v))),
                Tok::StringConst { str_index } => {
                    out.push('"');
                    out.push_str(self.img.parsed_string(cur, str_index));
                    out.push('"');
                }
                Tok::SymConst { code } => out.push_str(sym_const(code).name),
                Tok::InternalFn { code } => out.push_str(internal_fn(code).name),
                Tok::ExternalFn { bucket, index } => {
                    if let Some(def) = self.host.external.get(bucket, index) {
                        out.push_str(def.name);
                    }
                }
                Tok::UserFn { index } => {
                    if let Some(f) = self.img.funcs.get(index as usize) {
                        out.push_str(&f.name);
                    }
                }
                Tok::GenericName { str_index } => {
                    out.push_str(self.img.parsed_string(cur, str_index));
                }
                Tok::VarRef {
                    info, name_index, ..
                } => {
                    let name = if info & varinfo::SCOPE_MASK == Scope::User as u8 {
                        self.store.user_name(name_index as usize)
                    } else {
                        self.store.prog_name(name_index as usize)
                    };
                    out.push_str(name);
                }
            }
            cur = self.img.tokens.step(cur);
        }
        out.trim_end().to_string()
    }
}

fn to_rad(x: f64, degrees: bool) -> f64 {
    if degrees {
        x.to_radians()
    } else {
        x
    }
}

fn from_rad(x: f64, degrees: bool) -> f64 {
    if degrees {
        x.to_degrees()
    } else {
        x
    }
}

/// Equality as used by `switch` / `index`: numeric compare across long
/// and float, exact compare for strings, never across kinds.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Str(_), Value::Str(_)) => a.as_str() == b.as_str(),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn format_signed(v: i32, flags: i32) -> String {
    if v >= 0 {
        if flags & fmtflags::SIGN != 0 {
            format!("+{}", v)
        } else if flags & fmtflags::SPACE != 0 {
            format!(" {}", v)
        } else {
            format!("{}", v)
        }
    } else {
        format!("{}", v)
    }
}

fn format_signed_str(body: &str, v: f32, flags: i32) -> String {
    if v >= 0.0 {
        if flags & fmtflags::SIGN != 0 {
            format!("+{}", body)
        } else if flags & fmtflags::SPACE != 0 {
            format!(" {}", body)
        } else {
            body.to_string()
        }
    } else {
        body.to_string()
    }
}

/// Zero padding that keeps the sign in front.
fn zero_pad(body: &str, width: usize) -> String {
    let (sign, digits) = match body.strip_prefix(['-', '+', ' ']) {
        Some(rest) => (&body[..1], rest),
        None => ("", body),
    };
    let pad = width.saturating_sub(sign.len() + digits.len());
    format!("{}{}{}", sign, "0".repeat(pad), digits)
}

/// `%g`-style cleanup: strip trailing zeros after the decimal point.
fn trim_g(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_equal_across_numeric_kinds() {
        assert!(values_equal(&Value::Long(3), &Value::Float(3.0)));
        assert!(!values_equal(&Value::Long(3), &Value::str_from("3")));
        assert!(values_equal(&Value::str_from("a"), &Value::str_from("a")));
    }

    #[test]
    fn test_zero_pad_keeps_sign() {
        assert_eq!(zero_pad("-12", 5), "-0012");
        assert_eq!(zero_pad("12", 5), "00012");
    }

    #[test]
    fn test_trim_g() {
        assert_eq!(trim_g("3.1400"), "3.14");
        assert_eq!(trim_g("3.000"), "3");
        assert_eq!(trim_g("300"), "300");
    }

    #[test]
    fn test_format_value_exact_roundtrips() {
        assert_eq!(Machine::format_value_exact(&Value::Long(14)), "14");
        assert_eq!(Machine::format_value_exact(&Value::Float(3.5)), "3.5");
        assert_eq!(Machine::format_value_exact(&Value::Float(2.0)), "2.0");
    }
}
