//! Statement parser
//!
//! A single pass over statement text. Tokens are emitted eagerly in
//! source order; operator precedence is the executor's business, the
//! parser validates token sequence, scope, command usage, argument
//! arity and array-vs-scalar consistency, and resolves block keyword
//! chains through in-place offset fix-ups.
//!
//! Nothing is committed on failure: the statement's tokens, its parsed
//! string constants and any variables it created are rolled back, and
//! the caller discards the rest of the input line.

use crate::breakpoints::Breakpoints;
use crate::error::{ParseDiag, ParseError};
use crate::host::ExternalFns;
use crate::lexer::{Lexer, Literal};
use crate::program::{LocalDef, ProgramImage, PARAM_PATTERN_UNCOMMITTED};
use crate::tables::{
    find_command, find_internal_fn, find_sym_const, term, ArgPattern, BlockRole, CmdCode, CmdSpec,
    CmdWhere, FnCode, OpFlags, SymVal, OPERATORS,
};
use crate::token::varinfo;
use rill_core::{
    ArrayStorage, HeapAudit, Scope, Slot, Value, VarAttr, VarStore, MAX_FUNC_ARGS,
};

/// What the source text is being parsed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Program load: tokens go to the program area
    Program,
    /// Prompt line: tokens go to the immediate area
    Immediate,
    /// View / trigger / eval() strings: immediate area, but commands,
    /// user function calls and generic names are rejected
    Restricted,
}

/// Parse-time commands deferred until after the execution phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
    DeleteVars(Vec<String>),
    ClearMem,
    ClearProg,
}

/// Everything the parser reads and mutates.
pub struct ParseCtx<'a> {
    pub img: &'a mut ProgramImage,
    pub store: &'a mut VarStore,
    pub bp: &'a mut Breakpoints,
    pub audit: &'a mut HeapAudit,
    pub ext: &'a ExternalFns,
    /// Deepest stopped function (immediate-mode `#` scope escape)
    pub stopped_func: Option<usize>,
    pub pending: &'a mut Vec<PendingAction>,
}

/// Expression-syntax flags at one sub-expression nesting level.
#[derive(Debug, Clone, Copy, Default)]
struct ExprFlags {
    last_is_var: bool,
    last_is_const_var: bool,
    assign_possible: bool,
    last_op_incr_decr: bool,
    /// A variable token was the last operand (array subscript anchor)
    var_just_emitted: bool,
    var_is_array: bool,
}

impl ExprFlags {
    fn fresh() -> Self {
        ExprFlags {
            assign_possible: true,
            ..Default::default()
        }
    }
}

/// Why a parenthesis frame exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParenKind {
    Grouping,
    ArraySubs,
    InternalCall,
    ExternalCall,
    UserCall,
}

#[derive(Debug)]
struct ParenFrame {
    kind: ParenKind,
    saved: ExprFlags,
    /// Comma count so far
    commas: u8,
    min_args: u8,
    max_args: u8,
    array_pattern: u16,
    var_pattern: u16,
    /// Array subscripting: declared dimension count (0 = deferred)
    dim_count: u8,
    /// User call: target function index
    func_index: usize,
    /// Accumulated array-argument pattern of this call
    call_pattern: u16,
    // current argument summary
    arg_has_content: bool,
    arg_is_pure_var: bool,
    arg_is_whole_array: bool,
}

impl ParenFrame {
    fn new(kind: ParenKind, saved: ExprFlags) -> Self {
        ParenFrame {
            kind,
            saved,
            commas: 0,
            min_args: 0,
            max_args: 0,
            array_pattern: 0,
            var_pattern: 0,
            dim_count: 0,
            func_index: 0,
            call_pattern: 0,
            arg_has_content: false,
            arg_is_pure_var: false,
            arg_is_whole_array: false,
        }
    }

    fn args_so_far(&self) -> u8 {
        self.commas + self.arg_has_content as u8
    }

    fn note_operand(&mut self, is_var: bool, is_whole_array: bool) {
        if self.arg_has_content {
            self.arg_is_pure_var = false;
            self.arg_is_whole_array = false;
        } else {
            self.arg_has_content = true;
            self.arg_is_pure_var = is_var;
            self.arg_is_whole_array = is_whole_array;
        }
    }

    fn note_operator(&mut self) {
        self.arg_has_content = true;
        self.arg_is_pure_var = false;
        self.arg_is_whole_array = false;
    }

    fn next_arg(&mut self) {
        self.commas += 1;
        self.arg_has_content = false;
        self.arg_is_pure_var = false;
        self.arg_is_whole_array = false;
    }
}

/// One open block while parsing (the block side of the parsing stack).
#[derive(Debug)]
struct BlockFrame {
    start_cmd: CmdCode,
    start_pos: usize,
    /// Last keyword in the if / elseif / else chain (start for loops)
    last_chain_pos: usize,
    last_chain_cmd: CmdCode,
    /// `for` control variable identity (scope bits, value index)
    for_control: Option<(u8, u16)>,
}

/// Result summary of one parsed expression (command argument checks).
#[derive(Debug, Default)]
struct ExprSummary {
    is_pure_var: bool,
    is_whole_array: bool,
    any_tokens: bool,
}

pub struct Parser<'c, 'a, 's> {
    ctx: &'c mut ParseCtx<'a>,
    lex: Lexer<'s>,
    mode: ParseMode,
    blocks: Vec<BlockFrame>,
    /// Open function definition (program mode)
    in_function: Option<usize>,
    stmt_index: u32,
    last_stmt_line: u32,
    last_sep_pos: Option<usize>,
    /// User variables created by the statement being parsed
    stmt_new_user_vars: Vec<usize>,
}

impl<'c, 'a, 's> Parser<'c, 'a, 's> {
    pub fn new(ctx: &'c mut ParseCtx<'a>, src: &'s str, mode: ParseMode) -> Self {
        Parser {
            ctx,
            lex: Lexer::new(src),
            mode,
            blocks: Vec::new(),
            in_function: None,
            stmt_index: 0,
            last_stmt_line: 0,
            last_sep_pos: None,
            stmt_new_user_vars: Vec::new(),
        }
    }

    fn diag(&self, error: ParseError) -> ParseDiag {
        ParseDiag {
            error,
            line: if self.mode == ParseMode::Program {
                self.lex.line()
            } else {
                0
            },
            pos: self.lex.pos() + 1,
        }
    }

    /// Parse the whole source into the target area.
    pub fn parse(mut self) -> Result<(), ParseDiag> {
        if self.mode == ParseMode::Program {
            self.ctx.bp.on_program_parse_start();
            self.ctx.img.tokens.start_program();
            self.ctx.img.parsing_program = true;
        } else {
            self.ctx.img.tokens.start_immediate();
            self.ctx.img.parsing_program = false;
        }

        loop {
            self.lex.skip_whitespace().map_err(|e| self.diag(e))?;
            if self.lex.at_end() {
                break;
            }
            self.parse_statement()?;
        }

        if self.mode == ParseMode::Program {
            if !self.blocks.is_empty() || self.in_function.is_some() {
                return Err(self.diag(ParseError::BlockNotClosed));
            }
            for func in &self.ctx.img.funcs {
                if !func.is_defined() {
                    return Err(self.diag(ParseError::FunctionUndefined));
                }
            }
            self.ctx
                .bp
                .ranges
                .finalize()
                .map_err(|e| self.diag(e))?;
            self.ctx.img.tokens.end_program();
            self.ctx.img.parsing_program = false;
        } else if !self.blocks.is_empty() {
            // immediate-mode blocks must be complete on the line
            return Err(self.diag(ParseError::BlockNotClosed));
        }
        Ok(())
    }

    fn parse_statement(&mut self) -> Result<(), ParseDiag> {
        let stmt_line = self.lex.line();
        let tok_mark = self.ctx.img.tokens.written_len();
        let str_mark = self.ctx.img.parsed_string_count();
        let prev_sep = self.last_sep_pos;
        self.stmt_new_user_vars.clear();

        match self.parse_statement_inner() {
            Ok(()) => {
                if self.mode == ParseMode::Program && stmt_line > self.last_stmt_line {
                    if let Some(sep) = prev_sep {
                        self.ctx
                            .img
                            .tokens
                            .rewrite_terminal(sep, term::SEMICOLON_BP_ALLOWED);
                        self.ctx
                            .bp
                            .ranges
                            .note_line(stmt_line)
                            .map_err(|e| self.diag(e))?;
                    }
                    self.last_stmt_line = stmt_line;
                }
                self.stmt_index += 1;
                Ok(())
            }
            Err(e) => {
                self.ctx.img.tokens.truncate_written(tok_mark);
                self.ctx
                    .img
                    .truncate_parsed_strings(str_mark, self.ctx.audit);
                // undo user variables the failed statement created
                while let Some(idx) = self.stmt_new_user_vars.pop() {
                    let _ = self.ctx.store.delete_user_var(idx, self.ctx.audit);
                }
                Err(self.diag(e))
            }
        }
    }

    fn parse_statement_inner(&mut self) -> Result<(), ParseError> {
        if let Some(ident) = self.lex.peek_identifier() {
            if !ident.starts_with('#') {
                if let Some(spec) = find_command(ident) {
                    if self.mode == ParseMode::Restricted {
                        return Err(ParseError::KeywordNotAllowedHere);
                    }
                    let ident = ident.to_string();
                    self.lex.consume_identifier(&ident);
                    return self.parse_command(spec);
                }
            }
        }
        // expression statement
        if self.mode == ParseMode::Program && self.in_function.is_none() {
            return Err(ParseError::ExpressionNotAllowedHere);
        }
        if self.mode == ParseMode::Program && self.ctx.img.program_name.is_none() {
            return Err(ParseError::ProgramCmdMissing);
        }
        let summary = self.parse_expression()?;
        if !summary.any_tokens {
            return Err(ParseError::ExpressionNotComplete);
        }
        self.expect_semicolon()
    }

    fn expect_semicolon(&mut self) -> Result<(), ParseError> {
        self.lex.skip_whitespace()?;
        match self.lex.try_terminal() {
            Some(term::SEMICOLON) => {
                let pos = self.ctx.img.tokens.emit_terminal(term::SEMICOLON)?;
                self.last_sep_pos = Some(pos);
                Ok(())
            }
            Some(_) => Err(ParseError::SeparatorNotAllowedHere),
            None => Err(ParseError::ExpressionNotComplete),
        }
    }

    // --- commands ---

    fn check_cmd_allowed(&self, spec: &CmdSpec) -> Result<(), ParseError> {
        let w = spec.where_allowed;
        match self.mode {
            ParseMode::Immediate => {
                if !w.contains(CmdWhere::IMMEDIATE) {
                    return Err(ParseError::CommandOnlyInProgram);
                }
                if w.contains(CmdWhere::IMM_TOP) && self.stmt_index != 0 {
                    return Err(ParseError::CommandOnlyAtProgramStart);
                }
            }
            ParseMode::Program => {
                if self.ctx.img.program_name.is_none() && spec.code != CmdCode::Program {
                    return Err(ParseError::ProgramCmdMissing);
                }
                if self.in_function.is_some() {
                    if !w.contains(CmdWhere::PROG_IN_FUNC) {
                        if w.contains(CmdWhere::IMMEDIATE) && !w.contains(CmdWhere::PROG_OUT_FUNC) {
                            return Err(ParseError::CommandOnlyImmediate);
                        }
                        return Err(ParseError::CommandOnlyOutsideFunction);
                    }
                } else {
                    if !w.contains(CmdWhere::PROG_OUT_FUNC) {
                        if w.contains(CmdWhere::PROG_IN_FUNC) {
                            return Err(ParseError::CommandOnlyInsideFunction);
                        }
                        return Err(ParseError::CommandOnlyImmediate);
                    }
                    if w.contains(CmdWhere::PROGRAM_TOP) && self.stmt_index != 0 {
                        return Err(ParseError::CommandOnlyAtProgramStart);
                    }
                }
            }
            ParseMode::Restricted => return Err(ParseError::KeywordNotAllowedHere),
        }
        Ok(())
    }

    fn check_block_role(&self, spec: &CmdSpec) -> Result<(), ParseError> {
        match spec.block {
            BlockRole::ElseIf | BlockRole::Else => match self.blocks.last() {
                Some(b)
                    if b.start_cmd == CmdCode::If
                        && matches!(b.last_chain_cmd, CmdCode::If | CmdCode::ElseIf) =>
                {
                    Ok(())
                }
                _ => Err(ParseError::MisplacedBlockKeyword),
            },
            BlockRole::End => {
                if self.blocks.is_empty() && self.in_function.is_none() {
                    Err(ParseError::NoOpenBlock)
                } else {
                    Ok(())
                }
            }
            BlockRole::LoopCtl => {
                if self
                    .blocks
                    .iter()
                    .any(|b| matches!(b.start_cmd, CmdCode::For | CmdCode::While))
                {
                    Ok(())
                } else {
                    Err(ParseError::NoOpenLoop)
                }
            }
            BlockRole::ReturnCtl => {
                if self.in_function.is_some() || self.mode == ParseMode::Immediate {
                    Ok(())
                } else {
                    Err(ParseError::NotInFunction)
                }
            }
            BlockRole::FunctionStart => {
                if self.blocks.is_empty() {
                    Ok(())
                } else {
                    Err(ParseError::MisplacedBlockKeyword)
                }
            }
            _ => Ok(()),
        }
    }

    fn parse_command(&mut self, spec: &'static CmdSpec) -> Result<(), ParseError> {
        self.check_cmd_allowed(spec)?;
        self.check_block_role(spec)?;

        let kw_pos = self.ctx.img.tokens.emit_keyword(spec.code as u8, 0)?;

        match spec.args {
            ArgPattern::None => {}
            ArgPattern::Ident => {
                let name = self.parse_generic_ident()?;
                if spec.code == CmdCode::Program {
                    self.ctx.img.program_name = Some(name.as_str().into());
                }
                let idx = self
                    .ctx
                    .img
                    .add_parsed_string(name, self.ctx.audit);
                self.ctx.img.tokens.emit_generic_name(idx)?;
            }
            ArgPattern::Idents => {
                let mut names = Vec::new();
                loop {
                    let name = self.parse_generic_ident()?;
                    let idx = self
                        .ctx
                        .img
                        .add_parsed_string(name.clone(), self.ctx.audit);
                    self.ctx.img.tokens.emit_generic_name(idx)?;
                    names.push(name);
                    if names.len() > spec.max_args as usize {
                        return Err(ParseError::TooManyParameters);
                    }
                    self.lex.skip_whitespace()?;
                    if self.try_exact_terminal(term::COMMA)? {
                        self.ctx.img.tokens.emit_terminal(term::COMMA)?;
                        continue;
                    }
                    break;
                }
                if spec.code == CmdCode::Delete {
                    self.ctx.pending.push(PendingAction::DeleteVars(names));
                }
            }
            ArgPattern::Declarators => self.parse_declarations(spec)?,
            ArgPattern::FuncDef => self.parse_function_def()?,
            ArgPattern::ForSpec => self.parse_for_spec(kw_pos)?,
            ArgPattern::Exprs | ArgPattern::VarThenExprs => {
                self.parse_command_args(spec)?;
            }
        }

        match spec.code {
            CmdCode::ClearMem => self.ctx.pending.push(PendingAction::ClearMem),
            CmdCode::ClearProg => self.ctx.pending.push(PendingAction::ClearProg),
            _ => {}
        }

        self.expect_semicolon()?;

        // block machinery
        match spec.block {
            BlockRole::FunctionStart => {
                // body starts after the header's separator
                if let Some(fi) = self.in_function {
                    let start = self.ctx.img.tokens.write_cursor();
                    self.ctx.img.funcs[fi].start_token = Some(start);
                }
            }
            BlockRole::WhileStart | BlockRole::IfStart => {
                self.blocks.push(BlockFrame {
                    start_cmd: spec.code,
                    start_pos: kw_pos,
                    last_chain_pos: kw_pos,
                    last_chain_cmd: spec.code,
                    for_control: None,
                });
            }
            BlockRole::ForStart => {
                // frame already pushed by parse_for_spec
            }
            BlockRole::ElseIf | BlockRole::Else => {
                let frame = self.blocks.last_mut().ok_or(ParseError::NoOpenBlock)?;
                self.ctx
                    .img
                    .tokens
                    .fixup_keyword_ofs(frame.last_chain_pos, kw_pos as u16);
                frame.last_chain_pos = kw_pos;
                frame.last_chain_cmd = spec.code;
            }
            BlockRole::End => {
                if let Some(frame) = self.blocks.pop() {
                    self.ctx
                        .img
                        .tokens
                        .fixup_keyword_ofs(frame.last_chain_pos, kw_pos as u16);
                    self.ctx
                        .img
                        .tokens
                        .fixup_keyword_ofs(kw_pos, frame.start_pos as u16);
                } else if let Some(fi) = self.in_function.take() {
                    // closes the function definition
                    let start = self.ctx.img.funcs[fi].start_token.unwrap_or(0);
                    self.ctx.img.tokens.fixup_keyword_ofs(kw_pos, start as u16);
                } else {
                    return Err(ParseError::NoOpenBlock);
                }
            }
            BlockRole::LoopCtl => {
                let loop_start = self
                    .blocks
                    .iter()
                    .rev()
                    .find(|b| matches!(b.start_cmd, CmdCode::For | CmdCode::While))
                    .map(|b| b.start_pos)
                    .unwrap_or(0);
                self.ctx
                    .img
                    .tokens
                    .fixup_keyword_ofs(kw_pos, loop_start as u16);
            }
            BlockRole::ReturnCtl | BlockRole::None => {}
        }
        Ok(())
    }

    /// Command argument expressions, optionally wrapped in one enclosing
    /// parenthesis pair (`cout(a, b);` and `cout a, b;` both parse).
    fn parse_command_args(&mut self, spec: &'static CmdSpec) -> Result<(), ParseError> {
        self.lex.skip_whitespace()?;
        let wrapped = self.try_exact_terminal(term::LEFT_PAR)?;
        if wrapped {
            self.ctx.img.tokens.emit_terminal(term::LEFT_PAR)?;
        }

        let mut count: u8 = 0;
        self.lex.skip_whitespace()?;
        let list_empty = if wrapped {
            self.peek_terminal() == Some(term::RIGHT_PAR)
        } else {
            self.peek_terminal() == Some(term::SEMICOLON)
        };
        if !list_empty {
            loop {
                let summary = self.parse_expression()?;
                if !summary.any_tokens {
                    return Err(ParseError::ExpressionNotComplete);
                }
                count += 1;
                if count > spec.max_args {
                    return Err(ParseError::TooManyParameters);
                }
                if spec.args == ArgPattern::VarThenExprs && count == 1 && !summary.is_pure_var {
                    return Err(ParseError::VarExpectedAsParam);
                }
                self.lex.skip_whitespace()?;
                if self.try_exact_terminal(term::COMMA)? {
                    self.ctx.img.tokens.emit_terminal(term::COMMA)?;
                    continue;
                }
                break;
            }
        }
        if wrapped {
            if !self.try_exact_terminal(term::RIGHT_PAR)? {
                return Err(ParseError::MissingRightParenthesis);
            }
            self.ctx.img.tokens.emit_terminal(term::RIGHT_PAR)?;
        }
        if count < spec.min_args {
            return Err(ParseError::MissingParameters);
        }
        Ok(())
    }

    fn parse_generic_ident(&mut self) -> Result<String, ParseError> {
        self.lex.skip_whitespace()?;
        let ident = self
            .lex
            .peek_identifier()
            .ok_or(ParseError::IdentExpectedAsParam)?;
        if ident.starts_with('#') {
            return Err(ParseError::IdentExpectedAsParam);
        }
        Lexer::check_ident_len(ident)?;
        let name = ident.to_string();
        self.lex.consume_identifier(&name);
        Ok(name)
    }

    // --- declarations ---

    fn decl_scope(&self, cmd: CmdCode) -> Scope {
        match (self.mode, cmd, self.in_function) {
            (ParseMode::Immediate, _, _) => Scope::User,
            (_, CmdCode::Static, _) => Scope::Static,
            (_, _, Some(_)) => Scope::Local,
            _ => Scope::Global,
        }
    }

    fn parse_declarations(&mut self, spec: &'static CmdSpec) -> Result<(), ParseError> {
        let is_const = spec.code == CmdCode::Const;
        let scope = self.decl_scope(spec.code);
        let mut count = 0u8;
        loop {
            self.parse_one_declarator(scope, is_const)?;
            count += 1;
            if count > spec.max_args {
                return Err(ParseError::TooManyParameters);
            }
            self.lex.skip_whitespace()?;
            if self.try_exact_terminal(term::COMMA)? {
                self.ctx.img.tokens.emit_terminal(term::COMMA)?;
                continue;
            }
            return Ok(());
        }
    }

    fn parse_one_declarator(&mut self, scope: Scope, is_const: bool) -> Result<(), ParseError> {
        let name = self.parse_generic_ident()?;

        // array dimensions
        self.lex.skip_whitespace()?;
        let mut dims: Vec<u8> = Vec::new();
        let is_array = self.lex.next_is_left_par();
        if is_array {
            self.try_exact_terminal(term::LEFT_PAR)?;
            loop {
                self.lex.skip_whitespace()?;
                let v = match self.lex.try_number()? {
                    Some(Literal::Long(v)) => v,
                    _ => return Err(ParseError::ArrayDefDimsMustBeConst),
                };
                if !(1..=255).contains(&v) {
                    return Err(ParseError::ArrayDefDimSizeInvalid);
                }
                if dims.len() >= rill_core::MAX_ARRAY_DIMS {
                    return Err(ParseError::ArrayDefMaxDimsExceeded);
                }
                dims.push(v as u8);
                self.lex.skip_whitespace()?;
                if self.try_exact_terminal(term::COMMA)? {
                    continue;
                }
                if self.try_exact_terminal(term::RIGHT_PAR)? {
                    break;
                }
                return Err(ParseError::MissingRightParenthesis);
            }
            let elems: usize = dims.iter().map(|&d| d as usize).product();
            if elems > rill_core::MAX_ARRAY_ELEM {
                return Err(ParseError::ArrayDefMaxElementsExceeded);
            }
        }

        // initializer
        self.lex.skip_whitespace()?;
        let mut init: Option<Value> = None;
        if self.try_exact_terminal(term::ASSIGN)? {
            init = Some(self.parse_const_initializer()?);
        } else if is_const {
            return Err(ParseError::ConstantExpected);
        }
        if is_array {
            match &init {
                Some(Value::Str(Some(_))) => return Err(ParseError::StringArrayInitNotEmpty),
                Some(Value::Array(_)) => return Err(ParseError::ScalarExpectedAsInitializer),
                _ => {}
            }
        }

        // create the variable and emit its reference token
        let (info, name_index, value_index) =
            self.declare_variable(&name, scope, is_const, is_array, &dims, init.clone())?;
        self.ctx
            .img
            .tokens
            .emit_var_ref(info, name_index, value_index)?;
        if is_array {
            self.ctx.img.tokens.emit_terminal(term::LEFT_PAR)?;
            for (i, d) in dims.iter().enumerate() {
                if i > 0 {
                    self.ctx.img.tokens.emit_terminal(term::COMMA)?;
                }
                self.ctx.img.tokens.emit_long_const(*d as i32)?;
            }
            self.ctx.img.tokens.emit_terminal(term::RIGHT_PAR)?;
        }
        if let Some(v) = init {
            self.ctx.img.tokens.emit_terminal(term::ASSIGN)?;
            self.emit_const_value(&v)?;
        }
        Ok(())
    }

    fn emit_const_value(&mut self, v: &Value) -> Result<(), ParseError> {
        match v {
            Value::Long(n) => {
                self.ctx.img.tokens.emit_long_const(*n)?;
            }
            Value::Float(f) => {
                self.ctx.img.tokens.emit_float_const(*f)?;
            }
            Value::Str(s) => {
                let idx = self.ctx.img.add_parsed_string(
                    s.as_deref().unwrap_or("").to_string(),
                    self.ctx.audit,
                );
                self.ctx.img.tokens.emit_string_const(idx)?;
            }
            Value::Array(_) => return Err(ParseError::ScalarExpectedAsInitializer),
        }
        Ok(())
    }

    /// Constant initializer: optional sign, then a numeric or string
    /// literal or symbolic constant. `+` chains between constants fold
    /// at parse time (`"he"+"llo"`, `PI+1`).
    fn parse_const_initializer(&mut self) -> Result<Value, ParseError> {
        let mut value = self.parse_one_constant()?;
        while self.try_exact_terminal(term::PLUS)? {
            let rhs = self.parse_one_constant()?;
            value = match (value, rhs) {
                (Value::Str(a), Value::Str(b)) => {
                    let mut s = a.as_deref().unwrap_or("").to_string();
                    s.push_str(b.as_deref().unwrap_or(""));
                    if s.len() > rill_core::MAX_ALPHA_CST_LEN {
                        return Err(ParseError::StringTooLong);
                    }
                    Value::str_from(&s)
                }
                (Value::Long(a), Value::Long(b)) => {
                    Value::Long(a.checked_add(b).ok_or(ParseError::NumberOverflow)?)
                }
                (Value::Long(a), Value::Float(b)) => Value::Float(a as f32 + b),
                (Value::Float(a), Value::Long(b)) => Value::Float(a + b as f32),
                (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
                _ => return Err(ParseError::ConstantExpected),
            };
        }
        Ok(value)
    }

    fn parse_one_constant(&mut self) -> Result<Value, ParseError> {
        self.lex.skip_whitespace()?;
        let mut sign = 1i32;
        let mut signed = false;
        match self.peek_terminal() {
            Some(term::MINUS) => {
                self.try_exact_terminal(term::MINUS)?;
                sign = -1;
                signed = true;
            }
            Some(term::PLUS) => {
                self.try_exact_terminal(term::PLUS)?;
                signed = true;
            }
            _ => {}
        }
        self.lex.skip_whitespace()?;
        if let Some(lit) = self.lex.try_number()? {
            return Ok(match lit {
                Literal::Long(v) => Value::Long(v * sign),
                Literal::Float(v) => Value::Float(v * sign as f32),
                Literal::Str(_) => unreachable!("try_number never returns Literal::Str"),
            });
        }
        if signed {
            return Err(ParseError::ConstantExpected);
        }
        if let Some(s) = self.lex.try_string()? {
            return Ok(Value::str_from(&s));
        }
        if let Some(ident) = self.lex.peek_identifier() {
            if let Some((_, sym)) = find_sym_const(ident) {
                let ident = ident.to_string();
                self.lex.consume_identifier(&ident);
                return Ok(match sym.value {
                    SymVal::Long(v) => Value::Long(v),
                    SymVal::Float(v) => Value::Float(v),
                    SymVal::Str(s) => Value::str_from(s),
                });
            }
        }
        Err(ParseError::ConstantExpected)
    }

    /// Create the declared variable in its scope.
    fn declare_variable(
        &mut self,
        name: &str,
        scope: Scope,
        is_const: bool,
        is_array: bool,
        dims: &[u8],
        init: Option<Value>,
    ) -> Result<(u8, u16, u16), ParseError> {
        let mut attrs = VarAttr::empty();
        if is_const {
            attrs |= VarAttr::IS_CONST;
        }
        if is_array {
            attrs |= VarAttr::IS_ARRAY;
        }
        let mut info = scope as u8;
        if is_const {
            info |= varinfo::IS_CONST;
        }
        if is_array {
            info |= varinfo::IS_ARRAY;
        }

        let default = init.clone().unwrap_or(Value::Long(0));
        match scope {
            Scope::User => {
                if self.ctx.store.find_user_name(name).is_some() {
                    return Err(ParseError::VarRedeclared);
                }
                let value = if is_array {
                    let storage = self.build_array_storage(dims, &default)?;
                    let id = self.ctx.store.alloc_array(storage, scope, self.ctx.audit);
                    Value::Array(id)
                } else {
                    default
                };
                if matches!(value, Value::Str(Some(_))) {
                    self.ctx
                        .audit
                        .on_create(rill_core::StringClass::UserVarStr);
                }
                let idx = self
                    .ctx
                    .store
                    .add_user_var(name, Slot::new(value, attrs), self.ctx.audit)
                    .map_err(|e| match e {
                        rill_core::store::StoreError::Redeclared => ParseError::VarRedeclared,
                        _ => ParseError::ProgramMemoryFull,
                    })?;
                self.stmt_new_user_vars.push(idx);
                Ok((info, idx as u16, idx as u16))
            }
            Scope::Global => {
                let name_index = match self.ctx.store.find_prog_name(name) {
                    Some(i) => {
                        if self
                            .ctx
                            .store
                            .prog_name_attrs(i)
                            .contains(VarAttr::HAS_GLOBAL_VALUE)
                        {
                            return Err(ParseError::VarRedeclared);
                        }
                        i
                    }
                    None => self
                        .ctx
                        .store
                        .add_prog_name(name, self.ctx.audit)
                        .map_err(|_| ParseError::ProgramMemoryFull)?,
                };
                let mut name_attrs = self.ctx.store.prog_name_attrs(name_index);
                name_attrs |= VarAttr::HAS_GLOBAL_VALUE;
                self.ctx.store.set_prog_name_attrs(name_index, name_attrs);
                let value = if is_array {
                    let storage = self.build_array_storage(dims, &default)?;
                    let id = self.ctx.store.alloc_array(storage, scope, self.ctx.audit);
                    Value::Array(id)
                } else {
                    default
                };
                if matches!(value, Value::Str(Some(_))) {
                    self.ctx
                        .audit
                        .on_create(rill_core::StringClass::GlobalStaticVarStr);
                }
                *self.ctx.store.global_slot_mut(name_index) = Slot::new(value, attrs);
                Ok((info, name_index as u16, name_index as u16))
            }
            Scope::Static => {
                let fi = self.in_function.ok_or(ParseError::NotInFunction)?;
                let name_index = self.intern_prog_name(name)?;
                if self.ctx.img.funcs[fi]
                    .statics
                    .contains(&(name_index as u16))
                    || self.ctx.img.funcs[fi]
                        .local_index_of(name_index as u16)
                        .is_some()
                {
                    return Err(ParseError::VarRedeclared);
                }
                let value = if is_array {
                    let storage = self.build_array_storage(dims, &default)?;
                    let id = self.ctx.store.alloc_array(storage, scope, self.ctx.audit);
                    Value::Array(id)
                } else {
                    default
                };
                if matches!(value, Value::Str(Some(_))) {
                    self.ctx
                        .audit
                        .on_create(rill_core::StringClass::GlobalStaticVarStr);
                }
                let slot_index = self.ctx.store.push_static(Slot::new(value, attrs));
                let func = &mut self.ctx.img.funcs[fi];
                func.statics.push(name_index as u16);
                func.static_count += 1;
                Ok((info, name_index as u16, slot_index as u16))
            }
            Scope::Local | Scope::Param => {
                let fi = self.in_function.ok_or(ParseError::NotInFunction)?;
                let name_index = self.intern_prog_name(name)?;
                if self.ctx.img.funcs[fi]
                    .local_index_of(name_index as u16)
                    .is_some()
                    || self.ctx.img.funcs[fi]
                        .statics
                        .contains(&(name_index as u16))
                {
                    return Err(ParseError::VarRedeclared);
                }
                let mut d = [0u8; 3];
                d[..dims.len()].copy_from_slice(dims);
                let func = &mut self.ctx.img.funcs[fi];
                func.locals.push(LocalDef {
                    name_index: name_index as u16,
                    is_param: false,
                    is_const,
                    is_array,
                    dims: d,
                    dim_count: dims.len() as u8,
                    init,
                });
                let local_index = func.locals.len() - 1;
                Ok((info, name_index as u16, local_index as u16))
            }
        }
    }

    fn build_array_storage(
        &mut self,
        dims: &[u8],
        init: &Value,
    ) -> Result<ArrayStorage, ParseError> {
        let storage = if init.is_string() {
            ArrayStorage::new_string(dims)
        } else {
            ArrayStorage::new_numeric(dims, init.clone())
        };
        storage.map_err(|e| match e {
            rill_core::store::ArrayDefError::DimCount => ParseError::ArrayDefMaxDimsExceeded,
            rill_core::store::ArrayDefError::DimSize => ParseError::ArrayDefDimSizeInvalid,
            rill_core::store::ArrayDefError::TooManyElements => {
                ParseError::ArrayDefMaxElementsExceeded
            }
        })
    }

    fn intern_prog_name(&mut self, name: &str) -> Result<usize, ParseError> {
        match self.ctx.store.find_prog_name(name) {
            Some(i) => Ok(i),
            None => self
                .ctx
                .store
                .add_prog_name(name, self.ctx.audit)
                .map_err(|_| ParseError::ProgramMemoryFull),
        }
    }

    // --- function definitions ---

    fn parse_function_def(&mut self) -> Result<(), ParseError> {
        let name = self.parse_generic_ident()?;
        if find_internal_fn(&name).is_some()
            || find_sym_const(&name).is_some()
            || self.ctx.ext.find(&name).is_some()
        {
            return Err(ParseError::FunctionNotAllowedHere);
        }
        let fi = self
            .ctx
            .img
            .func_entry(&name)
            .ok_or(ParseError::ProgramMemoryFull)?;
        if self.ctx.img.funcs[fi].is_defined() {
            return Err(ParseError::FunctionRedefined);
        }
        self.in_function = Some(fi);
        self.ctx.img.funcs[fi].static_base = self.ctx.store.static_count() as u16;

        self.ctx.img.tokens.emit_user_fn(fi as u8)?;
        self.lex.skip_whitespace()?;
        if !self.try_exact_terminal(term::LEFT_PAR)? {
            return Err(ParseError::MissingLeftParenthesis);
        }
        self.ctx.img.tokens.emit_terminal(term::LEFT_PAR)?;

        let mut mandatory = 0u8;
        let mut total = 0u8;
        let mut optional_seen = false;
        let mut pattern: u16 = 0;
        self.lex.skip_whitespace()?;
        if !self.try_exact_terminal(term::RIGHT_PAR)? {
            loop {
                let pname = self.parse_generic_ident()?;
                if total as usize >= MAX_FUNC_ARGS {
                    return Err(ParseError::FunctionMaxArgsExceeded);
                }
                self.lex.skip_whitespace()?;
                // `name()` declares an array parameter
                let mut is_array = false;
                if self.lex.next_is_left_par() {
                    self.try_exact_terminal(term::LEFT_PAR)?;
                    self.lex.skip_whitespace()?;
                    if !self.try_exact_terminal(term::RIGHT_PAR)? {
                        return Err(ParseError::MissingRightParenthesis);
                    }
                    is_array = true;
                    pattern |= 1 << total;
                }
                self.lex.skip_whitespace()?;
                let mut default = None;
                if self.try_exact_terminal(term::ASSIGN)? {
                    if is_array {
                        return Err(ParseError::ScalarExpectedAsInitializer);
                    }
                    default = Some(self.parse_const_initializer()?);
                    optional_seen = true;
                } else {
                    if optional_seen {
                        return Err(ParseError::FunctionMandatoryArgAfterOptional);
                    }
                    mandatory += 1;
                }

                let name_index = self.intern_prog_name(&pname)?;
                let func = &mut self.ctx.img.funcs[fi];
                if func.local_index_of(name_index as u16).is_some() {
                    return Err(ParseError::VarRedeclared);
                }
                func.locals.push(LocalDef {
                    name_index: name_index as u16,
                    is_param: true,
                    is_const: false,
                    is_array,
                    dims: [0; 3],
                    dim_count: 0,
                    init: default.clone(),
                });
                let local_index = func.locals.len() - 1;
                total += 1;

                let mut info = Scope::Param as u8;
                if is_array {
                    info |= varinfo::IS_ARRAY;
                }
                self.ctx.img.tokens.emit_var_ref(
                    info,
                    name_index as u16,
                    local_index as u16,
                )?;
                if is_array {
                    self.ctx.img.tokens.emit_terminal(term::LEFT_PAR)?;
                    self.ctx.img.tokens.emit_terminal(term::RIGHT_PAR)?;
                }
                if let Some(v) = default {
                    self.ctx.img.tokens.emit_terminal(term::ASSIGN)?;
                    self.emit_const_value(&v)?;
                }

                self.lex.skip_whitespace()?;
                if self.try_exact_terminal(term::COMMA)? {
                    self.ctx.img.tokens.emit_terminal(term::COMMA)?;
                    continue;
                }
                if self.try_exact_terminal(term::RIGHT_PAR)? {
                    break;
                }
                return Err(ParseError::MissingRightParenthesis);
            }
        }
        self.ctx.img.tokens.emit_terminal(term::RIGHT_PAR)?;

        // commit arity and array pattern, verifying forward calls
        let func = &mut self.ctx.img.funcs[fi];
        func.param_count = total;
        func.mandatory_count = mandatory;
        if func.seen_any {
            if func.seen_min < mandatory || func.seen_max > total {
                return Err(ParseError::FunctionPrevCallArgCountWrong);
            }
            // the pattern accumulated from forward calls must agree with
            // the declared one over the argument positions actually passed
            let observed = func.param_is_array & !PARAM_PATTERN_UNCOMMITTED;
            let mask = if func.seen_max >= 15 {
                0x7FFF
            } else {
                (1u16 << func.seen_max) - 1
            };
            if observed != pattern & mask {
                return Err(ParseError::FunctionScalarArrayMismatch);
            }
        }
        func.param_is_array = pattern;
        Ok(())
    }

    // --- for loops ---

    fn parse_for_spec(&mut self, kw_pos: usize) -> Result<(), ParseError> {
        self.lex.skip_whitespace()?;
        let ident = self
            .lex
            .peek_identifier()
            .ok_or(ParseError::VarNameExpected)?;
        let ident = ident.to_string();
        Lexer::check_ident_len(&ident)?;
        self.lex.consume_identifier(&ident);

        let (info, name_index, value_index) = self.resolve_variable(&ident)?;
        if info & varinfo::IS_CONST != 0 {
            return Err(ParseError::AssignToConstNotAllowed);
        }
        if info & varinfo::IS_ARRAY != 0 {
            return Err(ParseError::VarExpectedAsParam);
        }
        // the control variable must not drive an outer open loop
        let identity = (info & varinfo::SCOPE_MASK, value_index);
        if self
            .blocks
            .iter()
            .any(|b| b.for_control == Some(identity))
        {
            return Err(ParseError::ForControlVarInUse);
        }
        self.ctx
            .img
            .tokens
            .emit_var_ref(info, name_index, value_index)?;

        self.lex.skip_whitespace()?;
        if !self.try_exact_terminal(term::ASSIGN)? {
            return Err(ParseError::OperatorNotAllowedHere);
        }
        self.ctx.img.tokens.emit_terminal(term::ASSIGN)?;

        for arg in 0..3 {
            let summary = self.parse_expression()?;
            if !summary.any_tokens {
                return Err(ParseError::ExpressionNotComplete);
            }
            self.lex.skip_whitespace()?;
            if self.try_exact_terminal(term::COMMA)? {
                if arg == 2 {
                    return Err(ParseError::TooManyParameters);
                }
                self.ctx.img.tokens.emit_terminal(term::COMMA)?;
                continue;
            }
            if arg == 0 {
                // the end value is mandatory
                return Err(ParseError::MissingParameters);
            }
            break;
        }

        self.blocks.push(BlockFrame {
            start_cmd: CmdCode::For,
            start_pos: kw_pos,
            last_chain_pos: kw_pos,
            last_chain_cmd: CmdCode::For,
            for_control: Some(identity),
        });
        Ok(())
    }

    // --- expressions ---

    fn peek_terminal(&self) -> Option<u8> {
        let mut probe = self.lex.clone();
        probe.try_terminal()
    }

    fn try_exact_terminal(&mut self, code: u8) -> Result<bool, ParseError> {
        self.lex.skip_whitespace()?;
        if self.peek_terminal() == Some(code) {
            self.lex.try_terminal();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Parse one expression, stopping (without consuming) at `,`, `;` or
    /// an unmatched `)` at the outermost nesting level.
    fn parse_expression(&mut self) -> Result<ExprSummary, ParseError> {
        let mut parens: Vec<ParenFrame> = Vec::new();
        let mut flags = ExprFlags::fresh();
        let mut expecting_operand = true;
        let mut pending_prefix_incr = false;
        let mut summary = ExprSummary::default();
        let mut top_is_pure_var = true;
        let mut top_operands = 0u32;

        loop {
            self.lex.skip_whitespace()?;
            if self.lex.at_end() {
                if expecting_operand && summary.any_tokens || !parens.is_empty() {
                    return Err(ParseError::ExpressionNotComplete);
                }
                return Ok(summary);
            }

            // literals
            if expecting_operand {
                if let Some(lit) = self.lex.try_number()? {
                    match lit {
                        Literal::Long(v) => self.ctx.img.tokens.emit_long_const(v)?,
                        Literal::Float(v) => self.ctx.img.tokens.emit_float_const(v)?,
                        Literal::Str(_) => unreachable!("try_number never returns Literal::Str"),
                    };
                    if pending_prefix_incr {
                        return Err(ParseError::OperatorNotAllowedHere);
                    }
                    summary.any_tokens = true;
                    if parens.is_empty() {
                        top_operands += 1;
                        top_is_pure_var = false;
                    }
                    Self::after_operand(
                        &mut parens,
                        &mut flags,
                        &mut expecting_operand,
                        false,
                        false,
                        false,
                    );
                    continue;
                }
                if let Some(s) = self.lex.try_string()? {
                    if pending_prefix_incr {
                        return Err(ParseError::OperatorNotAllowedHere);
                    }
                    let idx = self.ctx.img.add_parsed_string(s, self.ctx.audit);
                    self.ctx.img.tokens.emit_string_const(idx)?;
                    summary.any_tokens = true;
                    if parens.is_empty() {
                        top_operands += 1;
                        top_is_pure_var = false;
                    }
                    Self::after_operand(
                        &mut parens,
                        &mut flags,
                        &mut expecting_operand,
                        false,
                        false,
                        false,
                    );
                    continue;
                }
            }

            // identifiers
            if let Some(ident) = self.lex.peek_identifier() {
                if !expecting_operand {
                    return Err(ParseError::TokenNotRecognised);
                }
                let ident = ident.to_string();
                self.emit_operand_for_ident(
                    &ident,
                    &mut parens,
                    &mut flags,
                    &mut expecting_operand,
                    &mut pending_prefix_incr,
                    &mut summary,
                    &mut top_is_pure_var,
                    &mut top_operands,
                )?;
                continue;
            }

            // terminals
            let save = self.lex.pos();
            let code = match self.lex.try_terminal() {
                Some(c) => c,
                None => return Err(ParseError::TokenNotRecognised),
            };
            match code {
                term::SEMICOLON | term::COMMA if parens.is_empty() => {
                    self.lex.rewind_to(save);
                    if expecting_operand && summary.any_tokens {
                        return Err(ParseError::ExpressionNotComplete);
                    }
                    summary.is_pure_var =
                        top_is_pure_var && top_operands == 1 && flags.last_is_var;
                    summary.is_whole_array = flags.var_is_array
                        && flags.var_just_emitted
                        && top_operands == 1;
                    return Ok(summary);
                }
                term::SEMICOLON => return Err(ParseError::MissingRightParenthesis),
                term::COMMA => {
                    if expecting_operand {
                        return Err(ParseError::SeparatorNotAllowedHere);
                    }
                    let frame = parens.last_mut().expect("checked non-empty");
                    self.close_argument(frame, false)?;
                    frame.next_arg();
                    self.ctx.img.tokens.emit_terminal(term::COMMA)?;
                    flags = ExprFlags::fresh();
                    expecting_operand = true;
                }
                term::LEFT_PAR => {
                    if expecting_operand {
                        // plain grouping
                        let mut frame = ParenFrame::new(ParenKind::Grouping, flags);
                        frame.min_args = 1;
                        frame.max_args = 1;
                        parens.push(frame);
                        self.ctx.img.tokens.emit_terminal(term::LEFT_PAR)?;
                        flags = ExprFlags::fresh();
                    } else if flags.var_just_emitted && flags.var_is_array {
                        // array subscript
                        let frame = ParenFrame::new(ParenKind::ArraySubs, flags);
                        parens.push(frame);
                        self.ctx.img.tokens.emit_terminal(term::LEFT_PAR)?;
                        flags = ExprFlags::fresh();
                        expecting_operand = true;
                    } else {
                        return Err(ParseError::OperatorNotAllowedHere);
                    }
                }
                term::RIGHT_PAR => {
                    let mut frame = match parens.pop() {
                        Some(f) => f,
                        None => {
                            self.lex.rewind_to(save);
                            if expecting_operand && summary.any_tokens {
                                return Err(ParseError::ExpressionNotComplete);
                            }
                            summary.is_pure_var =
                                top_is_pure_var && top_operands == 1 && flags.last_is_var;
                            summary.is_whole_array =
                                flags.var_is_array && flags.var_just_emitted && top_operands == 1;
                            return Ok(summary);
                        }
                    };
                    if expecting_operand {
                        // `f()` is fine for a zero-argument function
                        let empty_ok =
                            frame.commas == 0 && !frame.arg_has_content && frame.min_args == 0;
                        if !empty_ok {
                            return Err(ParseError::ExpressionNotComplete);
                        }
                    } else {
                        self.close_argument(&mut frame, true)?;
                    }
                    self.finish_paren(&frame)?;
                    self.ctx.img.tokens.emit_terminal(term::RIGHT_PAR)?;
                    let is_subscript = frame.kind == ParenKind::ArraySubs;
                    flags = frame.saved;
                    flags.last_is_var = is_subscript;
                    flags.var_just_emitted = false;
                    flags.var_is_array = false;
                    flags.last_op_incr_decr = false;
                    expecting_operand = false;
                    if let Some(outer) = parens.last_mut() {
                        outer.note_operand(is_subscript, false);
                    } else {
                        top_operands += 1;
                        if !is_subscript {
                            top_is_pure_var = false;
                        }
                    }
                }
                op => {
                    let def = &OPERATORS[op as usize];
                    summary.any_tokens = true;
                    if expecting_operand {
                        if def.prefix_prio == 0 {
                            return Err(ParseError::PrefixOperatorNotAllowedHere);
                        }
                        if matches!(op, term::INCR | term::DECR) {
                            pending_prefix_incr = true;
                        }
                        self.ctx.img.tokens.emit_terminal(op)?;
                        if let Some(frame) = parens.last_mut() {
                            frame.note_operator();
                        } else {
                            top_is_pure_var = false;
                        }
                    } else if def.postfix_prio != 0
                        && flags.last_is_var
                        && !flags.last_op_incr_decr
                    {
                        // postfix ++/--
                        if flags.last_is_const_var {
                            return Err(ParseError::AssignToConstNotAllowed);
                        }
                        self.ctx.img.tokens.emit_terminal(op)?;
                        flags.last_op_incr_decr = true;
                        flags.var_just_emitted = false;
                        if let Some(frame) = parens.last_mut() {
                            frame.note_operator();
                        } else {
                            top_is_pure_var = false;
                        }
                    } else {
                        if def.infix_prio == 0 {
                            return Err(ParseError::OperatorNotAllowedHere);
                        }
                        if def.flags.contains(OpFlags::ASSIGN) {
                            if !flags.last_is_var
                                || flags.last_op_incr_decr
                                || !flags.assign_possible
                            {
                                return Err(ParseError::OperatorNotAllowedHere);
                            }
                            if flags.last_is_const_var {
                                return Err(ParseError::AssignToConstNotAllowed);
                            }
                        } else {
                            flags.assign_possible = false;
                        }
                        self.ctx.img.tokens.emit_terminal(op)?;
                        flags.last_is_var = false;
                        flags.last_is_const_var = false;
                        flags.var_just_emitted = false;
                        flags.last_op_incr_decr = false;
                        expecting_operand = true;
                        if let Some(frame) = parens.last_mut() {
                            frame.note_operator();
                        } else {
                            top_is_pure_var = false;
                        }
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_operand_for_ident(
        &mut self,
        ident: &str,
        parens: &mut Vec<ParenFrame>,
        flags: &mut ExprFlags,
        expecting_operand: &mut bool,
        pending_prefix_incr: &mut bool,
        summary: &mut ExprSummary,
        top_is_pure_var: &mut bool,
        top_operands: &mut u32,
    ) -> Result<(), ParseError> {
        Lexer::check_ident_len(ident)?;
        summary.any_tokens = true;

        // commands are never valid inside an expression
        if !ident.starts_with('#') && find_command(ident).is_some() {
            return Err(ParseError::KeywordNotAllowedHere);
        }

        // symbolic constant
        if let Some((code, _)) = find_sym_const(ident) {
            self.lex.consume_identifier(ident);
            if *pending_prefix_incr {
                return Err(ParseError::OperatorNotAllowedHere);
            }
            self.ctx.img.tokens.emit_sym_const(code)?;
            if parens.is_empty() {
                *top_operands += 1;
                *top_is_pure_var = false;
            }
            Self::after_operand(parens, flags, expecting_operand, false, false, false);
            return Ok(());
        }

        // a declared variable shadows the function try-order from here on
        let var = self.try_resolve_variable(ident);

        if var.is_none() {
            // internal function
            if let Some((idx, spec)) = find_internal_fn(ident) {
                self.lex.consume_identifier(ident);
                if !self.lex.next_is_left_par() {
                    return Err(ParseError::MissingLeftParenthesis);
                }
                if spec.code == FnCode::Eval && self.mode == ParseMode::Restricted {
                    return Err(ParseError::FunctionNotAllowedHere);
                }
                self.ctx.img.tokens.emit_internal_fn(idx)?;
                self.lex.skip_whitespace()?;
                self.lex.try_terminal(); // the '('
                self.ctx.img.tokens.emit_terminal(term::LEFT_PAR)?;
                let mut frame = ParenFrame::new(ParenKind::InternalCall, *flags);
                frame.min_args = spec.min_args;
                frame.max_args = spec.max_args;
                frame.array_pattern = spec.array_pattern;
                frame.var_pattern = spec.var_pattern;
                parens.push(frame);
                *flags = ExprFlags::fresh();
                *expecting_operand = true;
                return Ok(());
            }
            // external function
            if let Some((bucket, idx, def)) = self.ctx.ext.find(ident) {
                self.lex.consume_identifier(ident);
                if !self.lex.next_is_left_par() {
                    return Err(ParseError::MissingLeftParenthesis);
                }
                self.ctx.img.tokens.emit_external_fn(bucket as u8, idx)?;
                self.lex.skip_whitespace()?;
                self.lex.try_terminal();
                self.ctx.img.tokens.emit_terminal(term::LEFT_PAR)?;
                let mut frame = ParenFrame::new(ParenKind::ExternalCall, *flags);
                frame.min_args = def.min_args;
                frame.max_args = def.max_args;
                parens.push(frame);
                *flags = ExprFlags::fresh();
                *expecting_operand = true;
                return Ok(());
            }
            // user function (only when called)
            if !ident.starts_with('#') && self.lex_clone_next_is_call(ident) {
                if self.mode == ParseMode::Restricted {
                    return Err(ParseError::FunctionNotAllowedHere);
                }
                self.lex.consume_identifier(ident);
                let fi = self
                    .ctx
                    .img
                    .func_entry(ident)
                    .ok_or(ParseError::ProgramMemoryFull)?;
                self.ctx.img.tokens.emit_user_fn(fi as u8)?;
                self.lex.skip_whitespace()?;
                self.lex.try_terminal();
                self.ctx.img.tokens.emit_terminal(term::LEFT_PAR)?;
                let mut frame = ParenFrame::new(ParenKind::UserCall, *flags);
                frame.func_index = fi;
                let func = &self.ctx.img.funcs[fi];
                if func.is_defined() {
                    frame.min_args = func.mandatory_count;
                    frame.max_args = func.param_count;
                } else {
                    frame.min_args = 0;
                    frame.max_args = MAX_FUNC_ARGS as u8;
                }
                parens.push(frame);
                *flags = ExprFlags::fresh();
                *expecting_operand = true;
                return Ok(());
            }
        }

        // variable
        let (info, name_index, value_index) = match var {
            Some(v) => v,
            None => return Err(ParseError::VarNotDeclared),
        };
        self.lex.consume_identifier(ident);
        let is_const = info & varinfo::IS_CONST != 0;
        if *pending_prefix_incr {
            if is_const {
                return Err(ParseError::AssignToConstNotAllowed);
            }
            *pending_prefix_incr = false;
        }
        if self.mode == ParseMode::Program && info & varinfo::SCOPE_MASK == Scope::User as u8 {
            // program now references this user variable: block delete
            let mut attrs = self.ctx.store.user_slot(value_index as usize).attrs;
            attrs |= VarAttr::USED_BY_PROGRAM;
            self.ctx.store.user_slot_mut(value_index as usize).attrs = attrs;
        }
        self.ctx
            .img
            .tokens
            .emit_var_ref(info, name_index, value_index)?;
        let is_array = info & varinfo::IS_ARRAY != 0;
        let subscripted_next = self.lex.next_is_left_par();
        if is_array && !subscripted_next {
            // whole-array reference (function argument)
            if parens.is_empty() {
                *top_operands += 1;
                *top_is_pure_var = false;
            }
            Self::after_operand(parens, flags, expecting_operand, false, true, false);
        } else if !is_array && subscripted_next {
            // subscripting a scalar
            return Err(ParseError::ArrayUseWrongDimCount);
        } else if is_array {
            // subscript follows; the closing parenthesis is the operand
            *expecting_operand = false;
            flags.var_just_emitted = true;
            flags.var_is_array = true;
            flags.last_is_const_var = is_const;
        } else {
            if parens.is_empty() {
                *top_operands += 1;
            }
            Self::after_operand(parens, flags, expecting_operand, true, false, is_const);
            flags.var_just_emitted = true;
        }
        Ok(())
    }

    /// Probe whether an undeclared identifier is being called.
    fn lex_clone_next_is_call(&self, ident: &str) -> bool {
        let mut probe = self.lex.clone();
        probe.consume_identifier(ident);
        probe.next_is_left_par()
    }

    fn after_operand(
        parens: &mut [ParenFrame],
        flags: &mut ExprFlags,
        expecting_operand: &mut bool,
        is_var: bool,
        is_whole_array: bool,
        is_const: bool,
    ) {
        *expecting_operand = false;
        flags.last_is_var = is_var;
        flags.last_is_const_var = is_const;
        flags.var_just_emitted = false;
        flags.var_is_array = false;
        flags.last_op_incr_decr = false;
        if let Some(frame) = parens.last_mut() {
            frame.note_operand(is_var, is_whole_array);
        }
    }

    /// Per-argument checks at `,` and `)` boundaries.
    fn close_argument(&mut self, frame: &mut ParenFrame, closing: bool) -> Result<(), ParseError> {
        let arg_index = frame.commas as usize; // 0-based
        match frame.kind {
            ParenKind::Grouping => {
                // grouping parens hold exactly one expression
                if !closing || !frame.arg_has_content {
                    return Err(ParseError::MissingRightParenthesis);
                }
            }
            ParenKind::ArraySubs => {
                if arg_index + 1 > rill_core::MAX_ARRAY_DIMS {
                    return Err(ParseError::ArrayUseWrongDimCount);
                }
            }
            ParenKind::InternalCall | ParenKind::ExternalCall => {
                if frame.args_so_far() > frame.max_args {
                    return Err(ParseError::FunctionArgCountWrong);
                }
                if arg_index < 16 {
                    let expect_array = frame.array_pattern & (1 << arg_index) != 0;
                    if expect_array && !frame.arg_is_whole_array {
                        return Err(ParseError::FunctionScalarArrayMismatch);
                    }
                    if !expect_array && frame.arg_is_whole_array {
                        return Err(ParseError::FunctionScalarArrayMismatch);
                    }
                    if frame.var_pattern & (1 << arg_index) != 0 && !frame.arg_is_pure_var {
                        return Err(ParseError::VarExpectedAsParam);
                    }
                }
            }
            ParenKind::UserCall => {
                if frame.args_so_far() > MAX_FUNC_ARGS as u8 {
                    return Err(ParseError::FunctionMaxArgsExceeded);
                }
                if frame.arg_is_whole_array && arg_index < 15 {
                    frame.call_pattern |= 1 << arg_index;
                }
            }
        }
        Ok(())
    }

    /// Close-parenthesis checks per frame kind.
    fn finish_paren(&mut self, frame: &ParenFrame) -> Result<(), ParseError> {
        let args = frame.args_so_far();
        match frame.kind {
            ParenKind::Grouping => {
                if args != 1 {
                    return Err(ParseError::MissingRightParenthesis);
                }
            }
            ParenKind::ArraySubs => {
                if args == 0 {
                    return Err(ParseError::ArrayUseNoDims);
                }
                if args as usize > rill_core::MAX_ARRAY_DIMS {
                    return Err(ParseError::ArrayUseWrongDimCount);
                }
            }
            ParenKind::InternalCall | ParenKind::ExternalCall => {
                if args < frame.min_args || args > frame.max_args {
                    return Err(ParseError::FunctionArgCountWrong);
                }
            }
            ParenKind::UserCall => {
                let func = &mut self.ctx.img.funcs[frame.func_index];
                if func.is_defined() {
                    if args < func.mandatory_count || args > func.param_count {
                        return Err(ParseError::FunctionArgCountWrong);
                    }
                    let committed = func.param_is_array & !PARAM_PATTERN_UNCOMMITTED;
                    let mask = if args >= 15 {
                        0x7FFF
                    } else {
                        (1u16 << args) - 1
                    };
                    if frame.call_pattern & mask != committed & mask {
                        return Err(ParseError::FunctionScalarArrayMismatch);
                    }
                } else {
                    // forward reference: accumulate the observed range
                    if func.seen_any {
                        func.seen_min = func.seen_min.min(args);
                        func.seen_max = func.seen_max.max(args);
                        let prev = func.param_is_array & !PARAM_PATTERN_UNCOMMITTED;
                        if prev != frame.call_pattern {
                            return Err(ParseError::FunctionScalarArrayMismatch);
                        }
                    } else {
                        func.seen_min = args;
                        func.seen_max = args;
                        func.seen_any = true;
                        func.param_is_array = PARAM_PATTERN_UNCOMMITTED | frame.call_pattern;
                    }
                }
            }
        }
        Ok(())
    }

    // --- variable resolution ---

    fn try_resolve_variable(&self, ident: &str) -> Option<(u8, u16, u16)> {
        self.resolve_variable(ident).ok()
    }

    fn resolve_variable(&self, ident: &str) -> Result<(u8, u16, u16), ParseError> {
        let (name, forced_local) = match ident.strip_prefix('#') {
            Some(rest) => (rest, true),
            None => (ident, false),
        };
        if forced_local && self.mode == ParseMode::Program {
            return Err(ParseError::VarNotDeclared);
        }

        // inside a function definition: params, locals, statics first
        if let Some(fi) = self.in_function {
            let func = &self.ctx.img.funcs[fi];
            if let Some(name_index) = self.ctx.store.find_prog_name(name) {
                if let Some(local) = func.local_index_of(name_index as u16) {
                    let def = &func.locals[local];
                    let mut info = if def.is_param {
                        Scope::Param as u8
                    } else {
                        Scope::Local as u8
                    };
                    if def.is_array {
                        info |= varinfo::IS_ARRAY;
                    }
                    if def.is_const {
                        info |= varinfo::IS_CONST;
                    }
                    return Ok((info, name_index as u16, local as u16));
                }
                if let Some(k) = func
                    .statics
                    .iter()
                    .position(|&n| n == name_index as u16)
                {
                    let slot_index = func.static_base as usize + k;
                    let slot = self.ctx.store.static_slot(slot_index);
                    let mut info = Scope::Static as u8;
                    if slot.attrs.contains(VarAttr::IS_ARRAY) {
                        info |= varinfo::IS_ARRAY;
                    }
                    if slot.attrs.contains(VarAttr::IS_CONST) {
                        info |= varinfo::IS_CONST;
                    }
                    return Ok((info, name_index as u16, slot_index as u16));
                }
            }
        }

        // stopped-function scope escape (immediate mode)
        if forced_local || (self.mode != ParseMode::Program && self.ctx.stopped_func.is_some()) {
            if let Some(fi) = self.ctx.stopped_func {
                if let Some(found) = self.resolve_in_stopped(fi, name) {
                    return Ok(found);
                }
                if forced_local {
                    return Err(ParseError::VarNotDeclared);
                }
            } else if forced_local {
                return Err(ParseError::VarNotDeclared);
            }
        }

        // global program variable
        if let Some(name_index) = self.ctx.store.find_prog_name(name) {
            if self
                .ctx
                .store
                .prog_name_attrs(name_index)
                .contains(VarAttr::HAS_GLOBAL_VALUE)
            {
                let slot = self.ctx.store.global_slot(name_index);
                let mut info = Scope::Global as u8;
                if slot.attrs.contains(VarAttr::IS_ARRAY) {
                    info |= varinfo::IS_ARRAY;
                }
                if slot.attrs.contains(VarAttr::IS_CONST) {
                    info |= varinfo::IS_CONST;
                }
                return Ok((info, name_index as u16, name_index as u16));
            }
        }

        // user variable
        if let Some(idx) = self.ctx.store.find_user_name(name) {
            let slot = self.ctx.store.user_slot(idx);
            let mut info = Scope::User as u8;
            if slot.attrs.contains(VarAttr::IS_ARRAY) {
                info |= varinfo::IS_ARRAY;
            }
            if slot.attrs.contains(VarAttr::IS_CONST) {
                info |= varinfo::IS_CONST;
            }
            return Ok((info, idx as u16, idx as u16));
        }

        Err(ParseError::VarNotDeclared)
    }

    fn resolve_in_stopped(&self, fi: usize, name: &str) -> Option<(u8, u16, u16)> {
        let func = self.ctx.img.funcs.get(fi)?;
        let name_index = self.ctx.store.find_prog_name(name)?;
        if let Some(local) = func.local_index_of(name_index as u16) {
            let def = &func.locals[local];
            let mut info = if def.is_param {
                Scope::Param as u8
            } else {
                Scope::Local as u8
            } | varinfo::FORCED_FUNC;
            if def.is_array {
                info |= varinfo::IS_ARRAY;
            }
            if def.is_const {
                info |= varinfo::IS_CONST;
            }
            return Some((info, name_index as u16, local as u16));
        }
        if let Some(k) = func.statics.iter().position(|&n| n == name_index as u16) {
            let slot_index = func.static_base as usize + k;
            let mut info = Scope::Static as u8;
            if self
                .ctx
                .store
                .static_slot(slot_index)
                .attrs
                .contains(VarAttr::IS_ARRAY)
            {
                info |= varinfo::IS_ARRAY;
            }
            return Some((info, name_index as u16, slot_index as u16));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ExternalFns;
    use crate::token::Tok;

    struct Fixture {
        img: ProgramImage,
        store: VarStore,
        bp: Breakpoints,
        audit: HeapAudit,
        ext: ExternalFns,
        pending: Vec<PendingAction>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                img: ProgramImage::new(),
                store: VarStore::new(),
                bp: Breakpoints::new(),
                audit: HeapAudit::new(),
                ext: ExternalFns::default(),
                pending: Vec::new(),
            }
        }

        fn parse(&mut self, src: &str, mode: ParseMode) -> Result<(), ParseDiag> {
            let mut ctx = ParseCtx {
                img: &mut self.img,
                store: &mut self.store,
                bp: &mut self.bp,
                audit: &mut self.audit,
                ext: &self.ext,
                stopped_func: None,
                pending: &mut self.pending,
            };
            Parser::new(&mut ctx, src, mode).parse()
        }
    }

    #[test]
    fn test_immediate_line_emits_tokens() {
        let mut fx = Fixture::new();
        fx.parse("var a=3; a=a+4;", ParseMode::Immediate).unwrap();
        let imm = fx.img.tokens.imm_base();
        assert!(matches!(fx.img.tokens.at(imm), Tok::Keyword { .. }));
        assert_eq!(fx.store.find_user_name("a"), Some(0));
    }

    #[test]
    fn test_undeclared_variable_rejected() {
        let mut fx = Fixture::new();
        let err = fx.parse("x=1;", ParseMode::Immediate).unwrap_err();
        assert_eq!(err.error, ParseError::VarNotDeclared);
    }

    #[test]
    fn test_redeclaration_rejected() {
        let mut fx = Fixture::new();
        fx.parse("var a=1;", ParseMode::Immediate).unwrap();
        let err = fx.parse("var a=2;", ParseMode::Immediate).unwrap_err();
        assert_eq!(err.error, ParseError::VarRedeclared);
    }

    #[test]
    fn test_failed_statement_rolls_back_new_vars() {
        let mut fx = Fixture::new();
        // the declarator parses, then the missing separator fails the
        // statement; the variable must not survive
        let err = fx.parse("var b=1 var", ParseMode::Immediate).unwrap_err();
        assert_ne!(err.error, ParseError::VarRedeclared);
        assert_eq!(fx.store.find_user_name("b"), None);
        assert!(fx.audit.all_balanced());
    }

    #[test]
    fn test_initializer_constant_folding() {
        let mut fx = Fixture::new();
        fx.parse(r#"var s="he"+"llo";"#, ParseMode::Immediate).unwrap();
        let idx = fx.store.find_user_name("s").unwrap();
        assert_eq!(
            fx.store.user_slot(idx).value,
            Some(Value::str_from("hello"))
        );
    }

    #[test]
    fn test_assignment_to_constant_rejected() {
        let mut fx = Fixture::new();
        fx.parse("const c=1;", ParseMode::Immediate).unwrap();
        let err = fx.parse("c=2;", ParseMode::Immediate).unwrap_err();
        assert_eq!(err.error, ParseError::AssignToConstNotAllowed);
    }

    #[test]
    fn test_program_requires_program_command() {
        let mut fx = Fixture::new();
        let err = fx.parse("var g=1;", ParseMode::Program).unwrap_err();
        assert_eq!(err.error, ParseError::ProgramCmdMissing);
    }

    #[test]
    fn test_block_keyword_preconditions() {
        let mut fx = Fixture::new();
        let err = fx.parse("else;", ParseMode::Immediate).unwrap_err();
        assert_eq!(err.error, ParseError::MisplacedBlockKeyword);

        let err = fx.parse("break;", ParseMode::Immediate).unwrap_err();
        assert_eq!(err.error, ParseError::NoOpenLoop);

        let err = fx.parse("end;", ParseMode::Immediate).unwrap_err();
        assert_eq!(err.error, ParseError::NoOpenBlock);
    }

    #[test]
    fn test_unclosed_immediate_block_rejected() {
        let mut fx = Fixture::new();
        let err = fx
            .parse("var i=0; while i<3; i=i+1;", ParseMode::Immediate)
            .unwrap_err();
        assert_eq!(err.error, ParseError::BlockNotClosed);
    }

    #[test]
    fn test_restricted_mode_rejects_commands() {
        let mut fx = Fixture::new();
        let err = fx.parse("cout(1);", ParseMode::Restricted).unwrap_err();
        assert_eq!(err.error, ParseError::KeywordNotAllowedHere);
    }

    #[test]
    fn test_separator_promotion_builds_line_ranges() {
        let mut fx = Fixture::new();
        let src = "program P;\nfunction f();\nreturn 1;\nend;\n";
        fx.parse(src, ParseMode::Program).unwrap();
        // lines 2..4 start statements after a separator
        assert_eq!(fx.bp.ranges.line_to_index(2), Some(0));
        assert_eq!(fx.bp.ranges.line_to_index(3), Some(1));
        assert_eq!(fx.bp.ranges.line_to_index(4), Some(2));
        assert_eq!(fx.bp.ranges.line_to_index(5), None);
    }

    #[test]
    fn test_internal_fn_arity_checked() {
        let mut fx = Fixture::new();
        let err = fx.parse("var y=0; y=sqrt(1,2);", ParseMode::Immediate).unwrap_err();
        assert_eq!(err.error, ParseError::FunctionArgCountWrong);
    }

    #[test]
    fn test_ubound_requires_array_argument() {
        let mut fx = Fixture::new();
        fx.parse("var v=0;", ParseMode::Immediate).unwrap();
        let err = fx.parse("v=ubound(v,1);", ParseMode::Immediate).unwrap_err();
        assert_eq!(err.error, ParseError::FunctionScalarArrayMismatch);
    }

    #[test]
    fn test_grouping_paren_rejects_comma_in_expression() {
        let mut fx = Fixture::new();
        fx.parse("var v=0;", ParseMode::Immediate).unwrap();
        let err = fx.parse("v=(1,2)+3;", ParseMode::Immediate).unwrap_err();
        assert_eq!(err.error, ParseError::MissingRightParenthesis);
    }
}
