//! Fixed language tables
//!
//! Terminals (operators and punctuation) with their three priorities,
//! commands with their usage restrictions and block roles, the internal
//! function table with arity and array-argument patterns, and the
//! symbolic constants. The parser and executor never hard-code language
//! surface outside this module.

/// Terminal codes. The statement separator comes in three flavours; the
/// breakpoint variants are only ever produced by separator rewrites, the
/// lexer always yields the plain one.
pub mod term {
    pub const SEMICOLON_BP_SET: u8 = 0;
    pub const SEMICOLON_BP_ALLOWED: u8 = 1;
    pub const SEMICOLON: u8 = 2;
    pub const COMMA: u8 = 3;
    pub const LEFT_PAR: u8 = 4;
    pub const RIGHT_PAR: u8 = 5;

    pub const ASSIGN: u8 = 6;
    pub const BIT_AND: u8 = 7;
    pub const BIT_XOR: u8 = 8;
    pub const BIT_OR: u8 = 9;
    pub const AND: u8 = 10;
    pub const OR: u8 = 11;
    pub const NOT: u8 = 12;
    pub const BIT_COMPL: u8 = 13;
    pub const EQ: u8 = 14;
    pub const NE: u8 = 15;
    pub const LT: u8 = 16;
    pub const GT: u8 = 17;
    pub const LTOE: u8 = 18;
    pub const GTOE: u8 = 19;
    pub const SHL: u8 = 20;
    pub const SHR: u8 = 21;
    pub const PLUS: u8 = 22;
    pub const MINUS: u8 = 23;
    pub const MULT: u8 = 24;
    pub const DIV: u8 = 25;
    pub const MOD: u8 = 26;
    pub const POW: u8 = 27;
    pub const INCR: u8 = 28;
    pub const DECR: u8 = 29;
    pub const PLUS_ASSIGN: u8 = 30;
    pub const MINUS_ASSIGN: u8 = 31;
    pub const MULT_ASSIGN: u8 = 32;
    pub const DIV_ASSIGN: u8 = 33;
    pub const MOD_ASSIGN: u8 = 34;
    pub const AND_ASSIGN: u8 = 35;
    pub const OR_ASSIGN: u8 = 36;
    pub const XOR_ASSIGN: u8 = 37;
    pub const SHL_ASSIGN: u8 = 38;
    pub const SHR_ASSIGN: u8 = 39;

    pub const COUNT: usize = 40;

    pub fn is_semicolon(code: u8) -> bool {
        code <= SEMICOLON
    }
}

bitflags::bitflags! {
    /// Operator behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u8 {
        /// Operands must coerce to long, result is long
        const LONG_ONLY = 0x01;
        /// Operands numeric (long or float), result is long 0/1
        const RES_LONG  = 0x02;
        /// Right-to-left infix associativity
        const RTOL      = 0x04;
        /// Pure or compound assignment
        const ASSIGN    = 0x08;
    }
}

/// One terminal's operator properties. Priority 0 means the terminal has
/// no operator role at that position.
#[derive(Debug, Clone, Copy)]
pub struct OpDef {
    pub prefix_prio: u8,
    pub infix_prio: u8,
    pub postfix_prio: u8,
    pub flags: OpFlags,
    /// Underlying operator of a compound assignment (0xFF = none)
    pub compound_base: u8,
}

const fn op(
    prefix_prio: u8,
    infix_prio: u8,
    postfix_prio: u8,
    flags: OpFlags,
    compound_base: u8,
) -> OpDef {
    OpDef {
        prefix_prio,
        infix_prio,
        postfix_prio,
        flags,
        compound_base,
    }
}

const NONE: OpDef = op(0, 0, 0, OpFlags::empty(), 0xFF);
const LONG: OpFlags = OpFlags::LONG_ONLY;
const RESL: OpFlags = OpFlags::RES_LONG;
const RTOL: OpFlags = OpFlags::RTOL;
const ASG: OpFlags = OpFlags::ASSIGN;

/// Operator properties indexed by terminal code.
pub static OPERATORS: [OpDef; term::COUNT] = [
    NONE,                                              // ; (BP set)
    NONE,                                              // ; (BP allowed)
    NONE,                                              // ;
    NONE,                                              // ,
    NONE,                                              // (
    NONE,                                              // )
    op(0, 0x01, 0, RTOL.union(ASG), 0xFF),             // =
    op(0, 0x06, 0, LONG, 0xFF),                        // &
    op(0, 0x05, 0, LONG, 0xFF),                        // ^
    op(0, 0x04, 0, LONG, 0xFF),                        // |
    op(0, 0x03, 0, RESL, 0xFF),                        // &&
    op(0, 0x02, 0, RESL, 0xFF),                        // ||
    op(0x0C, 0, 0, RESL, 0xFF),                        // !
    op(0x0C, 0, 0, LONG, 0xFF),                        // ~
    op(0, 0x07, 0, RESL, 0xFF),                        // ==
    op(0, 0x07, 0, RESL, 0xFF),                        // !=
    op(0, 0x08, 0, RESL, 0xFF),                        // <
    op(0, 0x08, 0, RESL, 0xFF),                        // >
    op(0, 0x08, 0, RESL, 0xFF),                        // <=
    op(0, 0x08, 0, RESL, 0xFF),                        // >=
    op(0, 0x09, 0, LONG, 0xFF),                        // <<
    op(0, 0x09, 0, LONG, 0xFF),                        // >>
    op(0x0C, 0x0A, 0, OpFlags::empty(), 0xFF),         // +
    op(0x0C, 0x0A, 0, OpFlags::empty(), 0xFF),         // -
    op(0, 0x0B, 0, OpFlags::empty(), 0xFF),            // *
    op(0, 0x0B, 0, OpFlags::empty(), 0xFF),            // /
    op(0, 0x0B, 0, LONG, 0xFF),                        // %
    op(0, 0x0D, 0, RTOL, 0xFF),                        // **
    op(0x0E, 0, 0x0F, OpFlags::empty(), 0xFF),         // ++
    op(0x0E, 0, 0x0F, OpFlags::empty(), 0xFF),         // --
    op(0, 0x01, 0, RTOL.union(ASG), term::PLUS),       // +=
    op(0, 0x01, 0, RTOL.union(ASG), term::MINUS),      // -=
    op(0, 0x01, 0, RTOL.union(ASG), term::MULT),       // *=
    op(0, 0x01, 0, RTOL.union(ASG), term::DIV),        // /=
    op(0, 0x01, 0, RTOL.union(ASG).union(LONG), term::MOD), // %=
    op(0, 0x01, 0, RTOL.union(ASG).union(LONG), term::BIT_AND), // &=
    op(0, 0x01, 0, RTOL.union(ASG).union(LONG), term::BIT_OR),  // |=
    op(0, 0x01, 0, RTOL.union(ASG).union(LONG), term::BIT_XOR), // ^=
    op(0, 0x01, 0, RTOL.union(ASG).union(LONG), term::SHL),     // <<=
    op(0, 0x01, 0, RTOL.union(ASG).union(LONG), term::SHR),     // >>=
];

/// Lexable terminal spellings, longest first so prefixes never shadow
/// longer operators.
pub static TERMINAL_LEXEMES: [(&str, u8); 38] = [
    ("<<=", term::SHL_ASSIGN),
    (">>=", term::SHR_ASSIGN),
    ("**", term::POW),
    ("++", term::INCR),
    ("--", term::DECR),
    ("+=", term::PLUS_ASSIGN),
    ("-=", term::MINUS_ASSIGN),
    ("*=", term::MULT_ASSIGN),
    ("/=", term::DIV_ASSIGN),
    ("%=", term::MOD_ASSIGN),
    ("&=", term::AND_ASSIGN),
    ("|=", term::OR_ASSIGN),
    ("^=", term::XOR_ASSIGN),
    ("<<", term::SHL),
    (">>", term::SHR),
    ("<=", term::LTOE),
    (">=", term::GTOE),
    ("==", term::EQ),
    ("!=", term::NE),
    ("&&", term::AND),
    ("||", term::OR),
    (";", term::SEMICOLON),
    (",", term::COMMA),
    ("(", term::LEFT_PAR),
    (")", term::RIGHT_PAR),
    ("=", term::ASSIGN),
    ("&", term::BIT_AND),
    ("^", term::BIT_XOR),
    ("|", term::BIT_OR),
    ("!", term::NOT),
    ("~", term::BIT_COMPL),
    ("<", term::LT),
    (">", term::GT),
    ("+", term::PLUS),
    ("-", term::MINUS),
    ("*", term::MULT),
    ("/", term::DIV),
    ("%", term::MOD),
];

// --- commands ---

/// Command codes (keyword token payload byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmdCode {
    Program = 0,
    Function,
    Var,
    Const,
    Static,
    For,
    While,
    If,
    ElseIf,
    Else,
    End,
    Break,
    Continue,
    Return,
    Stop,
    Nop,
    Go,
    Step,
    StepOver,
    StepOut,
    BStepOut,
    Loop,
    SetNextLine,
    Abort,
    Debug,
    BpOn,
    BpOff,
    BpActivate,
    SetBp,
    ClearBp,
    EnableBp,
    DisableBp,
    MoveBp,
    ListBp,
    RaiseError,
    TrapErrors,
    ClearError,
    Quit,
    Cout,
    CoutLine,
    CoutList,
    Print,
    PrintLine,
    PrintList,
    Vprint,
    ListVars,
    ListCallStack,
    ListFiles,
    Info,
    Input,
    DispWidth,
    FloatFmt,
    IntFmt,
    DispMode,
    TabSize,
    AngleMode,
    ClearMem,
    ClearProg,
    LoadProg,
    Delete,
}

impl CmdCode {
    pub fn from_u8(v: u8) -> Option<CmdCode> {
        if (v as usize) < COMMANDS.len() {
            Some(COMMANDS[v as usize].code)
        } else {
            None
        }
    }
}

bitflags::bitflags! {
    /// Where a command may appear, and whether the executor skips it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmdWhere: u8 {
        /// In a program, outside any function body
        const PROG_OUT_FUNC = 0x01;
        /// In a program, inside a function body
        const PROG_IN_FUNC  = 0x02;
        /// In immediate mode
        const IMMEDIATE     = 0x04;
        /// Only as very first statement of a program
        const PROGRAM_TOP   = 0x08;
        /// Only as very first statement of an immediate line
        const IMM_TOP       = 0x20;
        /// The executor steps over this statement (declarations and
        /// parse-time commands); also makes it an invalid breakpoint
        /// target
        const SKIP_EXEC     = 0x10;
    }
}

const W_NO_RESTRICTION: CmdWhere = CmdWhere::PROG_OUT_FUNC
    .union(CmdWhere::PROG_IN_FUNC)
    .union(CmdWhere::IMMEDIATE);
const W_IMM_OR_FUNC: CmdWhere = CmdWhere::PROG_IN_FUNC.union(CmdWhere::IMMEDIATE);
const W_IMM: CmdWhere = CmdWhere::IMMEDIATE;
const W_FUNC: CmdWhere = CmdWhere::PROG_IN_FUNC;
const SKIP: CmdWhere = CmdWhere::SKIP_EXEC;

/// Argument list shape of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgPattern {
    /// No arguments
    None,
    /// `min..=max` comma-separated expressions
    Exprs,
    /// One unqualified identifier
    Ident,
    /// 1..=max unqualified identifiers
    Idents,
    /// Variable declarators (`name`, `name(dims)`, `name = const`)
    Declarators,
    /// `name(params)` function definition header
    FuncDef,
    /// `var = expr, expr [, expr]` loop specification
    ForSpec,
    /// Leading writable variable, then expressions
    VarThenExprs,
}

/// Block machinery role of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    None,
    FunctionStart,
    ForStart,
    WhileStart,
    IfStart,
    /// Must follow `if` or `elseif` in the same open block
    ElseIf,
    /// Must follow `if` or `elseif` in the same open block
    Else,
    /// Closes any open block
    End,
    /// `break` / `continue`: requires an open loop somewhere
    LoopCtl,
    /// `return`: requires an open function definition
    ReturnCtl,
}

#[derive(Debug, Clone, Copy)]
pub struct CmdSpec {
    pub name: &'static str,
    pub code: CmdCode,
    pub where_allowed: CmdWhere,
    pub min_args: u8,
    pub max_args: u8,
    pub args: ArgPattern,
    pub block: BlockRole,
}

const fn cmd(
    name: &'static str,
    code: CmdCode,
    where_allowed: CmdWhere,
    min_args: u8,
    max_args: u8,
    args: ArgPattern,
    block: BlockRole,
) -> CmdSpec {
    CmdSpec {
        name,
        code,
        where_allowed,
        min_args,
        max_args,
        args,
        block,
    }
}

/// The command table, indexed by `CmdCode` discriminant.
pub static COMMANDS: [CmdSpec; 60] = [
    cmd("program", CmdCode::Program, CmdWhere::PROG_OUT_FUNC.union(CmdWhere::PROGRAM_TOP).union(SKIP), 1, 1, ArgPattern::Ident, BlockRole::None),
    cmd("function", CmdCode::Function, CmdWhere::PROG_OUT_FUNC.union(SKIP), 1, 1, ArgPattern::FuncDef, BlockRole::FunctionStart),
    cmd("var", CmdCode::Var, W_NO_RESTRICTION.union(SKIP), 1, 15, ArgPattern::Declarators, BlockRole::None),
    cmd("const", CmdCode::Const, W_NO_RESTRICTION.union(SKIP), 1, 15, ArgPattern::Declarators, BlockRole::None),
    cmd("static", CmdCode::Static, W_FUNC.union(SKIP), 1, 15, ArgPattern::Declarators, BlockRole::None),
    cmd("for", CmdCode::For, W_IMM_OR_FUNC, 2, 3, ArgPattern::ForSpec, BlockRole::ForStart),
    cmd("while", CmdCode::While, W_IMM_OR_FUNC, 1, 1, ArgPattern::Exprs, BlockRole::WhileStart),
    cmd("if", CmdCode::If, W_IMM_OR_FUNC, 1, 1, ArgPattern::Exprs, BlockRole::IfStart),
    cmd("elseif", CmdCode::ElseIf, W_IMM_OR_FUNC, 1, 1, ArgPattern::Exprs, BlockRole::ElseIf),
    cmd("else", CmdCode::Else, W_IMM_OR_FUNC, 0, 0, ArgPattern::None, BlockRole::Else),
    cmd("end", CmdCode::End, W_NO_RESTRICTION, 0, 0, ArgPattern::None, BlockRole::End),
    cmd("break", CmdCode::Break, W_IMM_OR_FUNC, 0, 0, ArgPattern::None, BlockRole::LoopCtl),
    cmd("continue", CmdCode::Continue, W_IMM_OR_FUNC, 0, 0, ArgPattern::None, BlockRole::LoopCtl),
    cmd("return", CmdCode::Return, W_IMM_OR_FUNC, 0, 1, ArgPattern::Exprs, BlockRole::ReturnCtl),
    cmd("stop", CmdCode::Stop, W_FUNC, 0, 0, ArgPattern::None, BlockRole::None),
    cmd("nop", CmdCode::Nop, W_FUNC.union(SKIP), 0, 0, ArgPattern::None, BlockRole::None),
    cmd("go", CmdCode::Go, W_IMM, 0, 0, ArgPattern::None, BlockRole::None),
    cmd("step", CmdCode::Step, W_IMM, 0, 0, ArgPattern::None, BlockRole::None),
    cmd("stepOver", CmdCode::StepOver, W_IMM, 0, 0, ArgPattern::None, BlockRole::None),
    cmd("stepOut", CmdCode::StepOut, W_IMM, 0, 0, ArgPattern::None, BlockRole::None),
    cmd("bStepOut", CmdCode::BStepOut, W_IMM, 0, 0, ArgPattern::None, BlockRole::None),
    cmd("loop", CmdCode::Loop, W_IMM, 0, 0, ArgPattern::None, BlockRole::None),
    cmd("setNextLine", CmdCode::SetNextLine, W_IMM, 1, 1, ArgPattern::Exprs, BlockRole::None),
    cmd("abort", CmdCode::Abort, W_IMM, 0, 0, ArgPattern::None, BlockRole::None),
    cmd("debug", CmdCode::Debug, W_IMM, 0, 0, ArgPattern::None, BlockRole::None),
    cmd("BPon", CmdCode::BpOn, W_IMM, 0, 0, ArgPattern::None, BlockRole::None),
    cmd("BPoff", CmdCode::BpOff, W_IMM, 0, 0, ArgPattern::None, BlockRole::None),
    cmd("BPactivate", CmdCode::BpActivate, W_IMM, 0, 0, ArgPattern::None, BlockRole::None),
    cmd("setBP", CmdCode::SetBp, W_IMM, 1, 4, ArgPattern::Exprs, BlockRole::None),
    cmd("clearBP", CmdCode::ClearBp, W_IMM, 1, 9, ArgPattern::Exprs, BlockRole::None),
    cmd("enableBP", CmdCode::EnableBp, W_IMM, 1, 9, ArgPattern::Exprs, BlockRole::None),
    cmd("disableBP", CmdCode::DisableBp, W_IMM, 1, 9, ArgPattern::Exprs, BlockRole::None),
    cmd("moveBP", CmdCode::MoveBp, W_IMM, 2, 2, ArgPattern::Exprs, BlockRole::None),
    cmd("listBP", CmdCode::ListBp, W_IMM_OR_FUNC, 0, 1, ArgPattern::Exprs, BlockRole::None),
    cmd("raiseError", CmdCode::RaiseError, W_IMM_OR_FUNC, 1, 1, ArgPattern::Exprs, BlockRole::None),
    cmd("trapErrors", CmdCode::TrapErrors, W_IMM_OR_FUNC, 1, 1, ArgPattern::Exprs, BlockRole::None),
    cmd("clearError", CmdCode::ClearError, W_IMM_OR_FUNC, 0, 0, ArgPattern::None, BlockRole::None),
    cmd("quit", CmdCode::Quit, W_IMM_OR_FUNC, 0, 0, ArgPattern::None, BlockRole::None),
    cmd("cout", CmdCode::Cout, W_IMM_OR_FUNC, 1, 15, ArgPattern::Exprs, BlockRole::None),
    cmd("coutLine", CmdCode::CoutLine, W_IMM_OR_FUNC, 0, 15, ArgPattern::Exprs, BlockRole::None),
    cmd("coutList", CmdCode::CoutList, W_IMM_OR_FUNC, 1, 15, ArgPattern::Exprs, BlockRole::None),
    cmd("print", CmdCode::Print, W_IMM_OR_FUNC, 2, 16, ArgPattern::Exprs, BlockRole::None),
    cmd("printLine", CmdCode::PrintLine, W_IMM_OR_FUNC, 1, 16, ArgPattern::Exprs, BlockRole::None),
    cmd("printList", CmdCode::PrintList, W_IMM_OR_FUNC, 2, 16, ArgPattern::Exprs, BlockRole::None),
    cmd("vprint", CmdCode::Vprint, W_IMM_OR_FUNC, 2, 16, ArgPattern::VarThenExprs, BlockRole::None),
    cmd("listVars", CmdCode::ListVars, W_IMM_OR_FUNC, 0, 1, ArgPattern::Exprs, BlockRole::None),
    cmd("listCallStack", CmdCode::ListCallStack, W_IMM_OR_FUNC, 0, 1, ArgPattern::Exprs, BlockRole::None),
    cmd("listFiles", CmdCode::ListFiles, W_IMM_OR_FUNC, 0, 1, ArgPattern::Exprs, BlockRole::None),
    cmd("info", CmdCode::Info, W_IMM_OR_FUNC, 1, 2, ArgPattern::VarThenExprs, BlockRole::None),
    cmd("input", CmdCode::Input, W_IMM_OR_FUNC, 3, 3, ArgPattern::VarThenExprs, BlockRole::None),
    cmd("dispWidth", CmdCode::DispWidth, W_IMM_OR_FUNC, 1, 1, ArgPattern::Exprs, BlockRole::None),
    cmd("floatFmt", CmdCode::FloatFmt, W_IMM_OR_FUNC, 1, 3, ArgPattern::Exprs, BlockRole::None),
    cmd("intFmt", CmdCode::IntFmt, W_IMM_OR_FUNC, 1, 3, ArgPattern::Exprs, BlockRole::None),
    cmd("dispMode", CmdCode::DispMode, W_IMM_OR_FUNC, 2, 2, ArgPattern::Exprs, BlockRole::None),
    cmd("tabSize", CmdCode::TabSize, W_IMM_OR_FUNC, 1, 1, ArgPattern::Exprs, BlockRole::None),
    cmd("angleMode", CmdCode::AngleMode, W_IMM_OR_FUNC, 1, 1, ArgPattern::Exprs, BlockRole::None),
    cmd("clearMem", CmdCode::ClearMem, W_IMM.union(SKIP), 0, 0, ArgPattern::None, BlockRole::None),
    cmd("clearProg", CmdCode::ClearProg, W_IMM.union(SKIP), 0, 0, ArgPattern::None, BlockRole::None),
    cmd("loadProg", CmdCode::LoadProg, W_IMM, 0, 1, ArgPattern::Exprs, BlockRole::None),
    cmd("delete", CmdCode::Delete, W_IMM.union(CmdWhere::IMM_TOP).union(SKIP), 1, 15, ArgPattern::Idents, BlockRole::None),
];

pub fn find_command(name: &str) -> Option<&'static CmdSpec> {
    COMMANDS.iter().find(|c| c.name == name)
}

pub fn command(code: CmdCode) -> &'static CmdSpec {
    &COMMANDS[code as usize]
}

// --- internal functions ---

/// Internal function codes (internal-function token payload byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FnCode {
    // math
    Sqrt = 0,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Ln,
    Lnp1,
    Log10,
    Exp,
    Expm1,
    Round,
    Ceil,
    Floor,
    Trunc,
    Min,
    Max,
    Abs,
    Sign,
    Fmod,
    Pow,
    Square,
    // lookup
    Ifte,
    Switch,
    Index,
    Choose,
    // conversion
    CInt,
    CFloat,
    CStr,
    // timing
    Millis,
    Micros,
    Wait,
    // bits and bytes
    Bit,
    BitRead,
    BitClear,
    BitSet,
    BitWrite,
    ByteRead,
    ByteWrite,
    MaskedWordRead,
    MaskedWordClear,
    MaskedWordSet,
    MaskedWordWrite,
    // strings
    Char,
    Len,
    Nl,
    Asc,
    Rtrim,
    Ltrim,
    Trim,
    Left,
    Mid,
    Right,
    ToUpper,
    ToLower,
    Space,
    RepeatChar,
    ReplaceChar,
    ReplaceStr,
    FindStr,
    StrCmp,
    StrCaseCmp,
    AscToHexStr,
    HexStrToAsc,
    Quote,
    IsAlpha,
    IsAlphaNumeric,
    IsDigit,
    IsHexDigit,
    IsSpace,
    IsUpperCase,
    IsLowerCase,
    // meta
    Eval,
    Ubound,
    Dims,
    Type,
    Last,
    ErrVal,
    IsColdStart,
    SysVal,
    // formatting
    Fmt,
    Tab,
    Col,
    Pos,
    // stream I/O
    Cin,
    CinLine,
    Read,
    ReadLine,
    ReadList,
    CinList,
    VreadList,
    Peek,
    Available,
    Flush,
    SetTimeout,
    GetTimeout,
    // files
    Open,
    Close,
    CloseAll,
    Position,
    Size,
    Seek,
    Exists,
    Remove,
    FileNum,
    IsInUse,
}

#[derive(Debug, Clone, Copy)]
pub struct FnSpec {
    pub name: &'static str,
    pub code: FnCode,
    pub min_args: u8,
    pub max_args: u8,
    /// Bit k set: argument k+1 must be an array name
    pub array_pattern: u16,
    /// Bit k set: argument k+1 must be a writable variable
    pub var_pattern: u16,
}

const fn f(name: &'static str, code: FnCode, min_args: u8, max_args: u8) -> FnSpec {
    FnSpec {
        name,
        code,
        min_args,
        max_args,
        array_pattern: 0,
        var_pattern: 0,
    }
}

const fn fa(
    name: &'static str,
    code: FnCode,
    min_args: u8,
    max_args: u8,
    array_pattern: u16,
) -> FnSpec {
    FnSpec {
        name,
        code,
        min_args,
        max_args,
        array_pattern,
        var_pattern: 0,
    }
}

const fn fv(
    name: &'static str,
    code: FnCode,
    min_args: u8,
    max_args: u8,
    var_pattern: u16,
) -> FnSpec {
    FnSpec {
        name,
        code,
        min_args,
        max_args,
        array_pattern: 0,
        var_pattern,
    }
}

/// The internal function table.
pub static FUNCTIONS: &[FnSpec] = &[
    f("sqrt", FnCode::Sqrt, 1, 1),
    f("sin", FnCode::Sin, 1, 1),
    f("cos", FnCode::Cos, 1, 1),
    f("tan", FnCode::Tan, 1, 1),
    f("asin", FnCode::Asin, 1, 1),
    f("acos", FnCode::Acos, 1, 1),
    f("atan", FnCode::Atan, 1, 1),
    f("ln", FnCode::Ln, 1, 1),
    f("lnp1", FnCode::Lnp1, 1, 1),
    f("log10", FnCode::Log10, 1, 1),
    f("exp", FnCode::Exp, 1, 1),
    f("expm1", FnCode::Expm1, 1, 1),
    f("round", FnCode::Round, 1, 1),
    f("ceil", FnCode::Ceil, 1, 1),
    f("floor", FnCode::Floor, 1, 1),
    f("trunc", FnCode::Trunc, 1, 1),
    f("min", FnCode::Min, 2, 2),
    f("max", FnCode::Max, 2, 2),
    f("abs", FnCode::Abs, 1, 1),
    f("sign", FnCode::Sign, 1, 1),
    f("fmod", FnCode::Fmod, 2, 2),
    f("pow", FnCode::Pow, 2, 2),
    f("square", FnCode::Square, 1, 1),
    f("ifte", FnCode::Ifte, 3, 15),
    f("switch", FnCode::Switch, 3, 15),
    f("index", FnCode::Index, 3, 15),
    f("choose", FnCode::Choose, 3, 15),
    f("cInt", FnCode::CInt, 1, 1),
    f("cFloat", FnCode::CFloat, 1, 1),
    f("cStr", FnCode::CStr, 1, 1),
    f("millis", FnCode::Millis, 0, 0),
    f("micros", FnCode::Micros, 0, 0),
    f("wait", FnCode::Wait, 1, 1),
    f("bit", FnCode::Bit, 1, 1),
    f("bitRead", FnCode::BitRead, 2, 2),
    fv("bitClear", FnCode::BitClear, 2, 2, 0b1),
    fv("bitSet", FnCode::BitSet, 2, 2, 0b1),
    fv("bitWrite", FnCode::BitWrite, 3, 3, 0b1),
    f("byteRead", FnCode::ByteRead, 2, 2),
    fv("byteWrite", FnCode::ByteWrite, 3, 3, 0b1),
    f("maskedWordRead", FnCode::MaskedWordRead, 2, 2),
    fv("maskedWordClear", FnCode::MaskedWordClear, 2, 2, 0b1),
    fv("maskedWordSet", FnCode::MaskedWordSet, 2, 2, 0b1),
    fv("maskedWordWrite", FnCode::MaskedWordWrite, 3, 3, 0b1),
    f("char", FnCode::Char, 1, 1),
    f("len", FnCode::Len, 1, 1),
    f("nl", FnCode::Nl, 0, 0),
    f("asc", FnCode::Asc, 1, 2),
    f("rtrim", FnCode::Rtrim, 1, 1),
    f("ltrim", FnCode::Ltrim, 1, 1),
    f("trim", FnCode::Trim, 1, 1),
    f("left", FnCode::Left, 2, 2),
    f("mid", FnCode::Mid, 3, 3),
    f("right", FnCode::Right, 2, 2),
    f("toUpper", FnCode::ToUpper, 1, 1),
    f("toLower", FnCode::ToLower, 1, 1),
    f("space", FnCode::Space, 1, 1),
    f("repeatChar", FnCode::RepeatChar, 2, 2),
    f("replaceChar", FnCode::ReplaceChar, 3, 3),
    f("replaceStr", FnCode::ReplaceStr, 3, 3),
    f("findStr", FnCode::FindStr, 2, 3),
    f("strCmp", FnCode::StrCmp, 2, 2),
    f("strCaseCmp", FnCode::StrCaseCmp, 2, 2),
    f("ascToHexStr", FnCode::AscToHexStr, 1, 1),
    f("hexStrToAsc", FnCode::HexStrToAsc, 1, 1),
    f("quote", FnCode::Quote, 1, 1),
    f("isAlpha", FnCode::IsAlpha, 1, 1),
    f("isAlphaNumeric", FnCode::IsAlphaNumeric, 1, 1),
    f("isDigit", FnCode::IsDigit, 1, 1),
    f("isHexDigit", FnCode::IsHexDigit, 1, 1),
    f("isSpace", FnCode::IsSpace, 1, 1),
    f("isUpperCase", FnCode::IsUpperCase, 1, 1),
    f("isLowerCase", FnCode::IsLowerCase, 1, 1),
    f("eval", FnCode::Eval, 1, 1),
    fa("ubound", FnCode::Ubound, 2, 2, 0b1),
    fa("dims", FnCode::Dims, 1, 1, 0b1),
    f("type", FnCode::Type, 1, 1),
    f("last", FnCode::Last, 0, 1),
    f("err", FnCode::ErrVal, 0, 0),
    f("isColdStart", FnCode::IsColdStart, 0, 0),
    f("sysVal", FnCode::SysVal, 1, 1),
    f("fmt", FnCode::Fmt, 2, 6),
    f("tab", FnCode::Tab, 0, 1),
    f("col", FnCode::Col, 1, 1),
    f("pos", FnCode::Pos, 0, 0),
    f("cin", FnCode::Cin, 0, 0),
    f("cinLine", FnCode::CinLine, 0, 0),
    f("read", FnCode::Read, 1, 1),
    f("readLine", FnCode::ReadLine, 1, 1),
    fv("readList", FnCode::ReadList, 2, 15, 0xFFFE),
    fv("cinList", FnCode::CinList, 1, 15, 0xFFFF),
    fv("vreadList", FnCode::VreadList, 2, 15, 0xFFFE),
    f("peek", FnCode::Peek, 1, 1),
    f("available", FnCode::Available, 1, 1),
    f("flush", FnCode::Flush, 1, 1),
    f("setTimeout", FnCode::SetTimeout, 2, 2),
    f("getTimeout", FnCode::GetTimeout, 1, 1),
    f("open", FnCode::Open, 1, 2),
    f("close", FnCode::Close, 1, 1),
    f("closeAll", FnCode::CloseAll, 0, 0),
    f("position", FnCode::Position, 1, 1),
    f("size", FnCode::Size, 1, 1),
    f("seek", FnCode::Seek, 2, 2),
    f("exists", FnCode::Exists, 1, 1),
    f("remove", FnCode::Remove, 1, 1),
    f("fileNum", FnCode::FileNum, 1, 1),
    f("isInUse", FnCode::IsInUse, 1, 1),
];

pub fn find_internal_fn(name: &str) -> Option<(u8, &'static FnSpec)> {
    FUNCTIONS
        .iter()
        .enumerate()
        .find(|(_, s)| s.name == name)
        .map(|(i, s)| (i as u8, s))
}

pub fn internal_fn(index: u8) -> &'static FnSpec {
    &FUNCTIONS[index as usize]
}

// --- symbolic constants ---

/// Value of a symbolic constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SymVal {
    Long(i32),
    Float(f32),
    Str(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct SymSpec {
    pub name: &'static str,
    pub value: SymVal,
}

const fn sl(name: &'static str, v: i32) -> SymSpec {
    SymSpec {
        name,
        value: SymVal::Long(v),
    }
}

const fn sf(name: &'static str, v: f32) -> SymSpec {
    SymSpec {
        name,
        value: SymVal::Float(v),
    }
}

/// Symbolic constants, indexed by the symbolic-constant token payload.
pub static SYM_CONSTS: &[SymSpec] = &[
    sl("TRUE", 1),
    sl("FALSE", 0),
    sf("PI", std::f32::consts::PI),
    sf("HALF_PI", std::f32::consts::FRAC_PI_2),
    sf("TWO_PI", std::f32::consts::TAU),
    sf("EULER", std::f32::consts::E),
    sf("DEG_TO_RAD", std::f32::consts::PI / 180.0),
    sf("RAD_TO_DEG", 180.0 / std::f32::consts::PI),
    sl("LONG_MIN", i32::MIN),
    sl("LONG_MAX", i32::MAX),
    sf("FLOAT_MIN", f32::MIN),
    sf("FLOAT_MAX", f32::MAX),
    sl("RADIANS", 0),
    sl("DEGREES", 1),
    sl("CONSOLE", 0),
    sl("IO1", -1),
    sl("IO2", -2),
    sl("IO3", -3),
    sl("IO4", -4),
    sl("FILE1", 1),
    sl("FILE2", 2),
    sl("FILE3", 3),
    sl("FILE4", 4),
    sl("FILE5", 5),
    sl("READ", 0x01),
    sl("WRITE", 0x02),
    sl("APPEND", 0x06),
    sl("SYNC", 0x08),
    sl("NEW_OK", 0x10),
    sl("NEW_ONLY", 0x30),
    sl("TRUNC", 0x40),
    sl("FMT_NONE", 0x00),
    sl("FMT_LEFT", 0x01),
    sl("FMT_SIGN", 0x02),
    sl("FMT_SPACE", 0x04),
    sl("FMT_POINT", 0x08),
    sl("FMT_ZEROPAD", 0x10),
];

pub fn find_sym_const(name: &str) -> Option<(u8, &'static SymSpec)> {
    SYM_CONSTS
        .iter()
        .enumerate()
        .find(|(_, s)| s.name == name)
        .map(|(i, s)| (i as u8, s))
}

pub fn sym_const(index: u8) -> &'static SymSpec {
    &SYM_CONSTS[index as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_table_indexed_by_code() {
        for (i, spec) in COMMANDS.iter().enumerate() {
            assert_eq!(spec.code as usize, i, "command {} out of order", spec.name);
        }
    }

    #[test]
    fn test_operator_priorities() {
        assert_eq!(OPERATORS[term::ASSIGN as usize].infix_prio, 0x01);
        assert!(OPERATORS[term::ASSIGN as usize].flags.contains(OpFlags::ASSIGN));
        assert_eq!(OPERATORS[term::POW as usize].infix_prio, 0x0D);
        assert!(OPERATORS[term::POW as usize].flags.contains(OpFlags::RTOL));
        assert_eq!(OPERATORS[term::MULT as usize].infix_prio, 0x0B);
        assert_eq!(OPERATORS[term::PLUS as usize].infix_prio, 0x0A);
        assert_eq!(OPERATORS[term::PLUS as usize].prefix_prio, 0x0C);
        assert_eq!(OPERATORS[term::INCR as usize].postfix_prio, 0x0F);
        assert!(OPERATORS[term::MOD as usize].flags.contains(OpFlags::LONG_ONLY));
    }

    #[test]
    fn test_terminal_lexemes_longest_first() {
        let mut last_len = usize::MAX;
        for (text, _) in TERMINAL_LEXEMES.iter() {
            assert!(text.len() <= last_len);
            last_len = text.len();
        }
    }

    #[test]
    fn test_compound_assign_bases() {
        assert_eq!(OPERATORS[term::PLUS_ASSIGN as usize].compound_base, term::PLUS);
        assert_eq!(OPERATORS[term::SHR_ASSIGN as usize].compound_base, term::SHR);
        assert_eq!(OPERATORS[term::ASSIGN as usize].compound_base, 0xFF);
    }

    #[test]
    fn test_internal_fn_lookup() {
        let (idx, spec) = find_internal_fn("ubound").unwrap();
        assert_eq!(spec.code, FnCode::Ubound);
        assert_eq!(spec.array_pattern, 0b1);
        assert_eq!(internal_fn(idx).name, "ubound");
        assert!(find_internal_fn("noSuchFn").is_none());
    }

    #[test]
    fn test_sym_const_lookup() {
        let (_, t) = find_sym_const("TRUE").unwrap();
        assert_eq!(t.value, SymVal::Long(1));
        let (_, pi) = find_sym_const("PI").unwrap();
        assert!(matches!(pi.value, SymVal::Float(_)));
    }

    #[test]
    fn test_skip_exec_commands() {
        for code in [CmdCode::Var, CmdCode::Const, CmdCode::Static, CmdCode::Function, CmdCode::Program, CmdCode::ClearProg, CmdCode::Nop] {
            assert!(command(code).where_allowed.contains(CmdWhere::SKIP_EXEC), "{:?}", code);
        }
        assert!(!command(CmdCode::Stop).where_allowed.contains(CmdWhere::SKIP_EXEC));
    }
}
