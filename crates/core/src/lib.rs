//! Core data model for the Rill interpreter
//!
//! This crate holds the pieces of the interpreter that must agree on
//! representation but carry no parsing or execution logic:
//!
//! - [`Value`] — the tagged value union (long / float / string / array handle)
//! - [`VarStore`] — program, user, static and local variable storage
//! - [`HeapAudit`] — per-category accounting of live heap strings
//! - [`LastResults`] — the bounded FIFO of recent top-level results
//!
//! Everything here is single-threaded by design; the interpreter owns one
//! instance of each and there is no concurrent mutator.

pub mod accounting;
pub mod fifo;
pub mod store;
pub mod value;

pub use accounting::{HeapAudit, StringClass};
pub use fifo::LastResults;
pub use store::{ArrayId, ArrayStorage, Scope, Slot, VarAttr, VarStore};
pub use value::{Value, ValueType};

/// Maximum identifier length (variables, functions, generic names)
pub const MAX_IDENT_NAME_LEN: usize = 14;

/// Maximum length of a string constant in source text
pub const MAX_ALPHA_CST_LEN: usize = 255;

/// Maximum array dimension count
pub const MAX_ARRAY_DIMS: usize = 3;

/// Maximum total element count of one array
pub const MAX_ARRAY_ELEM: usize = 400;

/// Depth of the last-results FIFO
pub const MAX_LAST_RESULT_DEPTH: usize = 10;

/// Capacity of the program variable name table
pub const MAX_PROG_VARS: usize = 64;

/// Capacity of the user variable table
pub const MAX_USER_VARS: usize = 64;

/// Capacity of the function name table
pub const MAX_FUNCS: usize = 32;

/// Maximum parameter count of one function (15 mandatory max; the
/// sixteenth mandatory parameter is a parse error)
pub const MAX_FUNC_ARGS: usize = 15;
