//! Rill interpreter engine
//!
//! A self-hosted interactive interpreter for the Rill language with an
//! integrated debugger, aimed at small 32-bit targets. Statements parse
//! into a packed token stream held in a fixed-size buffer and execute
//! against a persistent variable store; programs can halt on `stop` or
//! breakpoints, step, and evaluate watch expressions.
//!
//! The front end drives one [`Machine`] per session:
//!
//! ```no_run
//! use rill::{Host, Machine};
//!
//! let mut machine = Machine::new(Host::default());
//! machine.process_line("var a = 3;");
//! machine.process_line("cout(a + 4);");
//! ```
//!
//! All physical I/O arrives through the [`host`] interfaces; the engine
//! itself is single-threaded and cooperative.

pub mod breakpoints;
pub mod builtins;
pub mod error;
pub mod eval;
pub mod flow;
pub mod host;
pub mod lexer;
pub mod machine;
pub mod parser;
pub mod program;
pub mod tables;
pub mod token;

pub use error::{Event, ExecError, Interrupt, ParseDiag, ParseError};
pub use host::{
    ExtBucket, ExtFnDef, Host, HostClock, HostFileSystem, HostFlags, HostStream, MemoryStream,
};
pub use machine::{Machine, Settings};
pub use parser::ParseMode;
pub use rill_core::{HeapAudit, StringClass, Value, ValueType};
