//! Parsed program image
//!
//! Owns the token stream plus everything the tokens point into: the
//! parsed string constants of both areas, the function name/descriptor
//! table and the program name. Clearing the program or discarding an
//! immediate line releases the matching string constants through the
//! accounting categories.

use crate::token::TokenStream;
use rill_core::{HeapAudit, StringClass, Value, MAX_FUNCS};

/// Sentinel bit: a function's array-parameter pattern is not yet
/// committed by its definition (only accumulated from calls).
pub const PARAM_PATTERN_UNCOMMITTED: u16 = 0x8000;

/// One local variable or parameter of a function, in declaration order
/// (parameters first).
#[derive(Debug, Clone)]
pub struct LocalDef {
    /// Index into the program variable name table
    pub name_index: u16,
    pub is_param: bool,
    pub is_const: bool,
    pub is_array: bool,
    pub dims: [u8; 3],
    pub dim_count: u8,
    /// Initializer (locals) or default value (optional parameters)
    pub init: Option<Value>,
}

/// Function descriptor. Also carries the min/max argument counts
/// observed across forward calls, settled when the definition parses.
#[derive(Debug)]
pub struct FunctionDef {
    pub name: Box<str>,
    /// First statement of the body; None until the definition is parsed
    pub start_token: Option<usize>,
    pub param_count: u8,
    pub mandatory_count: u8,
    /// Base index of this function's static slots in the store
    pub static_base: u16,
    pub static_count: u8,
    /// Bit k set: parameter k+1 is an array. Bit 15: not yet committed.
    pub param_is_array: u16,
    /// Observed call argument counts (valid when `seen_any`)
    pub seen_min: u8,
    pub seen_max: u8,
    pub seen_any: bool,
    pub locals: Vec<LocalDef>,
    /// Program-variable name indexes of this function's statics, in
    /// declaration order (slot = `static_base` + position)
    pub statics: Vec<u16>,
}

impl FunctionDef {
    fn new(name: &str) -> Self {
        FunctionDef {
            name: name.into(),
            start_token: None,
            param_count: 0,
            mandatory_count: 0,
            static_base: 0,
            static_count: 0,
            param_is_array: PARAM_PATTERN_UNCOMMITTED,
            seen_min: 0,
            seen_max: 0,
            seen_any: false,
            locals: Vec::new(),
            statics: Vec::new(),
        }
    }

    pub fn is_defined(&self) -> bool {
        self.start_token.is_some()
    }

    /// Local slot index of a program variable name inside this function.
    pub fn local_index_of(&self, name_index: u16) -> Option<usize> {
        self.locals.iter().position(|l| l.name_index == name_index)
    }
}

/// The parsed program plus immediate-mode line.
#[derive(Debug, Default)]
pub struct ProgramImage {
    pub tokens: TokenStream,
    /// String constants referenced by program-area tokens
    prog_strings: Vec<Box<str>>,
    /// String constants referenced by immediate-area tokens
    imm_strings: Vec<Box<str>>,
    pub funcs: Vec<FunctionDef>,
    pub program_name: Option<Box<str>>,
    /// True while parsing into the program area
    pub parsing_program: bool,
}

impl ProgramImage {
    pub fn new() -> Self {
        ProgramImage {
            tokens: TokenStream::new(),
            ..Default::default()
        }
    }

    // --- parsed string constants ---

    /// Intern a parsed string constant for the area being parsed.
    pub fn add_parsed_string(&mut self, s: String, audit: &mut HeapAudit) -> u16 {
        audit.on_create(StringClass::ParsedConst);
        let table = if self.parsing_program {
            &mut self.prog_strings
        } else {
            &mut self.imm_strings
        };
        table.push(s.into_boxed_str());
        (table.len() - 1) as u16
    }

    /// Resolve a string-constant token by the area its token lives in.
    pub fn parsed_string(&self, token_pos: usize, index: u16) -> &str {
        let table = if self.tokens.in_program_area(token_pos) {
            &self.prog_strings
        } else {
            &self.imm_strings
        };
        table.get(index as usize).map(|s| s.as_ref()).unwrap_or("")
    }

    /// Roll parsed strings of the current area back to `len` entries
    /// (statement rollback after a parse error).
    pub fn truncate_parsed_strings(&mut self, len: usize, audit: &mut HeapAudit) {
        let table = if self.parsing_program {
            &mut self.prog_strings
        } else {
            &mut self.imm_strings
        };
        while table.len() > len {
            table.pop();
            audit.on_destroy(StringClass::ParsedConst);
        }
    }

    pub fn parsed_string_count(&self) -> usize {
        if self.parsing_program {
            self.prog_strings.len()
        } else {
            self.imm_strings.len()
        }
    }

    /// Release the immediate line's string constants (line discarded).
    pub fn clear_imm_strings(&mut self, audit: &mut HeapAudit) {
        while self.imm_strings.pop().is_some() {
            audit.on_destroy(StringClass::ParsedConst);
        }
    }

    /// Move the immediate string table out (snapshot), leaving it empty.
    pub fn take_imm_strings(&mut self) -> Vec<Box<str>> {
        std::mem::take(&mut self.imm_strings)
    }

    /// Put a snapshot's string table back.
    pub fn restore_imm_strings(&mut self, strings: Vec<Box<str>>, audit: &mut HeapAudit) {
        self.clear_imm_strings(audit);
        self.imm_strings = strings;
    }

    /// Release the program area's string constants (program cleared).
    pub fn clear_prog_strings(&mut self, audit: &mut HeapAudit) {
        while self.prog_strings.pop().is_some() {
            audit.on_destroy(StringClass::ParsedConst);
        }
    }

    // --- functions ---

    pub fn find_func(&self, name: &str) -> Option<usize> {
        self.funcs.iter().position(|f| f.name.as_ref() == name)
    }

    /// Look up or create a function entry (first call or definition).
    pub fn func_entry(&mut self, name: &str) -> Option<usize> {
        if let Some(i) = self.find_func(name) {
            return Some(i);
        }
        if self.funcs.len() >= MAX_FUNCS {
            return None;
        }
        self.funcs.push(FunctionDef::new(name));
        Some(self.funcs.len() - 1)
    }

    /// Drop all program-side state (program cleared).
    pub fn clear_program(&mut self, audit: &mut HeapAudit) {
        self.tokens.clear_program();
        self.clear_prog_strings(audit);
        self.funcs.clear();
        self.program_name = None;
        self.parsing_program = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parsed_strings_per_area() {
        let mut img = ProgramImage::new();
        let mut audit = HeapAudit::new();

        img.parsing_program = true;
        img.tokens.start_program();
        let pi = img.add_parsed_string("prog".to_string(), &mut audit);
        img.tokens.end_program();

        img.parsing_program = false;
        img.tokens.start_immediate();
        let ii = img.add_parsed_string("imm".to_string(), &mut audit);

        // program-area position resolves against program strings
        assert_eq!(img.parsed_string(0, pi), "prog");
        // immediate-area position resolves against immediate strings
        assert_eq!(img.parsed_string(img.tokens.imm_base(), ii), "imm");

        img.clear_imm_strings(&mut audit);
        img.clear_prog_strings(&mut audit);
        assert!(audit.all_balanced());
    }

    #[test]
    fn test_func_entry_dedup() {
        let mut img = ProgramImage::new();
        let a = img.func_entry("fact").unwrap();
        let b = img.func_entry("fact").unwrap();
        assert_eq!(a, b);
        assert!(!img.funcs[a].is_defined());
        assert_eq!(img.funcs[a].param_is_array, PARAM_PATTERN_UNCOMMITTED);
    }

    #[test]
    fn test_rollback_frees_strings() {
        let mut img = ProgramImage::new();
        let mut audit = HeapAudit::new();
        img.parsing_program = false;
        let mark = img.parsed_string_count();
        img.add_parsed_string("a".to_string(), &mut audit);
        img.add_parsed_string("b".to_string(), &mut audit);
        img.truncate_parsed_strings(mark, &mut audit);
        assert!(audit.all_balanced());
    }
}
