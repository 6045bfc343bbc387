//! Lexeme scanning
//!
//! The lexer is a cursor over statement text. It skips whitespace and
//! comments, classifies terminals and literals, and reads identifiers;
//! deciding what an identifier *is* (keyword, function, symbolic
//! constant, variable, generic name) needs parse context and stays in the
//! parser, which probes the tables in the fixed try-order. The same
//! scanning routines are reused at runtime by the `readList` family to
//! pull values out of a character stream.

use crate::error::ParseError;
use crate::tables::TERMINAL_LEXEMES;
use rill_core::{Value, MAX_ALPHA_CST_LEN, MAX_IDENT_NAME_LEN};

/// A numeric or string literal produced by the lexer.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Long(i32),
    Float(f32),
    Str(String),
}

#[derive(Debug, Clone)]
pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    /// 1-based source line of the cursor
    line: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Move the cursor back to an earlier position on the same line
    /// (un-reads a just-consumed terminal).
    pub fn rewind_to(&mut self, pos: usize) {
        debug_assert!(pos <= self.pos);
        self.pos = pos;
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, ofs: usize) -> Option<u8> {
        self.src.get(self.pos + ofs).copied()
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    /// Skip whitespace and both comment forms, tracking line numbers.
    pub fn skip_whitespace(&mut self) -> Result<(), ParseError> {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => self.pos += 1,
                Some(b'\n') => {
                    self.pos += 1;
                    self.line += 1;
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    self.pos += 2;
                    loop {
                        match self.peek() {
                            None => return Ok(()), // unterminated comment eats the rest
                            Some(b'\n') => {
                                self.line += 1;
                                self.pos += 1;
                            }
                            Some(b'*') if self.peek_at(1) == Some(b'/') => {
                                self.pos += 2;
                                break;
                            }
                            Some(_) => self.pos += 1,
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Try to match a terminal (longest spelling first).
    pub fn try_terminal(&mut self) -> Option<u8> {
        for (text, code) in TERMINAL_LEXEMES.iter() {
            if self.src[self.pos..].starts_with(text.as_bytes()) {
                self.pos += text.len();
                return Some(*code);
            }
        }
        None
    }

    /// Peek the identifier starting at the cursor without consuming it.
    /// `#` prefixes are included (immediate-mode local-scope escape).
    pub fn peek_identifier(&self) -> Option<&'a str> {
        let mut ofs = 0;
        if self.peek() == Some(b'#') {
            ofs = 1;
        }
        match self.peek_at(ofs) {
            Some(c) if c.is_ascii_alphabetic() => {}
            _ => return None,
        }
        let start = self.pos;
        let mut end = self.pos + ofs;
        while let Some(c) = self.src.get(end) {
            if c.is_ascii_alphanumeric() || *c == b'_' {
                end += 1;
            } else {
                break;
            }
        }
        // the byte range is pure ASCII
        Some(std::str::from_utf8(&self.src[start..end]).unwrap_or(""))
    }

    /// Consume a previously peeked identifier.
    pub fn consume_identifier(&mut self, ident: &str) {
        debug_assert!(self.src[self.pos..].starts_with(ident.as_bytes()));
        self.pos += ident.len();
    }

    /// Check an identifier against the name length limit (the `#` prefix
    /// does not count).
    pub fn check_ident_len(ident: &str) -> Result<(), ParseError> {
        let name = ident.strip_prefix('#').unwrap_or(ident);
        if name.len() > MAX_IDENT_NAME_LEN {
            Err(ParseError::IdentifierTooLong)
        } else {
            Ok(())
        }
    }

    /// After the cursor, is the next non-space character a left
    /// parenthesis? (user function names must be called)
    pub fn next_is_left_par(&self) -> bool {
        let mut p = self.pos;
        while let Some(&c) = self.src.get(p) {
            match c {
                b' ' | b'\t' => p += 1,
                b'(' => return true,
                _ => return false,
            }
        }
        false
    }

    /// Try to scan a numeric literal. The leading sign is never consumed;
    /// unary `+`/`-` are prefix operators.
    pub fn try_number(&mut self) -> Result<Option<Literal>, ParseError> {
        let first = match self.peek() {
            Some(c) => c,
            None => return Ok(None),
        };
        let second_is_digit = matches!(self.peek_at(1), Some(c) if c.is_ascii_digit());
        if !first.is_ascii_digit() && !(first == b'.' && second_is_digit) {
            return Ok(None);
        }

        // hex and binary prefixes produce longs, wrapping at 32 bits so
        // 0x80000000 is long-min
        if first == b'0' {
            let base = match self.peek_at(1) {
                Some(b'x') | Some(b'X') => Some(16),
                Some(b'b') | Some(b'B') => Some(2),
                _ => None,
            };
            if let Some(base) = base {
                let start = self.pos + 2;
                let mut end = start;
                while let Some(c) = self.src.get(end) {
                    let ok = if base == 16 {
                        c.is_ascii_hexdigit()
                    } else {
                        *c == b'0' || *c == b'1'
                    };
                    if ok {
                        end += 1;
                    } else {
                        break;
                    }
                }
                if end == start {
                    return Err(ParseError::TokenNotRecognised);
                }
                let digits = std::str::from_utf8(&self.src[start..end]).unwrap_or("");
                let value =
                    u32::from_str_radix(digits, base).map_err(|_| ParseError::NumberOverflow)?;
                self.pos = end;
                self.reject_trailing_ident_char()?;
                return Ok(Some(Literal::Long(value as i32)));
            }
        }

        let start = self.pos;
        let mut end = self.pos;
        let mut saw_dot = false;
        let mut saw_exp = false;
        while let Some(&c) = self.src.get(end) {
            match c {
                b'0'..=b'9' => end += 1,
                b'.' if !saw_dot && !saw_exp => {
                    saw_dot = true;
                    end += 1;
                }
                b'e' | b'E' if !saw_exp => {
                    // only an exponent when followed by digits (optional sign)
                    let mut p = end + 1;
                    if matches!(self.src.get(p), Some(&b'+') | Some(&b'-')) {
                        p += 1;
                    }
                    if matches!(self.src.get(p), Some(d) if d.is_ascii_digit()) {
                        saw_exp = true;
                        end = p;
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.src[start..end]).unwrap_or("");
        self.pos = end;
        self.reject_trailing_ident_char()?;
        if saw_dot || saw_exp {
            let v: f32 = text.parse().map_err(|_| ParseError::NumberOverflow)?;
            if !v.is_finite() {
                return Err(ParseError::NumberOverflow);
            }
            Ok(Some(Literal::Float(v)))
        } else {
            let v: i64 = text.parse().map_err(|_| ParseError::NumberOverflow)?;
            if v > i32::MAX as i64 {
                return Err(ParseError::NumberOverflow);
            }
            Ok(Some(Literal::Long(v as i32)))
        }
    }

    fn reject_trailing_ident_char(&self) -> Result<(), ParseError> {
        match self.peek() {
            Some(c) if c.is_ascii_alphanumeric() || c == b'_' => {
                Err(ParseError::TokenNotRecognised)
            }
            _ => Ok(()),
        }
    }

    /// Try to scan a string literal. Escapes: `\\` and `\"` only.
    /// Embedded newlines are allowed; other control characters are not.
    pub fn try_string(&mut self) -> Result<Option<String>, ParseError> {
        if self.peek() != Some(b'"') {
            return Ok(None);
        }
        let mut out = String::new();
        let mut p = self.pos + 1;
        loop {
            match self.src.get(p).copied() {
                None => return Err(ParseError::StringUnterminated),
                Some(b'"') => {
                    p += 1;
                    break;
                }
                Some(b'\\') => match self.src.get(p + 1).copied() {
                    Some(b'\\') => {
                        out.push('\\');
                        p += 2;
                    }
                    Some(b'"') => {
                        out.push('"');
                        p += 2;
                    }
                    _ => return Err(ParseError::StringInvalidEscape),
                },
                Some(b'\n') => {
                    out.push('\n');
                    self.line += 1;
                    p += 1;
                }
                Some(c) if c.is_ascii_control() => return Err(ParseError::StringControlChar),
                Some(c) => {
                    out.push(c as char);
                    p += 1;
                }
            }
            if out.len() > MAX_ALPHA_CST_LEN {
                return Err(ParseError::StringTooLong);
            }
        }
        self.pos = p;
        Ok(Some(out))
    }
}

/// Parse a comma-separated value list out of plain text (the `readList` /
/// `cinList` / `vreadList` runtime path). Numbers and quoted strings are
/// recognized; anything else ends the scan. Returns the values read.
pub fn scan_value_list(text: &str) -> Vec<Value> {
    let mut lex = Lexer::new(text);
    let mut out = Vec::new();
    loop {
        if lex.skip_whitespace().is_err() || lex.at_end() {
            break;
        }
        let negative = {
            if lex.peek() == Some(b'-') {
                lex.pos += 1;
                let _ = lex.skip_whitespace();
                true
            } else {
                false
            }
        };
        let value = match lex.try_number() {
            Ok(Some(Literal::Long(v))) => Value::Long(if negative { -v } else { v }),
            Ok(Some(Literal::Float(v))) => Value::Float(if negative { -v } else { v }),
            _ if !negative => match lex.try_string() {
                Ok(Some(s)) => Value::str_from(&s),
                _ => break,
            },
            _ => break,
        };
        out.push(value);
        if lex.skip_whitespace().is_err() {
            break;
        }
        if lex.peek() == Some(b',') {
            lex.pos += 1;
        } else {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::term;

    #[test]
    fn test_skip_comments_and_count_lines() {
        let mut lex = Lexer::new("  // comment\n  /* multi\nline */ x");
        lex.skip_whitespace().unwrap();
        assert_eq!(lex.line(), 3);
        assert_eq!(lex.peek_identifier(), Some("x"));
    }

    #[test]
    fn test_terminal_longest_match() {
        let mut lex = Lexer::new("<<=");
        assert_eq!(lex.try_terminal(), Some(term::SHL_ASSIGN));
        let mut lex = Lexer::new("<<");
        assert_eq!(lex.try_terminal(), Some(term::SHL));
        let mut lex = Lexer::new("<=");
        assert_eq!(lex.try_terminal(), Some(term::LTOE));
        let mut lex = Lexer::new("<");
        assert_eq!(lex.try_terminal(), Some(term::LT));
        let mut lex = Lexer::new("**2");
        assert_eq!(lex.try_terminal(), Some(term::POW));
    }

    #[test]
    fn test_number_bases() {
        let mut lex = Lexer::new("0x1F");
        assert_eq!(lex.try_number().unwrap(), Some(Literal::Long(31)));
        let mut lex = Lexer::new("0b101");
        assert_eq!(lex.try_number().unwrap(), Some(Literal::Long(5)));
        let mut lex = Lexer::new("42");
        assert_eq!(lex.try_number().unwrap(), Some(Literal::Long(42)));
    }

    #[test]
    fn test_hex_long_min_no_overflow() {
        let mut lex = Lexer::new("0x80000000");
        assert_eq!(lex.try_number().unwrap(), Some(Literal::Long(i32::MIN)));
        let mut lex = Lexer::new("0xFFFFFFFF");
        assert_eq!(lex.try_number().unwrap(), Some(Literal::Long(-1)));
    }

    #[test]
    fn test_decimal_overflow_rejected() {
        let mut lex = Lexer::new("2147483648");
        assert_eq!(lex.try_number().unwrap_err(), ParseError::NumberOverflow);
        let mut lex = Lexer::new("2147483647");
        assert_eq!(lex.try_number().unwrap(), Some(Literal::Long(i32::MAX)));
    }

    #[test]
    fn test_float_forms() {
        let mut lex = Lexer::new("3.5");
        assert_eq!(lex.try_number().unwrap(), Some(Literal::Float(3.5)));
        let mut lex = Lexer::new("1e3");
        assert_eq!(lex.try_number().unwrap(), Some(Literal::Float(1000.0)));
        let mut lex = Lexer::new(".25");
        assert_eq!(lex.try_number().unwrap(), Some(Literal::Float(0.25)));
    }

    #[test]
    fn test_leading_sign_not_consumed() {
        let mut lex = Lexer::new("-5");
        assert_eq!(lex.try_number().unwrap(), None);
    }

    #[test]
    fn test_string_escapes() {
        let mut lex = Lexer::new(r#""he\"llo\\""#);
        assert_eq!(lex.try_string().unwrap(), Some("he\"llo\\".to_string()));
        let mut lex = Lexer::new(r#""bad \n escape""#);
        assert_eq!(
            lex.try_string().unwrap_err(),
            ParseError::StringInvalidEscape
        );
        let mut lex = Lexer::new("\"unterminated");
        assert_eq!(lex.try_string().unwrap_err(), ParseError::StringUnterminated);
    }

    #[test]
    fn test_identifier_with_hash_prefix() {
        let mut lex = Lexer::new("#local");
        assert_eq!(lex.peek_identifier(), Some("#local"));
        lex.consume_identifier("#local");
        assert!(lex.at_end());
    }

    #[test]
    fn test_ident_len_limit() {
        assert!(Lexer::check_ident_len("abcdefghijklmn").is_ok());
        assert_eq!(
            Lexer::check_ident_len("abcdefghijklmno"),
            Err(ParseError::IdentifierTooLong)
        );
    }

    #[test]
    fn test_scan_value_list() {
        let values = scan_value_list(r#"1, 2.5, "three", -4"#);
        assert_eq!(
            values,
            vec![
                Value::Long(1),
                Value::Float(2.5),
                Value::str_from("three"),
                Value::Long(-4)
            ]
        );
    }
}
