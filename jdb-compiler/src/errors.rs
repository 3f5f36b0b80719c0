//! The numbered error registry (§4.2, §7). These are *script-level* error
//! codes, distinct from the `anyhow::Error`s that surface host-side misuse
//! of this crate's API.

use compact_str::{format_compact, CompactString};

/// Error code 0 means "no error". Codes 1-26 are taken from
/// `original_source/source/Error.cpp`'s `errorMessages` table, preserved
/// verbatim so scripts that pattern-match on `ERR` text keep working.
pub const OK: u8 = 0;
pub const SYNTAX: u8 = 1;
pub const CALCULATION: u8 = 2;
pub const VARIABLE_NOT_FOUND: u8 = 3;
pub const UNCLOSED_IF: u8 = 4;
pub const UNCLOSED_FUNC: u8 = 5;
pub const FILE_NOT_FOUND: u8 = 6;
pub const FUNC_NAME_NOT_FOUND: u8 = 7;
pub const WRONG_ARG_COUNT: u8 = 8;
pub const RETURN_WITHOUT_GOSUB: u8 = 9;
pub const ARRAY_OUT_OF_BOUNDS: u8 = 10;
pub const UNDEFINED_LABEL: u8 = 11;
pub const IO_ERROR: u8 = 12;
pub const INVALID_TOKEN: u8 = 13;
pub const UNCLOSED_LOOP: u8 = 14;
pub const TYPE_MISMATCH: u8 = 15;
pub const UNCLOSED_BRACKET: u8 = 16;
pub const UNCLOSED_BRACE: u8 = 17;
pub const UNCLOSED_PAREN: u8 = 18;
pub const MISSING_COMMA: u8 = 19;
pub const RESERVED_20: u8 = 20;
pub const NEXT_WITHOUT_FOR: u8 = 21;
pub const UNDEFINED_FUNCTION: u8 = 22;
pub const RETURN_WITHOUT_CALL: u8 = 23;
pub const BAD_SUBSCRIPT: u8 = 24;
pub const MISSING_RETURN: u8 = 25;
pub const INCORRECT_ARG_COUNT: u8 = 26;

const MESSAGES: &[&str] = &[
    "OK",
    "Syntax Error",
    "Calculation Error",
    "Variable not found",
    "Unclosed IF/ENDIF",
    "Unclosed FUNC/ENDFUNC",
    "File not found",
    "Function/Sub name not found",
    "Wrong number of arguments",
    "RETURN without GOSUB/CALL",
    "Array out of bounds",
    "Undefined label",
    "File I/O Error",
    "Invalid token in expression",
    "Unclosed loop",
    "Type Mismatch",
    "Syntax Error, ] missing",
    "Syntax Error, } missing",
    "Syntax Error, ) missing",
    "Syntax Error, , missing",
    "Reserved 20",
    "NEXT without FOR",
    "Undefined function",
    "RETURN without function call",
    "Bad array subscript",
    "Function or Sub is missing RETURN or END",
    "Incorrect number of arguments",
];

/// Look up the canonical message for `code`, or a generic fallback for
/// codes outside the known table (a native module is free to raise
/// arbitrary codes).
pub fn message(code: u8) -> &'static str {
    MESSAGES.get(code as usize).copied().unwrap_or("Unknown Error")
}

/// A concrete, line-attributed script error, as recorded in `ERR`/`ERL`/
/// `ERRMSG$` once a handler (or the top level) observes it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptError {
    pub code: u8,
    pub line: u32,
    pub custom_message: Option<CompactString>,
}

impl ScriptError {
    pub fn new(code: u8, line: u32) -> Self {
        Self { code, line, custom_message: None }
    }

    pub fn with_message(code: u8, line: u32, msg: impl Into<CompactString>) -> Self {
        Self { code, line, custom_message: Some(msg.into()) }
    }

    /// Full `ERRMSG$` text: the canonical message, plus ", <custom>" if set.
    pub fn full_message(&self) -> CompactString {
        match &self.custom_message {
            None => CompactString::from(message(self.code)),
            Some(m) => format_compact!("{}, {}", message(self.code), m),
        }
    }

    /// The `? Error #<n>, <text> [IN LINE <l>]` rendering used for
    /// uncaught errors (§2.2, §7).
    pub fn render(&self) -> CompactString {
        if self.line > 0 {
            format_compact!("? Error #{}, {} IN LINE {}", self.code, self.full_message(), self.line)
        } else {
            format_compact!("? Error #{}, {}", self.code, self.full_message())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_messages_match_original_table() {
        assert_eq!(message(TYPE_MISMATCH), "Type Mismatch");
        assert_eq!(message(UNDEFINED_FUNCTION), "Undefined function");
        assert_eq!(message(OK), "OK");
    }

    #[test]
    fn unknown_code_is_generic() {
        assert_eq!(message(200), "Unknown Error");
    }

    #[test]
    fn render_includes_line_and_custom_message() {
        let e = ScriptError::with_message(CALCULATION, 12, "division by zero");
        assert_eq!(e.render(), "? Error #2, Calculation Error, division by zero IN LINE 12");
    }

    #[test]
    fn render_omits_line_when_zero() {
        let e = ScriptError::new(TYPE_MISMATCH, 0);
        assert_eq!(e.render(), "? Error #15, Type Mismatch");
    }
}
