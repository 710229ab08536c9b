//! The page script: the small statement language embedded in
//! templates between `<!` and `!>`, and the language of helper
//! source files.
//!
//! Source text goes through `lexer` and `parser` into the `ast`;
//! `link` resolves every name against the page bindings, the builtin
//! modules and the helper classes, and `interp` runs the result
//! against a `RenderContext`.

pub mod ast;
pub mod builtins;
pub mod interp;
pub mod lexer;
pub mod link;
pub mod parser;
pub mod value;

use std::fmt::Display;

use serde::Serialize;

/// A position in a template or helper source file. Both are 1-based;
/// columns count characters, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Pos {
    pub line: u32,
    pub column: u32,
}

impl Pos {
    pub const START: Pos = Pos { line: 1, column: 1 };

    pub fn new(line: u32, column: u32) -> Self {
        Pos { line, column }
    }
}

impl Default for Pos {
    fn default() -> Self {
        Pos::START
    }
}

impl Display for Pos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// Lexing or parsing failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} at {pos}")]
pub struct ScriptError {
    pub pos: Pos,
    pub message: String,
}

impl ScriptError {
    pub fn new(pos: Pos, message: impl Into<String>) -> Self {
        ScriptError { pos, message: message.into() }
    }
}
