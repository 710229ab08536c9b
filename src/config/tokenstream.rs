//! Tokens of the configuration files.
//!
//! A file is a sequence of numbers, `"strings"` (with `\` escaping
//! the next character), single punctuation characters ("operators")
//! and identifiers, which run until whitespace. `#` starts a comment
//! that runs to the end of the line.

use std::fmt::Display;

use anyhow::{anyhow, bail, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Number,
    String,
    Identifier,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub data: String,
    pub line: u32,
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {:?} token at line {}", self.kind, self.data, self.line)
    }
}

fn ends_identifier(c: char) -> bool {
    c.is_whitespace() || matches!(c, '{' | '}' | '"' | '#')
}

pub struct TokenStream {
    /// The file name, for messages.
    source: String,
    tokens: Vec<Token>,
    position: usize,
}

impl TokenStream {
    pub fn tokenize(source: &str, text: &str) -> Result<TokenStream> {
        let mut tokens = Vec::new();
        let mut line = 1;
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\n' {
                line += 1;
                continue
            }
            if c.is_whitespace() {
                continue
            }
            let start_line = line;
            let mut push = |kind, data| tokens.push(Token { kind, data, line: start_line });
            if c == '#' {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break
                    }
                }
            } else if c == '"' {
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => bail!("{source}: unterminated string starting at line {start_line}"),
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            None => bail!("{source}: unterminated string starting at line \
                                           {start_line}"),
                            Some(c) => s.push(c),
                        },
                        Some(c) => s.push(c),
                    }
                    if s.ends_with('\n') {
                        line += 1;
                    }
                }
                push(TokenKind::String, s);
            } else if c.is_ascii_digit() {
                let mut s = String::from(c);
                while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    s.push(d);
                    chars.next();
                }
                push(TokenKind::Number, s);
            } else if c.is_ascii_punctuation() {
                push(TokenKind::Operator, c.to_string());
            } else {
                let mut s = String::from(c);
                while let Some(&d) = chars.peek().filter(|d| !ends_identifier(**d)) {
                    s.push(d);
                    chars.next();
                }
                push(TokenKind::Identifier, s);
            }
        }
        Ok(TokenStream { source: source.into(), tokens, position: 0 })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_end(&self) -> bool {
        self.position >= self.tokens.len()
    }

    pub fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn accept(&mut self, kind: TokenKind) -> Option<String> {
        match self.peek() {
            Some(t) if t.kind == kind => {
                let data = t.data.clone();
                self.position += 1;
                Some(data)
            }
            _ => None
        }
    }

    /// An error about the next token (or the end of the file).
    pub fn unexpected(&self, expected: &str) -> anyhow::Error {
        match self.peek() {
            Some(t) => anyhow!("{}: unexpected {t}, expected {expected}", self.source),
            None => anyhow!("{}: unexpected end of file, expected {expected}", self.source),
        }
    }

    pub fn accept_number(&mut self) -> Result<Option<u64>> {
        let line = self.peek().map(|t| t.line);
        match self.accept(TokenKind::Number) {
            Some(s) => Ok(Some(s.parse().map_err(
                |e| anyhow!("{}: number {s:?} at line {:?}: {e}", self.source, line))?)),
            None => Ok(None),
        }
    }

    pub fn accept_string(&mut self) -> Option<String> {
        self.accept(TokenKind::String)
    }

    pub fn accept_identifier(&mut self) -> Option<String> {
        self.accept(TokenKind::Identifier)
    }

    /// Consumes the next token only if it is the operator `op`.
    pub fn accept_operator(&mut self, op: &str) -> bool {
        match self.peek() {
            Some(t) if t.kind == TokenKind::Operator && t.data == op => {
                self.position += 1;
                true
            }
            _ => false
        }
    }

    pub fn expect_number(&mut self) -> Result<u64> {
        self.accept_number()?.ok_or_else(|| self.unexpected("a number"))
    }

    pub fn expect_string(&mut self) -> Result<String> {
        self.accept_string().ok_or_else(|| self.unexpected("a string"))
    }

    pub fn expect_identifier(&mut self) -> Result<String> {
        self.accept_identifier().ok_or_else(|| self.unexpected("an identifier"))
    }

    pub fn expect_operator(&mut self, op: &str) -> Result<()> {
        if self.accept_operator(op) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("`{op}`")))
        }
    }

    /// A single string, or a `{ … }` block of them.
    pub fn expect_strings(&mut self) -> Result<Vec<String>> {
        if let Some(s) = self.accept_string() {
            return Ok(vec![s])
        }
        self.expect_operator("{")?;
        let mut strings = Vec::new();
        while !self.accept_operator("}") {
            strings.push(self.expect_string()?);
        }
        Ok(strings)
    }
}
