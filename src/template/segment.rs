//! Splitting a template into literal text and `<! ... >` directives.
//!
//! The scan is a single pass over the bytes. After `<!`, characters
//! are collected into the directive body while a short prefix is
//! collected to identify the keyword; the keyword is fixed at the
//! first whitespace or `>`. Directives with a "quick" keyword end at
//! the next `>`; code directives (and `class`) only end at `!>`,
//! since code may contain `>`. `<!--` starts a comment that is
//! copied through verbatim up to `-->`.

use std::sync::Arc;

use kstring::KString;

use crate::script::ast::{Accessor, AssignOp, CallTarget, ClassDecl, Expr, ExprKind, Place,
                         Stmt, StmtKind};
use crate::script::lexer::{tokenize, Punct, Tok, Token};
use crate::script::parser::{parse_declarations, parse_expression, parse_statements};
use crate::script::value::Value;
use crate::script::{Pos, ScriptError};

#[derive(Debug, Clone)]
pub enum Segment {
    /// Literal bytes, emitted verbatim.
    Text { bytes: Arc<[u8]>, pos: Pos },
    /// One statement of the render body, in execution order. `code`
    /// is its source form.
    Statement { code: String, stmt: Stmt },
    Import { name: KString, pos: Pos },
    /// Page-level class declarations, hoisted out of the render body.
    HelperDecl { code: String, classes: Vec<ClassDecl>, pos: Pos },
    /// Code with unbalanced braces: the opening or closing part of a
    /// block enclosing template text, as in `<! if (x) { !>..<! } !>`.
    /// Parsed together with its neighbours during code generation.
    Fragment { code: String, tokens: Vec<Token>, pos: Pos },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} at {pos}")]
pub struct ParseError {
    pub code: &'static str,
    pub pos: Pos,
    pub message: String,
}

impl ParseError {
    fn new(code: &'static str, pos: Pos, message: impl Into<String>) -> Self {
        ParseError { code, pos, message: message.into() }
    }
}

impl From<ScriptError> for ParseError {
    fn from(e: ScriptError) -> Self {
        ParseError { code: "AH0002", pos: e.pos, message: e.message }
    }
}

const MARKER: u8 = b'!';

const QUICK_KEYWORDS: &[&str] = &["using", "layout", "title", "section", "/section",
                                  "writesection"];

fn is_doctype(keyword: &str) -> bool {
    keyword.eq_ignore_ascii_case("doctype")
}

fn is_quick(keyword: &str) -> bool {
    QUICK_KEYWORDS.contains(&keyword) || is_doctype(keyword)
}

fn is_continuation(b: u8) -> bool {
    b & 0xC0 == 0x80
}

/// The position after `bytes`, when they start at `pos`.
pub fn advance_pos(mut pos: Pos, bytes: &[u8]) -> Pos {
    for &b in bytes {
        if b == b'\n' {
            pos.line += 1;
            pos.column = 1;
        } else if !is_continuation(b) {
            pos.column += 1;
        }
    }
    pos
}

struct Scanner<'t> {
    input: &'t [u8],
    i: usize,
    pos: Pos,
}

impl<'t> Scanner<'t> {
    fn next(&mut self) -> Option<u8> {
        let b = *self.input.get(self.i)?;
        self.i += 1;
        self.pos = advance_pos(self.pos, &[b]);
        Some(b)
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.i).copied()
    }
}

/// A scanned directive, before dispatch on its keyword.
struct RawDirective {
    /// Position of the `<`.
    pos: Pos,
    /// Position of the first body byte.
    body_pos: Pos,
    keyword: Option<Vec<u8>>,
    body: Vec<u8>,
}

fn scan_directive(s: &mut Scanner, pos: Pos) -> Result<RawDirective, ParseError> {
    let body_pos = s.pos;
    let mut body = Vec::new();
    let mut prefix = Vec::new();
    let mut keyword: Option<Vec<u8>> = None;
    let unterminated = || ParseError::new("AH0001", pos, "unterminated directive");
    loop {
        let b = s.next().ok_or_else(unterminated)?;
        if b == b'>' {
            if keyword.is_none() {
                keyword = Some(std::mem::take(&mut prefix));
            }
            if keyword.as_deref().map_or(false, |k| is_quick(&String::from_utf8_lossy(k))) {
                break
            }
        }
        if b == MARKER && s.peek() == Some(b'>') {
            s.next();
            break
        }
        body.push(b);
        if keyword.is_none() {
            if b.is_ascii_whitespace() {
                keyword = Some(std::mem::take(&mut prefix));
            } else {
                prefix.push(b);
                if prefix == b"--" {
                    keyword = Some(std::mem::take(&mut prefix));
                    // a comment: copy through to `-->`, nothing else
                    // ends it
                    let mut raw = Vec::new();
                    while !raw.ends_with(b"-->") {
                        let b = s.next().ok_or_else(unterminated)?;
                        raw.push(b);
                    }
                    body.extend_from_slice(&raw);
                    break
                }
            }
        }
    }
    Ok(RawDirective { pos, body_pos, keyword, body })
}

fn body_str(d: &RawDirective) -> Result<&str, ParseError> {
    std::str::from_utf8(&d.body).map_err(
        |e| ParseError::new("AH0003", advance_pos(d.body_pos, &d.body[..e.valid_up_to()]),
                            "directive is not valid UTF-8"))
}

/// The directive argument following the keyword, trimmed, and its
/// position.
fn argument<'d>(d: &'d RawDirective, keyword: &str) -> Result<(&'d str, Pos), ParseError> {
    let body = body_str(d)?;
    let rest = &body[keyword.len()..];
    let trimmed_start = rest.trim_start();
    let skipped = keyword.len() + rest.len() - trimmed_start.len();
    Ok((trimmed_start.trim_end(), advance_pos(d.body_pos, &d.body[..skipped])))
}

fn required_argument<'d>(d: &'d RawDirective, keyword: &str)
                         -> Result<(&'d str, Pos), ParseError> {
    let (arg, pos) = argument(d, keyword)?;
    if arg.is_empty() {
        return Err(ParseError::new("AH0002", d.pos,
                                   format!("`{keyword}` directive needs an argument")))
    }
    Ok((arg, pos))
}

fn page_call(name: &str, arg: Expr, pos: Pos) -> Stmt {
    let call = Expr {
        kind: ExprKind::Call {
            path: vec![KString::from_ref(name)],
            args: vec![arg],
            target: CallTarget::Unresolved,
        },
        pos,
    };
    Stmt { kind: StmtKind::Expr(call), pos }
}

fn braces_balance(tokens: &[Token]) -> bool {
    let mut depth: i64 = 0;
    for t in tokens {
        match t.tok {
            Tok::Punct(Punct::LBrace) => depth += 1,
            Tok::Punct(Punct::RBrace) => {
                depth -= 1;
                if depth < 0 {
                    return false
                }
            }
            _ => ()
        }
    }
    depth == 0
}

fn dispatch(d: RawDirective, out: &mut Vec<Segment>) -> Result<(), ParseError> {
    let keyword = match &d.keyword {
        Some(k) => String::from_utf8_lossy(k).into_owned(),
        None => "*".into(),
    };
    let text_with = |tail: &[u8]| {
        let mut bytes = b"<!".to_vec();
        bytes.extend_from_slice(&d.body);
        bytes.extend_from_slice(tail);
        Segment::Text { bytes: bytes.into(), pos: d.pos }
    };
    match keyword.as_str() {
        k if is_doctype(k) => out.push(text_with(b">")),
        "--" => out.push(text_with(b"")),
        "using" => {
            let (name, pos) = required_argument(&d, "using")?;
            let name = name.trim_end_matches(';').trim_end();
            if !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return Err(ParseError::new("AH0002", pos,
                                           format!("invalid module name {name:?}")))
            }
            out.push(Segment::Import { name: KString::from_ref(name), pos });
        }
        k @ ("layout" | "title") => {
            let (arg, pos) = required_argument(&d, k)?;
            let e = parse_expression(arg, pos)?;
            let (acc, name) = if k == "layout" {
                (Accessor::Layout, "Layout")
            } else {
                (Accessor::Title, "Title")
            };
            let stmt = Stmt {
                kind: StmtKind::Assign(Place::Accessor(acc), AssignOp::Set, e),
                pos: d.pos,
            };
            out.push(Segment::Statement { code: format!("{name} = {arg};"), stmt });
        }
        k @ ("section" | "writesection") => {
            let (arg, pos) = required_argument(&d, k)?;
            let e = parse_expression(arg, pos)?;
            let name = if k == "section" { "Section" } else { "WriteSection" };
            out.push(Segment::Statement {
                code: format!("{name}({arg});"),
                stmt: page_call(name, e, d.pos),
            });
        }
        "/section" => {
            let (arg, pos) = argument(&d, "/section")?;
            if !arg.is_empty() {
                return Err(ParseError::new("AH0002", pos, "`/section` takes no argument"))
            }
            let null = Expr { kind: ExprKind::Literal(Value::Null), pos: d.pos };
            out.push(Segment::Statement {
                code: "Section(null);".into(),
                stmt: page_call("Section", null, d.pos),
            });
        }
        "class" => {
            let code = body_str(&d)?;
            let classes = parse_declarations(code, d.body_pos)?;
            out.push(Segment::HelperDecl { code: code.into(), classes, pos: d.pos });
        }
        _ => {
            let code = body_str(&d)?;
            let mut tokens = tokenize(code, d.body_pos)?;
            if !braces_balance(&tokens) {
                tokens.pop(); // Eof
                out.push(Segment::Fragment { code: code.into(), tokens, pos: d.body_pos });
                return Ok(())
            }
            for (stmt, range) in parse_statements(code, d.body_pos)? {
                out.push(Segment::Statement { code: code[range].into(), stmt });
            }
        }
    }
    Ok(())
}

/// Split `template` into segments. Text and statement segments are in
/// source order; any error aborts the whole template.
pub fn segment(template: &[u8]) -> Result<Vec<Segment>, ParseError> {
    let mut s = Scanner { input: template, i: 0, pos: Pos::START };
    let mut out = Vec::new();
    let mut text = Vec::new();
    let mut text_pos = s.pos;
    let flush = |text: &mut Vec<u8>, pos: Pos, out: &mut Vec<Segment>| {
        if !text.is_empty() {
            out.push(Segment::Text { bytes: std::mem::take(text).into(), pos });
        }
    };
    loop {
        let pos = s.pos;
        let b = match s.next() {
            Some(b) => b,
            None => break,
        };
        if b == b'<' && s.peek() == Some(MARKER) {
            s.next();
            flush(&mut text, text_pos, &mut out);
            let d = scan_directive(&mut s, pos)?;
            dispatch(d, &mut out)?;
            text_pos = s.pos;
        } else {
            text.push(b);
        }
    }
    flush(&mut text, text_pos, &mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describe(segments: &[Segment]) -> Vec<String> {
        segments.iter().map(|s| match s {
            Segment::Text { bytes, .. } => format!("T:{}", String::from_utf8_lossy(bytes)),
            Segment::Statement { code, .. } => format!("S:{code}"),
            Segment::Import { name, .. } => format!("I:{name}"),
            Segment::HelperDecl { code, .. } => format!("H:{code}"),
            Segment::Fragment { code, .. } => format!("F:{}", code.trim()),
        }).collect()
    }

    fn seg(t: &str) -> Vec<String> {
        describe(&segment(t.as_bytes()).unwrap())
    }

    #[test]
    fn t_plain_text() {
        assert_eq!(seg("<p>a < b</p>\n"), vec!["T:<p>a < b</p>\n"]);
        assert_eq!(seg(""), Vec::<String>::new());
        let bytes = b"\xff\xfe <b>";
        match &segment(bytes).unwrap()[..] {
            [Segment::Text { bytes: b, .. }] => assert_eq!(&b[..], &bytes[..]),
            s => panic!("{s:?}")
        }
    }

    #[test]
    fn t_doctype_and_comments() {
        assert_eq!(seg("<!DOCTYPE html>"), vec!["T:<!DOCTYPE html>"]);
        assert_eq!(seg("<!doctype html>\n"), vec!["T:<!doctype html>", "T:\n"]);
        assert_eq!(seg("a<!-- x > y !> -->b"), vec!["T:a", "T:<!-- x > y !> -->", "T:b"]);
        assert_eq!(seg("<!---->"), vec!["T:<!---->"]);
    }

    #[test]
    fn t_directives() {
        assert_eq!(seg("<!using text><!title \"Hi\"><!layout \"/l.ahtml\">x"),
                   vec!["I:text", "S:Title = \"Hi\";", "S:Layout = \"/l.ahtml\";", "T:x"]);
        assert_eq!(seg("<!section \"s\">in<!/section><!writesection \"s\">"),
                   vec!["S:Section(\"s\");", "T:in", "S:Section(null);",
                        "S:WriteSection(\"s\");"]);
    }

    #[test]
    fn t_code() {
        assert_eq!(seg("<! if (a > 1) { Write(a); } Write(b) !>"),
                   vec!["S:if (a > 1) { Write(a); }", "S:Write(b)"]);
        // `!` not followed by `>` is code
        assert_eq!(seg("<!Write(a != b)!>"), vec!["S:Write(a != b)"]);
        assert_eq!(seg("<! !>"), Vec::<String>::new());
        assert_eq!(seg("<<!Write(1)!>"), vec!["T:<", "S:Write(1)"]);
        assert_eq!(seg("<!class A { fn f() { return 1 > 0; } }!>"),
                   vec!["H:class A { fn f() { return 1 > 0; } }"]);
        assert_eq!(seg("<! for (x in xs) { !><li><! } else { !>-<! } !>"),
                   vec!["F:for (x in xs) {", "T:<li>", "F:} else {", "T:-", "F:}"]);
    }

    #[test]
    fn t_positions() {
        let e = segment("ab\n  <!title x + >".as_bytes()).unwrap_err();
        assert_eq!(e.pos, Pos::new(2, 14));
        let segments = segment("ä<!\nWrite(1);\n Write(2)!>".as_bytes()).unwrap();
        match &segments[..] {
            [Segment::Text { pos: p0, .. },
             Segment::Statement { stmt: s1, .. },
             Segment::Statement { stmt: s2, .. }] => {
                assert_eq!(*p0, Pos::START);
                assert_eq!(s1.pos, Pos::new(2, 1));
                assert_eq!(s2.pos, Pos::new(3, 2));
            }
            s => panic!("{s:?}")
        }
        let e = segment("é <!Write(\"x\")>".as_bytes()).unwrap_err();
        assert_eq!(e, ParseError::new("AH0001", Pos::new(1, 3), "unterminated directive"));
    }

    #[test]
    fn t_errors() {
        assert_eq!(segment(b"<!title").unwrap_err().code, "AH0001");
        assert_eq!(segment(b"<!-- open").unwrap_err().code, "AH0001");
        assert_eq!(segment(b"<!Write(1 +)!>").unwrap_err().code, "AH0002");
        assert_eq!(segment(b"<!title>").unwrap_err().code, "AH0002");
        assert_eq!(segment(b"<!using a.b>").unwrap_err().code, "AH0002");
        assert_eq!(segment(b"<!Write(\"\xff\")!>").unwrap_err().code, "AH0003");
    }
}
