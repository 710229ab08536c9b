//! Turning segments into the pieces of a page: imports, hoisted
//! class declarations, and the render body.

use std::fmt::Write;
use std::sync::Arc;

use crate::script::ast::{Block, ClassDecl, Stmt, StmtKind};
use crate::script::lexer::{Punct, Tok, Token};
use crate::script::link::Import;
use crate::script::parser::parse_spliced;
use crate::script::{Pos, ScriptError};
use super::segment::Segment;

#[derive(Debug, Clone)]
pub enum BodyStmt {
    WriteLiteral { bytes: Arc<[u8]>, pos: Pos },
    Code { code: String, stmt: Stmt },
    /// Part of a block spanning several directives.
    Fragment { code: String, tokens: Vec<Token>, pos: Pos },
}

#[derive(Debug, Clone)]
pub struct HelperDecl {
    pub code: String,
    pub classes: Vec<ClassDecl>,
}

#[derive(Debug, Clone)]
pub struct GeneratedPage {
    pub name: String,
    /// First occurrence of each import.
    pub imports: Vec<Import>,
    /// Later occurrences, reported as warnings.
    pub duplicate_imports: Vec<Import>,
    pub helper_decls: Vec<HelperDecl>,
    pub body: Vec<BodyStmt>,
    pub end: Pos,
}

/// `end` is the position after the last byte of the template.
pub fn generate(segments: Vec<Segment>, name: &str, end: Pos) -> GeneratedPage {
    let mut page = GeneratedPage {
        name: name.into(),
        imports: Vec::new(),
        duplicate_imports: Vec::new(),
        helper_decls: Vec::new(),
        body: Vec::new(),
        end,
    };
    for segment in segments {
        match segment {
            Segment::Text { bytes, pos } =>
                page.body.push(BodyStmt::WriteLiteral { bytes, pos }),
            Segment::Statement { code, stmt } =>
                page.body.push(BodyStmt::Code { code, stmt }),
            Segment::Import { name, pos } => {
                let import = Import { name, pos };
                if page.imports.iter().any(|i| i.name == import.name) {
                    page.duplicate_imports.push(import);
                } else {
                    page.imports.push(import);
                }
            }
            Segment::HelperDecl { code, classes, .. } =>
                page.helper_decls.push(HelperDecl { code, classes }),
            Segment::Fragment { code, tokens, pos } =>
                page.body.push(BodyStmt::Fragment { code, tokens, pos }),
        }
    }
    page
}

fn literal_source(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => format!("\"{}\"", s.escape_debug()),
        Err(_) => format!("b\"{}\"", bytes.escape_ascii()),
    }
}

impl GeneratedPage {
    /// All classes of the page, in declaration order.
    pub fn classes(&self) -> Vec<ClassDecl> {
        self.helper_decls.iter().flat_map(|h| h.classes.iter().cloned()).collect()
    }

    /// The render body as statements. Fails only if the fragments of
    /// blocks spanning directives don't fit together.
    pub fn body_block(&self) -> Result<Block, ScriptError> {
        let whole = |s: &BodyStmt| match s {
            BodyStmt::WriteLiteral { bytes, pos } =>
                Some(Stmt { kind: StmtKind::WriteLiteral(bytes.clone()), pos: *pos }),
            BodyStmt::Code { stmt, .. } => Some(stmt.clone()),
            BodyStmt::Fragment { .. } => None,
        };
        if !self.body.iter().any(|s| matches!(s, BodyStmt::Fragment { .. })) {
            return Ok(self.body.iter().filter_map(whole).collect())
        }
        // one token stream, with the complete statements spliced in
        let mut tokens = Vec::new();
        let mut spliced = Vec::new();
        for s in &self.body {
            match (whole(s), s) {
                (Some(stmt), _) => {
                    tokens.push(Token { tok: Tok::Splice(spliced.len()), pos: stmt.pos,
                                        start: 0, end: 0 });
                    spliced.push(stmt);
                }
                (None, BodyStmt::Fragment { tokens: ts, .. }) => {
                    tokens.extend(ts.iter().cloned());
                    // the end of a directive ends a statement
                    let open = matches!(ts.last().map(|t| &t.tok),
                                        Some(Tok::Punct(Punct::LBrace | Punct::RBrace)));
                    if let (false, Some(last)) = (open, ts.last()) {
                        tokens.push(Token { tok: Tok::Punct(Punct::Semi), pos: last.pos,
                                            start: 0, end: 0 });
                    }
                }
                (None, _) => (),
            }
        }
        tokens.push(Token { tok: Tok::Eof, pos: self.end, start: 0, end: 0 });
        parse_spliced(tokens, spliced)
    }

    /// The page as one readable translation unit.
    pub fn to_source(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "// page {}", self.name);
        for import in &self.imports {
            let _ = writeln!(out, "using {};", import.name);
        }
        if !self.imports.is_empty() {
            out.push('\n');
        }
        let _ = writeln!(out, "page {:?} {{", self.name);
        out.push_str("    // bound to the render context\n");
        out.push_str("    Title <-> ctx.page.title;\n");
        out.push_str("    Layout <-> ctx.page.layout;\n");
        out.push_str("    Request -> ctx.request;\n");
        out.push_str("    Site -> ctx.site;\n");
        out.push_str("    Write, WriteLine, Section, WriteSection, SetStatus, SetMime, SetHeader\n");
        out.push_str("        -> ctx.page;\n");
        for decl in &self.helper_decls {
            out.push('\n');
            for line in decl.code.trim().lines() {
                let _ = writeln!(out, "    {line}");
            }
        }
        out.push_str("\n    render(ctx) {\n");
        for stmt in &self.body {
            match stmt {
                BodyStmt::WriteLiteral { bytes, .. } => {
                    let _ = writeln!(out, "        Write({});", literal_source(bytes));
                }
                BodyStmt::Code { code, .. } => {
                    let code = code.trim();
                    let sep = if code.ends_with(';') || code.ends_with('}') { "" } else { ";" };
                    let _ = writeln!(out, "        {code}{sep}");
                }
                BodyStmt::Fragment { code, .. } => {
                    let _ = writeln!(out, "        {}", code.trim());
                }
            }
        }
        out.push_str("    }\n}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::segment::segment;

    #[test]
    fn t_order_and_imports() {
        let segs = segment(
            b"<!using text><p><!let a = 1; Write(a)!></p><!using text><!class C { fn f() {} }!>"
        ).unwrap();
        let page = generate(segs, "p.ahtml", Pos::START);
        let names: Vec<_> = page.imports.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["text"]);
        assert_eq!(page.duplicate_imports.len(), 1);
        assert_eq!(page.classes().len(), 1);
        let kinds: Vec<String> = page.body.iter().map(|s| match s {
            BodyStmt::WriteLiteral { bytes, .. } => String::from_utf8_lossy(bytes).into(),
            BodyStmt::Code { code, .. } => format!("code:{}", code.trim()),
            BodyStmt::Fragment { code, .. } => format!("fragment:{}", code.trim()),
        }).collect();
        assert_eq!(kinds, vec!["<p>", "code:let a = 1;", "code:Write(a)", "</p>"]);
        assert_eq!(page.body_block().unwrap().len(), 4);
    }

    #[test]
    fn t_whitespace_kept() {
        let page = generate(segment(b"<!title \"x\">\n  \n").unwrap(), "p", Pos::START);
        match &page.body[1] {
            BodyStmt::WriteLiteral { bytes, .. } => assert_eq!(&bytes[..], b"\n  \n"),
            _ => panic!("expected a literal"),
        }
    }

    #[test]
    fn t_to_source() {
        let page = generate(segment(b"<!using html>a\"b\n<!Write(html.escape(\"<\"))!>").unwrap(),
                            "x.ahtml", Pos::START);
        let src = page.to_source();
        assert!(src.contains("using html;\n"));
        assert!(src.contains("        Write(\"a\\\"b\\n\");\n"));
        assert!(src.contains("        Write(html.escape(\"<\"));\n"));
    }

    #[test]
    fn t_spanning_blocks() {
        let page = generate(
            segment(b"<ul><! for (x in [1, 2]) { !><li><! Write(x) } !></ul>").unwrap(),
            "p", Pos::new(1, 53));
        let block = page.body_block().unwrap();
        assert_eq!(block.len(), 3);
        match &block[1].kind {
            StmtKind::For { body, .. } => assert_eq!(body.len(), 2),
            k => panic!("{k:?}")
        }
        let page = generate(segment(b"<! if (a) { !>x").unwrap(), "p", Pos::new(1, 16));
        assert_eq!(page.body_block().unwrap_err().pos, Pos::new(1, 16));
        let src = page.to_source();
        assert!(src.contains("        if (a) {\n        Write(\"x\");\n"));
    }
}
