//! Recursive descent parser for the page script.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use super::ast::*;
use super::lexer::{tokenize, Keyword, Punct, Tok, Token};
use super::value::Value;
use super::{Pos, ScriptError};

type PResult<T> = Result<T, ScriptError>;

/// How deeply statements and expressions may nest, counting operator
/// chains like `a + b + c` as nesting too.
pub const MAX_NESTING: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    i: usize,
    /// Statements referenced by `Tok::Splice`.
    spliced: Vec<Stmt>,
    depth: usize,
}

impl Parser {
    fn new(src: &str, origin: Pos) -> PResult<Self> {
        Ok(Parser { tokens: tokenize(src, origin)?, i: 0, spliced: Vec::new(), depth: 0 })
    }

    fn peek(&self) -> &Token {
        // tokenize always ends with Eof, and we never advance past it
        &self.tokens[self.i]
    }

    fn peek_tok(&self) -> &Tok {
        &self.peek().tok
    }

    fn pos(&self) -> Pos {
        self.peek().pos
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.i].clone();
        if t.tok != Tok::Eof {
            self.i += 1;
        }
        t
    }

    /// End offset of the last consumed token.
    fn prev_end(&self) -> usize {
        if self.i == 0 { 0 } else { self.tokens[self.i - 1].end }
    }

    fn at_punct(&self, p: Punct) -> bool {
        *self.peek_tok() == Tok::Punct(p)
    }

    fn at_keyword(&self, k: Keyword) -> bool {
        *self.peek_tok() == Tok::Keyword(k)
    }

    fn eat_punct(&mut self, p: Punct) -> bool {
        if self.at_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn unexpected<T>(&self, wanted: &str) -> PResult<T> {
        Err(ScriptError::new(
            self.pos(), format!("expected {wanted}, found {}", self.peek_tok().describe())))
    }

    fn expect_punct(&mut self, p: Punct) -> PResult<()> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            self.unexpected(&format!("`{}`", p.as_str()))
        }
    }

    fn expect_keyword(&mut self, k: Keyword) -> PResult<()> {
        if self.at_keyword(k) {
            self.advance();
            Ok(())
        } else {
            self.unexpected(&format!("`{}`", k.as_str()))
        }
    }

    fn ident(&mut self) -> PResult<Name> {
        match self.peek_tok() {
            Tok::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => self.unexpected("identifier")
        }
    }

    /// Fails if `extra` more levels would nest too deeply.
    fn check_depth(&self, extra: usize) -> PResult<()> {
        if self.depth + extra >= MAX_NESTING {
            return Err(ScriptError::new(
                self.pos(), format!("code nested more than {MAX_NESTING} levels deep")))
        }
        Ok(())
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        self.check_depth(0)?;
        self.depth += 1;
        let r = parse(self);
        self.depth -= 1;
        r
    }

    // ---- statements --------------------------------------------------

    /// Whether the current simple statement may end here without a `;`.
    fn at_implicit_end(&self) -> bool {
        matches!(self.peek_tok(), Tok::Punct(Punct::RBrace) | Tok::Splice(_) | Tok::Eof)
    }

    /// A `;` ends a simple statement; it may be left out before `}`
    /// and at the end of the code.
    fn end_simple(&mut self) -> PResult<()> {
        if self.eat_punct(Punct::Semi) || self.at_implicit_end() {
            Ok(())
        } else {
            self.unexpected("`;`")
        }
    }

    fn block(&mut self) -> PResult<Block> {
        self.expect_punct(Punct::LBrace)?;
        let mut stmts = Vec::new();
        loop {
            while self.eat_punct(Punct::Semi) {}
            if self.eat_punct(Punct::RBrace) {
                return Ok(stmts)
            }
            if *self.peek_tok() == Tok::Eof {
                return self.unexpected("`}`")
            }
            stmts.push(self.statement()?);
        }
    }

    fn statement(&mut self) -> PResult<Stmt> {
        self.nested(Self::statement_kind)
    }

    fn statement_kind(&mut self) -> PResult<Stmt> {
        let pos = self.pos();
        let kind = match self.peek_tok().clone() {
            Tok::Splice(i) => {
                self.advance();
                return self.spliced.get(i).cloned().ok_or_else(
                    || ScriptError::new(pos, "invalid template text reference"))
            }
            Tok::Keyword(Keyword::Let) => {
                self.advance();
                let name = self.ident()?;
                let init = if self.eat_punct(Punct::Assign) {
                    Some(self.expr()?)
                } else {
                    None
                };
                self.end_simple()?;
                StmtKind::Let(name, init)
            }
            Tok::Keyword(Keyword::If) => self.if_stmt()?,
            Tok::Keyword(Keyword::While) => {
                self.advance();
                self.expect_punct(Punct::LParen)?;
                let cond = self.expr()?;
                self.expect_punct(Punct::RParen)?;
                StmtKind::While(cond, self.block()?)
            }
            Tok::Keyword(Keyword::For) => {
                self.advance();
                self.expect_punct(Punct::LParen)?;
                let first = self.ident()?;
                let (key, value) = if self.eat_punct(Punct::Comma) {
                    (Some(first), self.ident()?)
                } else {
                    (None, first)
                };
                self.expect_keyword(Keyword::In)?;
                let iter = self.expr()?;
                self.expect_punct(Punct::RParen)?;
                StmtKind::For { key, value, iter, body: self.block()? }
            }
            Tok::Keyword(Keyword::Break) => {
                self.advance();
                self.end_simple()?;
                StmtKind::Break
            }
            Tok::Keyword(Keyword::Continue) => {
                self.advance();
                self.end_simple()?;
                StmtKind::Continue
            }
            Tok::Keyword(Keyword::Return) => {
                self.advance();
                let value = if self.at_punct(Punct::Semi) || self.at_implicit_end() {
                    None
                } else {
                    Some(self.expr()?)
                };
                self.end_simple()?;
                StmtKind::Return(value)
            }
            Tok::Keyword(k @ (Keyword::Fn | Keyword::Class)) =>
                return Err(ScriptError::new(
                    pos, format!("`{}` is only allowed in class declarations", k.as_str()))),
            Tok::Punct(Punct::LBrace) => StmtKind::Block(self.block()?),
            _ => {
                let e = self.expr()?;
                let op = match self.peek_tok() {
                    Tok::Punct(Punct::Assign) => Some(AssignOp::Set),
                    Tok::Punct(Punct::PlusAssign) => Some(AssignOp::Add),
                    Tok::Punct(Punct::MinusAssign) => Some(AssignOp::Sub),
                    _ => None
                };
                let kind = if let Some(op) = op {
                    self.advance();
                    let place = to_place(e)?;
                    StmtKind::Assign(place, op, self.expr()?)
                } else {
                    StmtKind::Expr(e)
                };
                self.end_simple()?;
                kind
            }
        };
        Ok(Stmt { kind, pos })
    }

    fn if_stmt(&mut self) -> PResult<StmtKind> {
        self.nested(Self::if_chain)
    }

    fn if_chain(&mut self) -> PResult<StmtKind> {
        self.expect_keyword(Keyword::If)?;
        self.expect_punct(Punct::LParen)?;
        let cond = self.expr()?;
        self.expect_punct(Punct::RParen)?;
        let then = self.block()?;
        let otherwise = if self.at_keyword(Keyword::Else) {
            self.advance();
            if self.at_keyword(Keyword::If) {
                let pos = self.pos();
                Some(vec![Stmt { kind: self.if_stmt()?, pos }])
            } else {
                Some(self.block()?)
            }
        } else {
            None
        };
        Ok(StmtKind::If { cond, then, otherwise })
    }

    // ---- expressions -------------------------------------------------

    fn expr(&mut self) -> PResult<Expr> {
        self.nested(Self::conditional)
    }

    fn conditional(&mut self) -> PResult<Expr> {
        let cond = self.binary(0)?;
        if self.at_punct(Punct::Question) {
            let pos = self.pos();
            self.advance();
            let a = self.expr()?;
            self.expect_punct(Punct::Colon)?;
            let b = self.expr()?;
            Ok(Expr { kind: ExprKind::Cond(Box::new(cond), Box::new(a), Box::new(b)), pos })
        } else {
            Ok(cond)
        }
    }

    /// Precedence climbing over the binary operator levels.
    fn binary(&mut self, level: usize) -> PResult<Expr> {
        const LEVELS: &[&[(Punct, BinOp)]] = &[
            &[(Punct::Or, BinOp::Or)],
            &[(Punct::And, BinOp::And)],
            &[(Punct::Eq, BinOp::Eq), (Punct::Ne, BinOp::Ne)],
            &[(Punct::Lt, BinOp::Lt), (Punct::Le, BinOp::Le),
              (Punct::Gt, BinOp::Gt), (Punct::Ge, BinOp::Ge)],
            &[(Punct::Plus, BinOp::Add), (Punct::Minus, BinOp::Sub)],
            &[(Punct::Star, BinOp::Mul), (Punct::Slash, BinOp::Div),
              (Punct::Percent, BinOp::Rem)],
        ];
        if level == LEVELS.len() {
            return self.unary()
        }
        let mut lhs = self.binary(level + 1)?;
        // each operator in a chain nests the expression one level deeper
        let mut chain = 0;
        'outer: loop {
            for (p, op) in LEVELS[level] {
                if self.at_punct(*p) {
                    self.check_depth(0)?;
                    self.depth += 1;
                    chain += 1;
                    let pos = self.pos();
                    self.advance();
                    let rhs = self.binary(level + 1)?;
                    lhs = Expr { kind: ExprKind::Binary(*op, Box::new(lhs), Box::new(rhs)), pos };
                    continue 'outer
                }
            }
            self.depth -= chain;
            return Ok(lhs)
        }
    }

    fn unary(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let op = match self.peek_tok() {
            Tok::Punct(Punct::Not) => UnOp::Not,
            Tok::Punct(Punct::Minus) => UnOp::Neg,
            _ => return self.postfix()
        };
        self.advance();
        let e = self.nested(Self::unary)?;
        Ok(Expr { kind: ExprKind::Unary(op, Box::new(e)), pos })
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut e = self.primary()?;
        let mut chain = 0;
        loop {
            let pos = self.pos();
            if matches!(self.peek_tok(),
                        Tok::Punct(Punct::LParen | Punct::Dot | Punct::LBracket)) {
                self.check_depth(0)?;
                self.depth += 1;
                chain += 1;
            }
            if self.eat_punct(Punct::LParen) {
                let path = call_path(&e).ok_or_else(
                    || ScriptError::new(pos, "only named functions can be called"))?;
                let args = self.list_of(Punct::RParen, |p| p.expr())?;
                e = Expr { kind: ExprKind::Call { path, args, target: CallTarget::Unresolved },
                           pos: e.pos };
            } else if self.eat_punct(Punct::Dot) {
                let name = self.ident()?;
                e = Expr { kind: ExprKind::Field(Box::new(e), name), pos };
            } else if self.eat_punct(Punct::LBracket) {
                let idx = self.expr()?;
                self.expect_punct(Punct::RBracket)?;
                e = Expr { kind: ExprKind::Index(Box::new(e), Box::new(idx)), pos };
            } else {
                self.depth -= chain;
                return Ok(e)
            }
        }
    }

    /// Comma separated items up to `close` (consumed); a trailing
    /// comma is allowed.
    fn list_of<T>(&mut self, close: Punct, mut item: impl FnMut(&mut Self) -> PResult<T>)
                  -> PResult<Vec<T>> {
        let mut items = Vec::new();
        loop {
            if self.eat_punct(close) {
                return Ok(items)
            }
            items.push(item(self)?);
            if !self.eat_punct(Punct::Comma) {
                self.expect_punct(close)?;
                return Ok(items)
            }
        }
    }

    fn primary(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let lit = |v: Value| -> PResult<Expr> { Ok(Expr { kind: ExprKind::Literal(v), pos }) };
        match self.advance().tok {
            Tok::Int(i) => lit(Value::Int(i)),
            Tok::Float(x) => lit(Value::Float(x)),
            Tok::Str(s) => lit(Value::from(s)),
            Tok::Keyword(Keyword::True) => lit(Value::Bool(true)),
            Tok::Keyword(Keyword::False) => lit(Value::Bool(false)),
            Tok::Keyword(Keyword::Null) => lit(Value::Null),
            Tok::Ident(name) => Ok(Expr { kind: ExprKind::Var(name), pos }),
            Tok::Punct(Punct::LParen) => {
                let e = self.expr()?;
                self.expect_punct(Punct::RParen)?;
                Ok(e)
            }
            Tok::Punct(Punct::LBracket) => {
                let items = self.list_of(Punct::RBracket, |p| p.expr())?;
                Ok(Expr { kind: ExprKind::List(items), pos })
            }
            Tok::Punct(Punct::LBrace) => {
                let entries = self.list_of(Punct::RBrace, |p| {
                    let key = match p.advance() {
                        Token { tok: Tok::Str(s), .. } => Name::from(s),
                        Token { tok: Tok::Ident(n), .. } => n,
                        t => return Err(ScriptError::new(
                            t.pos, format!("expected map key, found {}", t.tok.describe())))
                    };
                    p.expect_punct(Punct::Colon)?;
                    Ok((key, p.expr()?))
                })?;
                Ok(Expr { kind: ExprKind::Map(entries), pos })
            }
            t => Err(ScriptError::new(pos, format!("expected expression, found {}",
                                                   t.describe())))
        }
    }

    // ---- declarations ------------------------------------------------

    fn class_decl(&mut self) -> PResult<ClassDecl> {
        let pos = self.pos();
        self.expect_keyword(Keyword::Class)?;
        let name = self.ident()?;
        self.expect_punct(Punct::LBrace)?;
        let mut functions = BTreeMap::new();
        while !self.eat_punct(Punct::RBrace) {
            let fpos = self.pos();
            self.expect_keyword(Keyword::Fn)?;
            let fname = self.ident()?;
            self.expect_punct(Punct::LParen)?;
            let params = self.list_of(Punct::RParen, |p| p.ident())?;
            let body = self.block()?;
            if functions.contains_key(&fname) {
                return Err(ScriptError::new(
                    fpos, format!("function `{fname}` declared twice in class `{name}`")))
            }
            functions.insert(fname.clone(),
                             Arc::new(FnDecl { name: fname, params, body, pos: fpos }));
        }
        Ok(ClassDecl { name, functions, pos })
    }
}

fn call_path(e: &Expr) -> Option<Vec<Name>> {
    match &e.kind {
        ExprKind::Var(n) => Some(vec![n.clone()]),
        ExprKind::Field(inner, n) => {
            let mut path = call_path(inner)?;
            path.push(n.clone());
            Some(path)
        }
        _ => None
    }
}

fn to_place(e: Expr) -> PResult<Place> {
    match e.kind {
        ExprKind::Var(n) => Ok(Place::Var(n)),
        ExprKind::Field(inner, n) => Ok(Place::Field(Box::new(to_place(*inner)?), n)),
        ExprKind::Index(inner, idx) => Ok(Place::Index(Box::new(to_place(*inner)?), *idx)),
        _ => Err(ScriptError::new(e.pos, "invalid assignment target"))
    }
}

/// Split `body` into its top-level statements, each with its byte
/// range in `body` (including the terminating `;` if present).
/// `origin` is where `body` starts in its file.
pub fn parse_statements(body: &str, origin: Pos) -> PResult<Vec<(Stmt, Range<usize>)>> {
    let mut p = Parser::new(body, origin)?;
    let mut out = Vec::new();
    loop {
        while p.eat_punct(Punct::Semi) {}
        if *p.peek_tok() == Tok::Eof {
            return Ok(out)
        }
        if p.at_punct(Punct::RBrace) {
            return p.unexpected("statement");
        }
        let start = p.peek().start;
        let stmt = p.statement()?;
        out.push((stmt, start..p.prev_end()));
    }
}

/// Parse a statement sequence given as tokens, where `Tok::Splice(i)`
/// stands for the ready-made statement `spliced[i]`. `tokens` must end
/// with `Tok::Eof`.
pub fn parse_spliced(tokens: Vec<Token>, spliced: Vec<Stmt>) -> PResult<Block> {
    let mut p = Parser { tokens, i: 0, spliced, depth: 0 };
    let mut out = Vec::new();
    loop {
        while p.eat_punct(Punct::Semi) {}
        if *p.peek_tok() == Tok::Eof {
            return Ok(out)
        }
        if p.at_punct(Punct::RBrace) {
            return p.unexpected("statement");
        }
        out.push(p.statement()?);
    }
}

/// Parse a single expression, optionally followed by `;`.
pub fn parse_expression(src: &str, origin: Pos) -> PResult<Expr> {
    let mut p = Parser::new(src, origin)?;
    let e = p.expr()?;
    p.eat_punct(Punct::Semi);
    if *p.peek_tok() != Tok::Eof {
        return p.unexpected("end of expression")
    }
    Ok(e)
}

/// Parse a sequence of `class` declarations.
pub fn parse_declarations(source: &str, origin: Pos) -> PResult<Vec<ClassDecl>> {
    let mut p = Parser::new(source, origin)?;
    let mut out = Vec::new();
    while *p.peek_tok() != Tok::Eof {
        out.push(p.class_decl()?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(body: &str) -> Vec<&str> {
        parse_statements(body, Pos::START).unwrap().into_iter()
            .map(|(_, r)| &body[r])
            .collect()
    }

    #[test]
    fn t_split_statements() {
        assert_eq!(split(" Write(1); let x = 2;\n x += 3 "),
                   vec!["Write(1);", "let x = 2;", "x += 3"]);
        assert_eq!(split("if (a > b) { Write(a) } else { Write(b); } Write(\";\")"),
                   vec!["if (a > b) { Write(a) } else { Write(b); }", "Write(\";\")"]);
        assert_eq!(split(" ;; "), Vec::<&str>::new());
    }

    #[test]
    fn t_positions() {
        let stmts = parse_statements("a;\n  b;", Pos::new(5, 10)).unwrap();
        assert_eq!(stmts[0].0.pos, Pos::new(5, 10));
        assert_eq!(stmts[1].0.pos, Pos::new(6, 3));
    }

    #[test]
    fn t_precedence() {
        let stmts = parse_statements("x = 1 + 2 * 3 == 7 || !y ? a : b", Pos::START).unwrap();
        let (stmt, _) = &stmts[0];
        match &stmt.kind {
            StmtKind::Assign(Place::Var(n), AssignOp::Set, e) => {
                assert_eq!(n, "x");
                match &e.kind {
                    ExprKind::Cond(c, _, _) => match &c.kind {
                        ExprKind::Binary(BinOp::Or, l, _) => match &l.kind {
                            ExprKind::Binary(BinOp::Eq, l, _) => match &l.kind {
                                ExprKind::Binary(BinOp::Add, _, r) => assert!(
                                    matches!(r.kind, ExprKind::Binary(BinOp::Mul, _, _))),
                                k => panic!("{k:?}")
                            },
                            k => panic!("{k:?}")
                        },
                        k => panic!("{k:?}")
                    },
                    k => panic!("{k:?}")
                }
            }
            k => panic!("{k:?}")
        }
    }

    #[test]
    fn t_calls_and_places() {
        let stmts = parse_statements("text.upper(x)[0]; m.a[1] -= 2;", Pos::START).unwrap();
        match &stmts[0].0.kind {
            StmtKind::Expr(Expr { kind: ExprKind::Index(call, _), .. }) => match &call.kind {
                ExprKind::Call { path, args, .. } => {
                    assert_eq!(path.len(), 2);
                    assert_eq!(args.len(), 1);
                }
                k => panic!("{k:?}")
            },
            k => panic!("{k:?}")
        }
        match &stmts[1].0.kind {
            StmtKind::Assign(place, AssignOp::Sub, _) =>
                assert!(matches!(place.root(), Place::Var(n) if n == "m")),
            k => panic!("{k:?}")
        }
    }

    #[test]
    fn t_errors() {
        let e = parse_statements("Write(1) Write(2)", Pos::START).unwrap_err();
        assert_eq!(e.pos, Pos::new(1, 10));
        assert!(e.message.starts_with("expected `;`"));
        assert!(parse_statements("1 = 2;", Pos::START).is_err());
        assert!(parse_statements("(a + b)(1);", Pos::START).is_err());
        assert!(parse_statements("fn f() {}", Pos::START).is_err());
        assert!(parse_statements("if (x) { ", Pos::START).is_err());
    }

    #[test]
    fn t_deep_nesting() {
        // without the limit, the 200 000 levels overflow this stack
        std::thread::Builder::new().stack_size(8 << 20).spawn(|| {
            let too_deep = |src: String| {
                let e = parse_statements(&src, Pos::START).unwrap_err();
                assert!(e.message.contains("nested more than"), "{src:.40}: {e}");
            };
            too_deep(format!("Write({}1{})", "(".repeat(1000), ")".repeat(1000)));
            too_deep(format!("Write({}1{})", "(".repeat(200_000), ")".repeat(200_000)));
            too_deep(format!("x = {}y;", "!".repeat(1000)));
            too_deep(format!("x = 1{};", " + 1".repeat(1000)));
            too_deep(format!("x = a{};", ".b".repeat(1000)));
            too_deep(format!("{}{}", "{".repeat(1000), "}".repeat(1000)));
            too_deep(format!("if (a) {{}}{}", " else if (a) {}".repeat(1000)));
            // chains inside parentheses add up
            too_deep(format!("x = {}1{};", "(1 + 1 + 1 + ".repeat(40), ")".repeat(40)));

            parse_statements(&format!("Write({}1{})", "(".repeat(100), ")".repeat(100)),
                             Pos::START).unwrap();
            parse_statements(&format!("x = 1{};", " + 1".repeat(100)), Pos::START).unwrap();
        }).unwrap().join().unwrap();
    }

    #[test]
    fn t_expression() {
        let e = parse_expression("\"a\" + x;", Pos::new(3, 9)).unwrap();
        assert_eq!(e.pos, Pos::new(3, 13));
        assert!(parse_expression("", Pos::START).is_err());
        assert!(parse_expression("a b", Pos::START).is_err());
    }

    #[test]
    fn t_declarations() {
        let classes = parse_declarations(
            "class Fmt { fn money(x) { return str(x) + \" EUR\"; } fn nothing() {} }\n\
             class Other { }",
            Pos::START).unwrap();
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[0].name, "Fmt");
        assert_eq!(classes[0].function("money").unwrap().params.len(), 1);
        assert!(parse_declarations("class A { fn f() {} fn f() {} }", Pos::START).is_err());
        assert!(parse_declarations("Write(1);", Pos::START).is_err());
    }
    #[test]
    fn t_spliced() {
        let literal = |n: i64| Stmt {
            kind: StmtKind::Expr(Expr { kind: ExprKind::Literal(Value::Int(n)), pos: Pos::START }),
            pos: Pos::START,
        };
        let mut tokens: Vec<Token> = tokenize("for (x in xs) {", Pos::START).unwrap();
        tokens.pop();
        tokens.push(Token { tok: Tok::Splice(0), pos: Pos::START, start: 0, end: 0 });
        let mut rest = tokenize("Write(x) } Write(2)", Pos::START).unwrap();
        tokens.append(&mut rest);
        let block = parse_spliced(tokens, vec![literal(1)]).unwrap();
        assert_eq!(block.len(), 2);
        match &block[0].kind {
            StmtKind::For { body, .. } => {
                assert_eq!(body.len(), 2);
                assert!(matches!(body[0].kind, StmtKind::Expr(_)));
            }
            k => panic!("{k:?}")
        }

        let mut tokens: Vec<Token> = tokenize("if (a) {", Pos::START).unwrap();
        tokens.pop();
        tokens.push(Token { tok: Tok::Splice(0), pos: Pos::START, start: 0, end: 0 });
        tokens.push(Token { tok: Tok::Eof, pos: Pos::new(9, 1), start: 0, end: 0 });
        let e = parse_spliced(tokens, vec![literal(1)]).unwrap_err();
        assert_eq!(e.pos, Pos::new(9, 1));
    }
}
