//! Syntax tree of the page script. The parser produces it with all
//! call targets `Unresolved`; the linker fills those in (and turns
//! `Title`/`Layout`/`Request`/`Site` variables into accessors) before
//! a tree is ever run.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use kstring::KString;
use strum_macros::{EnumString, IntoStaticStr};

use super::builtins::BuiltinFn;
use super::value::Value;
use super::Pos;

pub type Name = KString;

/// The page properties visible to scripts as capitalized names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr)]
pub enum Accessor {
    Title,
    Layout,
    Request,
    Site,
}

impl Accessor {
    pub fn is_writable(self) -> bool {
        matches!(self, Accessor::Title | Accessor::Layout)
    }
}

/// Functions operating on the page being rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr)]
pub enum PageFn {
    Write,
    WriteLine,
    Section,
    WriteSection,
    SetStatus,
    SetMime,
    SetHeader,
}

impl PageFn {
    /// (min, max) number of arguments.
    pub fn arity(self) -> (usize, usize) {
        match self {
            PageFn::Write => (1, 1),
            PageFn::WriteLine => (0, 1),
            PageFn::Section => (1, 1),
            PageFn::WriteSection => (1, 1),
            PageFn::SetStatus => (1, 1),
            PageFn::SetMime => (1, 1),
            PageFn::SetHeader => (2, 2),
        }
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone)]
pub enum CallTarget {
    Unresolved,
    Page(PageFn),
    Builtin(&'static BuiltinFn),
    /// A class declared by the page itself.
    PageClass { class: Name, func: Name },
    /// A class from a helper library, looked up at call time.
    Library { class: Name, func: Name },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Value),
    Var(Name),
    Accessor(Accessor),
    List(Vec<Expr>),
    Map(Vec<(Name, Expr)>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
    Field(Box<Expr>, Name),
    Index(Box<Expr>, Box<Expr>),
    /// `path` is what was written before the parenthesis, e.g.
    /// `["text", "upper"]` for `text.upper(x)`.
    Call { path: Vec<Name>, args: Vec<Expr>, target: CallTarget },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
}

#[derive(Debug, Clone)]
pub enum Place {
    Var(Name),
    Accessor(Accessor),
    Field(Box<Place>, Name),
    Index(Box<Place>, Expr),
}

impl Place {
    pub fn root(&self) -> &Place {
        match self {
            Place::Var(_) | Place::Accessor(_) => self,
            Place::Field(p, _) | Place::Index(p, _) => p.root(),
        }
    }
}

pub type Block = Vec<Stmt>;

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Let(Name, Option<Expr>),
    Assign(Place, AssignOp, Expr),
    Expr(Expr),
    If { cond: Expr, then: Block, otherwise: Option<Block> },
    While(Expr, Block),
    For { key: Option<Name>, value: Name, iter: Expr, body: Block },
    Break,
    Continue,
    Return(Option<Expr>),
    Block(Block),
    /// Emit template text byte for byte; only generated, never parsed.
    WriteLiteral(Arc<[u8]>),
}

#[derive(Debug, Clone)]
pub struct FnDecl {
    pub name: Name,
    pub params: Vec<Name>,
    pub body: Block,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub struct ClassDecl {
    pub name: Name,
    pub functions: BTreeMap<Name, Arc<FnDecl>>,
    pub pos: Pos,
}

impl ClassDecl {
    pub fn function(&self, name: &str) -> Option<&Arc<FnDecl>> {
        self.functions.get(name)
    }
}

/// A linked template, ready to run.
#[derive(Debug)]
pub struct Program {
    pub name: String,
    pub classes: BTreeMap<Name, Arc<ClassDecl>>,
    pub body: Block,
}

/// A linked helper source file.
#[derive(Debug)]
pub struct Library {
    pub path: PathBuf,
    pub classes: BTreeMap<Name, Arc<ClassDecl>>,
}

/// The helper libraries currently in effect. Earlier libraries win
/// when two of them declare the same class.
#[derive(Debug, Default, Clone)]
pub struct LibrarySet {
    pub libraries: Vec<Arc<Library>>,
}

impl LibrarySet {
    pub fn new(libraries: Vec<Arc<Library>>) -> Self {
        LibrarySet { libraries }
    }

    pub fn class(&self, name: &str) -> Option<&Arc<ClassDecl>> {
        self.libraries.iter().find_map(|lib| lib.classes.get(name))
    }

    /// Replace (or add) the library for `lib.path`, keeping the
    /// position of an existing one.
    pub fn with_library(&self, lib: Arc<Library>) -> Self {
        let mut libraries = self.libraries.clone();
        if let Some(slot) = libraries.iter_mut().find(|l| l.path == lib.path) {
            *slot = lib;
        } else {
            libraries.push(lib);
        }
        LibrarySet { libraries }
    }

    pub fn without_library(&self, path: &std::path::Path) -> Self {
        LibrarySet {
            libraries: self.libraries.iter().filter(|l| l.path != path).cloned().collect()
        }
    }
}
