//! Name resolution. Every identifier of a page (or helper library)
//! is resolved here, once, at compile time; the interpreter never
//! looks a function up by name except for library classes, which
//! may be swapped while a page stays cached.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use crate::template::unit::Diagnostic;
use super::ast::*;
use super::builtins;
use super::Pos;

/// A `using` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub name: Name,
    pub pos: Pos,
}

struct ImportState {
    name: Name,
    pos: Pos,
    used: bool,
}

/// Which kind of code is being linked; decides how calls to the
/// classes declared alongside it are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Page,
    Library,
}

struct Linker<'a> {
    unit: Unit,
    libraries: &'a LibrarySet,
    /// class -> function -> number of parameters
    own_classes: HashMap<Name, HashMap<Name, usize>>,
    imports: Vec<ImportState>,
    scopes: Vec<HashSet<Name>>,
    loop_depth: usize,
    current_class: Option<Name>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Linker<'a> {
    fn new(unit: Unit, libraries: &'a LibrarySet, classes: &[ClassDecl]) -> Self {
        let mut linker = Linker {
            unit,
            libraries,
            own_classes: HashMap::new(),
            imports: Vec::new(),
            scopes: Vec::new(),
            loop_depth: 0,
            current_class: None,
            diagnostics: Vec::new(),
        };
        for class in classes {
            if linker.own_classes.contains_key(&class.name) {
                linker.error("AH0108", class.pos,
                             format!("class `{}` is declared more than once", class.name));
                continue
            }
            let arities = class.functions.iter()
                .map(|(name, f)| (name.clone(), f.params.len()))
                .collect();
            linker.own_classes.insert(class.name.clone(), arities);
        }
        linker
    }

    fn error(&mut self, code: &'static str, pos: Pos, msg: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(code, pos, msg));
    }

    fn warning(&mut self, code: &'static str, pos: Pos, msg: impl Into<String>) {
        self.diagnostics.push(Diagnostic::warning(code, pos, msg));
    }

    fn set_imports(&mut self, imports: &[Import]) {
        for import in imports {
            if builtins::is_module(&import.name) {
                self.imports.push(ImportState {
                    name: import.name.clone(), pos: import.pos, used: false
                });
            } else {
                self.error("AH0106", import.pos,
                           format!("unknown module `{}` in using", import.name));
            }
        }
    }

    fn finish(mut self) -> Vec<Diagnostic> {
        let unused: Vec<_> = self.imports.iter()
            .filter(|i| !i.used)
            .map(|i| (i.pos, i.name.clone()))
            .collect();
        for (pos, name) in unused {
            self.warning("AH0201", pos, format!("module `{name}` is imported but never used"));
        }
        self.diagnostics
    }

    // ---- scopes ------------------------------------------------------

    fn is_local(&self, name: &str) -> bool {
        self.scopes.iter().rev().any(|s| s.contains(name))
    }

    fn declare(&mut self, name: &Name, pos: Pos) {
        let n = self.scopes.len();
        if n == 0 {
            self.scopes.push(HashSet::new());
            return self.declare(name, pos)
        }
        if self.scopes[n - 1].contains(name) {
            return self.error("AH0104", pos,
                              format!("`{name}` is already declared in this scope"))
        }
        if self.scopes[..n - 1].iter().any(|s| s.contains(name)) {
            self.warning("AH0203", pos, format!("`{name}` shadows an outer variable"));
        }
        self.scopes[n - 1].insert(name.clone());
    }

    fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.scopes.push(HashSet::new());
        let r = f(self);
        self.scopes.pop();
        r
    }

    // ---- statements --------------------------------------------------

    fn block(&mut self, block: &mut Block) {
        self.scoped(|l| l.stmts(block))
    }

    fn stmts(&mut self, stmts: &mut [Stmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &mut Stmt) {
        let pos = stmt.pos;
        match &mut stmt.kind {
            StmtKind::Let(name, init) => {
                // the initializer cannot see the new variable
                if let Some(e) = init {
                    self.expr(e);
                }
                let name = name.clone();
                self.declare(&name, pos);
            }
            StmtKind::Assign(place, _, e) => {
                self.place(place, pos, false);
                self.expr(e);
            }
            StmtKind::Expr(e) => self.expr(e),
            StmtKind::If { cond, then, otherwise } => {
                self.expr(cond);
                self.block(then);
                if let Some(b) = otherwise {
                    self.block(b);
                }
            }
            StmtKind::While(cond, body) => {
                self.expr(cond);
                self.loop_body(body, &[], pos);
            }
            StmtKind::For { key, value, iter, body } => {
                self.expr(iter);
                let mut vars = Vec::new();
                if let Some(k) = key {
                    vars.push(k.clone());
                }
                vars.push(value.clone());
                self.loop_body(body, &vars, pos);
            }
            StmtKind::Break => self.check_in_loop("break", pos),
            StmtKind::Continue => self.check_in_loop("continue", pos),
            StmtKind::Return(e) => {
                if let Some(e) = e {
                    self.expr(e);
                }
            }
            StmtKind::Block(b) => self.block(b),
            StmtKind::WriteLiteral(_) => (),
        }
    }

    fn check_in_loop(&mut self, what: &str, pos: Pos) {
        if self.loop_depth == 0 {
            self.error("AH0105", pos, format!("`{what}` outside of a loop"));
        }
    }

    fn loop_body(&mut self, body: &mut Block, vars: &[Name], pos: Pos) {
        self.loop_depth += 1;
        self.scoped(|l| {
            for v in vars {
                // loop variables share the body's scope
                l.declare(v, pos);
            }
            l.stmts(body)
        });
        self.loop_depth -= 1;
    }

    fn place(&mut self, place: &mut Place, pos: Pos, nested: bool) {
        match place {
            Place::Var(name) => {
                if self.is_local(name) {
                    return
                }
                match Accessor::from_str(name) {
                    Ok(acc) => {
                        *place = Place::Accessor(acc);
                        let name: &'static str = acc.into();
                        if nested {
                            self.error("AH0107", pos,
                                       format!("parts of `{name}` cannot be assigned"));
                        } else if !acc.is_writable() {
                            self.error("AH0107", pos, format!("`{name}` is read-only"));
                        }
                    }
                    Err(_) => {
                        let msg = format!("assignment to undeclared variable `{name}`");
                        self.error("AH0101", pos, msg);
                    }
                }
            }
            Place::Accessor(_) => (),
            Place::Field(inner, _) => self.place(inner, pos, true),
            Place::Index(inner, idx) => {
                self.expr(idx);
                self.place(inner, pos, true);
            }
        }
    }

    // ---- expressions -------------------------------------------------

    fn expr(&mut self, e: &mut Expr) {
        let pos = e.pos;
        match &mut e.kind {
            ExprKind::Literal(_) | ExprKind::Accessor(_) => (),
            ExprKind::Var(name) => {
                if self.is_local(name) {
                    return
                }
                if let Ok(acc) = Accessor::from_str(name) {
                    e.kind = ExprKind::Accessor(acc);
                } else if self.own_classes.contains_key(name)
                    || self.libraries.class(name).is_some()
                    || builtins::is_module(name)
                {
                    let msg = format!("`{name}` is not a value; call one of its functions");
                    self.error("AH0101", pos, msg);
                } else {
                    let msg = format!("unknown name `{name}`");
                    self.error("AH0101", pos, msg);
                }
            }
            ExprKind::List(items) => {
                for item in items {
                    self.expr(item);
                }
            }
            ExprKind::Map(entries) => {
                for (_, v) in entries {
                    self.expr(v);
                }
            }
            ExprKind::Unary(_, a) => self.expr(a),
            ExprKind::Binary(_, a, b) => {
                self.expr(a);
                self.expr(b);
            }
            ExprKind::Cond(c, a, b) => {
                self.expr(c);
                self.expr(a);
                self.expr(b);
            }
            ExprKind::Field(a, _) => self.expr(a),
            ExprKind::Index(a, i) => {
                self.expr(a);
                self.expr(i);
            }
            ExprKind::Call { path, args, target } => {
                for a in args.iter_mut() {
                    self.expr(a);
                }
                match self.resolve_call(path) {
                    Ok((t, arity)) => {
                        let (min, max) = arity;
                        let n = args.len();
                        if n < min || n > max {
                            let expected = if min == max {
                                format!("{min}")
                            } else if max == usize::MAX {
                                format!("at least {min}")
                            } else {
                                format!("{min} to {max}")
                            };
                            let msg = format!("`{}` takes {expected} argument(s), {n} given",
                                              itertools::join(path.iter(), "."));
                            self.error("AH0103", pos, msg);
                        }
                        *target = t;
                    }
                    Err(msg) => self.error("AH0102", pos, msg),
                }
            }
        }
    }

    fn class_target(&self, class: &Name, func: &Name) -> CallTarget {
        match self.unit {
            Unit::Page => CallTarget::PageClass { class: class.clone(), func: func.clone() },
            Unit::Library => CallTarget::Library { class: class.clone(), func: func.clone() },
        }
    }

    fn own_function(&self, class: &Name, func: &Name) -> Option<(CallTarget, (usize, usize))> {
        let n = *self.own_classes.get(class)?.get(func)?;
        Some((self.class_target(class, func), (n, n)))
    }

    fn resolve_call(&mut self, path: &[Name]) -> Result<(CallTarget, (usize, usize)), String> {
        match path {
            [f] => {
                if self.is_local(f) {
                    return Err(format!("`{f}` is a variable, not a function"))
                }
                if let Ok(pf) = PageFn::from_str(f) {
                    return Ok((CallTarget::Page(pf), pf.arity()))
                }
                if let Some(b) = builtins::global(f) {
                    return Ok((CallTarget::Builtin(b), (b.min_args, b.max_args)))
                }
                for import in self.imports.iter_mut() {
                    if let Some(b) = builtins::module_function(&import.name, f) {
                        import.used = true;
                        return Ok((CallTarget::Builtin(b), (b.min_args, b.max_args)))
                    }
                }
                if let Some(class) = self.current_class.clone() {
                    if let Some(r) = self.own_function(&class, f) {
                        return Ok(r)
                    }
                }
                Err(format!("unknown function `{f}`"))
            }
            [a, f] => {
                if self.is_local(a) {
                    return Err(format!("`{a}` is a variable; values have no methods"))
                }
                if self.own_classes.contains_key(a) {
                    return self.own_function(a, f).ok_or_else(
                        || format!("class `{a}` has no function `{f}`"))
                }
                if let Some(class) = self.libraries.class(a) {
                    let decl = class.function(f).ok_or_else(
                        || format!("class `{a}` has no function `{f}`"))?;
                    let n = decl.params.len();
                    return Ok((CallTarget::Library { class: a.clone(), func: f.clone() }, (n, n)))
                }
                if builtins::is_module(a) {
                    let b = builtins::module_function(a, f).ok_or_else(
                        || format!("module `{a}` has no function `{f}`"))?;
                    for import in self.imports.iter_mut() {
                        if import.name == *a {
                            import.used = true;
                        }
                    }
                    return Ok((CallTarget::Builtin(b), (b.min_args, b.max_args)))
                }
                Err(format!("unknown class or module `{a}`"))
            }
            _ => Err(format!("cannot call `{}`", itertools::join(path.iter(), ".")))
        }
    }

    // ---- declarations ------------------------------------------------

    fn classes(&mut self, classes: &mut [ClassDecl]) {
        for class in classes {
            self.current_class = Some(class.name.clone());
            for f in class.functions.values_mut() {
                let f = Arc::make_mut(f);
                let saved_scopes = std::mem::take(&mut self.scopes);
                let saved_loops = std::mem::replace(&mut self.loop_depth, 0);
                self.scoped(|l| {
                    for p in &f.params {
                        l.declare(p, f.pos);
                    }
                    l.block(&mut f.body);
                });
                self.scopes = saved_scopes;
                self.loop_depth = saved_loops;
            }
            self.current_class = None;
        }
    }
}

/// Resolve all names of a page. Returns the diagnostics; the page is
/// runnable iff none of them is an error.
pub fn link_page(imports: &[Import],
                 classes: &mut [ClassDecl],
                 body: &mut Block,
                 libraries: &LibrarySet) -> Vec<Diagnostic> {
    let mut linker = Linker::new(Unit::Page, libraries, classes);
    linker.set_imports(imports);
    linker.classes(classes);
    linker.scopes.push(HashSet::new());
    linker.stmts(body);
    linker.finish()
}

/// Resolve all names of a helper library.
pub fn link_library(classes: &mut [ClassDecl], libraries: &LibrarySet) -> Vec<Diagnostic> {
    let mut linker = Linker::new(Unit::Library, libraries, classes);
    linker.classes(classes);
    linker.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kstring::KString;
    use crate::script::parser::{parse_declarations, parse_statements};
    use crate::template::unit::Severity;

    fn link(code: &str, imports: &[&str]) -> (Block, Vec<Diagnostic>) {
        let mut body: Block = parse_statements(code, Pos::START).unwrap()
            .into_iter().map(|(s, _)| s).collect();
        let imports: Vec<Import> = imports.iter()
            .map(|n| Import { name: KString::from_ref(n), pos: Pos::START })
            .collect();
        let d = link_page(&imports, &mut [], &mut body, &LibrarySet::default());
        (body, d)
    }

    fn codes(d: &[Diagnostic]) -> Vec<&'static str> {
        d.iter().map(|d| d.code).collect()
    }

    #[test]
    fn t_resolves() {
        let (body, d) = link("let x = len(Title); Write(upper(x)); Layout = \"l.ahtml\";",
                             &["text"]);
        assert_eq!(d, vec![]);
        match &body[1].kind {
            StmtKind::Expr(Expr { kind: ExprKind::Call { target, args, .. }, .. }) => {
                assert!(matches!(target, CallTarget::Page(PageFn::Write)));
                match &args[0].kind {
                    ExprKind::Call { target: CallTarget::Builtin(b), .. } =>
                        assert_eq!(b.qualified_name(), "text.upper"),
                    k => panic!("{k:?}")
                }
            }
            k => panic!("{k:?}")
        }
        assert!(matches!(body[2].kind, StmtKind::Assign(Place::Accessor(Accessor::Layout), _, _)));
    }

    #[test]
    fn t_errors() {
        assert_eq!(codes(&link("Write(y);", &[]).1), vec!["AH0101"]);
        assert_eq!(codes(&link("nope(1);", &[]).1), vec!["AH0102"]);
        assert_eq!(codes(&link("Write(1, 2);", &[]).1), vec!["AH0103"]);
        assert_eq!(codes(&link("let a; let a;", &[]).1), vec!["AH0104"]);
        assert_eq!(codes(&link("break;", &[]).1), vec!["AH0105"]);
        assert_eq!(codes(&link("", &["nosuch"]).1), vec!["AH0106"]);
        assert_eq!(codes(&link("Request = 1;", &[]).1), vec!["AH0107"]);
        assert_eq!(codes(&link("Site.x = 1;", &[]).1), vec!["AH0107"]);
        // qualified module calls need no using
        assert_eq!(codes(&link("Write(math.abs(-1));", &[]).1), Vec::<&str>::new());
    }

    #[test]
    fn t_warnings() {
        let (_, d) = link("let a = 1; if (a) { let a = 2; Write(a); }", &["html"]);
        assert_eq!(codes(&d), vec!["AH0203", "AH0201"]);
        assert!(d.iter().all(|d| d.severity == Severity::Warning));
    }

    #[test]
    fn t_loops_and_scopes() {
        let (_, d) = link("for (i, v in [1, 2]) { if (v) { continue; } Write(i); } Write(i);", &[]);
        assert_eq!(codes(&d), vec!["AH0101"]);
        let (_, d) = link("while (true) { let x = 1; break; } let x = 2;", &[]);
        assert_eq!(d, vec![]);
    }

    #[test]
    fn t_classes() {
        let mut classes = parse_declarations(
            "class Fmt { fn a(x) { return b(x) + 1; } fn b(y) { return y; } }", Pos::START)
            .unwrap();
        let mut body: Block = parse_statements("Write(Fmt.a(1)); Fmt.b();", Pos::START).unwrap()
            .into_iter().map(|(s, _)| s).collect();
        let d = link_page(&[], &mut classes, &mut body, &LibrarySet::default());
        assert_eq!(codes(&d), vec!["AH0103"]);
        let f = classes[0].function("a").unwrap();
        match &f.body[0].kind {
            StmtKind::Return(Some(Expr { kind: ExprKind::Binary(_, call, _), .. })) =>
                assert!(matches!(&call.kind,
                                 ExprKind::Call { target: CallTarget::PageClass { .. }, .. })),
            k => panic!("{k:?}")
        }
    }

    #[test]
    fn t_library_classes() {
        let mut lib_classes = parse_declarations(
            "class Util { fn twice(x) { return x * 2; } }", Pos::START).unwrap();
        assert_eq!(link_library(&mut lib_classes, &LibrarySet::default()), vec![]);
        let lib = Library {
            path: "util.ah".into(),
            classes: lib_classes.into_iter().map(|c| (c.name.clone(), Arc::new(c))).collect(),
        };
        let set = LibrarySet::new(vec![Arc::new(lib)]);
        let mut body: Block = parse_statements("Write(Util.twice(2)); Util.nope();", Pos::START)
            .unwrap().into_iter().map(|(s, _)| s).collect();
        let d = link_page(&[], &mut [], &mut body, &set);
        assert_eq!(codes(&d), vec!["AH0102"]);
    }
}
