//! Tree-walking evaluator. All page state is reached through the
//! `RenderContext` handed down explicitly; nothing is kept in thread
//! locals, so any number of renders can run in parallel.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::template::pagestate::PageState;
use super::ast::*;
use super::value::Value;
use super::Pos;

pub const MAX_CALL_DEPTH: usize = 256;
/// How many statements and expressions may be under evaluation at
/// once, across all active calls.
pub const MAX_NESTING: usize = 1024;
pub const DEFAULT_MAX_STEPS: u64 = 10_000_000;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeFault {
    #[error("{message} ({pos})")]
    Script { pos: Pos, message: String },
    #[error("output limit of {limit} bytes exceeded ({pos})")]
    OutputLimit { pos: Pos, limit: usize },
    #[error("step limit of {limit} exceeded ({pos})")]
    StepLimit { pos: Pos, limit: u64 },
    #[error("call depth limit of {} exceeded ({pos})", MAX_CALL_DEPTH)]
    CallDepth { pos: Pos },
    #[error("nesting limit of {} exceeded ({pos})", MAX_NESTING)]
    Nesting { pos: Pos },
    #[error("bad layout path {path:?}: {reason}")]
    BadLayoutPath { path: String, reason: String },
}

impl RuntimeFault {
    pub fn script(pos: Pos, message: impl Into<String>) -> Self {
        RuntimeFault::Script { pos, message: message.into() }
    }

    pub fn pos(&self) -> Option<Pos> {
        match self {
            RuntimeFault::Script { pos, .. }
            | RuntimeFault::OutputLimit { pos, .. }
            | RuntimeFault::StepLimit { pos, .. }
            | RuntimeFault::CallDepth { pos }
            | RuntimeFault::Nesting { pos } => Some(*pos),
            RuntimeFault::BadLayoutPath { .. } => None,
        }
    }

    /// Whether this is one of the resource ceilings rather than an
    /// error in the script.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, RuntimeFault::OutputLimit { .. } | RuntimeFault::StepLimit { .. })
    }
}

type RResult<T> = Result<T, RuntimeFault>;

/// Everything a running page can reach. One context serves all
/// layout iterations of a request, so the step budget covers the
/// whole request.
pub struct RenderContext<'r> {
    pub page: &'r mut PageState,
    pub request: Value,
    pub site: Value,
    pub libraries: Arc<LibrarySet>,
    pub max_steps: u64,
    steps: u64,
    depth: usize,
    nesting: usize,
}

impl<'r> RenderContext<'r> {
    pub fn new(page: &'r mut PageState, request: Value, site: Value,
               libraries: Arc<LibrarySet>, max_steps: u64) -> Self {
        RenderContext { page, request, site, libraries, max_steps,
                        steps: 0, depth: 0, nesting: 0 }
    }

    pub fn steps_used(&self) -> u64 {
        self.steps
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Local variables: a stack of block scopes.
struct Env {
    scopes: Vec<HashMap<Name, Value>>,
}

impl Env {
    fn new() -> Self {
        Env { scopes: vec![HashMap::new()] }
    }

    fn declare(&mut self, name: &Name, v: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.clone(), v);
        }
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.scopes.iter_mut().rev().find_map(|s| s.get_mut(name))
    }
}

enum Key {
    Field(Name),
    Index(Value),
}

/// Run the body of a linked page.
pub fn run_program(program: &Program, ctx: &mut RenderContext) -> RResult<()> {
    let mut interp = Interp { ctx, program };
    let mut env = Env::new();
    // a page-level `return` just ends this page
    interp.stmts(&mut env, &program.body)?;
    Ok(())
}

struct Interp<'c, 'r> {
    ctx: &'c mut RenderContext<'r>,
    program: &'c Program,
}

impl<'c, 'r> Interp<'c, 'r> {
    fn step(&mut self, pos: Pos) -> RResult<()> {
        self.ctx.steps += 1;
        if self.ctx.steps > self.ctx.max_steps {
            return Err(RuntimeFault::StepLimit { pos, limit: self.ctx.max_steps })
        }
        Ok(())
    }

    /// Run `f` one nesting level deeper.
    fn nested<T>(&mut self, pos: Pos, f: impl FnOnce(&mut Self) -> RResult<T>) -> RResult<T> {
        if self.ctx.nesting >= MAX_NESTING {
            return Err(RuntimeFault::Nesting { pos })
        }
        self.ctx.nesting += 1;
        let r = f(self);
        self.ctx.nesting -= 1;
        r
    }

    fn write(&mut self, bytes: &[u8], pos: Pos) -> RResult<()> {
        self.ctx.page.write(bytes).map_err(
            |e| RuntimeFault::OutputLimit { pos, limit: e.limit })
    }

    // ---- statements --------------------------------------------------

    fn block(&mut self, env: &mut Env, block: &Block) -> RResult<Flow> {
        env.scopes.push(HashMap::new());
        let r = self.stmts(env, block);
        env.scopes.pop();
        r
    }

    fn stmts(&mut self, env: &mut Env, stmts: &[Stmt]) -> RResult<Flow> {
        for stmt in stmts {
            match self.stmt(env, stmt)? {
                Flow::Normal => (),
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn stmt(&mut self, env: &mut Env, stmt: &Stmt) -> RResult<Flow> {
        self.nested(stmt.pos, |this| this.stmt_kind(env, stmt))
    }

    fn stmt_kind(&mut self, env: &mut Env, stmt: &Stmt) -> RResult<Flow> {
        let pos = stmt.pos;
        self.step(pos)?;
        match &stmt.kind {
            StmtKind::Let(name, init) => {
                let v = match init {
                    Some(e) => self.eval(env, e)?,
                    None => Value::Null,
                };
                env.declare(name, v);
            }
            StmtKind::Assign(place, op, e) => {
                let rhs = self.eval(env, e)?;
                self.assign(env, place, *op, rhs, pos)?;
            }
            StmtKind::Expr(e) => {
                self.eval(env, e)?;
            }
            StmtKind::If { cond, then, otherwise } => {
                if self.eval(env, cond)?.is_truthy() {
                    return self.block(env, then)
                } else if let Some(b) = otherwise {
                    return self.block(env, b)
                }
            }
            StmtKind::While(cond, body) => {
                while self.eval(env, cond)?.is_truthy() {
                    self.step(pos)?;
                    match self.block(env, body)? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => (),
                        r @ Flow::Return(_) => return Ok(r),
                    }
                }
            }
            StmtKind::For { key, value, iter, body } => {
                let items: Vec<(Value, Value)> = match self.eval(env, iter)? {
                    Value::List(l) => l.iter().enumerate()
                        .map(|(i, v)| (Value::Int(i as i64), v.clone()))
                        .collect(),
                    Value::Map(m) => m.iter()
                        .map(|(k, v)| (Value::from(k.as_str()), v.clone()))
                        .collect(),
                    Value::Str(s) => s.chars().enumerate()
                        .map(|(i, c)| (Value::Int(i as i64), Value::from(c.to_string())))
                        .collect(),
                    v => return Err(RuntimeFault::script(
                        iter.pos, format!("cannot iterate over {}", v.type_name())))
                };
                for (k, v) in items {
                    self.step(pos)?;
                    let mut scope = HashMap::new();
                    if let Some(key) = key {
                        scope.insert(key.clone(), k);
                    }
                    scope.insert(value.clone(), v);
                    env.scopes.push(scope);
                    let r = self.stmts(env, body);
                    env.scopes.pop();
                    match r? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => (),
                        r @ Flow::Return(_) => return Ok(r),
                    }
                }
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Return(e) => {
                let v = match e {
                    Some(e) => self.eval(env, e)?,
                    None => Value::Null,
                };
                return Ok(Flow::Return(v))
            }
            StmtKind::Block(b) => return self.block(env, b),
            StmtKind::WriteLiteral(bytes) => self.write(bytes, pos)?,
        }
        Ok(Flow::Normal)
    }

    /// Evaluate the index expressions of `place` (outermost first)
    /// and return the keys leading from its root.
    fn place_keys(&mut self, env: &mut Env, place: &Place, keys: &mut Vec<Key>) -> RResult<()> {
        match place {
            Place::Var(_) | Place::Accessor(_) => Ok(()),
            Place::Field(inner, name) => {
                self.place_keys(env, inner, keys)?;
                keys.push(Key::Field(name.clone()));
                Ok(())
            }
            Place::Index(inner, idx) => {
                self.place_keys(env, inner, keys)?;
                let i = self.eval(env, idx)?;
                keys.push(Key::Index(i));
                Ok(())
            }
        }
    }

    fn assign(&mut self, env: &mut Env, place: &Place, op: AssignOp, rhs: Value, pos: Pos)
              -> RResult<()> {
        let mut keys = Vec::new();
        self.place_keys(env, place, &mut keys)?;
        let fault = |msg: String| RuntimeFault::script(pos, msg);
        let target: &mut Value = match place.root() {
            Place::Accessor(acc) => {
                // the linker only lets through plain Title/Layout assignments
                let old = self.accessor(*acc);
                let new = combine(&old, op, rhs).map_err(fault)?;
                let text = new.to_opt_text();
                match acc {
                    Accessor::Title => self.ctx.page.title = text,
                    Accessor::Layout => self.ctx.page.layout = text,
                    Accessor::Request | Accessor::Site =>
                        return Err(fault(format!("`{}` is read-only",
                                                 <&str>::from(*acc)))),
                }
                return Ok(())
            }
            Place::Var(name) => env.get_mut(name).ok_or_else(
                || fault(format!("undefined variable `{name}`")))?,
            Place::Field(..) | Place::Index(..) => unreachable!("root() returns a leaf"),
        };
        let mut slot = target;
        for key in &keys {
            slot = match key {
                Key::Field(name) => slot.field_mut(name),
                Key::Index(i) => slot.index_mut(i),
            }.map_err(fault)?;
        }
        let new = combine(slot, op, rhs).map_err(fault)?;
        *slot = new;
        Ok(())
    }

    // ---- expressions -------------------------------------------------

    fn accessor(&self, acc: Accessor) -> Value {
        match acc {
            Accessor::Title => self.ctx.page.title.clone().into(),
            Accessor::Layout => self.ctx.page.layout.clone().into(),
            Accessor::Request => self.ctx.request.clone(),
            Accessor::Site => self.ctx.site.clone(),
        }
    }

    fn eval(&mut self, env: &mut Env, e: &Expr) -> RResult<Value> {
        self.nested(e.pos, |this| this.eval_kind(env, e))
    }

    fn eval_kind(&mut self, env: &mut Env, e: &Expr) -> RResult<Value> {
        let pos = e.pos;
        let fault = |msg: String| RuntimeFault::script(pos, msg);
        Ok(match &e.kind {
            ExprKind::Literal(v) => v.clone(),
            ExprKind::Var(name) => env.get(name).cloned().ok_or_else(
                || fault(format!("undefined variable `{name}`")))?,
            ExprKind::Accessor(acc) => self.accessor(*acc),
            ExprKind::List(items) => {
                let mut v = Vec::with_capacity(items.len());
                for item in items {
                    v.push(self.eval(env, item)?);
                }
                v.into()
            }
            ExprKind::Map(entries) => {
                let mut m = BTreeMap::new();
                for (k, item) in entries {
                    m.insert(k.clone(), self.eval(env, item)?);
                }
                m.into()
            }
            ExprKind::Unary(UnOp::Not, a) => Value::Bool(!self.eval(env, a)?.is_truthy()),
            ExprKind::Unary(UnOp::Neg, a) => self.eval(env, a)?.neg().map_err(fault)?,
            // `a || b` and `a && b` yield the deciding operand
            ExprKind::Binary(BinOp::Or, a, b) => {
                let a = self.eval(env, a)?;
                if a.is_truthy() { a } else { self.eval(env, b)? }
            }
            ExprKind::Binary(BinOp::And, a, b) => {
                let a = self.eval(env, a)?;
                if a.is_truthy() { self.eval(env, b)? } else { a }
            }
            ExprKind::Binary(op, a, b) => {
                let a = self.eval(env, a)?;
                let b = self.eval(env, b)?;
                binary(*op, &a, &b).map_err(fault)?
            }
            ExprKind::Cond(c, a, b) => {
                if self.eval(env, c)?.is_truthy() {
                    self.eval(env, a)?
                } else {
                    self.eval(env, b)?
                }
            }
            ExprKind::Field(a, name) => self.eval(env, a)?.field(name).map_err(fault)?,
            ExprKind::Index(a, i) => {
                let a = self.eval(env, a)?;
                let i = self.eval(env, i)?;
                a.index(&i).map_err(fault)?
            }
            ExprKind::Call { path, args, target } => {
                let mut argv = Vec::with_capacity(args.len());
                for a in args {
                    argv.push(self.eval(env, a)?);
                }
                self.call(path, target, argv, pos)?
            }
        })
    }

    fn call(&mut self, path: &[Name], target: &CallTarget, args: Vec<Value>, pos: Pos)
            -> RResult<Value> {
        let fault = |msg: String| RuntimeFault::script(pos, msg);
        match target {
            CallTarget::Unresolved => Err(fault(format!(
                "call to unlinked function `{}`", itertools::join(path.iter(), ".")))),
            CallTarget::Page(pf) => self.page_fn(*pf, &args, pos),
            CallTarget::Builtin(b) => (b.f)(&args).map_err(fault),
            CallTarget::PageClass { class, func } => {
                let f = self.program.classes.get(class)
                    .and_then(|c| c.function(func))
                    .cloned()
                    .ok_or_else(|| fault(format!("unknown function `{class}.{func}`")))?;
                self.call_function(&f, args, pos)
            }
            CallTarget::Library { class, func } => {
                let libraries = self.ctx.libraries.clone();
                let f = libraries.class(class)
                    .ok_or_else(|| fault(format!("helper class `{class}` is not loaded")))?
                    .function(func)
                    .cloned()
                    .ok_or_else(|| fault(format!("unknown function `{class}.{func}`")))?;
                self.call_function(&f, args, pos)
            }
        }
    }

    fn call_function(&mut self, f: &FnDecl, args: Vec<Value>, pos: Pos) -> RResult<Value> {
        if args.len() != f.params.len() {
            return Err(RuntimeFault::script(pos, format!(
                "`{}` takes {} argument(s), {} given", f.name, f.params.len(), args.len())))
        }
        if self.ctx.depth >= MAX_CALL_DEPTH {
            return Err(RuntimeFault::CallDepth { pos })
        }
        let mut env = Env::new();
        for (p, a) in f.params.iter().zip(args) {
            env.declare(p, a);
        }
        self.ctx.depth += 1;
        let r = self.block(&mut env, &f.body);
        self.ctx.depth -= 1;
        Ok(match r? {
            Flow::Return(v) => v,
            _ => Value::Null,
        })
    }

    fn page_fn(&mut self, pf: PageFn, args: &[Value], pos: Pos) -> RResult<Value> {
        let fault = |msg: String| RuntimeFault::script(pos, msg);
        match pf {
            PageFn::Write => self.write(args[0].to_text().as_bytes(), pos)?,
            PageFn::WriteLine => {
                let mut s = args.get(0).map(|v| v.to_text()).unwrap_or_default();
                s.push_str("\r\n");
                self.write(s.as_bytes(), pos)?
            }
            PageFn::Section => {
                let name = args[0].to_opt_text();
                self.ctx.page.section(name.as_deref());
            }
            PageFn::WriteSection => {
                let name = args[0].to_text();
                self.ctx.page.write_section(&name).map_err(
                    |e| RuntimeFault::OutputLimit { pos, limit: e.limit })?;
            }
            PageFn::SetStatus => {
                let code = args[0].as_int()
                    .and_then(|i| u16::try_from(i).ok())
                    .filter(|c| (100..=999).contains(c))
                    .ok_or_else(|| fault(format!("invalid status code {}", args[0])))?;
                self.ctx.page.status = Some(code);
            }
            PageFn::SetMime => self.ctx.page.mime = Some(args[0].to_text()),
            PageFn::SetHeader => {
                let name = args[0].to_text();
                let value = args[1].to_text();
                if name.is_empty() || name.contains(|c: char| c == ':' || c.is_whitespace())
                    || value.contains(|c: char| c == '\r' || c == '\n')
                {
                    return Err(fault(format!("invalid header {name:?}: {value:?}")))
                }
                self.ctx.page.headers.push((name, value));
            }
        }
        Ok(Value::Null)
    }
}

fn combine(old: &Value, op: AssignOp, rhs: Value) -> Result<Value, String> {
    match op {
        AssignOp::Set => Ok(rhs),
        AssignOp::Add => old.add(&rhs),
        AssignOp::Sub => old.sub(&rhs),
    }
}

fn binary(op: BinOp, a: &Value, b: &Value) -> Result<Value, String> {
    use std::cmp::Ordering::*;
    Ok(match op {
        BinOp::Add => a.add(b)?,
        BinOp::Sub => a.sub(b)?,
        BinOp::Mul => a.mul(b)?,
        BinOp::Div => a.div(b)?,
        BinOp::Rem => a.rem(b)?,
        BinOp::Eq => a.equals(b).into(),
        BinOp::Ne => (!a.equals(b)).into(),
        BinOp::Lt => (a.compare(b)? == Less).into(),
        BinOp::Le => (a.compare(b)? != Greater).into(),
        BinOp::Gt => (a.compare(b)? == Greater).into(),
        BinOp::Ge => (a.compare(b)? != Less).into(),
        BinOp::And | BinOp::Or => unreachable!("short-circuited in eval"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::link::link_page;
    use crate::script::parser::{parse_declarations, parse_statements};
    use crate::script::value::map_value;
    use crate::template::unit::Severity;

    fn program(code: &str, classes: &str) -> Program {
        let mut body: Block = parse_statements(code, Pos::START).unwrap()
            .into_iter().map(|(s, _)| s).collect();
        let mut classes = parse_declarations(classes, Pos::START).unwrap();
        let d = link_page(&[], &mut classes, &mut body, &LibrarySet::default());
        assert!(d.iter().all(|d| d.severity == Severity::Warning), "{d:?}");
        Program {
            name: "test".into(),
            classes: classes.into_iter().map(|c| (c.name.clone(), Arc::new(c))).collect(),
            body,
        }
    }

    fn run_with(code: &str, classes: &str, max_steps: u64) -> (PageState, RResult<()>) {
        let p = program(code, classes);
        let mut page = PageState::new(1000);
        let r = {
            let request = map_value([("path", Value::from("/x.ahtml"))]);
            let mut ctx = RenderContext::new(&mut page, request, Value::Null,
                                             Arc::new(LibrarySet::default()), max_steps);
            run_program(&p, &mut ctx)
        };
        (page, r)
    }

    fn run(code: &str) -> String {
        let (page, r) = run_with(code, "", DEFAULT_MAX_STEPS);
        r.unwrap();
        String::from_utf8(page.into_output()).unwrap()
    }

    fn fault(code: &str) -> RuntimeFault {
        run_with(code, "", DEFAULT_MAX_STEPS).1.unwrap_err()
    }

    #[test]
    fn t_basics() {
        assert_eq!(run("let x = 2; x += 3; Write(x * 2); WriteLine(); Write(Request.path)"),
                   "10\r\n/x.ahtml");
        assert_eq!(run("for (i, c in \"ab\") { Write(i); Write(c); }"), "0a1b");
        assert_eq!(run("let s = 0; for (k, v in {b: 2, a: 1}) { Write(k); s += v; } Write(s)"),
                   "ab3");
        assert_eq!(run("let i = 0; while (true) { i += 1; if (i > 3) { break; } \
                        if (i == 2) { continue; } Write(i); }"),
                   "13");
        assert_eq!(run("Write(null || \"d\"); Write(0 && 1); Write(1 < 2 ? \"y\" : \"n\")"),
                   "d0y");
    }

    #[test]
    fn t_nested_assignment() {
        assert_eq!(run("let m = {l: [1, 2]}; let n = m; m.l[1] = 5; m.k = \"v\"; \
                        Write(m); Write(n)"),
                   "{k: \"v\", l: [1, 5]}{l: [1, 2]}");
    }

    #[test]
    fn t_title_layout() {
        let (page, r) = run_with("Title = \"T\"; Title += \"!\"; Layout = \"l.ahtml\"; \
                                  Write(Title)", "", 100);
        r.unwrap();
        assert_eq!(page.title.as_deref(), Some("T!"));
        assert_eq!(page.layout.as_deref(), Some("l.ahtml"));
        assert_eq!(page.output(), b"T!");
    }

    #[test]
    fn t_page_return() {
        assert_eq!(run("Write(1); if (true) { return; } Write(2);"), "1");
    }

    #[test]
    fn t_functions() {
        let (page, r) = run_with(
            "Write(F.fact(5));", "class F { fn fact(n) { if (n <= 1) { return 1; } \
                                  return n * fact(n - 1); } }", 1000);
        r.unwrap();
        assert_eq!(page.output(), b"120");
    }

    #[test]
    fn t_faults() {
        assert_eq!(fault("Write(1 / 0);"),
                   RuntimeFault::script(Pos::new(1, 9), "division by zero"));
        assert_eq!(fault("let x = [1]; Write(x[3]);").pos(), Some(Pos::new(1, 21)));
        assert_eq!(fault("fail(\"boom\");"), RuntimeFault::script(Pos::START, "boom"));
        assert!(matches!(fault("for (x in 3) {}"), RuntimeFault::Script { .. }));
        assert!(matches!(fault("SetStatus(42);"), RuntimeFault::Script { .. }));
    }

    #[test]
    fn t_step_limit() {
        let (_, r) = run_with("while (true) {}", "", 1000);
        let e = r.unwrap_err();
        assert!(matches!(e, RuntimeFault::StepLimit { limit: 1000, .. }));
        assert!(e.is_resource_exhaustion());
    }

    #[test]
    fn t_output_limit() {
        let (page, r) = run_with("while (true) { Write(\"0123456789\"); }", "", 100_000);
        assert!(matches!(r.unwrap_err(), RuntimeFault::OutputLimit { limit: 1000, .. }));
        assert_eq!(page.output().len(), 1000);
    }

    #[test]
    fn t_call_depth() {
        // deep recursion needs more stack than the test harness gives
        let r = std::thread::Builder::new().stack_size(64 << 20).spawn(|| {
            run_with("F.f();", "class F { fn f() { f(); } }", DEFAULT_MAX_STEPS).1
        }).unwrap().join().unwrap();
        assert!(matches!(r.unwrap_err(), RuntimeFault::CallDepth { .. }));
    }

    #[test]
    fn t_nesting_across_calls() {
        // each call adds 60 levels, so the nesting limit comes before
        // the call depth limit
        let body = format!("{}f();{}", "{".repeat(60), "}".repeat(60));
        let classes = format!("class F {{ fn f() {{ {body} }} }}");
        let r = std::thread::Builder::new().stack_size(64 << 20).spawn(move || {
            run_with("F.f();", &classes, DEFAULT_MAX_STEPS).1
        }).unwrap().join().unwrap();
        assert!(matches!(r.unwrap_err(), RuntimeFault::Nesting { .. }));
    }
}
