//! The fixed set of functions every page can call: the globals
//! (`len`, `str`, ...) and the modules importable with `using`.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use kstring::KString;
use lazy_static::lazy_static;

use crate::time_util::now_unixtime;
use crate::url_encoding::{url_decode, url_encode};
use super::value::Value;

pub type BuiltinResult = Result<Value, String>;

#[derive(Debug)]
pub struct BuiltinFn {
    /// `None` for globals.
    pub module: Option<&'static str>,
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    pub f: fn(&[Value]) -> BuiltinResult,
}

impl BuiltinFn {
    pub fn qualified_name(&self) -> String {
        match self.module {
            Some(m) => format!("{m}.{}", self.name),
            None => self.name.to_string(),
        }
    }
}

pub const MODULES: &[&str] = &["text", "html", "math", "time", "json"];

macro_rules! builtin {
    ($module:expr, $name:expr, $min:expr, $max:expr, $f:expr) => {
        BuiltinFn { module: $module, name: $name, min_args: $min, max_args: $max, f: $f }
    }
}

pub static BUILTINS: &[BuiltinFn] = &[
    builtin!(None, "len", 1, 1, b_len),
    builtin!(None, "str", 1, 1, |a| Ok(a[0].to_text().into())),
    builtin!(None, "int", 1, 1, b_int),
    builtin!(None, "float", 1, 1, b_float),
    builtin!(None, "type", 1, 1, |a| Ok(a[0].type_name().into())),
    builtin!(None, "range", 1, 2, b_range),
    builtin!(None, "keys", 1, 1, b_keys),
    builtin!(None, "values", 1, 1, b_values),
    builtin!(None, "contains", 2, 2, b_contains),
    builtin!(None, "push", 2, 2, b_push),
    builtin!(None, "fail", 1, 1, |a| Err(a[0].to_text())),

    builtin!(Some("text"), "upper", 1, 1, |a| Ok(string(&a[0], "upper")?.to_uppercase().into())),
    builtin!(Some("text"), "lower", 1, 1, |a| Ok(string(&a[0], "lower")?.to_lowercase().into())),
    builtin!(Some("text"), "trim", 1, 1, |a| Ok(string(&a[0], "trim")?.trim().into())),
    builtin!(Some("text"), "replace", 3, 3, |a| Ok(
        string(&a[0], "replace")?.replace(string(&a[1], "replace")?,
                                          string(&a[2], "replace")?).into())),
    builtin!(Some("text"), "split", 2, 2, b_split),
    builtin!(Some("text"), "join", 2, 2, b_join),
    builtin!(Some("text"), "contains", 2, 2, |a| Ok(
        string(&a[0], "contains")?.contains(string(&a[1], "contains")?).into())),
    builtin!(Some("text"), "starts_with", 2, 2, |a| Ok(
        string(&a[0], "starts_with")?.starts_with(string(&a[1], "starts_with")?).into())),
    builtin!(Some("text"), "ends_with", 2, 2, |a| Ok(
        string(&a[0], "ends_with")?.ends_with(string(&a[1], "ends_with")?).into())),
    builtin!(Some("text"), "substr", 2, 3, b_substr),
    builtin!(Some("text"), "repeat", 2, 2, b_repeat),
    builtin!(Some("text"), "pad_left", 2, 3, b_pad_left),

    builtin!(Some("html"), "escape", 1, 1, |a| Ok(html_escape(&a[0].to_text(), false).into())),
    builtin!(Some("html"), "attr", 1, 1, |a| Ok(html_escape(&a[0].to_text(), true).into())),
    builtin!(Some("html"), "urlencode", 1, 1, |a| Ok(url_encode(&a[0].to_text()).into())),
    builtin!(Some("html"), "urldecode", 1, 1, |a| url_decode(string(&a[0], "urldecode")?)
             .map(Value::from).map_err(|e| e.to_string())),

    builtin!(Some("math"), "min", 1, usize::MAX, |a| b_extremum(a, std::cmp::Ordering::Less)),
    builtin!(Some("math"), "max", 1, usize::MAX, |a| b_extremum(a, std::cmp::Ordering::Greater)),
    builtin!(Some("math"), "abs", 1, 1, b_abs),
    builtin!(Some("math"), "floor", 1, 1, |a| b_round(&a[0], "floor", f64::floor)),
    builtin!(Some("math"), "ceil", 1, 1, |a| b_round(&a[0], "ceil", f64::ceil)),
    builtin!(Some("math"), "round", 1, 1, |a| b_round(&a[0], "round", f64::round)),

    builtin!(Some("time"), "now", 0, 0, |_| Ok(Value::Int(now_unixtime()))),
    builtin!(Some("time"), "format", 2, 2, b_time_format),

    builtin!(Some("json"), "encode", 1, 1, |a| serde_json::to_string(&a[0])
             .map(Value::from).map_err(|e| e.to_string())),
];

lazy_static! {
    /// By qualified name.
    static ref INDEX: HashMap<String, &'static BuiltinFn> =
        BUILTINS.iter().map(|b| (b.qualified_name(), b)).collect();
}

pub fn global(name: &str) -> Option<&'static BuiltinFn> {
    INDEX.get(name).copied()
}

pub fn module_function(module: &str, name: &str) -> Option<&'static BuiltinFn> {
    if !is_module(module) {
        return None
    }
    INDEX.get(&format!("{module}.{name}")).copied()
}

pub fn is_module(name: &str) -> bool {
    MODULES.contains(&name)
}

fn string<'v>(v: &'v Value, fname: &str) -> Result<&'v str, String> {
    v.as_str().ok_or_else(|| format!("{fname}: expected string, got {}", v.type_name()))
}

fn int(v: &Value, fname: &str) -> Result<i64, String> {
    v.as_int().ok_or_else(|| format!("{fname}: expected int, got {}", v.type_name()))
}

fn count(v: &Value, fname: &str) -> Result<usize, String> {
    let i = int(v, fname)?;
    usize::try_from(i).map_err(|_| format!("{fname}: negative count {i}"))
}

const MAX_GENERATED_LEN: usize = 10_000_000;

fn b_len(a: &[Value]) -> BuiltinResult {
    let n = match &a[0] {
        Value::Str(s) => s.chars().count(),
        Value::List(l) => l.len(),
        Value::Map(m) => m.len(),
        v => return Err(format!("len: {} has no length", v.type_name()))
    };
    Ok(Value::Int(n as i64))
}

fn b_int(a: &[Value]) -> BuiltinResult {
    match &a[0] {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(x) if x.is_finite() && x.abs() < 9.2e18 => Ok(Value::Int(x.trunc() as i64)),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Str(s) => s.trim().parse::<i64>().map(Value::Int)
            .map_err(|_| format!("int: cannot parse {:?}", &**s)),
        v => Err(format!("int: cannot convert {}", v.type_name()))
    }
}

fn b_float(a: &[Value]) -> BuiltinResult {
    match &a[0] {
        Value::Int(i) => Ok(Value::Float(*i as f64)),
        Value::Float(x) => Ok(Value::Float(*x)),
        Value::Str(s) => s.trim().parse::<f64>().map(Value::Float)
            .map_err(|_| format!("float: cannot parse {:?}", &**s)),
        v => Err(format!("float: cannot convert {}", v.type_name()))
    }
}

fn b_range(a: &[Value]) -> BuiltinResult {
    let (from, to) = if a.len() == 1 {
        (0, int(&a[0], "range")?)
    } else {
        (int(&a[0], "range")?, int(&a[1], "range")?)
    };
    if to.saturating_sub(from) > MAX_GENERATED_LEN as i64 {
        return Err(format!("range: {from}..{to} is too large"))
    }
    Ok((from..to).map(Value::Int).collect::<Vec<_>>().into())
}

fn b_keys(a: &[Value]) -> BuiltinResult {
    match &a[0] {
        Value::Map(m) => Ok(m.keys().map(|k| Value::from(k.as_str())).collect::<Vec<_>>().into()),
        Value::List(l) => Ok((0..l.len() as i64).map(Value::Int).collect::<Vec<_>>().into()),
        v => Err(format!("keys: expected map, got {}", v.type_name()))
    }
}

fn b_values(a: &[Value]) -> BuiltinResult {
    match &a[0] {
        Value::Map(m) => Ok(m.values().cloned().collect::<Vec<_>>().into()),
        Value::List(l) => Ok(Value::List(l.clone())),
        v => Err(format!("values: expected map, got {}", v.type_name()))
    }
}

fn b_contains(a: &[Value]) -> BuiltinResult {
    match &a[0] {
        Value::List(l) => Ok(l.iter().any(|v| v.equals(&a[1])).into()),
        Value::Map(m) => Ok(m.contains_key(string(&a[1], "contains")?).into()),
        Value::Str(s) => Ok(s.contains(&*a[1].to_text()).into()),
        v => Err(format!("contains: cannot search in {}", v.type_name()))
    }
}

fn b_push(a: &[Value]) -> BuiltinResult {
    match &a[0] {
        Value::List(l) => {
            let mut l = l.clone();
            Arc::make_mut(&mut l).push(a[1].clone());
            Ok(Value::List(l))
        }
        v => Err(format!("push: expected list, got {}", v.type_name()))
    }
}

fn b_split(a: &[Value]) -> BuiltinResult {
    let s = string(&a[0], "split")?;
    let sep = string(&a[1], "split")?;
    if sep.is_empty() {
        return Err("split: empty separator".into())
    }
    Ok(s.split(sep).map(Value::from).collect::<Vec<_>>().into())
}

fn b_join(a: &[Value]) -> BuiltinResult {
    let sep = string(&a[1], "join")?;
    match &a[0] {
        Value::List(l) => Ok(itertools::join(l.iter().map(|v| v.to_text()), sep).into()),
        v => Err(format!("join: expected list, got {}", v.type_name()))
    }
}

fn b_substr(a: &[Value]) -> BuiltinResult {
    let s = string(&a[0], "substr")?;
    let start = count(&a[1], "substr")?;
    let it = s.chars().skip(start);
    Ok(match a.get(2) {
        Some(n) => it.take(count(n, "substr")?).collect::<String>(),
        None => it.collect::<String>(),
    }.into())
}

fn b_repeat(a: &[Value]) -> BuiltinResult {
    let s = string(&a[0], "repeat")?;
    let n = count(&a[1], "repeat")?;
    if s.len().saturating_mul(n) > MAX_GENERATED_LEN {
        return Err("repeat: result too large".into())
    }
    Ok(s.repeat(n).into())
}

fn b_pad_left(a: &[Value]) -> BuiltinResult {
    let s = a[0].to_text();
    let width = count(&a[1], "pad_left")?;
    let fill = match a.get(2) {
        Some(v) => {
            let f = string(v, "pad_left")?;
            let mut cs = f.chars();
            match (cs.next(), cs.next()) {
                (Some(c), None) => c,
                _ => return Err(format!("pad_left: fill must be one character, got {f:?}"))
            }
        }
        None => ' ',
    };
    if width > MAX_GENERATED_LEN {
        return Err("pad_left: width too large".into())
    }
    let len = s.chars().count();
    let mut out = String::new();
    for _ in len..width {
        out.push(fill);
    }
    out.push_str(&s);
    Ok(out.into())
}

pub fn html_escape(s: &str, quotes: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if quotes => out.push_str("&quot;"),
            '\'' if quotes => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn b_extremum(a: &[Value], want: std::cmp::Ordering) -> BuiltinResult {
    // a single list argument is taken as the set of values
    let items: &[Value] = match a {
        [Value::List(l)] => &l[..],
        _ => a,
    };
    let mut best: Option<&Value> = None;
    for v in items {
        best = match best {
            None => Some(v),
            Some(b) => if v.compare(b)? == want { Some(v) } else { Some(b) },
        };
    }
    best.cloned().ok_or_else(|| "min/max of empty list".to_string())
}

fn b_abs(a: &[Value]) -> BuiltinResult {
    match &a[0] {
        Value::Int(i) => i.checked_abs().map(Value::Int)
            .ok_or_else(|| format!("integer overflow in abs({i})")),
        Value::Float(x) => Ok(Value::Float(x.abs())),
        v => Err(format!("abs: expected number, got {}", v.type_name()))
    }
}

fn b_round(v: &Value, fname: &str, f: fn(f64) -> f64) -> BuiltinResult {
    match v {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(x) => {
            let r = f(*x);
            if r.is_finite() && r.abs() < 9.2e18 {
                Ok(Value::Int(r as i64))
            } else {
                Err(format!("{fname}: {x} out of integer range"))
            }
        }
        v => Err(format!("{fname}: expected number, got {}", v.type_name()))
    }
}

fn b_time_format(a: &[Value]) -> BuiltinResult {
    let t = int(&a[0], "format")?;
    let pattern = string(&a[1], "format")?;
    let dt = Utc.timestamp_opt(t, 0).single()
        .ok_or_else(|| format!("format: invalid time {t}"))?;
    let mut out = String::new();
    // chrono reports bad patterns as a formatting error
    write!(out, "{}", dt.format(pattern))
        .map_err(|_| format!("format: invalid pattern {pattern:?}"))?;
    Ok(out.into())
}

/// Map value with the given string entries; used for `Request` and
/// `Site`.
pub fn string_map<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Value {
    let m: BTreeMap<KString, Value> = entries.into_iter()
        .map(|(k, v)| (KString::from_ref(k), Value::from(v)))
        .collect();
    m.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(module: Option<&str>, name: &str, args: &[Value]) -> BuiltinResult {
        let b = match module {
            Some(m) => module_function(m, name),
            None => global(name),
        }.unwrap();
        (b.f)(args)
    }

    #[test]
    fn t_lookup() {
        assert!(global("len").is_some());
        assert!(global("upper").is_none());
        assert!(module_function("text", "upper").is_some());
        assert!(module_function("nope", "upper").is_none());
        assert_eq!(module_function("json", "encode").unwrap().qualified_name(), "json.encode");
    }

    #[test]
    fn t_text() {
        assert_eq!(call(Some("text"), "upper", &["abc".into()]).unwrap().to_text(), "ABC");
        assert_eq!(call(Some("text"), "split", &["a,b".into(), ",".into()]).unwrap().to_text(),
                   "[\"a\", \"b\"]");
        assert_eq!(call(Some("text"), "join",
                        &[vec![Value::Int(1), "x".into()].into(), "-".into()]).unwrap().to_text(),
                   "1-x");
        assert_eq!(call(Some("text"), "substr", &["häll".into(), Value::Int(1), Value::Int(2)])
                   .unwrap().to_text(), "äl");
        assert_eq!(call(Some("text"), "pad_left", &[Value::Int(7), Value::Int(3), "0".into()])
                   .unwrap().to_text(), "007");
        assert!(call(Some("text"), "upper", &[Value::Int(1)]).is_err());
    }

    #[test]
    fn t_html() {
        assert_eq!(call(Some("html"), "escape", &["<a href=\"x\">&".into()]).unwrap().to_text(),
                   "&lt;a href=\"x\"&gt;&amp;");
        assert_eq!(call(Some("html"), "attr", &["\"'".into()]).unwrap().to_text(),
                   "&quot;&#39;");
        assert_eq!(call(Some("html"), "urldecode", &["a%20b".into()]).unwrap().to_text(), "a b");
    }

    #[test]
    fn t_math_and_time() {
        assert_eq!(call(Some("math"), "max", &[Value::Int(3), Value::Float(4.5), Value::Int(-1)])
                   .unwrap().to_text(), "4.5");
        assert_eq!(call(Some("math"), "min", &[vec![Value::Int(3), Value::Int(2)].into()])
                   .unwrap().to_text(), "2");
        assert_eq!(call(Some("math"), "round", &[Value::Float(2.5)]).unwrap().to_text(), "3");
        assert_eq!(call(Some("time"), "format", &[Value::Int(86400), "%Y-%m-%d".into()])
                   .unwrap().to_text(), "1970-01-02");
    }

    #[test]
    fn t_globals() {
        assert_eq!(call(None, "range", &[Value::Int(3)]).unwrap().to_text(), "[0, 1, 2]");
        assert_eq!(call(None, "int", &[" 42 ".into()]).unwrap().to_text(), "42");
        assert_eq!(call(None, "fail", &["boom".into()]).unwrap_err(), "boom");
        assert!(call(None, "range", &[Value::Int(i64::MAX)]).is_err());
    }
}
