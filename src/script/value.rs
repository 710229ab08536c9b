//! Runtime values of the page script.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Write};
use std::sync::Arc;

use kstring::KString;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Arc<Vec<Value>>),
    Map(Arc<BTreeMap<KString, Value>>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self { Value::Bool(b) }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self { Value::Int(i) }
}
impl From<f64> for Value {
    fn from(x: f64) -> Self { Value::Float(x) }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::Str(s.into()) }
}
impl From<String> for Value {
    fn from(s: String) -> Self { Value::Str(s.into()) }
}
impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self { Value::List(Arc::new(v)) }
}
impl From<BTreeMap<KString, Value>> for Value {
    fn from(m: BTreeMap<KString, Value>) -> Self { Value::Map(Arc::new(m)) }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(o: Option<T>) -> Self {
        match o {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// Build a map value from string keys.
pub fn map_value<'k>(entries: impl IntoIterator<Item = (&'k str, Value)>) -> Value {
    Value::Map(Arc::new(
        entries.into_iter().map(|(k, v)| (KString::from_ref(k), v)).collect()))
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(x) => *x != 0.,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None
        }
    }

    /// The text written by `Write` for this value.
    pub fn to_text(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            _ => self.to_string()
        }
    }

    /// Like `to_text`, but `None` for null (used for `Title` and
    /// `Layout`).
    pub fn to_opt_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            _ => Some(self.to_text())
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(x) => Some(*x),
            _ => None
        }
    }

    /// Structural equality; ints and floats compare numerically.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) =>
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y)),
            (Value::Map(a), Value::Map(b)) =>
                a.len() == b.len()
                && a.iter().zip(b.iter()).all(|((k1, v1), (k2, v2))| k1 == k2 && v1.equals(v2)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false
            }
        }
    }

    pub fn compare(&self, other: &Value) -> Result<Ordering, String> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b).ok_or_else(
                    || "comparison with NaN".to_string()),
                _ => Err(format!("cannot compare {} with {}",
                                 self.type_name(), other.type_name()))
            }
        }
    }

    pub fn add(&self, other: &Value) -> Result<Value, String> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.checked_add(*b).map(Value::Int)
                .ok_or_else(|| format!("integer overflow in {a} + {b}")),
            (Value::Str(_), _) | (_, Value::Str(_)) => {
                let mut s = self.to_text();
                s.push_str(&other.to_text());
                Ok(s.into())
            }
            (Value::List(a), Value::List(b)) => {
                let mut v = Vec::with_capacity(a.len() + b.len());
                v.extend(a.iter().cloned());
                v.extend(b.iter().cloned());
                Ok(v.into())
            }
            _ => self.float_op(other, "+", |a, b| a + b)
        }
    }

    pub fn sub(&self, other: &Value) -> Result<Value, String> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.checked_sub(*b).map(Value::Int)
                .ok_or_else(|| format!("integer overflow in {a} - {b}")),
            _ => self.float_op(other, "-", |a, b| a - b)
        }
    }

    pub fn mul(&self, other: &Value) -> Result<Value, String> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.checked_mul(*b).map(Value::Int)
                .ok_or_else(|| format!("integer overflow in {a} * {b}")),
            _ => self.float_op(other, "*", |a, b| a * b)
        }
    }

    pub fn div(&self, other: &Value) -> Result<Value, String> {
        match (self, other) {
            (Value::Int(_), Value::Int(0)) => Err("division by zero".into()),
            (Value::Int(a), Value::Int(b)) => a.checked_div(*b).map(Value::Int)
                .ok_or_else(|| format!("integer overflow in {a} / {b}")),
            _ => self.float_op(other, "/", |a, b| a / b)
        }
    }

    pub fn rem(&self, other: &Value) -> Result<Value, String> {
        match (self, other) {
            (Value::Int(_), Value::Int(0)) => Err("division by zero".into()),
            (Value::Int(a), Value::Int(b)) => a.checked_rem(*b).map(Value::Int)
                .ok_or_else(|| format!("integer overflow in {a} % {b}")),
            _ => self.float_op(other, "%", |a, b| a % b)
        }
    }

    pub fn neg(&self) -> Result<Value, String> {
        match self {
            Value::Int(i) => i.checked_neg().map(Value::Int)
                .ok_or_else(|| format!("integer overflow in -{i}")),
            Value::Float(x) => Ok(Value::Float(-x)),
            _ => Err(format!("cannot negate {}", self.type_name()))
        }
    }

    fn float_op(&self, other: &Value, op: &str, f: impl Fn(f64, f64) -> f64)
                -> Result<Value, String> {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Float(f(a, b))),
            _ => Err(format!("cannot apply `{op}` to {} and {}",
                             self.type_name(), other.type_name()))
        }
    }

    pub fn field(&self, name: &str) -> Result<Value, String> {
        match self {
            Value::Map(m) => m.get(name).cloned().ok_or_else(
                || format!("no field `{name}` in map")),
            _ => Err(format!("cannot access field `{name}` of {}", self.type_name()))
        }
    }

    pub fn index(&self, idx: &Value) -> Result<Value, String> {
        match (self, idx) {
            (Value::List(l), Value::Int(i)) => {
                let i = list_index(l.len(), *i)?;
                Ok(l[i].clone())
            }
            (Value::Str(s), Value::Int(i)) => {
                let n = s.chars().count();
                let i = list_index(n, *i)?;
                Ok(s.chars().nth(i).map(|c| Value::from(c.to_string())).unwrap_or_default())
            }
            (Value::Map(m), Value::Str(k)) => m.get(&**k).cloned().ok_or_else(
                || format!("no key {:?} in map", &**k)),
            _ => Err(format!("cannot index {} with {}", self.type_name(), idx.type_name()))
        }
    }

    /// Mutable access to a map entry (created as null if missing),
    /// copying a shared map first.
    pub fn field_mut(&mut self, name: &str) -> Result<&mut Value, String> {
        match self {
            Value::Map(m) => Ok(Arc::make_mut(m).entry(KString::from_ref(name)).or_default()),
            _ => Err(format!("cannot assign field `{name}` of {}", self.type_name()))
        }
    }

    /// Mutable access to a list element or map entry, copying shared
    /// data first.
    pub fn index_mut(&mut self, idx: &Value) -> Result<&mut Value, String> {
        let type_name = self.type_name();
        match (self, idx) {
            (Value::List(l), Value::Int(i)) => {
                let i = list_index(l.len(), *i)?;
                Ok(&mut Arc::make_mut(l)[i])
            }
            (Value::Map(m), Value::Str(k)) =>
                Ok(Arc::make_mut(m).entry(KString::from_ref(k)).or_default()),
            (_, idx) => Err(format!("cannot assign into {type_name} with {} index",
                                    idx.type_name()))
        }
    }
}

/// Negative indices count from the end.
fn list_index(len: usize, i: i64) -> Result<usize, String> {
    let j = if i < 0 { len as i64 + i } else { i };
    if j < 0 || j as usize >= len {
        Err(format!("index {i} out of range for length {len}"))
    } else {
        Ok(j as usize)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(l) => {
                f.write_char('[')?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_char(']')
            }
            Value::Map(m) => {
                f.write_char('{')?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_char('}')
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::Str(s) => serializer.serialize_str(s),
            Value::List(l) => {
                let mut seq = serializer.serialize_seq(Some(l.len()))?;
                for v in l.iter() {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
            Value::Map(m) => {
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m.iter() {
                    map.serialize_entry(k.as_str(), v)?;
                }
                map.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_text_form() {
        assert_eq!(Value::Null.to_text(), "");
        assert_eq!(Value::from("a\"b").to_text(), "a\"b");
        assert_eq!(Value::from(1.5).to_text(), "1.5");
        let l = Value::from(vec![Value::Int(1), "x".into(), Value::Null]);
        assert_eq!(l.to_text(), "[1, \"x\", ]");
        let m = map_value([("b", Value::Int(2)), ("a", Value::Bool(true))]);
        assert_eq!(m.to_text(), "{a: true, b: 2}");
    }

    #[test]
    fn t_truthiness() {
        for v in [Value::Null, false.into(), Value::Int(0), 0.0.into(), "".into(),
                  Value::from(Vec::new())] {
            assert!(!v.is_truthy(), "{v:?}");
        }
        for v in [Value::Bool(true), Value::Int(-1), "0".into(), Value::from(vec![Value::Null])] {
            assert!(v.is_truthy(), "{v:?}");
        }
    }

    #[test]
    fn t_arithmetic() {
        assert!(Value::Int(7).add(&Value::Int(5)).unwrap().equals(&Value::Int(12)));
        assert!(Value::Int(7).add(&Value::Float(0.5)).unwrap().equals(&Value::Float(7.5)));
        assert_eq!(Value::from("n=").add(&Value::Int(3)).unwrap().to_text(), "n=3");
        assert_eq!(Value::Int(i64::MAX).add(&Value::Int(1)).unwrap_err(),
                   "integer overflow in 9223372036854775807 + 1");
        assert_eq!(Value::Int(1).div(&Value::Int(0)).unwrap_err(), "division by zero");
        assert!(Value::Int(1).sub(&"a".into()).is_err());
        assert!(Value::Int(1).equals(&Value::Float(1.0)));
    }

    #[test]
    fn t_copy_on_write() {
        let a = Value::from(vec![Value::Int(1), Value::Int(2)]);
        let mut b = a.clone();
        *b.index_mut(&Value::Int(-1)).unwrap() = Value::Int(9);
        assert_eq!(a.to_text(), "[1, 2]");
        assert_eq!(b.to_text(), "[1, 9]");
        assert!(b.index(&Value::Int(2)).is_err());
    }

    #[test]
    fn t_json() {
        let m = map_value([("k", Value::from(vec![Value::Null, "s".into()]))]);
        assert_eq!(serde_json::to_string(&m).unwrap(), r#"{"k":[null,"s"]}"#);
    }
}
