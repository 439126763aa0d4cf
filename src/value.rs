//! Dynamic values held by scopes and produced by expressions.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::controller::ControllerHandle;
use crate::scope::ScopeId;

pub type ValueMap = BTreeMap<String, Value>;

/// Numbers below this magnitude with no fraction print as integers.
const INTEGRAL_LIMIT: f64 = 1e15;

/// How far past the end an array assignment may reach.
const MAX_ARRAY_GAP: usize = 10_000;

/// Host function callable from expressions.
pub type NativeFn = Rc<dyn Fn(&[Value]) -> Value>;

/// An outer expression exposed through an `&` binding. Invoking it evaluates
/// `expression` against `scope` with caller-supplied locals.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionHandler {
    pub expression: String,
    pub scope: ScopeId,
}

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(ValueMap),
    Handler(Rc<ExpressionHandler>),
    Controller(ControllerHandle),
    Function(NativeFn),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn function(f: impl Fn(&[Value]) -> Value + 'static) -> Self {
        Value::Function(Rc::new(f))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Handler(_) | Value::Function(_) => "function",
            Value::Array(_) | Value::Object(_) | Value::Controller(_) => "object",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric coercion used by arithmetic and comparison operators.
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::Bool(true) => 1.0,
            Value::Bool(false) | Value::Null => 0.0,
            Value::String(s) => {
                let t = s.trim();
                if t.is_empty() {
                    0.0
                } else {
                    t.parse::<f64>().unwrap_or(f64::NAN)
                }
            }
            _ => f64::NAN,
        }
    }

    /// Text used when a value is interpolated into markup. Undefined and
    /// null render as the empty string.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Undefined | Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
            Value::Handler(_) | Value::Function(_) => String::new(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }

    /// Property read with the lenient semantics expressions expect: missing
    /// members are undefined rather than errors.
    pub fn member(&self, key: &str) -> Value {
        match self {
            Value::Object(map) => map.get(key).cloned().unwrap_or_default(),
            Value::Array(items) => {
                if key == "length" {
                    return Value::Number(items.len() as f64);
                }
                key.parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or_default()
            }
            Value::String(s) if key == "length" => Value::Number(s.chars().count() as f64),
            Value::Controller(handle) => handle.binding(key),
            _ => Value::Undefined,
        }
    }

    /// Writes `value` at `path` below `self`, creating intermediate objects.
    /// Returns false when the path crosses a non-object value.
    pub fn set_path(&mut self, path: &[String], value: Value) -> bool {
        let Some((head, rest)) = path.split_first() else {
            *self = value;
            return true;
        };
        match self {
            Value::Undefined | Value::Null => {
                *self = Value::Object(ValueMap::new());
                self.set_path(path, value)
            }
            Value::Object(map) => {
                let slot = map.entry(head.clone()).or_default();
                slot.set_path(rest, value)
            }
            Value::Array(items) => match head.parse::<usize>() {
                Ok(i) if i <= items.len().saturating_add(MAX_ARRAY_GAP) => {
                    if i >= items.len() {
                        items.resize(i + 1, Value::Undefined);
                    }
                    items[i].set_path(rest, value)
                }
                Ok(_) => false,
                Err(_) => false,
            },
            Value::Controller(handle) => {
                if rest.is_empty() {
                    handle.set_binding(head, value);
                    true
                } else {
                    let mut inner = handle.binding(head);
                    let ok = inner.set_path(rest, value);
                    handle.set_binding(head, inner);
                    ok
                }
            }
            _ => false,
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let text = if n > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_string()
    } else if n.fract() == 0.0 && n.abs() < INTEGRAL_LIMIT {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Equality used for change detection: NaN equals itself so a NaN-valued
/// binding does not oscillate, and reference variants compare by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Handler(a), Value::Handler(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::Controller(a), Value::Controller(b)) => a.same(b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Array(items) => f.debug_list().entries(items).finish(),
            Value::Object(map) => f.debug_map().entries(map).finish(),
            Value::Handler(h) => write!(f, "handler({})", h.expression),
            Value::Controller(c) => write!(f, "controller({})", c.name()),
            Value::Function(_) => write!(f, "function"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Undefined | Value::Null | Value::Handler(_) | Value::Function(_) => {
                serializer.serialize_unit()
            }
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => {
                if n.is_finite() && n.fract() == 0.0 && n.abs() < INTEGRAL_LIMIT {
                    serializer.serialize_i64(*n as i64)
                } else if n.is_finite() {
                    serializer.serialize_f64(*n)
                } else {
                    serializer.serialize_unit()
                }
            }
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
            Value::Controller(handle) => {
                let bindings = handle.bindings_snapshot();
                let mut m = serializer.serialize_map(Some(bindings.len()))?;
                for (k, v) in &bindings {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nan_is_self_equal() {
        assert_eq!(Value::Number(f64::NAN), Value::Number(f64::NAN));
        assert_ne!(Value::Number(1.0), Value::Number(2.0));
    }

    #[test]
    fn test_display_string() {
        assert_eq!(Value::Number(3.0).to_display_string(), "3");
        assert_eq!(Value::Number(1.5).to_display_string(), "1.5");
        assert_eq!(Value::Undefined.to_display_string(), "");
        let obj = Value::from(serde_json::json!({"a": 1}));
        assert_eq!(obj.to_display_string(), r#"{"a":1}"#);
        let nested = Value::from(serde_json::json!({"a": 1, "b": [2, 3.5]}));
        assert_eq!(nested.to_display_string(), r#"{"a":1,"b":[2,3.5]}"#);
    }

    #[test]
    fn test_member_and_set_path() {
        let mut v = Value::Undefined;
        assert!(v.set_path(&["a".to_string(), "b".to_string()], Value::from(2)));
        assert_eq!(v.member("a").member("b"), Value::Number(2.0));
        assert!(v.member("missing").is_undefined());

        let mut s = Value::str("x");
        assert!(!s.set_path(&["a".to_string()], Value::Null));
    }

    #[test]
    fn test_set_path_far_index_is_rejected() {
        let mut list = Value::Array(vec![]);
        assert!(!list.set_path(&["1000000000000000000".to_string()], Value::from(1)));
        assert!(!list.set_path(&["1000000000000".to_string()], Value::from(1)));
        assert_eq!(list, Value::Array(vec![]));

        assert!(list.set_path(&["2".to_string()], Value::from(1)));
        assert_eq!(list.member("length"), Value::Number(3.0));
        assert!(list.member("0").is_undefined());
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::str("").is_truthy());
        assert!(Value::str("a").is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::Object(ValueMap::new()).is_truthy());
    }
}
