//! The closed value vocabulary contexts and selectors range over.
//!
//! Context assignments, selector constants and concrete property values all
//! use `Value`. The set is deliberately closed: rule resolution only ever
//! compares, hashes and unions values, so an open `Any`-style type would buy
//! nothing but trait-object overhead on the hot match path.
//!
//! Strings are `Arc<str>` so that cloning an assignment, a selector constant
//! or a cached activation record never copies character data.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::FxHasher;
use itertools::Itertools;

/// A context or property value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    /// Absent / explicit null assignment
    Nil,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    /// Ordered list; used for multi-value assignments (`Context::merge`)
    /// and list-union property values
    List(Vec<Value>),
}

impl Value {
    /// Stable structural hash, independent of collection iteration order.
    pub fn value_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }

    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Value::List(_))
    }

    /// View this value as a list of scalar elements. Scalars view as a
    /// single-element slice; `Nil` as empty.
    pub fn elements(&self) -> &[Value] {
        match self {
            Value::List(items) => items,
            Value::Nil => &[],
            _ => std::slice::from_ref(self),
        }
    }

    /// Union `self` and `other` as a deduplicated list, first-seen order
    /// preserved. Scalars are treated as single-element lists.
    pub fn list_union(&self, other: &Value) -> Value {
        let mut out: Vec<Value> = self
            .elements()
            .iter()
            .chain(other.elements())
            .unique()
            .cloned()
            .collect();
        if out.len() == 1 {
            out.pop().unwrap()
        } else {
            Value::List(out)
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Arc::from(s.as_str()))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}
