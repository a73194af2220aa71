//! The value model flowing along graph edges.
//!
//! Every value a function emits, and every assembled input struct the engine
//! sends, is a [`Value`]. The engine never interprets values; it only stores
//! the latest one per function, compares consecutive emissions for equality
//! (duplicates are dropped), and copies them into downstream input structs
//! under the field names the connecting edges declare.
//!
//! Comparison follows the engine's convention: [`Value::cmp`] returns
//! `Ok(())` when two values are structurally equal and an error describing
//! the first mismatch otherwise. Callers that only care about equality use
//! `v.cmp(&w).is_ok()`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors produced by value comparison.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// The two values have different kinds.
    #[error("kind mismatch: {lhs} vs {rhs}")]
    KindMismatch {
        /// Kind of the left-hand value.
        lhs: Kind,
        /// Kind of the right-hand value.
        rhs: Kind,
    },

    /// Same kind, different content.
    #[error("values differ: {lhs} vs {rhs}")]
    NotEqual {
        /// Rendered left-hand value.
        lhs: String,
        /// Rendered right-hand value.
        rhs: String,
    },
}

/// The kind of a [`Value`].
///
/// Kinds are deliberately coarse: element and field types are not tracked
/// here. The engine validates input *field names* against signatures at
/// assembly time; full type checking belongs to whatever front-end builds
/// the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Bool,
    Int,
    Float,
    Str,
    List,
    Struct,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Bool => "bool",
            Kind::Int => "int",
            Kind::Float => "float",
            Kind::Str => "str",
            Kind::List => "list",
            Kind::Struct => "struct",
        };
        write!(f, "{s}")
    }
}

/// A concrete value.
///
/// There is intentionally no null variant: a function that has nothing to
/// emit simply does not send, so "nil on the output channel" cannot be
/// expressed at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    /// Convenience constructor for string values.
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// The kind of this value.
    pub fn kind(&self) -> Kind {
        match self {
            Value::Bool(_) => Kind::Bool,
            Value::Int(_) => Kind::Int,
            Value::Float(_) => Kind::Float,
            Value::Str(_) => Kind::Str,
            Value::List(_) => Kind::List,
            Value::Struct(_) => Kind::Struct,
        }
    }

    /// Structural comparison: `Ok(())` if equal, an error describing the
    /// mismatch otherwise.
    pub fn cmp(&self, other: &Value) -> Result<(), ValueError> {
        if self.kind() != other.kind() {
            return Err(ValueError::KindMismatch {
                lhs: self.kind(),
                rhs: other.kind(),
            });
        }
        if self == other {
            Ok(())
        } else {
            Err(ValueError::NotEqual {
                lhs: self.to_string(),
                rhs: other.to_string(),
            })
        }
    }

    /// The fields of a struct value, or `None` for any other kind.
    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Struct(fields) => Some(fields),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            // Strings render bare so a constant "hello" reads as hello.
            Value::Str(s) => write!(f, "{s}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Struct(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
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

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}
