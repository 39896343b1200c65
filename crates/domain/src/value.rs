//! Dynamically-typed parameter values.
//!
//! Item parameters, config fields and event payloads all use the closed
//! [`Value`] type. Maps are ordered (`BTreeMap`) so serialization is
//! canonical and equality is structural.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A single dynamically-typed value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Short name of the variant, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers are widened.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Deep equality used by the snapshot diff.
    ///
    /// Maps are compared through their canonical JSON serialization so that
    /// two maps built independently compare equal when their content does.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Map(_), Self::Map(_)) => {
                match (serde_json::to_string(self), serde_json::to_string(other)) {
                    (Ok(a), Ok(b)) => a == b,
                    _ => self == other,
                }
            }
            _ => self == other,
        }
    }

    /// Convert `self` into the runtime type of `template`.
    ///
    /// Strings are parsed into bools, integers and floats; numbers are
    /// widened or narrowed when lossless; anything converts into a string.
    /// Templates that carry no scalar shape (null, list, map) accept `self`
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::TypeMismatch`] when no lossless conversion
    /// exists.
    #[allow(clippy::cast_precision_loss)]
    pub fn coerce_like(&self, template: &Self) -> Result<Self, ValidationError> {
        let mismatch = |expected: &'static str| ValidationError::TypeMismatch {
            expected,
            found: self.to_string(),
        };
        match template {
            Self::Null | Self::List(_) | Self::Map(_) => Ok(self.clone()),
            Self::Bool(_) => match self {
                Self::Bool(b) => Ok(Self::Bool(*b)),
                Self::Int(0) => Ok(Self::Bool(false)),
                Self::Int(1) => Ok(Self::Bool(true)),
                Self::String(s) => parse_bool(s).map(Self::Bool).ok_or_else(|| mismatch("bool")),
                _ => Err(mismatch("bool")),
            },
            Self::Int(_) => match self {
                Self::Int(i) => Ok(Self::Int(*i)),
                Self::Float(f) => exact_int(*f).map(Self::Int).ok_or_else(|| mismatch("int")),
                Self::String(s) => {
                    let trimmed = s.trim();
                    trimmed
                        .parse::<i64>()
                        .ok()
                        .or_else(|| trimmed.parse::<f64>().ok().and_then(exact_int))
                        .map(Self::Int)
                        .ok_or_else(|| mismatch("int"))
                }
                _ => Err(mismatch("int")),
            },
            Self::Float(_) => match self {
                Self::Float(f) => Ok(Self::Float(*f)),
                Self::Int(i) => Ok(Self::Float(*i as f64)),
                Self::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Self::Float)
                    .map_err(|_| mismatch("float")),
                _ => Err(mismatch("float")),
            },
            Self::String(_) => match self {
                Self::String(s) => Ok(Self::String(s.clone())),
                Self::Null => Err(mismatch("string")),
                other => Ok(Self::String(other.to_string())),
            },
        }
    }

    /// Build a value from an arbitrary JSON document.
    #[must_use]
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render as a JSON document. Non-finite floats become `null`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "1" | "yes" => Some(true),
        "false" | "off" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Self::Map(value)
    }
}

/// `f` as an `i64` when it is a whole number inside the `i64` range.
#[allow(clippy::cast_possible_truncation)]
fn exact_int(f: f64) -> Option<i64> {
    // 2^63, exactly representable
    const BOUND: f64 = 9_223_372_036_854_775_808.0;
    (f.fract() == 0.0 && (-BOUND..BOUND).contains(&f)).then(|| f as i64)
}
