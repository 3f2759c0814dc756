//! Node option values.

use std::fmt;

/// A value assigned to a node option before the run.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// A string value.
    String(String),
    /// A signed integer value.
    Integer(i64),
    /// An unsigned integer value (e.g. `max-size-time` in nanoseconds).
    Unsigned(u64),
    /// A floating-point value.
    Float(f64),
    /// A boolean value.
    Bool(bool),
}

impl PropertyValue {
    /// Get as a string, converting if necessary.
    pub fn as_string(&self) -> String {
        match self {
            PropertyValue::String(s) => s.clone(),
            PropertyValue::Integer(i) => i.to_string(),
            PropertyValue::Unsigned(u) => u.to_string(),
            PropertyValue::Float(f) => f.to_string(),
            PropertyValue::Bool(b) => b.to_string(),
        }
    }

    /// Borrow the string if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Integer(i) => Some(*i),
            PropertyValue::Unsigned(u) => i64::try_from(*u).ok(),
            PropertyValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get as a u64.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropertyValue::Unsigned(u) => Some(*u),
            _ => self.as_i64().and_then(|i| u64::try_from(i).ok()),
        }
    }

    /// Try to get as a float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(f) => Some(*f),
            PropertyValue::Integer(i) => Some(*i as f64),
            PropertyValue::Unsigned(u) => Some(*u as f64),
            PropertyValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get as a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            PropertyValue::String(s) => match s.to_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            PropertyValue::Integer(i) => Some(*i != 0),
            PropertyValue::Unsigned(u) => Some(*u != 0),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::String(s) => write!(f, "\"{s}\""),
            other => f.write_str(&other.as_string()),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Integer(i)
    }
}

impl From<i32> for PropertyValue {
    fn from(i: i32) -> Self {
        PropertyValue::Integer(i64::from(i))
    }
}

impl From<u32> for PropertyValue {
    fn from(u: u32) -> Self {
        PropertyValue::Unsigned(u64::from(u))
    }
}

impl From<u64> for PropertyValue {
    fn from(u: u64) -> Self {
        PropertyValue::Unsigned(u)
    }
}

impl From<f64> for PropertyValue {
    fn from(f: f64) -> Self {
        PropertyValue::Float(f)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}
