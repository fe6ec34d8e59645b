//! Attribute kinds and typed attribute values.
//!
//! # Responsibility
//! - Define the closed set of attribute types a schema may declare.
//! - Provide typed values with JSON coercion for schema defaults.
//!
//! # Invariants
//! - `Integer`, `Double` and `Date` compare numerically with each other.
//! - `Null` is the only value accepted by every attribute kind.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// Declared storage type of one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    Text,
    Integer,
    Double,
    Boolean,
    /// Unix epoch milliseconds.
    Date,
}

impl AttributeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Double => "double",
            Self::Boolean => "boolean",
            Self::Date => "date",
        }
    }
}

impl Display for AttributeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attribute value held by a managed record.
///
/// Serialized externally tagged (`{"text": "A"}`) so `Integer` and `Date`
/// stay distinguishable in stored payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    Null,
    Text(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    Date(i64),
}

impl AttributeValue {
    /// Returns the kind of a non-null value.
    pub fn kind(&self) -> Option<AttributeKind> {
        match self {
            Self::Null => None,
            Self::Text(_) => Some(AttributeKind::Text),
            Self::Integer(_) => Some(AttributeKind::Integer),
            Self::Double(_) => Some(AttributeKind::Double),
            Self::Boolean(_) => Some(AttributeKind::Boolean),
            Self::Date(_) => Some(AttributeKind::Date),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns whether this value may be stored in an attribute of `kind`.
    pub fn fits(&self, kind: AttributeKind) -> bool {
        match self.kind() {
            None => true,
            Some(own) => own == kind,
        }
    }

    /// Converts a JSON literal into a value of the declared `kind`.
    ///
    /// Returns `None` when the literal cannot represent that kind.
    pub fn from_json(kind: AttributeKind, value: &serde_json::Value) -> Option<Self> {
        if value.is_null() {
            return Some(Self::Null);
        }
        match kind {
            AttributeKind::Text => value.as_str().map(|text| Self::Text(text.to_string())),
            AttributeKind::Integer => value.as_i64().map(Self::Integer),
            AttributeKind::Double => value.as_f64().map(Self::Double),
            AttributeKind::Boolean => value.as_bool().map(Self::Boolean),
            AttributeKind::Date => value.as_i64().map(Self::Date),
        }
    }

    /// Converts this value for an attribute whose kind changed.
    ///
    /// Integer widens to double, anything stringifies to text; other
    /// conversions yield `None`.
    pub fn coerce_to(&self, kind: AttributeKind) -> Option<Self> {
        if self.fits(kind) {
            return Some(self.clone());
        }
        match (self, kind) {
            (Self::Integer(value), AttributeKind::Double) => Some(Self::Double(*value as f64)),
            (Self::Integer(value), AttributeKind::Date) => Some(Self::Date(*value)),
            (Self::Date(value), AttributeKind::Integer) => Some(Self::Integer(*value)),
            (_, AttributeKind::Text) => Some(Self::Text(self.to_string())),
            _ => None,
        }
    }

    /// Total-ish ordering used by comparisons and sorting.
    ///
    /// `Null` sorts before everything. Values of unrelated kinds are
    /// incomparable and yield `None`.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Null, _) => Some(Ordering::Less),
            (_, Self::Null) => Some(Ordering::Greater),
            (Self::Text(left), Self::Text(right)) => Some(left.cmp(right)),
            (Self::Boolean(left), Self::Boolean(right)) => Some(left.cmp(right)),
            (left, right) => {
                let left = left.numeric()?;
                let right = right.numeric()?;
                left.partial_cmp(&right)
            }
        }
    }

    fn numeric(&self) -> Option<f64> {
        match self {
            Self::Integer(value) | Self::Date(value) => Some(*value as f64),
            Self::Double(value) => Some(*value),
            _ => None,
        }
    }
}

impl Display for AttributeValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Text(value) => f.write_str(value),
            Self::Integer(value) | Self::Date(value) => write!(f, "{value}"),
            Self::Double(value) => write!(f, "{value}"),
            Self::Boolean(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl<T: Into<AttributeValue>> From<Option<T>> for AttributeValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
