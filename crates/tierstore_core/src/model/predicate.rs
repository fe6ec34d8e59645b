//! Record filter predicates.
//!
//! # Responsibility
//! - Express fetch filters as a small expression tree.
//! - Evaluate filters against detached records.
//!
//! # Invariants
//! - Missing attributes evaluate as `Null`.
//! - Comparisons between incomparable kinds are `false`, never an error.
//! - `Matches` patterns are compiled before evaluation; invalid patterns are
//!   reported up front by `compile`.

use crate::model::record::ManagedRecord;
use crate::model::value::AttributeValue;
use regex::Regex;
use std::cmp::Ordering;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Comparison operator used by `Predicate::Compare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Text prefix match.
    BeginsWith,
    /// Text substring match.
    Contains,
    /// Whole-value regular expression match on text.
    Matches,
}

/// Filter expression evaluated per record.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    True,
    Compare {
        key: String,
        op: CompareOp,
        value: AttributeValue,
    },
    In {
        key: String,
        values: Vec<AttributeValue>,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(key: impl Into<String>, op: CompareOp, value: impl Into<AttributeValue>) -> Self {
        Self::Compare {
            key: key.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(key, CompareOp::Eq, value)
    }

    pub fn ne(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(key, CompareOp::Ne, value)
    }

    pub fn lt(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(key, CompareOp::Lt, value)
    }

    pub fn gt(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(key, CompareOp::Gt, value)
    }

    pub fn begins_with(key: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::compare(key, CompareOp::BeginsWith, AttributeValue::Text(prefix.into()))
    }

    pub fn contains(key: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::compare(key, CompareOp::Contains, AttributeValue::Text(needle.into()))
    }

    pub fn matches(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::compare(key, CompareOp::Matches, AttributeValue::Text(pattern.into()))
    }

    pub fn is_in(key: impl Into<String>, values: Vec<AttributeValue>) -> Self {
        Self::In {
            key: key.into(),
            values,
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            first => Self::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut parts) => {
                parts.push(other);
                Self::Or(parts)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Compiles regex operands so evaluation cannot fail.
    pub fn compile(&self) -> Result<CompiledPredicate<'_>, PredicateError> {
        let node = match self {
            Self::True => Node::True,
            Self::Compare {
                key,
                op: CompareOp::Matches,
                value,
            } => {
                let Some(pattern) = value.as_text() else {
                    return Err(PredicateError::NonTextPattern { key: key.clone() });
                };
                let anchored = format!("^(?:{pattern})$");
                let regex = Regex::new(&anchored).map_err(|err| PredicateError::InvalidPattern {
                    pattern: pattern.to_string(),
                    message: err.to_string(),
                })?;
                Node::Matches { key, regex }
            }
            Self::Compare { key, op, value } => Node::Compare { key, op: *op, value },
            Self::In { key, values } => Node::In { key, values },
            Self::And(parts) => Node::And(compile_all(parts)?),
            Self::Or(parts) => Node::Or(compile_all(parts)?),
            Self::Not(inner) => Node::Not(Box::new(inner.compile()?.node)),
        };
        Ok(CompiledPredicate { node })
    }
}

fn compile_all(parts: &[Predicate]) -> Result<Vec<Node<'_>>, PredicateError> {
    parts
        .iter()
        .map(|part| part.compile().map(|compiled| compiled.node))
        .collect()
}

/// Predicate with regex operands compiled; cheap to evaluate repeatedly.
#[derive(Debug)]
pub struct CompiledPredicate<'p> {
    node: Node<'p>,
}

impl CompiledPredicate<'_> {
    pub fn evaluate(&self, record: &ManagedRecord) -> bool {
        self.node.evaluate(record)
    }
}

#[derive(Debug)]
enum Node<'p> {
    True,
    Compare {
        key: &'p str,
        op: CompareOp,
        value: &'p AttributeValue,
    },
    Matches {
        key: &'p str,
        regex: Regex,
    },
    In {
        key: &'p str,
        values: &'p [AttributeValue],
    },
    And(Vec<Node<'p>>),
    Or(Vec<Node<'p>>),
    Not(Box<Node<'p>>),
}

impl Node<'_> {
    fn evaluate(&self, record: &ManagedRecord) -> bool {
        match self {
            Self::True => true,
            Self::Compare { key, op, value } => compare(record.get(key), *op, value),
            Self::Matches { key, regex } => record
                .get(key)
                .as_text()
                .is_some_and(|text| regex.is_match(text)),
            Self::In { key, values } => {
                let actual = record.get(key);
                values
                    .iter()
                    .any(|candidate| actual.compare(candidate) == Some(Ordering::Equal))
            }
            Self::And(parts) => parts.iter().all(|part| part.evaluate(record)),
            Self::Or(parts) => parts.iter().any(|part| part.evaluate(record)),
            Self::Not(inner) => !inner.evaluate(record),
        }
    }
}

fn compare(actual: &AttributeValue, op: CompareOp, expected: &AttributeValue) -> bool {
    match op {
        CompareOp::BeginsWith => match (actual.as_text(), expected.as_text()) {
            (Some(text), Some(prefix)) => text.starts_with(prefix),
            _ => false,
        },
        CompareOp::Contains => match (actual.as_text(), expected.as_text()) {
            (Some(text), Some(needle)) => text.contains(needle),
            _ => false,
        },
        // Compiled into `Node::Matches`.
        CompareOp::Matches => false,
        CompareOp::Ne => actual.compare(expected) != Some(Ordering::Equal),
        _ => {
            // Ordering comparisons against null never match.
            if !matches!(op, CompareOp::Eq) && (actual.is_null() || expected.is_null()) {
                return false;
            }
            let Some(ordering) = actual.compare(expected) else {
                return false;
            };
            match op {
                CompareOp::Eq => ordering == Ordering::Equal,
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Le => ordering != Ordering::Greater,
                CompareOp::Gt => ordering == Ordering::Greater,
                CompareOp::Ge => ordering != Ordering::Less,
                _ => false,
            }
        }
    }
}

/// Predicate compilation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredicateError {
    InvalidPattern { pattern: String, message: String },
    NonTextPattern { key: String },
}

impl Display for PredicateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPattern { pattern, message } => {
                write!(f, "invalid match pattern `{pattern}`: {message}")
            }
            Self::NonTextPattern { key } => {
                write!(f, "match pattern for `{key}` must be text")
            }
        }
    }
}

impl Error for PredicateError {}
