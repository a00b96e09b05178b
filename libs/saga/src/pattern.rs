//! Action Patterns and Matcher
//!
//! Closed set of pattern primitives and combinators evaluated by a single
//! [`matches`] dispatcher. Matching is pure and total: an action of
//! unrelated shape simply fails the pattern, and a panicking predicate
//! counts as a non-match.
//!
//! ```text
//! Pattern ::= Any | ByType(tag) | ByField(name, kind) | FieldEquals(name, value)
//!           | ByPredicate(fn) | AnyOf([Pattern]) | AllOf([Pattern])
//! ```

use crate::action::Action;
use crate::{Result, SagaError};
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Wildcard tag accepted by `From<&str>`
pub const WILDCARD: &str = "*";

/// Predicate over actions
pub type ActionPredicate = Arc<dyn Fn(&Action) -> bool + Send + Sync>;

/// Kind of JSON value a field must hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Present with any value
    Any,
    Null,
    Bool,
    Number,
    /// Number representable as i64 or u64
    Integer,
    String,
    Array,
    Object,
}

impl ValueKind {
    /// Check whether a value is of this kind
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ValueKind::Any => true,
            ValueKind::Null => value.is_null(),
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Number => value.is_number(),
            ValueKind::Integer => value.is_i64() || value.is_u64(),
            ValueKind::String => value.is_string(),
            ValueKind::Array => value.is_array(),
            ValueKind::Object => value.is_object(),
        }
    }

    /// Kind of a concrete value (never `Any` or `Integer`)
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }
}

/// Predicate over actions built from primitives and combinators
#[derive(Clone)]
pub enum Pattern {
    /// Matches every action
    Any,
    /// Matches actions with the given type tag
    ByType(String),
    /// Matches actions exposing a field of the given kind
    ByField { name: String, kind: ValueKind },
    /// Matches actions whose field equals the given value
    FieldEquals { name: String, value: Value },
    /// Matches actions accepted by an arbitrary predicate
    ByPredicate(ActionPredicate),
    /// Matches if any member matches; short-circuits on first match
    AnyOf(Vec<Pattern>),
    /// Matches if all members match; short-circuits on first non-match
    AllOf(Vec<Pattern>),
}

impl Pattern {
    pub fn any() -> Self {
        Pattern::Any
    }

    pub fn by_type(tag: impl Into<String>) -> Self {
        Pattern::ByType(tag.into())
    }

    pub fn by_field(name: impl Into<String>, kind: ValueKind) -> Self {
        Pattern::ByField {
            name: name.into(),
            kind,
        }
    }

    pub fn field_equals(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Pattern::FieldEquals {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Action) -> bool + Send + Sync + 'static,
    {
        Pattern::ByPredicate(Arc::new(f))
    }

    pub fn any_of(patterns: impl IntoIterator<Item = Pattern>) -> Self {
        Pattern::AnyOf(patterns.into_iter().collect())
    }

    pub fn all_of(patterns: impl IntoIterator<Item = Pattern>) -> Self {
        Pattern::AllOf(patterns.into_iter().collect())
    }

    /// Combine with another pattern, matching either
    pub fn or(self, other: Pattern) -> Self {
        match self {
            Pattern::AnyOf(mut members) => {
                members.push(other);
                Pattern::AnyOf(members)
            }
            this => Pattern::AnyOf(vec![this, other]),
        }
    }

    /// Combine with another pattern, matching both
    pub fn and(self, other: Pattern) -> Self {
        match self {
            Pattern::AllOf(mut members) => {
                members.push(other);
                Pattern::AllOf(members)
            }
            this => Pattern::AllOf(vec![this, other]),
        }
    }

    /// Evaluate against an action
    pub fn matches(&self, action: &Action) -> bool {
        matches(self, action)
    }

    /// Reject malformed patterns
    ///
    /// Empty tags, empty field names and empty combinators are malformed:
    /// they can never express an intended match.
    pub fn validate(&self) -> Result<()> {
        match self {
            Pattern::Any | Pattern::ByPredicate(_) => Ok(()),
            Pattern::ByType(tag) if tag.trim().is_empty() => {
                Err(SagaError::pattern("type tag cannot be empty"))
            }
            Pattern::ByType(_) => Ok(()),
            Pattern::ByField { name, .. } | Pattern::FieldEquals { name, .. }
                if name.trim().is_empty() =>
            {
                Err(SagaError::pattern("field name cannot be empty"))
            }
            Pattern::ByField { .. } | Pattern::FieldEquals { .. } => Ok(()),
            Pattern::AnyOf(members) | Pattern::AllOf(members) => {
                if members.is_empty() {
                    return Err(SagaError::pattern(format!(
                        "{} requires at least one pattern",
                        self.combinator_name()
                    )));
                }
                members.iter().try_for_each(Pattern::validate)
            }
        }
    }

    /// Type tag every matching action must carry, if the pattern pins one
    ///
    /// Used by the take registry to index registrations by type.
    pub fn type_key(&self) -> Option<&str> {
        match self {
            Pattern::ByType(tag) => Some(tag.as_str()),
            Pattern::AllOf(members) => members.iter().find_map(Pattern::type_key),
            _ => None,
        }
    }

    /// Number of nodes in the pattern tree
    pub fn size(&self) -> usize {
        match self {
            Pattern::AnyOf(members) | Pattern::AllOf(members) => {
                1 + members.iter().map(Pattern::size).sum::<usize>()
            }
            _ => 1,
        }
    }

    fn combinator_name(&self) -> &'static str {
        match self {
            Pattern::AnyOf(_) => "AnyOf",
            Pattern::AllOf(_) => "AllOf",
            _ => "pattern",
        }
    }
}

/// Evaluate a pattern against an action
pub fn matches(pattern: &Pattern, action: &Action) -> bool {
    match pattern {
        Pattern::Any => true,
        Pattern::ByType(tag) => action.action_type() == tag,
        Pattern::ByField { name, kind } => action
            .field(name)
            .map(|value| kind.accepts(value))
            .unwrap_or(false),
        Pattern::FieldEquals { name, value } => action.field(name) == Some(value),
        Pattern::ByPredicate(predicate) => {
            match catch_unwind(AssertUnwindSafe(|| predicate(action))) {
                Ok(matched) => matched,
                Err(_) => {
                    warn!(
                        action_type = action.action_type(),
                        "Pattern predicate panicked; treating as non-match"
                    );
                    false
                }
            }
        }
        Pattern::AnyOf(members) => members.iter().any(|p| matches(p, action)),
        Pattern::AllOf(members) => members.iter().all(|p| matches(p, action)),
    }
}

impl From<&str> for Pattern {
    fn from(tag: &str) -> Self {
        if tag == WILDCARD {
            Pattern::Any
        } else {
            Pattern::ByType(tag.to_string())
        }
    }
}

impl From<String> for Pattern {
    fn from(tag: String) -> Self {
        Pattern::from(tag.as_str())
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => write!(f, "Any"),
            Pattern::ByType(tag) => f.debug_tuple("ByType").field(tag).finish(),
            Pattern::ByField { name, kind } => f
                .debug_struct("ByField")
                .field("name", name)
                .field("kind", kind)
                .finish(),
            Pattern::FieldEquals { name, value } => f
                .debug_struct("FieldEquals")
                .field("name", name)
                .field("value", value)
                .finish(),
            Pattern::ByPredicate(_) => write!(f, "ByPredicate(<fn>)"),
            Pattern::AnyOf(members) => f.debug_tuple("AnyOf").field(members).finish(),
            Pattern::AllOf(members) => f.debug_tuple("AllOf").field(members).finish(),
        }
    }
}
