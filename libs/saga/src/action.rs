//! Action Values
//!
//! Immutable events carried by the action bus. An action exposes a type tag
//! and a flat set of named JSON fields; the interpreter never looks past what
//! the matcher needs. Actions are shared as `Arc<Action>` once dispatched so
//! every subscriber sees the same value.

use crate::{Result, SagaError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Field name carrying the type tag in the JSON form
pub const TYPE_FIELD: &str = "type";

/// Immutable event value dispatched on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    action_type: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

/// Dispatched action shared between the bus and its subscribers
pub type SharedAction = Arc<Action>;

impl Action {
    /// Create an action with no fields
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            fields: Map::new(),
        }
    }

    /// Add a field
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        if name != TYPE_FIELD {
            self.fields.insert(name, value.into());
        }
        self
    }

    /// Build an action from a JSON object with a string `type` member
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(mut map) => match map.remove(TYPE_FIELD) {
                Some(Value::String(action_type)) => Ok(Self {
                    action_type,
                    fields: map,
                }),
                Some(other) => Err(SagaError::dispatch(format!(
                    "action type must be a string, got {}",
                    other
                ))),
                None => Err(SagaError::dispatch("action is missing a 'type' field")),
            },
            other => Err(SagaError::dispatch(format!(
                "action must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Type tag
    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// All fields except the type tag
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// JSON form, type tag included
    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert(TYPE_FIELD.to_string(), Value::String(self.action_type.clone()));
        Value::Object(map)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fields.is_empty() {
            write!(f, "{}", self.action_type)
        } else {
            write!(f, "{}{}", self.action_type, Value::Object(self.fields.clone()))
        }
    }
}
