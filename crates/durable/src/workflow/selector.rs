//! Selection of a transaction's result from step outputs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to a step output, optionally narrowed by a JSON pointer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputRef {
    pub step_id: String,
    /// RFC 6901 pointer into the output, e.g. `/receipt/id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
}

impl OutputRef {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            pointer: None,
        }
    }

    pub fn at(step_id: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            pointer: Some(pointer.into()),
        }
    }

    fn resolve(&self, outputs: &BTreeMap<String, Value>) -> Value {
        let output = outputs.get(&self.step_id);
        match (&self.pointer, output) {
            (Some(pointer), Some(value)) => value.pointer(pointer).cloned().unwrap_or(Value::Null),
            (None, Some(value)) => value.clone(),
            (_, None) => Value::Null,
        }
    }
}

/// How the result of a transaction is derived from its step outputs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultSelector {
    /// Output of a single step
    Step { step_id: String },

    /// Object keyed by step id
    Steps { step_ids: Vec<String> },

    /// Object with named fields picked from step outputs
    Fields { fields: BTreeMap<String, OutputRef> },
}

impl ResultSelector {
    pub fn step(step_id: impl Into<String>) -> Self {
        Self::Step {
            step_id: step_id.into(),
        }
    }

    pub fn steps<I, S>(step_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Steps {
            step_ids: step_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, OutputRef)>,
        S: Into<String>,
    {
        Self::Fields {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Step ids the selector reads from
    pub fn referenced_steps(&self) -> Vec<&str> {
        match self {
            Self::Step { step_id } => vec![step_id.as_str()],
            Self::Steps { step_ids } => step_ids.iter().map(String::as_str).collect(),
            Self::Fields { fields } => fields.values().map(|r| r.step_id.as_str()).collect(),
        }
    }

    /// Build the result; `None` when a single selected step has no output
    pub fn resolve(&self, outputs: &BTreeMap<String, Value>) -> Option<Value> {
        match self {
            Self::Step { step_id } => outputs.get(step_id).cloned(),
            Self::Steps { step_ids } => Some(Value::Object(
                step_ids
                    .iter()
                    .map(|id| (id.clone(), outputs.get(id).cloned().unwrap_or(Value::Null)))
                    .collect(),
            )),
            Self::Fields { fields } => Some(Value::Object(
                fields
                    .iter()
                    .map(|(name, output)| (name.clone(), output.resolve(outputs)))
                    .collect(),
            )),
        }
    }
}

impl From<&str> for ResultSelector {
    fn from(step_id: &str) -> Self {
        Self::step(step_id)
    }
}

impl From<String> for ResultSelector {
    fn from(step_id: String) -> Self {
        Self::step(step_id)
    }
}
