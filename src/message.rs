//! Queue messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Reserved `values` field that carries the tenant prefix.
pub const PREFIX_KEY: &str = "prefix";

/// One unit of work on a stream.
///
/// The `id` is assigned by the backend when the message is appended; any id
/// set by the caller is overwritten.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub stream: String,
    pub values: HashMap<String, Value>,
}

impl Message {
    /// Create an empty message for `stream`.
    pub fn new(stream: impl Into<String>) -> Self {
        Message {
            id: String::new(),
            stream: stream.into(),
            values: HashMap::new(),
        }
    }

    /// Builder-style insert of a payload field.
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Tenant prefix, or an empty string when absent or not a string.
    pub fn prefix(&self) -> &str {
        self.values
            .get(PREFIX_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn set_prefix(&mut self, prefix: impl Into<String>) {
        self.values
            .insert(PREFIX_KEY.to_string(), Value::String(prefix.into()));
    }
}
