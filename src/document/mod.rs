// Document handle types - ids and the validated document returned to callers

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A document id: an incrementing integer or a random string, depending on
/// the collection's id strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Int(u64),
    Str(String),
}

impl Id {
    /// Extract an id from a JSON value, if it has an id-compatible shape.
    pub fn from_value(value: &Value) -> Option<Id> {
        match value {
            Value::Number(n) => n.as_u64().map(Id::Int),
            Value::String(s) => Some(Id::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Id::Int(n) => Value::from(*n),
            Id::Str(s) => Value::from(s.clone()),
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Int(n) => write!(f, "{n}"),
            Id::Str(s) => write!(f, "{s}"),
        }
    }
}

/// A validated document. `data` is the full JSON object, including the
/// `id` field; `id` is the typed copy of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Id,
    pub data: Value,
}

impl Document {
    pub(crate) fn from_data(data: Value) -> crate::error::Result<Document> {
        let id = data
            .get("id")
            .and_then(Id::from_value)
            .ok_or_else(|| crate::error::ShardboxError::Typing("document has no id field".into()))?;
        Ok(Document { id, data })
    }
}
