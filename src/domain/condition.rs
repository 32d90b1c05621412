//! Predicates over a JSON context.
//!
//! Keys are dotted paths (`outputs.scan.ok`) resolved through nested objects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Equals { key: String, value: Value },
    NotEquals { key: String, value: Value },
    Exists { key: String },
    Truthy { key: String },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    pub fn evaluate(&self, context: &Map<String, Value>) -> bool {
        match self {
            Condition::Equals { key, value } => lookup(context, key) == Some(value),
            Condition::NotEquals { key, value } => lookup(context, key) != Some(value),
            Condition::Exists { key } => lookup(context, key).is_some_and(|v| !v.is_null()),
            Condition::Truthy { key } => lookup(context, key).is_some_and(is_truthy),
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(context)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.evaluate(context)),
            Condition::Not { condition } => !condition.evaluate(context),
        }
    }
}

/// Resolves a dotted path inside `context`.
pub fn lookup<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = context.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}
