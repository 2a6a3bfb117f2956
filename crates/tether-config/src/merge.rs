use serde_json::Value;

/// Type-directed merge of two optional configuration values.
///
/// - a missing side yields the other side unchanged;
/// - two arrays concatenate, `a`'s elements first;
/// - two maps form a shallow union where `b`'s entries replace `a`'s;
/// - anything else (scalars, mixed kinds) resolves to `b`, even when `b` is falsy.
pub fn merge(a: Option<Value>, b: Option<Value>) -> Option<Value> {
    match (a, b) {
        (a, None) => a,
        (None, b) => b,
        (Some(Value::Array(mut a)), Some(Value::Array(b))) => {
            a.extend(b);
            Some(Value::Array(a))
        }
        (Some(Value::Object(mut a)), Some(Value::Object(b))) => {
            a.extend(b);
            Some(Value::Object(a))
        }
        (Some(_), Some(b)) => Some(b),
    }
}

/// `true` for values that carry nothing worth writing back into a configuration.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
