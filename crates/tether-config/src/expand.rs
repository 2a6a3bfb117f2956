//! `${type:key}` placeholder expansion over strings and nested JSON values.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpandError {
    #[error("circular dependency detected during expansion of dbgconfig:{key}")]
    Circular { key: String },

    #[error("dbgconfig:{key} is not defined")]
    Undefined { key: String },

    #[error("unsupported variable `{placeholder}`")]
    UnknownType { placeholder: String },
}

/// Result of a single placeholder lookup. `Ok(None)` keeps the placeholder text as written so a
/// later pass (or the adapter) can resolve it.
pub type Lookup = Result<Option<String>, ExpandError>;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // `${key}` or `${type:key}`; the type stops at the first `:`.
        Regex::new(r"\$\{(?:([^:}]+):)?([^}]+)\}").expect("placeholder regex should compile")
    })
}

/// Replace every placeholder in `text` with what `lookup(type, key)` returns.
pub fn expand_str<F>(text: &str, lookup: &mut F) -> Result<String, ExpandError>
where
    F: FnMut(Option<&str>, &str) -> Lookup,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in placeholder_regex().captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&text[last..whole.start()]);

        let ty = caps.get(1).map(|m| m.as_str());
        let key = caps.get(2).map_or("", |m| m.as_str());
        match lookup(ty, key)? {
            Some(replacement) => out.push_str(&replacement),
            None => out.push_str(whole.as_str()),
        }
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Expand every string leaf of `value` in place. Object keys and non-string scalars are left
/// alone.
pub fn expand_value<F>(value: &mut Value, lookup: &mut F) -> Result<(), ExpandError>
where
    F: FnMut(Option<&str>, &str) -> Lookup,
{
    match value {
        Value::String(text) => {
            let expanded = expand_str(text, lookup)?;
            *text = expanded;
        }
        Value::Array(items) => {
            for item in items {
                expand_value(item, lookup)?;
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                expand_value(item, lookup)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Text substituted for a placeholder that refers to `value`.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
