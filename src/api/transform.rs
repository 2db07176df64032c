use serde_json::{Map, Value};

/// Normalize wire-format field naming (capitalized-leading) to client-format
/// naming (lowercase-leading), recursively over objects and arrays.
///
/// Pure and idempotent: a second application is a no-op, array length and
/// order are preserved, and primitive leaves pass through untouched. Applied
/// unconditionally to every parsed JSON response body when enabled in the
/// client configuration.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut normalized = Map::with_capacity(map.len());
            for (key, inner) in map {
                normalized.insert(lowercase_leading(&key), normalize(inner));
            }
            Value::Object(normalized)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        leaf => leaf,
    }
}

fn lowercase_leading(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) if first.is_uppercase() => {
            first.to_lowercase().chain(chars).collect()
        }
        _ => key.to_string(),
    }
}
