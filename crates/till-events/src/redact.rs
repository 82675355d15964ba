//! Redaction of sensitive payload fields before they reach event history.

use serde_json::{Map, Value};

/// Placeholder stored in place of any sensitive value.
pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEYS: &[&str] = &[
    "token",
    "password",
    "secret",
    "accesstoken",
    "refreshtoken",
    "authorization",
];

/// Whether a field name is considered sensitive (case-insensitive).
pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.contains(&key.as_str())
}

/// Return a copy of `value` with every sensitive field replaced by [`REDACTED`].
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                let replaced = if is_sensitive_key(key) {
                    Value::String(REDACTED.to_string())
                } else {
                    redact(inner)
                };
                out.insert(key.clone(), replaced);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redacts_top_level_token() {
        let redacted = redact(&json!({ "token": "secret", "user": "alice" }));
        assert_eq!(redacted, json!({ "token": REDACTED, "user": "alice" }));
    }

    #[test]
    fn test_redacts_nested_and_case_insensitive() {
        let redacted = redact(&json!({
            "session": { "Token": "1|abc", "expiresAt": 10 },
            "items": [{ "password": "hunter2" }, 3]
        }));

        assert_eq!(redacted["session"]["Token"], REDACTED);
        assert_eq!(redacted["session"]["expiresAt"], 10);
        assert_eq!(redacted["items"][0]["password"], REDACTED);
        assert_eq!(redacted["items"][1], 3);
    }

    #[test]
    fn test_scalars_pass_through() {
        assert_eq!(redact(&json!("token")), json!("token"));
        assert_eq!(redact(&Value::Null), Value::Null);
    }
}
