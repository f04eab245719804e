//! Redaction of sensitive request parameters before they reach the logs.

use serde_json::{Map, Value};

/// Replacement written in place of sensitive values.
pub const REDACTED: &str = "[REDACTED]";

const DENYLIST_KEYS: [&str; 8] = [
    "apikey",
    "api_key",
    "authorization",
    "pushtoken",
    "push_token",
    "customid",
    "custom_id",
    "visitorcode",
];

/// Whether a parameter or log field name carries a secret or personal identifier.
pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    DENYLIST_KEYS.iter().any(|denied| lowered == *denied)
}

/// Copy of `params` with sensitive values replaced, key order preserved.
pub fn redact_params(params: &Map<String, Value>) -> Map<String, Value> {
    params
        .iter()
        .map(|(key, value)| {
            if is_sensitive_key(key) {
                (key.clone(), Value::String(REDACTED.to_string()))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sensitive_keys_are_case_insensitive() {
        assert!(is_sensitive_key("apiKey"));
        assert!(is_sensitive_key("PUSHTOKEN"));
        assert!(is_sensitive_key("customId"));
        assert!(!is_sensitive_key("sessionCode"));
        assert!(!is_sensitive_key("hitCode"));
    }

    #[test]
    fn redact_keeps_order_and_plain_values() {
        let params = json!({
            "sessionCode": "s-1",
            "pushToken": "tok",
            "eventKey": "k"
        });
        let redacted = redact_params(params.as_object().unwrap());

        let keys: Vec<&String> = redacted.keys().collect();
        assert_eq!(keys, vec!["sessionCode", "pushToken", "eventKey"]);
        assert_eq!(redacted["sessionCode"], "s-1");
        assert_eq!(redacted["pushToken"], REDACTED);
        assert_eq!(redacted["eventKey"], "k");
    }
}
