//! Database model types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Parameter key carrying the capture time (ms since epoch).
pub const STAMP_TIMESTAMP_KEY: &str = "timestamp";
/// Parameter key carrying the numeric request-type code.
pub const STAMP_TYPE_KEY: &str = "type";

/// Which durable queue a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Requests captured while disconnected.
    Offline,
    /// Requests deferred until the next periodic flush.
    Periodic,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Periodic => "periodic",
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            Self::Offline => "offline_requests",
            Self::Periodic => "periodic_requests",
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request about to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDurableRecord {
    pub url: String,
    pub params: Map<String, Value>,
    pub captured_at: i64,
    pub request_type: i32,
}

impl NewDurableRecord {
    /// Build a record and stamp its parameters with capture time and type.
    ///
    /// A record that already carries a stamp (a replay being put back) keeps
    /// it, so the server still sees the original capture order.
    pub fn stamped(url: impl Into<String>, mut params: Map<String, Value>, request_type: i32, now_ms: i64) -> Self {
        let captured_at = match params.get(STAMP_TIMESTAMP_KEY).and_then(stamp_millis) {
            Some(existing) => existing,
            None => {
                params.insert(STAMP_TIMESTAMP_KEY.to_string(), Value::from(now_ms));
                now_ms
            }
        };
        if !params.contains_key(STAMP_TYPE_KEY) {
            params.insert(STAMP_TYPE_KEY.to_string(), Value::from(request_type));
        }

        Self {
            url: url.into(),
            params,
            captured_at,
            request_type,
        }
    }
}

/// Stamp values may come back as numbers or numeric strings.
fn stamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// A persisted request, as read back by a drain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableRecord {
    pub seq: i64,
    pub url: String,
    pub params: Map<String, Value>,
    pub captured_at: i64,
    pub request_type: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stamped_adds_timestamp_and_type() {
        let params = json!({ "sessionCode": "s1", "eventKey": "k" });
        let record = NewDurableRecord::stamped(
            "https://x/event/create",
            params.as_object().unwrap().clone(),
            4,
            1_700_000_000_000,
        );

        assert_eq!(record.captured_at, 1_700_000_000_000);
        assert_eq!(record.params["timestamp"], 1_700_000_000_000_i64);
        assert_eq!(record.params["type"], 4);
        let keys: Vec<&String> = record.params.keys().collect();
        assert_eq!(keys, vec!["sessionCode", "eventKey", "timestamp", "type"]);
    }

    #[test]
    fn stamped_preserves_existing_stamp() {
        let params = json!({ "sessionCode": "s1", "timestamp": 42, "type": 2 });
        let record =
            NewDurableRecord::stamped("https://x/hit/create", params.as_object().unwrap().clone(), 2, 99);

        assert_eq!(record.captured_at, 42);
        assert_eq!(record.params["timestamp"], 42);
        assert_eq!(record.params.len(), 3);
    }

    #[test]
    fn queue_kind_tables() {
        assert_eq!(QueueKind::Offline.table(), "offline_requests");
        assert_eq!(QueueKind::Periodic.table(), "periodic_requests");
        assert_eq!(QueueKind::Periodic.to_string(), "periodic");
    }
}
