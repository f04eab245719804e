//! Static request values supplied once by the host's feature loader.

use crate::envelope::Parameters;
use crate::route::keys;
use serde_json::Value;

/// Values merged into every request at send time.
///
/// Durable records never contain these; they are attached by the online
/// worker just before the transport call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticFeatures {
    pub api_key: String,
    pub tracking_code: String,
    pub visitor_code: String,
    pub sdk_version: String,
    /// Device fields collected by the host (screen size, carrier, ...).
    pub extra: Parameters,
}

impl StaticFeatures {
    pub fn new(api_key: impl Into<String>, tracking_code: impl Into<String>, visitor_code: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            tracking_code: tracking_code.into(),
            visitor_code: visitor_code.into(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            extra: Parameters::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Request parameters followed by every static value the request does not
    /// already set.
    pub fn merge_into(&self, params: &Parameters) -> Parameters {
        let mut merged = params.clone();
        let fixed = [
            (keys::API_KEY, &self.api_key),
            (keys::TRACKING_CODE, &self.tracking_code),
            (keys::VISITOR_CODE, &self.visitor_code),
            (keys::SDK_VERSION, &self.sdk_version),
        ];
        for (key, value) in fixed {
            if !value.is_empty() && !merged.contains_key(key) {
                merged.insert(key.to_string(), Value::from(value.as_str()));
            }
        }
        for (key, value) in &self.extra {
            if !merged.contains_key(key) {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}
