//! Transport to the ingestion endpoint.

use crate::envelope::Parameters;
use crate::error::TransportError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Response from a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    /// Parsed JSON payload; the `data` object when the endpoint wraps it.
    pub body: Option<Value>,
}

impl TransportResponse {
    pub fn new(status: u16, body: Option<Value>) -> Self {
        Self { status, body }
    }

    pub fn ok() -> Self {
        Self::new(200, None)
    }
}

/// Sends one request and reports what came back.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, url: &str, params: &Parameters) -> Result<TransportResponse, TransportError>;
}

/// `reqwest` transport posting form-encoded parameters.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("curio-rs/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, url: &str, params: &Parameters) -> Result<TransportResponse, TransportError> {
        let form = form_fields(params);

        let response = self
            .client
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(classify_error)?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(classify_error)?;
        debug!(url, status, bytes = text.len(), "Ingestion endpoint responded");

        Ok(TransportResponse::new(status, parse_body(&text)))
    }
}

/// Flatten parameters into form fields. Strings are sent bare, everything
/// else as its JSON text.
pub fn form_fields(params: &Parameters) -> Vec<(String, String)> {
    params
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), rendered)
        })
        .collect()
}

/// Parse a response body, unwrapping `{"data": {...}}` envelopes.
pub fn parse_body(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(mut map)) => match map.remove("data") {
            Some(data @ Value::Object(_)) => Some(data),
            Some(other) => {
                map.insert("data".to_string(), other);
                Some(Value::Object(map))
            }
            None => Some(Value::Object(map)),
        },
        Ok(other) => Some(other),
        Err(_) => None,
    }
}

fn classify_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Http(error)
    }
}
