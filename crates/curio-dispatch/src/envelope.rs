//! Request envelopes and delivery results.

use crate::route::Route;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Request parameters. Insertion order is kept for logging and persistence.
pub type Parameters = Map<String, Value>;

/// Drain priority; lower value drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Session start and session end.
    First = 0,
    /// Screens and push traffic.
    Second = 1,
    /// Custom events.
    Third = 2,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::First, Priority::Second, Priority::Third];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Where an envelope goes, decided once when it is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Online,
    Offline,
    Periodic,
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// The endpoint answered with this HTTP status.
    Http(u16),
    /// The request was never attempted because the device is offline.
    NoNetwork,
    /// The request failed below HTTP (timeout, DNS, refused connection).
    TransportFailure(String),
    /// Push glue was called while automatic push registration is disabled.
    PushRegistrationDisabled,
}

/// Coarse class of a status, the only thing the engine branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Ok,
    Unauthorized,
    PreconditionFailed,
    Failed,
}

impl DeliveryStatus {
    pub fn class(&self) -> StatusClass {
        match self {
            DeliveryStatus::Http(200) => StatusClass::Ok,
            DeliveryStatus::Http(401) => StatusClass::Unauthorized,
            DeliveryStatus::Http(412) => StatusClass::PreconditionFailed,
            _ => StatusClass::Failed,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.class() == StatusClass::Ok
    }

    /// Failures that never reached the server.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, DeliveryStatus::NoNetwork | DeliveryStatus::TransportFailure(_))
    }

    pub fn http_code(&self) -> Option<u16> {
        match self {
            DeliveryStatus::Http(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Http(code) => write!(f, "HTTP {code}"),
            DeliveryStatus::NoNetwork => f.write_str("no network"),
            DeliveryStatus::TransportFailure(reason) => write!(f, "transport failure: {reason}"),
            DeliveryStatus::PushRegistrationDisabled => f.write_str("push registration disabled"),
        }
    }
}

/// What a result listener receives for each attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptResult {
    pub status: DeliveryStatus,
    /// Parsed response payload (the `data` object when the endpoint wraps it).
    pub body: Option<Value>,
    /// The engine is about to replay this operation after re-authorizing.
    pub will_retry: bool,
}

impl AttemptResult {
    pub fn new(status: DeliveryStatus, body: Option<Value>) -> Self {
        Self {
            status,
            body,
            will_retry: false,
        }
    }

    /// String field from the response body.
    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body.as_ref()?.get(key)?.as_str()
    }
}

/// Result sink for online envelopes.
///
/// Invoked on the dispatch worker task, once per attempt.
pub trait ResultListener: Send + Sync {
    fn on_result(&self, result: &AttemptResult);
}

impl<F> ResultListener for F
where
    F: Fn(&AttemptResult) + Send + Sync,
{
    fn on_result(&self, result: &AttemptResult) {
        self(result)
    }
}

/// One outbound request plus its routing metadata. Immutable once built.
#[derive(Clone)]
pub struct RequestEnvelope {
    destination: String,
    route: Option<Route>,
    parameters: Parameters,
    priority: Priority,
    classification: Classification,
    callback: Option<Arc<dyn ResultListener>>,
}

impl RequestEnvelope {
    /// Envelope for `route` under `base_url`, priority taken from the route.
    ///
    /// Durable envelopes never carry a callback: it is dropped here.
    pub fn new(
        base_url: &str,
        route: Route,
        parameters: Parameters,
        classification: Classification,
        callback: Option<Arc<dyn ResultListener>>,
    ) -> Self {
        Self::for_destination(
            route.url(base_url),
            parameters,
            route.priority(),
            classification,
            callback,
        )
    }

    /// Envelope for an arbitrary destination (durable replays).
    pub fn for_destination(
        destination: String,
        parameters: Parameters,
        priority: Priority,
        classification: Classification,
        callback: Option<Arc<dyn ResultListener>>,
    ) -> Self {
        let callback = match classification {
            Classification::Online => callback,
            Classification::Offline | Classification::Periodic => None,
        };
        Self {
            route: Route::from_url(&destination),
            destination,
            parameters,
            priority,
            classification,
            callback,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn route(&self) -> Option<Route> {
        self.route
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn callback(&self) -> Option<&Arc<dyn ResultListener>> {
        self.callback.as_ref()
    }

    pub fn is_session_lifecycle(&self) -> bool {
        self.route.is_some_and(Route::is_session_lifecycle)
    }

    pub(crate) fn into_parts(self) -> (String, Parameters, Option<Arc<dyn ResultListener>>) {
        (self.destination, self.parameters, self.callback)
    }
}

impl fmt::Debug for RequestEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestEnvelope")
            .field("destination", &self.destination)
            .field("parameters", &curio_observability::redact_params(&self.parameters))
            .field("priority", &self.priority)
            .field("classification", &self.classification)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
