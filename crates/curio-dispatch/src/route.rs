//! Ingestion endpoint routes and request parameter keys.

use crate::envelope::Priority;

/// Request parameter keys understood by the ingestion endpoint.
pub mod keys {
    pub const SESSION_CODE: &str = "sessionCode";
    pub const HIT_CODE: &str = "hitCode";
    pub const EVENT_CODE: &str = "eventCode";
    pub const PAGE_TITLE: &str = "pageTitle";
    pub const PATH: &str = "path";
    pub const EVENT_KEY: &str = "eventKey";
    pub const EVENT_VALUE: &str = "eventValue";
    pub const EVENT_DURATION: &str = "eventDuration";
    pub const PUSH_TOKEN: &str = "pushToken";
    pub const PUSH_ID: &str = "pushId";
    pub const CUSTOM_ID: &str = "customId";
    pub const VISITOR_CODE: &str = "visitorCode";
    pub const TRACKING_CODE: &str = "trackingCode";
    pub const API_KEY: &str = "apiKey";
    pub const SDK_VERSION: &str = "sdkVersion";
    pub use curio_database::{STAMP_TIMESTAMP_KEY as TIMESTAMP, STAMP_TYPE_KEY as TYPE};
}

/// Request-type code for destinations outside the analytics routes.
pub const UNKNOWN_REQUEST_TYPE: i32 = -1;

/// Every endpoint the engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    SessionStart,
    SessionEnd,
    ScreenStart,
    ScreenEnd,
    SendEvent,
    EndEvent,
    PushData,
    Unregister,
}

impl Route {
    pub const ALL: [Route; 8] = [
        Route::SessionStart,
        Route::SessionEnd,
        Route::ScreenStart,
        Route::ScreenEnd,
        Route::SendEvent,
        Route::EndEvent,
        Route::PushData,
        Route::Unregister,
    ];

    /// Path appended to the server base URL.
    pub fn suffix(self) -> &'static str {
        match self {
            Route::SessionStart => "/visit/create",
            Route::SessionEnd => "/visit/end",
            Route::ScreenStart => "/hit/create",
            Route::ScreenEnd => "/hit/end",
            Route::SendEvent => "/event/create",
            Route::EndEvent => "/event/end",
            Route::PushData => "/visitor/setPushData",
            Route::Unregister => "/visitor/unregister",
        }
    }

    /// Numeric code stamped on durable records.
    pub fn request_type(self) -> i32 {
        match self {
            Route::SessionStart => 0,
            Route::SessionEnd => 1,
            Route::ScreenStart => 2,
            Route::ScreenEnd => 3,
            Route::SendEvent => 4,
            Route::EndEvent => 7,
            Route::PushData | Route::Unregister => UNKNOWN_REQUEST_TYPE,
        }
    }

    pub fn priority(self) -> Priority {
        match self {
            Route::SessionStart | Route::SessionEnd => Priority::First,
            Route::ScreenStart | Route::ScreenEnd | Route::PushData | Route::Unregister => Priority::Second,
            Route::SendEvent | Route::EndEvent => Priority::Third,
        }
    }

    /// Session start/end are never folded into periodic batches.
    pub fn is_session_lifecycle(self) -> bool {
        matches!(self, Route::SessionStart | Route::SessionEnd)
    }

    /// Push routes are only ever sent live; they are never persisted.
    pub fn is_online_only(self) -> bool {
        matches!(self, Route::PushData | Route::Unregister)
    }

    /// Full destination for this route under `base`.
    pub fn url(self, base: &str) -> String {
        format!("{}{}", base.trim_end_matches('/'), self.suffix())
    }

    /// Route whose suffix ends `url`, if any.
    pub fn from_url(url: &str) -> Option<Route> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        Route::ALL
            .into_iter()
            .find(|route| path.ends_with(route.suffix()))
    }
}

/// Request-type code for an arbitrary destination.
pub fn request_type_for_url(url: &str) -> i32 {
    Route::from_url(url)
        .map(Route::request_type)
        .unwrap_or(UNKNOWN_REQUEST_TYPE)
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}
