//! Dispatch error types.

use thiserror::Error;

/// Errors raised while building or driving the dispatch engine.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Durable store error
    #[error("Database error: {0}")]
    Database(#[from] curio_database::DatabaseError),

    /// Configuration or path setup error
    #[error("Configuration error: {0}")]
    Core(#[from] curio_config_and_utils::CoreError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A background task has stopped and no longer accepts work
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    /// The client was shut down
    #[error("Client has been shut down")]
    ShutDown,

    /// A background task of this kind is already running
    #[error("Already started: {0}")]
    AlreadyStarted(&'static str),
}

/// Result type alias using DispatchError.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Failure to obtain any HTTP response from the ingestion endpoint.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The device reported no connectivity before the call was attempted.
    #[error("No network connection")]
    NoNetwork,

    /// The request did not complete in time.
    #[error("Request timed out")]
    Timeout,

    /// Connection could not be established (DNS, refused, TLS).
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Any other HTTP client failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
