//! Dual dispatch engine for the Curio telemetry SDK.
//!
//! This crate provides:
//! - [`CurioClient`]: the façade a host application drives (sessions, screens,
//!   events, push glue, connectivity and timer hooks)
//! - An in-memory priority queue drained by a single online worker
//! - Two durable SQLite-backed queues, one for requests captured offline and
//!   one for requests deferred under periodic dispatch
//! - A connectivity-driven router between them
//! - Session recovery for unauthorized responses, with a bounded retry cap
//! - A flush coordinator for periodic batches and the two-phase session end
//!
//! # Architecture
//!
//! ```text
//! CurioClient ──▶ Router ──┬─▶ DispatchQueue ──▶ OnlineWorker ──▶ Transport
//!                          ├─▶ offline store  ─┐
//!                          └─▶ periodic store ─┴─▶ StoreWorker ──▶ replays ──▶ DispatchQueue
//! ```
//!
//! Only the online worker performs network I/O, and only the store worker
//! touches the database. Results reach the host through [`ResultListener`]s
//! invoked on the online worker task.
//!
//! ```ignore
//! let client = CurioClient::builder(config).build().await?;
//! client.mark_ready(StaticFeatures::new(api_key, tracking_code, visitor_code));
//! client.start_session();
//! client.start_screen("home", "Home", "/home");
//! ```

mod client;
mod error;

pub mod envelope;
pub mod features;
pub mod flush;
pub mod ids;
pub mod queue;
pub mod recovery;
pub mod route;
pub mod router;
pub mod session;
pub mod store;
pub mod transport;
pub mod worker;

pub use client::{CurioClient, CurioClientBuilder, EndSession};
pub use envelope::{
    AttemptResult, Classification, DeliveryStatus, Parameters, Priority, RequestEnvelope, ResultListener,
    StatusClass,
};
pub use error::{DispatchError, DispatchResult, TransportError};
pub use features::StaticFeatures;
pub use ids::{IdGenerator, UuidGenerator};
pub use queue::QueueDepth;
pub use recovery::{OperationKind, RecoveryPhase};
pub use route::Route;
pub use store::{AppendRetry, ReleaseHandle};
pub use transport::{HttpTransport, Transport, TransportResponse};

pub use curio_database::QueueKind;
