//! SQLite persistence for the Curio delivery core.
//!
//! This crate provides:
//! - Async SQLite executor with a dedicated thread
//! - Schema migrations
//! - Model types for the two durable queues (offline and periodic)
//! - Query helpers for append, drain and inspection
//!
//! # Architecture
//!
//! The `AsyncDatabase` uses a single dedicated thread for all SQLite operations.
//! Queries are sent through a channel and executed in FIFO order, which is
//! what serializes appends against drains.
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let records = db.call(|conn| queries::drain_records(conn, QueueKind::Offline)).await?;
//! ```
//!
//! **Important**: Only SQL operations should run inside `db.call()`.

mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::*;
