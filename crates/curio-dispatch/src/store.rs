//! Durable offline and periodic stores, and the task that owns them.
//!
//! ```text
//!  façade / router ──StoreCommand──▶ StoreWorker ──▶ SQLite (offline_requests, periodic_requests)
//!                                        │
//!                                        └── drained records ──▶ ReplaySink ──▶ online queue
//! ```
//!
//! Every read and write goes through one task, so appends and drains are
//! serialized against each other. Callers never wait on disk I/O unless they
//! ask to (see [`StoreHandle::sync`]).

use crate::envelope::RequestEnvelope;
use crate::error::{DispatchError, DispatchResult};
use crate::route::request_type_for_url;
use curio_database::{queries, AsyncDatabase, DurableRecord, NewDurableRecord, QueueKind};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Retry policy for appends that fail at the storage layer.
#[derive(Debug, Clone)]
pub struct AppendRetry {
    /// Attempts before the record is dropped.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for AppendRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_secs(1),
        }
    }
}

/// `base * 2^(attempt - 1)`, capped at `max`; zero for attempt 0.
pub fn compute_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let multiplier = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
}

// ==========================================
// DurableStore
// ==========================================

/// One persisted FIFO queue.
#[derive(Clone)]
pub struct DurableStore {
    db: AsyncDatabase,
    kind: QueueKind,
}

impl DurableStore {
    pub fn new(db: AsyncDatabase, kind: QueueKind) -> Self {
        Self { db, kind }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Stamp and persist an envelope. Durable once this returns.
    pub async fn append(&self, envelope: &RequestEnvelope) -> DispatchResult<i64> {
        let record = stamp_envelope(envelope, now_millis());
        self.append_record(record).await
    }

    /// Persist an already stamped record.
    pub async fn append_record(&self, record: NewDurableRecord) -> DispatchResult<i64> {
        let kind = self.kind;
        Ok(self
            .db
            .call(move |conn| queries::append_record(conn, kind, &record))
            .await?)
    }

    /// Remove and return every record, oldest first.
    pub async fn drain_all(&self) -> DispatchResult<Vec<DurableRecord>> {
        let kind = self.kind;
        Ok(self.db.call(move |conn| queries::drain_records(conn, kind)).await?)
    }

    /// Every record, oldest first, left in place.
    pub async fn peek_all(&self) -> DispatchResult<Vec<DurableRecord>> {
        let kind = self.kind;
        Ok(self.db.call(move |conn| queries::list_records(conn, kind)).await?)
    }

    pub async fn clear(&self) -> DispatchResult<usize> {
        let kind = self.kind;
        Ok(self.db.call(move |conn| queries::clear_records(conn, kind)).await?)
    }

    pub async fn len(&self) -> DispatchResult<i64> {
        let kind = self.kind;
        Ok(self.db.call(move |conn| queries::count_records(conn, kind)).await?)
    }

    pub async fn is_empty(&self) -> DispatchResult<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Build the persisted form of an envelope, stamped with capture time and type.
pub fn stamp_envelope(envelope: &RequestEnvelope, now_ms: i64) -> NewDurableRecord {
    NewDurableRecord::stamped(
        envelope.destination(),
        envelope.parameters().clone(),
        request_type_for_url(envelope.destination()),
        now_ms,
    )
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ==========================================
// Release tracking
// ==========================================

/// Completes once every record of a periodic release has had one attempt.
pub struct ReleaseTracker {
    remaining: AtomicUsize,
    total: usize,
    done: Mutex<Option<oneshot::Sender<usize>>>,
}

impl ReleaseTracker {
    fn new(total: usize, done: oneshot::Sender<usize>) -> Arc<Self> {
        let tracker = Arc::new(Self {
            remaining: AtomicUsize::new(total),
            total,
            done: Mutex::new(Some(done)),
        });
        if total == 0 {
            tracker.finish();
        }
        tracker
    }

    fn finish(&self) {
        if let Some(done) = self.done.lock().take() {
            let _ = done.send(self.total);
        }
    }

    fn ticket_finished(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }
}

/// One released record's share of a [`ReleaseTracker`].
///
/// Counted when completed or when dropped, so an envelope discarded at
/// shutdown cannot stall the release.
pub struct ReleaseTicket {
    tracker: Option<Arc<ReleaseTracker>>,
}

impl ReleaseTicket {
    pub fn complete(mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.ticket_finished();
        }
    }
}

impl Drop for ReleaseTicket {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.ticket_finished();
        }
    }
}

/// Awaitable end of a periodic release.
pub struct ReleaseHandle {
    done: oneshot::Receiver<usize>,
}

impl ReleaseHandle {
    /// Resolves with the number of released records once each has been
    /// attempted once.
    pub async fn released(self) -> usize {
        self.done.await.unwrap_or(0)
    }
}

impl std::fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseHandle").finish_non_exhaustive()
    }
}

// ==========================================
// Store worker
// ==========================================

/// Receives drained records and turns them into online traffic.
pub trait ReplaySink: Send + Sync {
    fn replay(&self, from: QueueKind, record: DurableRecord, ticket: Option<ReleaseTicket>);
}

enum StoreCommand {
    Append {
        kind: QueueKind,
        record: NewDurableRecord,
    },
    Drain {
        kind: QueueKind,
        done: Option<oneshot::Sender<usize>>,
    },
    Release {
        done: oneshot::Sender<usize>,
    },
    Sync {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable front end of the store worker.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<StoreCommand>,
}

impl StoreHandle {
    /// Queue `envelope` for persistence in `kind`, stamped now.
    pub fn append(&self, kind: QueueKind, envelope: &RequestEnvelope) {
        self.append_record(kind, stamp_envelope(envelope, now_millis()));
    }

    /// Queue an already stamped record; its stamp is kept.
    pub fn append_record(&self, kind: QueueKind, record: NewDurableRecord) {
        if self.tx.send(StoreCommand::Append { kind, record }).is_err() {
            warn!(queue = %kind, "Store worker stopped, record dropped");
        }
    }

    /// Drain `kind` into the replay sink without waiting.
    pub fn drain(&self, kind: QueueKind) {
        if self.tx.send(StoreCommand::Drain { kind, done: None }).is_err() {
            warn!(queue = %kind, "Store worker stopped, drain skipped");
        }
    }

    /// Drain `kind` and wait until the records were handed to the sink.
    pub async fn drain_now(&self, kind: QueueKind) -> DispatchResult<usize> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Drain { kind, done: Some(done) })
            .map_err(|_| DispatchError::ChannelClosed("store worker"))?;
        rx.await.map_err(|_| DispatchError::ChannelClosed("store worker"))
    }

    /// Move every periodic record into the online queue.
    pub fn release_periodic(&self) -> ReleaseHandle {
        let (done, rx) = oneshot::channel();
        if self.tx.send(StoreCommand::Release { done }).is_err() {
            warn!("Store worker stopped, periodic release skipped");
        }
        ReleaseHandle { done: rx }
    }

    /// Wait until every command sent before this call has been applied.
    pub async fn sync(&self) -> DispatchResult<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Sync { done })
            .map_err(|_| DispatchError::ChannelClosed("store worker"))?;
        rx.await.map_err(|_| DispatchError::ChannelClosed("store worker"))
    }
}

/// Owns both durable stores and applies [`StoreCommand`]s in order.
pub struct StoreWorker {
    offline: DurableStore,
    periodic: DurableStore,
    retry: AppendRetry,
    rx: mpsc::UnboundedReceiver<StoreCommand>,
    sink: Arc<dyn ReplaySink>,
}

impl StoreWorker {
    /// Build the worker and the handle used to feed it.
    pub fn new(db: AsyncDatabase, retry: AppendRetry, sink: Arc<dyn ReplaySink>) -> (Self, StoreHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Self {
            offline: DurableStore::new(db.clone(), QueueKind::Offline),
            periodic: DurableStore::new(db, QueueKind::Periodic),
            retry,
            rx,
            sink,
        };
        (worker, StoreHandle { tx })
    }

    /// Spawn the command loop. It exits when every handle is dropped.
    pub fn start(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Store worker started");
            while let Some(command) = self.rx.recv().await {
                self.apply(command).await;
            }
            debug!("Store worker stopped");
        })
    }

    fn store(&self, kind: QueueKind) -> &DurableStore {
        match kind {
            QueueKind::Offline => &self.offline,
            QueueKind::Periodic => &self.periodic,
        }
    }

    async fn apply(&self, command: StoreCommand) {
        match command {
            StoreCommand::Append { kind, record } => {
                self.append_with_retry(kind, record).await;
            }
            StoreCommand::Drain { kind, done } => {
                let count = self.drain_into_sink(kind).await;
                if let Some(done) = done {
                    let _ = done.send(count);
                }
            }
            StoreCommand::Release { done } => {
                self.release_periodic(done).await;
            }
            StoreCommand::Sync { done } => {
                let _ = done.send(());
            }
        }
    }

    async fn append_with_retry(&self, kind: QueueKind, record: NewDurableRecord) {
        let store = self.store(kind);
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match store.append_record(record.clone()).await {
                Ok(seq) => {
                    debug!(queue = %kind, seq, url = %record.url, "Request persisted");
                    return;
                }
                Err(e) if attempt < max_attempts => {
                    let delay = compute_backoff(attempt, self.retry.backoff_base, self.retry.backoff_max);
                    warn!(
                        queue = %kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Append failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        queue = %kind,
                        attempts = max_attempts,
                        url = %record.url,
                        request_type = record.request_type,
                        error = %e,
                        "Append failed, record dropped"
                    );
                }
            }
        }
    }

    async fn drain_into_sink(&self, kind: QueueKind) -> usize {
        let records = match self.store(kind).drain_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!(queue = %kind, error = %e, "Drain failed, records left in place");
                return 0;
            }
        };

        let count = records.len();
        if count > 0 {
            info!(queue = %kind, count, "Replaying durable records");
        }
        for record in records {
            self.sink.replay(kind, record, None);
        }
        count
    }

    async fn release_periodic(&self, done: oneshot::Sender<usize>) {
        let records = match self.periodic.drain_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Periodic release failed, records left in place");
                let _ = done.send(0);
                return;
            }
        };

        let tracker = ReleaseTracker::new(records.len(), done);
        if !records.is_empty() {
            info!(count = records.len(), "Releasing periodic records");
        }
        for record in records {
            let ticket = ReleaseTicket {
                tracker: Some(tracker.clone()),
            };
            self.sink.replay(QueueKind::Periodic, record, Some(ticket));
        }
    }
}
