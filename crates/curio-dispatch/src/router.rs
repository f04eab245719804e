//! Connectivity-driven routing between the online queue and the durable stores.

use crate::envelope::{Classification, RequestEnvelope};
use crate::queue::DispatchQueue;
use crate::route::Route;
use crate::store::StoreHandle;
use curio_database::QueueKind;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug)]
struct LinkState {
    connected: bool,
    /// Something landed in the offline store since the last catch-up pass.
    offline_request_exists: bool,
}

/// Decides, per envelope, which queue receives it.
pub struct Router {
    queue: Arc<DispatchQueue>,
    stores: StoreHandle,
    periodic_enabled: AtomicBool,
    link: Mutex<LinkState>,
}

impl Router {
    pub fn new(queue: Arc<DispatchQueue>, stores: StoreHandle, periodic_enabled: bool, connected: bool) -> Self {
        Self {
            queue,
            stores,
            periodic_enabled: AtomicBool::new(periodic_enabled),
            link: Mutex::new(LinkState {
                connected,
                offline_request_exists: false,
            }),
        }
    }

    /// Classification for a new envelope on `route`, given current state.
    pub fn classify(&self, route: Route) -> Classification {
        if !self.is_connected() {
            Classification::Offline
        } else if route.is_session_lifecycle() || route.is_online_only() {
            Classification::Online
        } else if self.periodic_enabled() {
            Classification::Periodic
        } else {
            Classification::Online
        }
    }

    /// Deliver an envelope to the queue its classification names.
    ///
    /// Durable appends are queued on the store worker; use
    /// [`StoreHandle::sync`] to wait for them to reach disk.
    pub fn route(&self, envelope: RequestEnvelope) {
        match envelope.classification() {
            Classification::Online => self.queue.push(envelope),
            Classification::Offline => {
                self.link.lock().offline_request_exists = true;
                debug!(url = %envelope.destination(), "Request stored offline");
                self.stores.append(QueueKind::Offline, &envelope);
            }
            Classification::Periodic => {
                if envelope.is_session_lifecycle() {
                    self.queue.push(envelope);
                } else {
                    debug!(url = %envelope.destination(), "Request deferred to periodic batch");
                    self.stores.append(QueueKind::Periodic, &envelope);
                }
            }
        }
    }

    /// Record a connectivity transition. Returns false for a repeat of the
    /// current state.
    pub fn set_connected(&self, connected: bool) -> bool {
        let mut link = self.link.lock();
        if link.connected == connected {
            return false;
        }
        link.connected = connected;
        info!(connected, "Connectivity changed");
        true
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().connected
    }

    pub fn periodic_enabled(&self) -> bool {
        self.periodic_enabled.load(Ordering::Acquire)
    }

    pub fn set_periodic_enabled(&self, enabled: bool) {
        self.periodic_enabled.store(enabled, Ordering::Release);
    }

    /// Mark that the offline store holds records again (failed replays).
    pub fn note_offline_request(&self) {
        self.link.lock().offline_request_exists = true;
    }

    pub fn offline_request_exists(&self) -> bool {
        self.link.lock().offline_request_exists
    }

    /// Take the catch-up flag, clearing it.
    pub fn take_offline_owed(&self) -> bool {
        std::mem::take(&mut self.link.lock().offline_request_exists)
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    pub fn stores(&self) -> &StoreHandle {
        &self.stores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Parameters;
    use crate::store::{AppendRetry, ReplaySink, ReleaseTicket, StoreWorker};
    use curio_database::{AsyncDatabase, DurableRecord};

    struct NullSink;

    impl ReplaySink for NullSink {
        fn replay(&self, _from: QueueKind, _record: DurableRecord, _ticket: Option<ReleaseTicket>) {}
    }

    async fn router(periodic: bool, connected: bool) -> (Router, AsyncDatabase) {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let (worker, handle) = StoreWorker::new(db.clone(), AppendRetry::default(), Arc::new(NullSink));
        worker.start();
        (Router::new(Arc::new(DispatchQueue::new()), handle, periodic, connected), db)
    }

    fn build(router: &Router, route: Route) -> RequestEnvelope {
        RequestEnvelope::new("https://x", route, Parameters::new(), router.classify(route), None)
    }

    #[tokio::test]
    async fn classification_table() {
        let (online, _db) = router(false, true).await;
        assert_eq!(online.classify(Route::SendEvent), Classification::Online);
        assert_eq!(online.classify(Route::SessionStart), Classification::Online);

        let (periodic, _db) = router(true, true).await;
        assert_eq!(periodic.classify(Route::ScreenStart), Classification::Periodic);
        assert_eq!(periodic.classify(Route::SessionEnd), Classification::Online);

        let (offline, _db) = router(true, false).await;
        assert_eq!(offline.classify(Route::SessionStart), Classification::Offline);
        assert_eq!(offline.classify(Route::SendEvent), Classification::Offline);
    }

    #[tokio::test]
    async fn offline_routing_persists_and_sets_flag() {
        let (router, db) = router(false, false).await;
        router.route(build(&router, Route::SendEvent));
        router.stores().sync().await.unwrap();

        let count = db
            .call(|conn| curio_database::queries::count_records(conn, QueueKind::Offline))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert!(router.take_offline_owed());
        assert!(!router.offline_request_exists());
        assert_eq!(router.queue().depth().total(), 0);
    }

    #[tokio::test]
    async fn periodic_routing_keeps_session_traffic_online() {
        let (router, db) = router(true, true).await;
        router.route(build(&router, Route::SessionStart));
        router.route(build(&router, Route::SendEvent));
        router.stores().sync().await.unwrap();

        assert_eq!(router.queue().depth().first, 1);
        let count = db
            .call(|conn| curio_database::queries::count_records(conn, QueueKind::Periodic))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn repeated_connectivity_is_ignored() {
        let (router, _db) = router(false, true).await;
        assert!(!router.set_connected(true));
        assert!(router.set_connected(false));
        assert!(!router.set_connected(false));
        assert!(!router.is_connected());
    }
}
