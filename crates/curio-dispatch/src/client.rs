//! The `CurioClient` façade and the engine state behind it.
//!
//! ```text
//!  host ──▶ CurioClient ──▶ Router ──┬─▶ DispatchQueue ──▶ OnlineWorker ──▶ Transport
//!                                    │        ▲                  │
//!                                    │        │ replays          ▼
//!                                    └─▶ StoreWorker (SQLite)   listeners ──▶ recovery
//! ```
//!
//! Façade calls only build envelopes and enqueue them. Results arrive on the
//! online worker task through engine-owned listeners, which update session
//! state, reconcile correlation codes and drive session recovery before the
//! host's own listener (if any) is told about the attempt.

use crate::envelope::{
    AttemptResult, Classification, DeliveryStatus, Parameters, Priority, RequestEnvelope, ResultListener,
    StatusClass,
};
use crate::error::{DispatchError, DispatchResult};
use crate::features::StaticFeatures;
use crate::flush::{CatchUp, EndSessionStep, FlushCoordinator};
use crate::ids::{IdGenerator, UuidGenerator};
use crate::queue::{DispatchQueue, QueueDepth};
use crate::recovery::{OperationKind, RecoveryAction, RecoveryController, RecoveryPhase};
use crate::route::{keys, Route};
use crate::router::Router;
use crate::session::{CorrelationMap, SessionState};
use crate::store::{now_millis, AppendRetry, DurableStore, ReleaseHandle, ReleaseTicket, ReplaySink, StoreWorker};
use crate::transport::{HttpTransport, Transport};
use crate::worker::OnlineWorker;
use curio_config_and_utils::{Config, Paths};
use curio_database::{AsyncDatabase, DurableRecord, NewDurableRecord, QueueKind};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Result of [`CurioClient::end_session`].
#[derive(Debug)]
pub enum EndSession {
    /// Periodic records are being released; call `end_session` again once
    /// the handle resolves to actually end the session.
    Releasing(ReleaseHandle),
    /// The session end request was routed.
    Sent,
    /// There was no session to end.
    NoActiveSession,
    /// The client is not ready yet; the call runs once it is.
    Deferred,
}

#[derive(Debug, Default)]
struct PushState {
    registration_id: Option<String>,
    /// Push-opened message waiting for a confirmed session.
    pending_push_id: Option<String>,
    custom_id: Option<String>,
    /// An unregister needed re-authorization; no automatic re-registration
    /// until the host sets a custom id again.
    suppress_reregistration: bool,
}

/// Mutable engine state, guarded by one lock.
struct EngineState {
    session: SessionState,
    correlation: CorrelationMap,
    recovery: RecoveryController,
    push: PushState,
}

type DeferredCall = Box<dyn FnOnce(&Arc<EngineCore>) + Send>;

#[derive(Default)]
struct Readiness {
    ready: bool,
    deferred: Vec<DeferredCall>,
}

enum PushFollowUp {
    Opened(String),
    Register(String),
}

struct EngineCore {
    config: Config,
    base_url: String,
    router: Router,
    flush: FlushCoordinator,
    features: Arc<RwLock<StaticFeatures>>,
    ids: Arc<dyn IdGenerator>,
    db: AsyncDatabase,
    state: Mutex<EngineState>,
    readiness: Mutex<Readiness>,
    online_task: Mutex<Option<JoinHandle<()>>>,
    store_task: Mutex<Option<JoinHandle<()>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

fn params<const N: usize>(pairs: [(&str, String); N]) -> Parameters {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), Value::from(value)))
        .collect()
}

fn param_str<'a>(params: &'a Parameters, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn notify(listener: Option<&Arc<dyn ResultListener>>, result: &AttemptResult) {
    if let Some(listener) = listener {
        listener.on_result(result);
    }
}

fn notify_retry(listener: Option<&Arc<dyn ResultListener>>, result: &AttemptResult, will_retry: bool) {
    if let Some(listener) = listener {
        let mut result = result.clone();
        result.will_retry = will_retry;
        listener.on_result(&result);
    }
}

impl EngineCore {
    // ==========================================
    // Envelope construction and submission
    // ==========================================

    fn envelope(
        self: &Arc<Self>,
        route: Route,
        params: Parameters,
        classification: Classification,
        user: Option<Arc<dyn ResultListener>>,
    ) -> RequestEnvelope {
        let callback: Option<Arc<dyn ResultListener>> = match classification {
            Classification::Online => Some(Arc::new(OperationListener {
                core: Arc::downgrade(self),
                route,
                params: params.clone(),
                user,
            })),
            Classification::Offline | Classification::Periodic => None,
        };
        RequestEnvelope::new(&self.base_url, route, params, classification, callback)
    }

    fn submit(self: &Arc<Self>, route: Route, params: Parameters, user: Option<Arc<dyn ResultListener>>) {
        let classification = self.router.classify(route);
        self.router.route(self.envelope(route, params, classification, user));
    }

    /// Re-send after recovery: straight to the online queue, or to the
    /// offline store when the link is down.
    fn resubmit(self: &Arc<Self>, route: Route, params: Parameters, user: Option<Arc<dyn ResultListener>>) {
        let classification = if self.router.is_connected() {
            Classification::Online
        } else if route.is_online_only() {
            notify(user.as_ref(), &AttemptResult::new(DeliveryStatus::NoNetwork, None));
            return;
        } else {
            Classification::Offline
        };
        self.router.route(self.envelope(route, params, classification, user));
    }

    /// `params` with the session code replaced by the current one.
    fn refreshed(&self, params: &Parameters) -> Parameters {
        let mut params = params.clone();
        if let Some(code) = self.state.lock().session.current() {
            params.insert(keys::SESSION_CODE.to_string(), Value::from(code));
        }
        params
    }

    // ==========================================
    // Session lifecycle
    // ==========================================

    /// Current session code, starting a session first when there is none.
    fn active_session(self: &Arc<Self>) -> String {
        let (code, minted) = self.state.lock().session.ensure(false, self.ids.as_ref());
        if minted {
            debug!("No active session, starting one");
            self.send_session_start(code.clone(), None);
        }
        code
    }

    fn start_session(self: &Arc<Self>, generate: bool, user: Option<Arc<dyn ResultListener>>) {
        let (code, _) = self.state.lock().session.ensure(generate, self.ids.as_ref());
        self.send_session_start(code, user);
    }

    fn send_session_start(self: &Arc<Self>, code: String, user: Option<Arc<dyn ResultListener>>) {
        let classification = self.router.classify(Route::SessionStart);
        let custom_id = {
            let mut state = self.state.lock();
            if classification == Classification::Online {
                state.recovery.begin_session_start();
            } else {
                state.recovery.on_session_start_completed();
            }
            state.push.custom_id.clone()
        };
        if classification == Classification::Online {
            self.router.queue().set_lower_priority_enabled(false);
        }

        let mut params = params([(keys::SESSION_CODE, code)]);
        if let Some(custom_id) = custom_id {
            params.insert(keys::CUSTOM_ID.to_string(), Value::from(custom_id));
        }
        info!(classification = ?classification, "Starting session");
        self.router.route(self.envelope(Route::SessionStart, params, classification, user));
    }

    /// `user` is only carried when the rejected request was itself a
    /// session start, so its caller sees every attempt.
    fn restart_session_for_recovery(self: &Arc<Self>, user: Option<Arc<dyn ResultListener>>) {
        let (code, _) = self.state.lock().session.ensure(true, self.ids.as_ref());
        info!("Session rejected by server, restarting");
        self.send_session_start(code, user);
    }

    fn end_session(self: &Arc<Self>) -> EndSession {
        let Some(code) = self.state.lock().session.current().map(str::to_string) else {
            debug!("end_session without an active session");
            return EndSession::NoActiveSession;
        };

        let periodic_active = self.router.periodic_enabled() && self.router.is_connected();
        match self.flush.end_session_step(periodic_active) {
            EndSessionStep::Release(handle) => EndSession::Releasing(handle),
            EndSessionStep::Finish => {
                let classification = self.router.classify(Route::SessionEnd);
                if classification != Classification::Online {
                    self.state.lock().session.clear_if(&code);
                }
                info!(classification = ?classification, "Ending session");
                let params = params([(keys::SESSION_CODE, code)]);
                self.router
                    .route(self.envelope(Route::SessionEnd, params, classification, None));
                EndSession::Sent
            }
        }
    }

    fn after_session_started(self: &Arc<Self>) {
        if self.router.take_offline_owed() {
            self.flush.drain_offline();
        }

        let follow_up = {
            let mut state = self.state.lock();
            if let Some(push_id) = state.push.pending_push_id.take() {
                Some(PushFollowUp::Opened(push_id))
            } else if self.config.auto_push_registration && !state.push.suppress_reregistration {
                state.push.registration_id.clone().map(PushFollowUp::Register)
            } else {
                None
            }
        };
        match follow_up {
            Some(PushFollowUp::Opened(push_id)) => self.send_push_opened(push_id),
            Some(PushFollowUp::Register(token)) => self.send_push_data(token, None),
            None => {}
        }
    }

    // ==========================================
    // Screens and events
    // ==========================================

    fn start_screen(
        self: &Arc<Self>,
        screen_id: String,
        title: String,
        path: String,
        user: Option<Arc<dyn ResultListener>>,
    ) {
        let session = self.active_session();
        let hit_code = self.ids.correlation_code();
        self.state
            .lock()
            .correlation
            .open_screen(&screen_id, &hit_code, &title, &path);

        let params = params([
            (keys::SESSION_CODE, session),
            (keys::HIT_CODE, hit_code),
            (keys::PAGE_TITLE, title),
            (keys::PATH, path),
        ]);
        self.submit(Route::ScreenStart, params, user);
    }

    fn end_screen(self: &Arc<Self>, screen_id: String, user: Option<Arc<dyn ResultListener>>) {
        let entry = self.state.lock().correlation.screen(&screen_id).cloned();
        let Some(entry) = entry else {
            debug!(screen_id = %screen_id, "end_screen for a screen that was never started, ignored");
            return;
        };

        let session = self.active_session();
        let params = params([
            (keys::SESSION_CODE, session),
            (keys::HIT_CODE, entry.hit_code),
            (keys::PAGE_TITLE, entry.title),
            (keys::PATH, entry.path),
        ]);
        self.submit(Route::ScreenEnd, params, user);
    }

    fn send_event(self: &Arc<Self>, key: String, value: String, user: Option<Arc<dyn ResultListener>>) {
        let session = self.active_session();
        let event_code = self.ids.correlation_code();
        self.state.lock().correlation.open_event(&key, &value, &event_code);

        let params = params([
            (keys::SESSION_CODE, session),
            (keys::EVENT_CODE, event_code),
            (keys::EVENT_KEY, key),
            (keys::EVENT_VALUE, value),
        ]);
        self.submit(Route::SendEvent, params, user);
    }

    fn end_event(
        self: &Arc<Self>,
        key: String,
        value: String,
        duration_ms: u64,
        user: Option<Arc<dyn ResultListener>>,
    ) {
        let event_code = self.state.lock().correlation.event(&key, &value).map(str::to_string);
        let Some(event_code) = event_code else {
            debug!(event_key = %key, "end_event for an event that was never sent, ignored");
            return;
        };

        let session = self.active_session();
        let mut params = params([
            (keys::SESSION_CODE, session),
            (keys::EVENT_CODE, event_code),
            (keys::EVENT_KEY, key),
            (keys::EVENT_VALUE, value),
        ]);
        params.insert(keys::EVENT_DURATION.to_string(), Value::from(duration_ms));
        self.submit(Route::EndEvent, params, user);
    }

    // ==========================================
    // Push glue
    // ==========================================

    /// Push traffic needs automatic registration enabled and a live link.
    fn push_allowed(&self, user: Option<&Arc<dyn ResultListener>>) -> bool {
        if !self.config.auto_push_registration {
            debug!("Push call ignored, automatic push registration is disabled");
            notify(user, &AttemptResult::new(DeliveryStatus::PushRegistrationDisabled, None));
            return false;
        }
        if !self.router.is_connected() {
            debug!("Push call refused while offline");
            notify(user, &AttemptResult::new(DeliveryStatus::NoNetwork, None));
            return false;
        }
        true
    }

    fn send_registration_id(self: &Arc<Self>, token: String, user: Option<Arc<dyn ResultListener>>) {
        self.state.lock().push.registration_id = Some(token.clone());
        if !self.push_allowed(user.as_ref()) {
            return;
        }
        self.send_push_data(token, user);
    }

    fn send_push_data(self: &Arc<Self>, token: String, user: Option<Arc<dyn ResultListener>>) {
        let session = self.active_session();
        let custom_id = self.state.lock().push.custom_id.clone();

        let mut params = params([(keys::SESSION_CODE, session), (keys::PUSH_TOKEN, token)]);
        if let Some(custom_id) = custom_id {
            params.insert(keys::CUSTOM_ID.to_string(), Value::from(custom_id));
        }
        self.router
            .route(self.envelope(Route::PushData, params, Classification::Online, user));
    }

    fn send_push_opened(self: &Arc<Self>, push_id: String) {
        let session = self.active_session();
        let params = params([(keys::SESSION_CODE, session), (keys::PUSH_ID, push_id)]);
        debug!("Sending push-opened message");
        self.router
            .route(self.envelope(Route::PushData, params, Classification::Online, None));
    }

    fn set_push_id(self: &Arc<Self>, push_id: String) {
        let send_now = {
            let mut state = self.state.lock();
            if state.session.current().is_some()
                && !state.recovery.session_start_in_flight()
                && self.router.is_connected()
            {
                true
            } else {
                state.push.pending_push_id = Some(push_id.clone());
                false
            }
        };
        if send_now {
            self.send_push_opened(push_id);
        } else {
            debug!("Push-opened message held until the next session start");
        }
    }

    fn set_custom_id(self: &Arc<Self>, custom_id: String) {
        let resend = {
            let mut state = self.state.lock();
            state.push.custom_id = Some(custom_id);
            state.push.suppress_reregistration = false;
            state.push.registration_id.clone()
        };
        if let Some(token) = resend {
            if self.config.auto_push_registration && self.router.is_connected() {
                self.send_push_data(token, None);
            }
        }
    }

    fn unregister(self: &Arc<Self>, user: Option<Arc<dyn ResultListener>>) {
        if !self.push_allowed(user.as_ref()) {
            return;
        }
        let session = self.active_session();
        let token = self.state.lock().push.registration_id.clone();

        let mut params = params([(keys::SESSION_CODE, session)]);
        if let Some(token) = token {
            params.insert(keys::PUSH_TOKEN.to_string(), Value::from(token));
        }
        self.router
            .route(self.envelope(Route::Unregister, params, Classification::Online, user));
    }

    // ==========================================
    // Connectivity and periodic flushing
    // ==========================================

    fn on_reconnected(self: &Arc<Self>) {
        let has_session = self.state.lock().session.current().is_some();
        // Without a session the owed flag is left for `after_session_started`.
        let owed = if has_session {
            self.router.take_offline_owed()
        } else {
            self.router.offline_request_exists()
        };
        if self.flush.on_connectivity_regained(has_session, owed) == CatchUp::StartSession {
            self.start_session(true, None);
        }
    }

    fn periodic_tick(&self) -> Option<ReleaseHandle> {
        if !self.router.periodic_enabled() || !self.router.is_connected() || !self.readiness.lock().ready {
            return None;
        }
        self.flush.on_timer_tick()
    }

    // ==========================================
    // Results
    // ==========================================

    fn on_operation_result(
        self: &Arc<Self>,
        route: Route,
        params: &Parameters,
        user: Option<&Arc<dyn ResultListener>>,
        result: &AttemptResult,
    ) {
        let class = result.status.class();

        if route == Route::SessionStart {
            self.state.lock().recovery.on_session_start_completed();
            self.router.queue().set_lower_priority_enabled(true);
        }
        self.settle_session_end(route, params, class);

        match class {
            StatusClass::Ok => {
                self.state.lock().recovery.on_ok(route.into());
                self.on_delivered(route, params, result);
                notify(user, result);
            }
            StatusClass::Unauthorized => self.on_unauthorized(route, params, user, result),
            StatusClass::PreconditionFailed => {
                error!(
                    route = %route,
                    "Server rejected the request as misconfigured, check the api key and tracking code"
                );
                notify(user, result);
            }
            StatusClass::Failed => {
                warn!(route = %route, status = %result.status, "Request failed");
                notify(user, result);
            }
        }
    }

    fn settle_session_end(&self, route: Route, params: &Parameters, class: StatusClass) {
        if route != Route::SessionEnd || class == StatusClass::Unauthorized {
            return;
        }
        if let Some(code) = param_str(params, keys::SESSION_CODE) {
            if self.state.lock().session.clear_if(code) {
                debug!("Session closed");
            }
        }
    }

    /// Route-specific follow-up for an OK response.
    fn on_delivered(self: &Arc<Self>, route: Route, params: &Parameters, result: &AttemptResult) {
        match route {
            Route::SessionStart => self.after_session_started(),
            Route::ScreenStart => {
                if let (Some(local), Some(server)) =
                    (param_str(params, keys::HIT_CODE), result.body_str(keys::HIT_CODE))
                {
                    if self.state.lock().correlation.confirm_hit(local, server) {
                        debug!(hit_code = server, "Hit code confirmed by server");
                    }
                }
            }
            Route::SendEvent => {
                if let (Some(local), Some(server)) =
                    (param_str(params, keys::EVENT_CODE), result.body_str(keys::EVENT_CODE))
                {
                    if self.state.lock().correlation.confirm_event(local, server) {
                        debug!(event_code = server, "Event code confirmed by server");
                    }
                }
            }
            Route::Unregister => {
                self.state.lock().push.registration_id = None;
            }
            _ => {}
        }
    }

    fn on_unauthorized(
        self: &Arc<Self>,
        route: Route,
        params: &Parameters,
        user: Option<&Arc<dyn ResultListener>>,
        result: &AttemptResult,
    ) {
        let action = {
            let mut state = self.state.lock();
            if route == Route::Unregister {
                state.push.suppress_reregistration = true;
            }
            state.recovery.on_unauthorized(route.into())
        };

        match action {
            RecoveryAction::Replay { start_session, attempt } => {
                notify_retry(user, result, true);
                if route == Route::SessionStart {
                    self.restart_session_for_recovery(user.cloned());
                } else {
                    if start_session {
                        self.restart_session_for_recovery(None);
                    }
                    debug!(route = %route, attempt, "Replaying request after re-authorization");
                    self.resubmit(route, self.refreshed(params), user.cloned());
                }
            }
            RecoveryAction::Exhausted { attempts } => {
                error!(route = %route, attempts, "Request still unauthorized after session restarts, dropped");
                notify_retry(user, result, false);
            }
        }
    }

    // ==========================================
    // Durable replay
    // ==========================================

    fn replay_record(self: &Arc<Self>, from: QueueKind, record: DurableRecord, ticket: Option<ReleaseTicket>) {
        let replay = Replay {
            from,
            url: record.url,
            params: record.params,
            request_type: record.request_type,
        };
        self.enqueue_replay(replay, ticket);
    }

    fn enqueue_replay(self: &Arc<Self>, replay: Replay, ticket: Option<ReleaseTicket>) {
        if !self.router.is_connected() {
            debug!(url = %replay.url, "Link down, record returned to offline store");
            self.put_back(replay);
            return;
        }

        let priority = Route::from_url(&replay.url)
            .map(Route::priority)
            .unwrap_or(Priority::Third);
        let url = replay.url.clone();
        let params = replay.params.clone();
        let listener = Arc::new(ReplayListener {
            core: Arc::downgrade(self),
            replay,
            ticket: Mutex::new(ticket),
        });
        let envelope =
            RequestEnvelope::for_destination(url, params, priority, Classification::Online, Some(listener));
        self.router.queue().push(envelope);
    }

    /// Append a replay to the offline store, keeping its original stamp.
    fn put_back(&self, replay: Replay) {
        self.router.note_offline_request();
        let record = NewDurableRecord::stamped(replay.url, replay.params, replay.request_type, now_millis());
        self.router.stores().append_record(QueueKind::Offline, record);
    }

    fn on_replay_result(self: &Arc<Self>, replay: &Replay, result: &AttemptResult) {
        let route = Route::from_url(&replay.url);
        let class = result.status.class();
        if let Some(route) = route {
            self.settle_session_end(route, &replay.params, class);
        }

        match (class, route) {
            (StatusClass::Ok, Some(route)) => {
                self.state.lock().recovery.on_ok(route.into());
                self.on_delivered(route, &replay.params, result);
            }
            (StatusClass::Ok, None) => {}
            (StatusClass::Unauthorized, Some(route)) => {
                let action = self.state.lock().recovery.on_unauthorized(route.into());
                match action {
                    RecoveryAction::Replay { start_session, .. } => {
                        if start_session {
                            self.restart_session_for_recovery(None);
                        }
                        if route != Route::SessionStart {
                            let retry = Replay {
                                from: replay.from,
                                url: replay.url.clone(),
                                params: self.refreshed(&replay.params),
                                request_type: replay.request_type,
                            };
                            self.enqueue_replay(retry, None);
                        }
                    }
                    RecoveryAction::Exhausted { attempts } => {
                        warn!(url = %replay.url, attempts, "Replayed request still unauthorized, dropped");
                    }
                }
            }
            _ if result.status.is_transport_failure() => {
                debug!(url = %replay.url, status = %result.status, "Replay failed in transit, kept offline");
                self.put_back(replay.clone());
            }
            _ => {
                warn!(
                    url = %replay.url,
                    queue = %replay.from,
                    status = %result.status,
                    "Replayed request rejected, dropped"
                );
            }
        }
    }
}

impl Drop for EngineCore {
    fn drop(&mut self) {
        self.router.queue().close();
    }
}

// ==========================================
// Listeners
// ==========================================

/// Engine-side listener attached to every online envelope built by the façade.
struct OperationListener {
    core: Weak<EngineCore>,
    route: Route,
    params: Parameters,
    user: Option<Arc<dyn ResultListener>>,
}

impl ResultListener for OperationListener {
    fn on_result(&self, result: &AttemptResult) {
        match self.core.upgrade() {
            Some(core) => core.on_operation_result(self.route, &self.params, self.user.as_ref(), result),
            None => notify(self.user.as_ref(), result),
        }
    }
}

#[derive(Debug, Clone)]
struct Replay {
    from: QueueKind,
    url: String,
    params: Parameters,
    request_type: i32,
}

/// Listener for records drained from a durable store.
struct ReplayListener {
    core: Weak<EngineCore>,
    replay: Replay,
    ticket: Mutex<Option<ReleaseTicket>>,
}

impl ResultListener for ReplayListener {
    fn on_result(&self, result: &AttemptResult) {
        if let Some(ticket) = self.ticket.lock().take() {
            ticket.complete();
        }
        if let Some(core) = self.core.upgrade() {
            core.on_replay_result(&self.replay, result);
        }
    }
}

/// Hands drained records from the store worker back to the engine.
struct ReplayBridge {
    core: Weak<EngineCore>,
}

impl ReplaySink for ReplayBridge {
    fn replay(&self, from: QueueKind, record: DurableRecord, ticket: Option<ReleaseTicket>) {
        match self.core.upgrade() {
            Some(core) => core.replay_record(from, record, ticket),
            None => debug!(queue = %from, seq = record.seq, "Client dropped, replay skipped"),
        }
    }
}

// ==========================================
// Builder
// ==========================================

/// Builder for [`CurioClient`].
pub struct CurioClientBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    ids: Option<Arc<dyn IdGenerator>>,
    database: Option<AsyncDatabase>,
    paths: Option<Paths>,
    connected: bool,
    append_retry: AppendRetry,
}

impl CurioClientBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
            ids: None,
            database: None,
            paths: None,
            connected: true,
            append_retry: AppendRetry::default(),
        }
    }

    /// Transport used by the online worker. Defaults to [`HttpTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Use an already opened database for the durable queues.
    pub fn database(mut self, db: AsyncDatabase) -> Self {
        self.database = Some(db);
        self
    }

    /// Open the durable queues under these paths instead of `~/.curio`.
    pub fn paths(mut self, paths: Paths) -> Self {
        self.paths = Some(paths);
        self
    }

    /// Initial connectivity, before the first monitor notification.
    pub fn connected(mut self, connected: bool) -> Self {
        self.connected = connected;
        self
    }

    pub fn append_retry(mut self, retry: AppendRetry) -> Self {
        self.append_retry = retry;
        self
    }

    /// Open the stores and start the online and store workers.
    pub async fn build(self) -> DispatchResult<CurioClient> {
        let Self {
            config,
            transport,
            ids,
            database,
            paths,
            connected,
            append_retry,
        } = self;

        config.server_url()?;
        let base_url = config.server_url.trim_end_matches('/').to_string();

        let transport: Arc<dyn Transport> = match transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(config.request_timeout())?),
        };
        let db = match database {
            Some(db) => db,
            None => {
                let paths = match paths {
                    Some(paths) => paths,
                    None => Paths::new()?,
                };
                AsyncDatabase::open(&paths.database_file()).await?
            }
        };
        let pending_offline = DurableStore::new(db.clone(), QueueKind::Offline).len().await?;

        let queue = Arc::new(DispatchQueue::new());
        let features = Arc::new(RwLock::new(StaticFeatures::default()));
        let ids: Arc<dyn IdGenerator> = match ids {
            Some(ids) => ids,
            None => Arc::new(UuidGenerator),
        };
        let periodic = config.periodic_dispatch_enabled;
        let max_retries = config.max_unauthorized_retries;

        let mut store_worker = None;
        let core = Arc::new_cyclic(|weak: &Weak<EngineCore>| {
            let sink: Arc<dyn ReplaySink> = Arc::new(ReplayBridge { core: weak.clone() });
            let (worker, stores) = StoreWorker::new(db.clone(), append_retry, sink);
            store_worker = Some(worker);

            EngineCore {
                config,
                base_url,
                router: Router::new(queue.clone(), stores.clone(), periodic, connected),
                flush: FlushCoordinator::new(stores),
                features: features.clone(),
                ids,
                db,
                state: Mutex::new(EngineState {
                    session: SessionState::default(),
                    correlation: CorrelationMap::default(),
                    recovery: RecoveryController::new(max_retries),
                    push: PushState::default(),
                }),
                readiness: Mutex::new(Readiness::default()),
                online_task: Mutex::new(None),
                store_task: Mutex::new(None),
                timer: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }
        });

        if pending_offline > 0 {
            info!(pending_offline, "Offline records left from a previous run");
            core.router.note_offline_request();
        }

        *core.store_task.lock() = store_worker.map(StoreWorker::start);
        *core.online_task.lock() = Some(OnlineWorker::new(queue, transport, features).start());

        info!(
            server_url = %core.base_url,
            periodic,
            connected,
            "Curio client started"
        );
        Ok(CurioClient { core })
    }
}

// ==========================================
// Façade
// ==========================================

/// Handle to one dispatch engine. Cheap to clone; every clone drives the
/// same engine.
///
/// Calls never block on the network. Until [`mark_ready`](Self::mark_ready)
/// is called, analytics calls are queued in call order and run once the
/// static request values are known.
///
/// Offline and periodic captures are handed to the store worker and written
/// in call order, but a façade call returns before its record is on disk.
/// [`persisted`](Self::persisted) is the durability point: once it returns,
/// every record captured before the call survives a restart.
#[derive(Clone)]
pub struct CurioClient {
    core: Arc<EngineCore>,
}

impl CurioClient {
    pub fn builder(config: Config) -> CurioClientBuilder {
        CurioClientBuilder::new(config)
    }

    /// Run `call` now if ready, otherwise queue it.
    fn when_ready(&self, call: impl FnOnce(&Arc<EngineCore>) + Send + 'static) {
        {
            let mut readiness = self.core.readiness.lock();
            if !readiness.ready {
                debug!(deferred = readiness.deferred.len() + 1, "Client not ready, call deferred");
                readiness.deferred.push(Box::new(call));
                return;
            }
        }
        call(&self.core);
    }

    /// Supply the static request values and run every deferred call in
    /// the order it was made.
    pub fn mark_ready(&self, features: StaticFeatures) {
        *self.core.features.write() = features;

        let mut replayed = 0usize;
        loop {
            let batch = {
                let mut readiness = self.core.readiness.lock();
                if readiness.deferred.is_empty() {
                    readiness.ready = true;
                    break;
                }
                std::mem::take(&mut readiness.deferred)
            };
            for call in batch {
                call(&self.core);
                replayed += 1;
            }
        }
        info!(replayed, "Client ready");
    }

    pub fn is_ready(&self) -> bool {
        self.core.readiness.lock().ready
    }

    // Sessions

    pub fn start_session(&self) {
        self.start_session_with(false);
    }

    /// Start a session; with `generate` a new session code replaces the
    /// current one.
    pub fn start_session_with(&self, generate: bool) {
        self.when_ready(move |core| core.start_session(generate, None));
    }

    pub fn start_session_with_listener(&self, generate: bool, listener: Arc<dyn ResultListener>) {
        self.when_ready(move |core| core.start_session(generate, Some(listener)));
    }

    /// End the session. Under periodic dispatch the first call only releases
    /// the periodic batch; see [`EndSession::Releasing`].
    pub fn end_session(&self) -> EndSession {
        {
            let mut readiness = self.core.readiness.lock();
            if !readiness.ready {
                readiness.deferred.push(Box::new(|core: &Arc<EngineCore>| {
                    core.end_session();
                }));
                return EndSession::Deferred;
            }
        }
        self.core.end_session()
    }

    /// Both phases of [`end_session`](Self::end_session): wait for the
    /// periodic release, then send the session end.
    pub async fn end_session_flushed(&self) -> EndSession {
        match self.end_session() {
            EndSession::Releasing(handle) => {
                let released = handle.released().await;
                debug!(released, "Periodic batch attempted, ending session");
                self.end_session()
            }
            other => other,
        }
    }

    // Screens and events

    pub fn start_screen(&self, screen_id: impl Into<String>, title: impl Into<String>, path: impl Into<String>) {
        let (screen_id, title, path) = (screen_id.into(), title.into(), path.into());
        self.when_ready(move |core| core.start_screen(screen_id, title, path, None));
    }

    pub fn start_screen_with_listener(
        &self,
        screen_id: impl Into<String>,
        title: impl Into<String>,
        path: impl Into<String>,
        listener: Arc<dyn ResultListener>,
    ) {
        let (screen_id, title, path) = (screen_id.into(), title.into(), path.into());
        self.when_ready(move |core| core.start_screen(screen_id, title, path, Some(listener)));
    }

    pub fn end_screen(&self, screen_id: impl Into<String>) {
        let screen_id = screen_id.into();
        self.when_ready(move |core| core.end_screen(screen_id, None));
    }

    pub fn end_screen_with_listener(&self, screen_id: impl Into<String>, listener: Arc<dyn ResultListener>) {
        let screen_id = screen_id.into();
        self.when_ready(move |core| core.end_screen(screen_id, Some(listener)));
    }

    pub fn send_event(&self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        self.when_ready(move |core| core.send_event(key, value, None));
    }

    pub fn send_event_with_listener(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        listener: Arc<dyn ResultListener>,
    ) {
        let (key, value) = (key.into(), value.into());
        self.when_ready(move |core| core.send_event(key, value, Some(listener)));
    }

    pub fn end_event(&self, key: impl Into<String>, value: impl Into<String>, duration_ms: u64) {
        let (key, value) = (key.into(), value.into());
        self.when_ready(move |core| core.end_event(key, value, duration_ms, None));
    }

    pub fn end_event_with_listener(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        duration_ms: u64,
        listener: Arc<dyn ResultListener>,
    ) {
        let (key, value) = (key.into(), value.into());
        self.when_ready(move |core| core.end_event(key, value, duration_ms, Some(listener)));
    }

    // Push glue

    /// Register the device push token for this visitor.
    pub fn send_registration_id(&self, token: impl Into<String>, listener: Option<Arc<dyn ResultListener>>) {
        let token = token.into();
        self.when_ready(move |core| core.send_registration_id(token, listener));
    }

    /// Record that the app was opened from push `push_id`.
    pub fn set_push_id(&self, push_id: impl Into<String>) {
        let push_id = push_id.into();
        self.when_ready(move |core| core.set_push_id(push_id));
    }

    pub fn set_custom_id(&self, custom_id: impl Into<String>) {
        let custom_id = custom_id.into();
        self.when_ready(move |core| core.set_custom_id(custom_id));
    }

    pub fn unregister(&self, listener: Option<Arc<dyn ResultListener>>) {
        self.when_ready(move |core| core.unregister(listener));
    }

    // Connectivity and periodic dispatch

    /// Connectivity monitor hook. Repeats of the current state are ignored.
    pub fn on_connectivity_changed(&self, connected: bool) {
        if !self.core.router.set_connected(connected) {
            debug!(connected, "Connectivity unchanged");
            return;
        }
        if connected {
            self.when_ready(|core| core.on_reconnected());
        }
    }

    /// Periodic timer hook. Returns the release handle when a batch was
    /// released.
    pub fn tick_periodic_dispatch(&self) -> Option<ReleaseHandle> {
        self.core.periodic_tick()
    }

    pub fn set_periodic_dispatch(&self, enabled: bool) {
        info!(enabled, "Periodic dispatch toggled");
        self.core.router.set_periodic_enabled(enabled);
    }

    /// Drive [`tick_periodic_dispatch`](Self::tick_periodic_dispatch) from
    /// the configured dispatch period.
    pub fn spawn_periodic_timer(&self) -> DispatchResult<()> {
        let mut timer = self.core.timer.lock();
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(DispatchError::AlreadyStarted("periodic timer"));
        }

        let period = self.core.config.dispatch_period();
        let core = Arc::downgrade(&self.core);
        *timer = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(core) = core.upgrade() else {
                    break;
                };
                if core.periodic_tick().is_some() {
                    debug!("Periodic batch released");
                }
            }
        }));
        info!(period_secs = period.as_secs(), "Periodic dispatch timer started");
        Ok(())
    }

    // Persistence and shutdown

    /// Wait until every store write issued so far has reached disk.
    ///
    /// Appends that exhaust their retries are dropped with a warning rather
    /// than failing this call.
    pub async fn persisted(&self) -> DispatchResult<()> {
        if self.core.shut_down.load(Ordering::Acquire) {
            return Err(DispatchError::ShutDown);
        }
        self.core.router.stores().sync().await
    }

    /// Records waiting in a durable store.
    pub async fn pending_records(&self, kind: QueueKind) -> DispatchResult<i64> {
        self.persisted().await?;
        DurableStore::new(self.core.db.clone(), kind).len().await
    }

    /// Flush pending store writes, let the online worker finish what it can
    /// dispatch and stop the background tasks.
    pub async fn shutdown(&self) {
        if self.core.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let timer = self.core.timer.lock().take();
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Err(e) = self.core.router.stores().sync().await {
            warn!(error = %e, "Store worker already stopped");
        }

        self.core.router.queue().close();
        let online = self.core.online_task.lock().take();
        if let Some(online) = online {
            let _ = online.await;
        }
        let store = self.core.store_task.lock().take();
        if let Some(store) = store {
            store.abort();
        }
        info!("Curio client stopped");
    }

    // Inspection

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    pub fn session_code(&self) -> Option<String> {
        self.core.state.lock().session.current().map(str::to_string)
    }

    pub fn screen_hit_code(&self, screen_id: &str) -> Option<String> {
        self.core
            .state
            .lock()
            .correlation
            .screen(screen_id)
            .map(|entry| entry.hit_code.clone())
    }

    pub fn event_code(&self, key: &str, value: &str) -> Option<String> {
        self.core.state.lock().correlation.event(key, value).map(str::to_string)
    }

    pub fn recovery_phase(&self, op: OperationKind) -> RecoveryPhase {
        self.core.state.lock().recovery.phase(op)
    }

    pub fn queue_depth(&self) -> QueueDepth {
        self.core.router.queue().depth()
    }

    pub fn lower_priority_enabled(&self) -> bool {
        self.core.router.queue().lower_priority_enabled()
    }

    pub fn is_connected(&self) -> bool {
        self.core.router.is_connected()
    }

    pub fn ending_session(&self) -> bool {
        self.core.flush.ending_session()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::TransportResponse;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Parameters)>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn send(&self, url: &str, params: &Parameters) -> Result<TransportResponse, TransportError> {
            self.calls.lock().push((url.to_string(), params.clone()));
            Ok(TransportResponse::ok())
        }
    }

    impl Recorder {
        fn routes(&self) -> Vec<Option<Route>> {
            self.calls.lock().iter().map(|(url, _)| Route::from_url(url)).collect()
        }
    }

    async fn client(transport: Arc<Recorder>, config: Config) -> CurioClient {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        CurioClient::builder(config)
            .transport(transport)
            .database(db)
            .build()
            .await
            .unwrap()
    }

    async fn settle(transport: &Recorder, count: usize) {
        for _ in 0..100 {
            if transport.calls.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn calls_before_ready_run_in_order() {
        let transport = Arc::new(Recorder::default());
        let client = client(transport.clone(), Config::default()).await;

        client.start_session();
        client.start_screen("home", "Home", "/home");
        client.send_event("tap", "buy");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(transport.calls.lock().is_empty());
        assert!(!client.is_ready());

        client.mark_ready(StaticFeatures::new("key", "TRK", "visitor"));
        settle(&transport, 3).await;

        assert_eq!(
            transport.routes(),
            vec![Some(Route::SessionStart), Some(Route::ScreenStart), Some(Route::SendEvent)]
        );
        let calls = transport.calls.lock();
        assert_eq!(calls[1].1["apiKey"], "key");
        assert_eq!(calls[1].1["sessionCode"], calls[0].1["sessionCode"]);
    }

    #[tokio::test]
    async fn push_calls_need_registration_enabled() {
        let transport = Arc::new(Recorder::default());
        let client = client(transport.clone(), Config::default()).await;
        client.mark_ready(StaticFeatures::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn ResultListener> =
            Arc::new(move |r: &AttemptResult| sink.lock().push(r.status.clone()));

        client.send_registration_id("token", Some(listener.clone()));
        assert_eq!(*seen.lock(), vec![DeliveryStatus::PushRegistrationDisabled]);
        assert!(transport.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn push_calls_refused_offline() {
        let transport = Arc::new(Recorder::default());
        let config = Config {
            auto_push_registration: true,
            ..Config::default()
        };
        let client = client(transport.clone(), config).await;
        client.mark_ready(StaticFeatures::default());
        client.on_connectivity_changed(false);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn ResultListener> =
            Arc::new(move |r: &AttemptResult| sink.lock().push(r.status.clone()));

        client.unregister(Some(listener));
        assert_eq!(*seen.lock(), vec![DeliveryStatus::NoNetwork]);
    }

    #[tokio::test]
    async fn unknown_screen_end_is_ignored() {
        let transport = Arc::new(Recorder::default());
        let client = client(transport.clone(), Config::default()).await;
        client.mark_ready(StaticFeatures::default());

        client.end_screen("never-started");
        client.end_event("k", "v", 10);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(transport.calls.lock().is_empty());
        assert_eq!(client.session_code(), None);
    }

    #[tokio::test]
    async fn end_session_without_session() {
        let transport = Arc::new(Recorder::default());
        let client = client(transport, Config::default()).await;
        assert!(matches!(client.end_session(), EndSession::Deferred));
        client.mark_ready(StaticFeatures::default());
        assert!(matches!(client.end_session(), EndSession::NoActiveSession));
    }

    #[tokio::test]
    async fn push_opened_waits_for_session_start() {
        let transport = Arc::new(Recorder::default());
        let client = client(transport.clone(), Config::default()).await;
        client.mark_ready(StaticFeatures::default());

        client.set_push_id("push-7");
        client.start_session();
        settle(&transport, 2).await;

        let calls = transport.calls.lock();
        assert_eq!(Route::from_url(&calls[0].0), Some(Route::SessionStart));
        assert_eq!(Route::from_url(&calls[1].0), Some(Route::PushData));
        assert_eq!(calls[1].1["pushId"], "push-7");
    }

    #[tokio::test]
    async fn invalid_server_url_is_a_config_error() {
        let config = Config {
            server_url: "not a url".to_string(),
            ..Config::default()
        };
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let result = CurioClient::builder(config)
            .transport(Arc::new(Recorder::default()))
            .database(db)
            .build()
            .await;
        assert!(matches!(result, Err(DispatchError::Core(_))));
    }

    #[tokio::test]
    async fn periodic_timer_starts_once() {
        let transport = Arc::new(Recorder::default());
        let client = client(transport, Config::default()).await;
        client.spawn_periodic_timer().unwrap();
        assert!(matches!(
            client.spawn_periodic_timer(),
            Err(DispatchError::AlreadyStarted(_))
        ));
        client.shutdown().await;
        assert!(matches!(client.persisted().await, Err(DispatchError::ShutDown)));
    }
}
