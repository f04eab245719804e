//! Test harness for end-to-end dispatch tests.
//!
//! Provides:
//! - FakeTransport: records every call, answers from per-route scripts and
//!   can hold calls to one route until released
//! - Collect: a result listener that keeps every attempt
//! - Harness: a started client over a temporary database

#![allow(dead_code)]

use async_trait::async_trait;
use curio_config_and_utils::Config;
use curio_dispatch::{
    AttemptResult, CurioClient, Parameters, ResultListener, Route, StaticFeatures, Transport, TransportError,
    TransportResponse,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

pub const SERVER_URL: &str = "https://curio.test/api/v2";

/// One request seen by the fake transport.
#[derive(Debug, Clone)]
pub struct Call {
    pub url: String,
    pub route: Option<Route>,
    pub params: Parameters,
}

impl Call {
    pub fn str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Scripted answer for one call.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, Option<Value>),
    Refused,
}

struct Hold {
    route: Route,
    pass: usize,
    seen: usize,
    gate: Arc<Semaphore>,
}

/// In-process transport with scripted replies.
#[derive(Default)]
pub struct FakeTransport {
    calls: Mutex<Vec<Call>>,
    scripts: Mutex<HashMap<Route, VecDeque<Reply>>>,
    defaults: Mutex<HashMap<Route, Reply>>,
    hold: Mutex<Option<Hold>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer the next call to `route` with `reply`.
    pub fn script(&self, route: Route, reply: Reply) {
        self.scripts.lock().entry(route).or_default().push_back(reply);
    }

    /// Answer every unscripted call to `route` with `reply`.
    pub fn set_default(&self, route: Route, reply: Reply) {
        self.defaults.lock().insert(route, reply);
    }

    /// Let the first `pass` calls to `route` through, hold the rest until
    /// [`release`](Self::release).
    pub fn hold(&self, route: Route, pass: usize) {
        *self.hold.lock() = Some(Hold {
            route,
            pass,
            seen: 0,
            gate: Arc::new(Semaphore::new(0)),
        });
    }

    pub fn release(&self) {
        if let Some(hold) = self.hold.lock().take() {
            hold.gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, route: Route) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.route == Some(route))
            .cloned()
            .collect()
    }

    pub fn count(&self, route: Route) -> usize {
        self.calls_to(route).len()
    }

    /// Poll until `route` has seen at least `n` calls.
    pub async fn wait_for(&self, route: Route, n: usize) -> bool {
        wait_until(|| self.count(route) >= n).await
    }

    fn held_gate(&self, route: Option<Route>) -> Option<Arc<Semaphore>> {
        let mut guard = self.hold.lock();
        let hold = guard.as_mut()?;
        if Some(hold.route) != route {
            return None;
        }
        hold.seen += 1;
        (hold.seen > hold.pass).then(|| hold.gate.clone())
    }

    fn reply_for(&self, route: Option<Route>) -> Reply {
        let Some(route) = route else {
            return Reply::Status(404, None);
        };
        if let Some(reply) = self.scripts.lock().get_mut(&route).and_then(VecDeque::pop_front) {
            return reply;
        }
        self.defaults
            .lock()
            .get(&route)
            .cloned()
            .unwrap_or(Reply::Status(200, None))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, url: &str, params: &Parameters) -> Result<TransportResponse, TransportError> {
        let route = Route::from_url(url);
        self.calls.lock().push(Call {
            url: url.to_string(),
            route,
            params: params.clone(),
        });

        if let Some(gate) = self.held_gate(route) {
            let _permit = gate.acquire().await;
        }

        match self.reply_for(route) {
            Reply::Status(code, body) => Ok(TransportResponse::new(code, body)),
            Reply::Refused => Err(TransportError::Connect("connection refused".to_string())),
        }
    }
}

/// Listener keeping every attempt it is given.
#[derive(Default)]
pub struct Collect {
    results: Mutex<Vec<AttemptResult>>,
}

impl Collect {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn results(&self) -> Vec<AttemptResult> {
        self.results.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }
}

impl ResultListener for Collect {
    fn on_result(&self, result: &AttemptResult) {
        self.results.lock().push(result.clone());
    }
}

pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn config() -> Config {
    Config {
        server_url: SERVER_URL.to_string(),
        ..Config::default()
    }
}

pub fn periodic_config() -> Config {
    Config {
        periodic_dispatch_enabled: true,
        ..config()
    }
}

pub fn features() -> StaticFeatures {
    StaticFeatures::new("api-key", "TRK-1", "visitor-1")
}

/// A started client over a temporary database.
pub struct Harness {
    pub client: CurioClient,
    pub transport: Arc<FakeTransport>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn start(config: Config) -> Self {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::new();
        let client = open_client(config, &dir.path().join("curio.sqlite"), transport.clone(), true).await;
        Self { client, transport, dir }
    }

    /// Start, mark ready and wait for the first session start to complete.
    pub async fn with_session(config: Config) -> Self {
        let harness = Self::start(config).await;
        harness.client.mark_ready(features());
        harness.client.start_session();
        assert!(harness.transport.wait_for(Route::SessionStart, 1).await);
        assert!(wait_until(|| harness.client.lower_priority_enabled()).await);
        harness
    }
}

pub async fn open_client(
    config: Config,
    db_path: &Path,
    transport: Arc<FakeTransport>,
    connected: bool,
) -> CurioClient {
    let db = curio_database::AsyncDatabase::open(db_path).await.unwrap();
    CurioClient::builder(config)
        .transport(transport)
        .database(db)
        .connected(connected)
        .build()
        .await
        .unwrap()
}
