//! Session recovery after authorization failures.
//!
//! Each tracked operation runs its own small state machine:
//!
//! ```text
//!   Normal ──401──▶ AwaitingReauth ──200──▶ Normal
//!                        │
//!                        └──401 beyond cap──▶ Exhausted
//! ```
//!
//! Only the first failure of a round starts a new session; later failures
//! observed while that restart is in flight replay their own request only.

use crate::route::Route;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// Operations tracked independently by the recovery controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    StartSession,
    EndSession,
    ScreenStart,
    ScreenEnd,
    SendEvent,
    EndEvent,
    PushRegistration,
    Unregister,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::StartSession => "start_session",
            OperationKind::EndSession => "end_session",
            OperationKind::ScreenStart => "screen_start",
            OperationKind::ScreenEnd => "screen_end",
            OperationKind::SendEvent => "send_event",
            OperationKind::EndEvent => "end_event",
            OperationKind::PushRegistration => "push_registration",
            OperationKind::Unregister => "unregister",
        }
    }
}

impl From<Route> for OperationKind {
    fn from(route: Route) -> Self {
        match route {
            Route::SessionStart => OperationKind::StartSession,
            Route::SessionEnd => OperationKind::EndSession,
            Route::ScreenStart => OperationKind::ScreenStart,
            Route::ScreenEnd => OperationKind::ScreenEnd,
            Route::SendEvent => OperationKind::SendEvent,
            Route::EndEvent => OperationKind::EndEvent,
            Route::PushData => OperationKind::PushRegistration,
            Route::Unregister => OperationKind::Unregister,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPhase {
    #[default]
    Normal,
    AwaitingReauth,
    Exhausted,
}

/// What the engine should do about one unauthorized response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Replay the original request. When `start_session` is set this caller
    /// is the first of its round and must also close the gate and send a
    /// fresh session start.
    Replay { start_session: bool, attempt: u32 },
    /// Cap reached: report a terminal failure and drop the request.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Default, Clone, Copy)]
struct OpState {
    count: u32,
    phase: RecoveryPhase,
}

/// Bounded retry counters and the in-flight session restart guard.
#[derive(Debug)]
pub struct RecoveryController {
    max_retries: u32,
    ops: HashMap<OperationKind, OpState>,
    session_start_in_flight: bool,
}

impl RecoveryController {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ops: HashMap::new(),
            session_start_in_flight: false,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn phase(&self, op: OperationKind) -> RecoveryPhase {
        self.ops.get(&op).map(|s| s.phase).unwrap_or_default()
    }

    pub fn retry_count(&self, op: OperationKind) -> u32 {
        self.ops.get(&op).map(|s| s.count).unwrap_or(0)
    }

    pub fn session_start_in_flight(&self) -> bool {
        self.session_start_in_flight
    }

    /// Record an unauthorized response for `op` and decide what to do.
    pub fn on_unauthorized(&mut self, op: OperationKind) -> RecoveryAction {
        let max = self.max_retries;
        let state = self.ops.entry(op).or_default();
        state.count += 1;

        if state.count > max {
            let attempts = state.count;
            state.count = 0;
            state.phase = RecoveryPhase::Exhausted;
            warn!(operation = %op, attempts, "Unauthorized retry cap reached, giving up");
            return RecoveryAction::Exhausted { attempts };
        }

        state.phase = RecoveryPhase::AwaitingReauth;
        let attempt = state.count;
        let start_session = !self.session_start_in_flight;
        if start_session {
            self.session_start_in_flight = true;
        }
        debug!(operation = %op, attempt, start_session, "Unauthorized, replaying after re-authorization");
        RecoveryAction::Replay { start_session, attempt }
    }

    /// A successful response for `op` resets its counter.
    pub fn on_ok(&mut self, op: OperationKind) {
        if let Some(state) = self.ops.get_mut(&op) {
            if state.count > 0 || state.phase != RecoveryPhase::Normal {
                debug!(operation = %op, "Operation recovered");
            }
            *state = OpState::default();
        }
    }

    /// Mark that a session start is being sent outside of recovery, so a
    /// concurrent failure does not issue a second one.
    pub fn begin_session_start(&mut self) {
        self.session_start_in_flight = true;
    }

    /// The session start finished, whatever its outcome.
    pub fn on_session_start_completed(&mut self) {
        self.session_start_in_flight = false;
    }
}

impl Default for RecoveryController {
    fn default() -> Self {
        Self::new(5)
    }
}
