//! Periodic-store flushing and the two-phase session end.

use crate::store::{ReleaseHandle, StoreHandle};
use curio_database::QueueKind;
use parking_lot::Mutex;
use tracing::{debug, info};

/// Outcome of one `end_session` step.
#[derive(Debug)]
pub enum EndSessionStep {
    /// First phase: the periodic store was released; call again once the
    /// handle resolves.
    Release(ReleaseHandle),
    /// Send the real session end now.
    Finish,
}

/// What a connectivity-regained pass should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUp {
    /// No session is active: start one first.
    StartSession,
    /// Offline records were handed to the replay path.
    Drained,
    /// Nothing was owed.
    Idle,
}

/// Moves periodic records into the online queue and owns the
/// `ending_session` handshake flag.
pub struct FlushCoordinator {
    stores: StoreHandle,
    ending_session: Mutex<bool>,
}

impl FlushCoordinator {
    pub fn new(stores: StoreHandle) -> Self {
        Self {
            stores,
            ending_session: Mutex::new(false),
        }
    }

    pub fn ending_session(&self) -> bool {
        *self.ending_session.lock()
    }

    /// One step of the session-end handshake.
    ///
    /// With periodic dispatch active the first call releases the periodic
    /// store and returns without ending anything; the next call clears the
    /// flag and lets the caller send the session end.
    pub fn end_session_step(&self, periodic_active: bool) -> EndSessionStep {
        let mut ending = self.ending_session.lock();
        if periodic_active && !*ending {
            *ending = true;
            debug!("Ending session, releasing periodic batch first");
            EndSessionStep::Release(self.stores.release_periodic())
        } else {
            *ending = false;
            EndSessionStep::Finish
        }
    }

    /// Release the periodic store on a timer tick. Skipped while a session
    /// end is releasing it.
    pub fn on_timer_tick(&self) -> Option<ReleaseHandle> {
        if *self.ending_session.lock() {
            debug!("Periodic tick skipped, session end in progress");
            return None;
        }
        Some(self.stores.release_periodic())
    }

    /// Connectivity came back.
    ///
    /// Without an active session a fresh one is started; owed offline
    /// records are drained once that session start succeeds.
    pub fn on_connectivity_regained(&self, has_session: bool, offline_owed: bool) -> CatchUp {
        if !has_session {
            info!(offline_owed, "Connectivity regained without a session, starting one");
            return CatchUp::StartSession;
        }
        if !offline_owed {
            return CatchUp::Idle;
        }
        self.drain_offline();
        CatchUp::Drained
    }

    pub fn drain_offline(&self) {
        debug!("Draining offline store");
        self.stores.drain(QueueKind::Offline);
    }
}
