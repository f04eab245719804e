//! Session code and start/end correlation bookkeeping.

use crate::ids::IdGenerator;
use std::collections::HashMap;

/// The active session code, if any.
#[derive(Debug, Default)]
pub struct SessionState {
    code: Option<String>,
}

impl SessionState {
    pub fn current(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Current code, generating one when absent or when `regenerate` is set.
    /// The flag in the result tells whether a new code was minted.
    pub fn ensure(&mut self, regenerate: bool, ids: &dyn IdGenerator) -> (String, bool) {
        match &self.code {
            Some(code) if !regenerate => (code.clone(), false),
            _ => {
                let code = ids.session_code();
                self.code = Some(code.clone());
                (code, true)
            }
        }
    }

    pub fn clear(&mut self) {
        self.code = None;
    }

    /// Clear only if `code` is still the active session.
    pub fn clear_if(&mut self, code: &str) -> bool {
        if self.code.as_deref() == Some(code) {
            self.code = None;
            true
        } else {
            false
        }
    }
}

/// A screen opened with `start_screen`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenEntry {
    pub hit_code: String,
    pub title: String,
    pub path: String,
}

/// Maps caller identities to hit and event codes.
///
/// Entries are written with a local code when the start request is built and
/// overwritten at most once, when the server acknowledges with its own code.
#[derive(Debug, Default)]
pub struct CorrelationMap {
    screens: HashMap<String, ScreenEntry>,
    events: HashMap<(String, String), String>,
}

impl CorrelationMap {
    pub fn open_screen(&mut self, screen_id: &str, hit_code: &str, title: &str, path: &str) {
        self.screens.insert(
            screen_id.to_string(),
            ScreenEntry {
                hit_code: hit_code.to_string(),
                title: title.to_string(),
                path: path.to_string(),
            },
        );
    }

    pub fn screen(&self, screen_id: &str) -> Option<&ScreenEntry> {
        self.screens.get(screen_id)
    }

    pub fn open_event(&mut self, key: &str, value: &str, event_code: &str) {
        self.events
            .insert((key.to_string(), value.to_string()), event_code.to_string());
    }

    pub fn event(&self, key: &str, value: &str) -> Option<&str> {
        self.events
            .get(&(key.to_string(), value.to_string()))
            .map(String::as_str)
    }

    /// Replace `local` with the server-issued hit code. Returns whether an
    /// entry still held the local code.
    pub fn confirm_hit(&mut self, local: &str, server: &str) -> bool {
        if local == server {
            return false;
        }
        match self.screens.values_mut().find(|entry| entry.hit_code == local) {
            Some(entry) => {
                entry.hit_code = server.to_string();
                true
            }
            None => false,
        }
    }

    /// Replace `local` with the server-issued event code.
    pub fn confirm_event(&mut self, local: &str, server: &str) -> bool {
        if local == server {
            return false;
        }
        match self.events.values_mut().find(|code| code.as_str() == local) {
            Some(code) => {
                *code = server.to_string();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.screens.len() + self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
