//! Online dispatch queue.
//!
//! Three FIFO lanes, one per priority, drained by a single consumer. While
//! the lower-priority gate is closed only the First lane is served; Second
//! and Third items stay queued until it reopens.

use crate::envelope::{Priority, RequestEnvelope};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::debug;

struct QueueState {
    lanes: [VecDeque<RequestEnvelope>; 3],
    lower_priority_enabled: bool,
    closed: bool,
}

impl QueueState {
    fn pop_ready(&mut self) -> Option<RequestEnvelope> {
        if let Some(envelope) = self.lanes[Priority::First.index()].pop_front() {
            return Some(envelope);
        }
        if !self.lower_priority_enabled {
            return None;
        }
        self.lanes[Priority::Second.index()]
            .pop_front()
            .or_else(|| self.lanes[Priority::Third.index()].pop_front())
    }
}

/// Snapshot of queue depth per lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub first: usize,
    pub second: usize,
    pub third: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.first + self.second + self.third
    }
}

/// In-memory priority queue with a lower-priority gate.
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                lower_priority_enabled: true,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append to the tail of the envelope's priority lane.
    pub fn push(&self, envelope: RequestEnvelope) {
        {
            let mut state = self.state.lock();
            if state.closed {
                debug!(url = %envelope.destination(), "Dispatch queue closed, envelope dropped");
                return;
            }
            state.lanes[envelope.priority().index()].push_back(envelope);
        }
        self.notify.notify_one();
    }

    /// Open or close the lower-priority gate.
    pub fn set_lower_priority_enabled(&self, enabled: bool) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.lower_priority_enabled != enabled;
            state.lower_priority_enabled = enabled;
            changed
        };
        if changed {
            debug!(enabled, "Lower-priority processing gate changed");
        }
        if enabled {
            self.notify.notify_one();
        }
    }

    pub fn lower_priority_enabled(&self) -> bool {
        self.state.lock().lower_priority_enabled
    }

    /// Wait for the next dispatchable envelope.
    ///
    /// Returns `None` once the queue is closed and nothing dispatchable is left.
    pub async fn next(&self) -> Option<RequestEnvelope> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(envelope) = state.pop_ready() {
                    return Some(envelope);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`next`](Self::next).
    pub fn try_next(&self) -> Option<RequestEnvelope> {
        self.state.lock().pop_ready()
    }

    /// Stop accepting envelopes and wake the consumer so it can exit.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn depth(&self) -> QueueDepth {
        let state = self.state.lock();
        QueueDepth {
            first: state.lanes[0].len(),
            second: state.lanes[1].len(),
            third: state.lanes[2].len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Classification, Parameters};
    use crate::route::Route;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    fn envelope(route: Route, tag: &str) -> RequestEnvelope {
        let mut params = Parameters::new();
        params.insert("tag".into(), Value::from(tag));
        RequestEnvelope::new("https://x", route, params, Classification::Online, None)
    }

    fn tag(envelope: &RequestEnvelope) -> &str {
        envelope.parameters()["tag"].as_str().unwrap_or_default()
    }

    #[test]
    fn strict_priority_then_fifo() {
        let queue = DispatchQueue::new();
        queue.push(envelope(Route::SendEvent, "e1"));
        queue.push(envelope(Route::ScreenStart, "s1"));
        queue.push(envelope(Route::SendEvent, "e2"));
        queue.push(envelope(Route::SessionStart, "v1"));
        queue.push(envelope(Route::ScreenEnd, "s2"));

        let order: Vec<String> = std::iter::from_fn(|| queue.try_next())
            .map(|e| tag(&e).to_string())
            .collect();
        assert_eq!(order, vec!["v1", "s1", "s2", "e1", "e2"]);
    }

    #[test]
    fn closed_gate_serves_only_first_lane() {
        let queue = DispatchQueue::new();
        queue.set_lower_priority_enabled(false);
        queue.push(envelope(Route::SendEvent, "e1"));
        queue.push(envelope(Route::ScreenStart, "s1"));
        queue.push(envelope(Route::SessionEnd, "v1"));

        assert_eq!(queue.try_next().map(|e| tag(&e).to_string()).as_deref(), Some("v1"));
        assert!(queue.try_next().is_none());
        assert_eq!(queue.depth(), QueueDepth { first: 0, second: 1, third: 1 });

        queue.set_lower_priority_enabled(true);
        assert_eq!(queue.try_next().map(|e| tag(&e).to_string()).as_deref(), Some("s1"));
        assert_eq!(queue.try_next().map(|e| tag(&e).to_string()).as_deref(), Some("e1"));
    }

    #[tokio::test]
    async fn next_waits_for_gate_to_reopen() {
        let queue = Arc::new(DispatchQueue::new());
        queue.set_lower_priority_enabled(false);
        queue.push(envelope(Route::SendEvent, "held"));

        let waiting = tokio::time::timeout(Duration::from_millis(50), queue.next()).await;
        assert!(waiting.is_err(), "third-priority item must stay held");

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await.map(|e| tag(&e).to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.set_lower_priority_enabled(true);

        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("held"));
    }

    #[tokio::test]
    async fn next_wakes_on_push_and_ends_on_close() {
        let queue = Arc::new(DispatchQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(e) = queue.next().await {
                    seen.push(tag(&e).to_string());
                }
                seen
            })
        };

        queue.push(envelope(Route::SessionStart, "a"));
        queue.push(envelope(Route::SendEvent, "b"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        queue.push(envelope(Route::SendEvent, "late"));

        let seen = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, vec!["a", "b"]);
    }
}
