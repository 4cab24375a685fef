//! Connectivity state tracking.
//!
//! The transport starts READY, drops to TRANSIENT_FAILURE when the peer
//! announces a GOAWAY, and ends at SHUTDOWN on close. Watchers subscribe
//! through the transport-op surface; notifications are handed back to
//! the combiner as after-turn callbacks so user code never runs under
//! the state lock.

use tracing::debug;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Ready,
    Connecting,
    TransientFailure,
    Idle,
    Shutdown,
}

pub type ConnectivityWatcher =
    Box<dyn FnMut(ConnectivityState, Option<&TransportError>) + Send + 'static>;

pub(crate) struct StateTracker {
    name: &'static str,
    state: ConnectivityState,
    watchers: Vec<(u64, ConnectivityWatcher)>,
}

impl StateTracker {
    pub fn new(name: &'static str, state: ConnectivityState) -> Self {
        Self {
            name,
            state,
            watchers: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn add_watcher(&mut self, id: u64, mut watcher: ConnectivityWatcher) {
        // New watchers observe the current state immediately.
        watcher(self.state, None);
        self.watchers.push((id, watcher));
    }

    pub fn remove_watcher(&mut self, id: u64) {
        self.watchers.retain(|(watcher_id, _)| *watcher_id != id);
    }

    /// Transition and notify. SHUTDOWN is terminal.
    pub fn set_state(
        &mut self,
        state: ConnectivityState,
        error: Option<&TransportError>,
        reason: &'static str,
    ) {
        if self.state == ConnectivityState::Shutdown || self.state == state {
            return;
        }
        debug!(
            tracker = self.name,
            from = ?self.state,
            to = ?state,
            reason,
            "connectivity state change"
        );
        self.state = state;
        for (_, watcher) in &mut self.watchers {
            watcher(state, error);
        }
    }
}
