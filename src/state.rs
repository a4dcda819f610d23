use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Connection lifecycle of a [`crate::session::VoiceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// A condvar-backed state cell so callers and internal threads can both
/// observe and wait on transitions.
pub(crate) struct StateCell {
    state: Mutex<ConnectionState>,
    cond: Condvar,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            cond: Condvar::new(),
        }
    }
}

impl StateCell {
    pub fn get(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Stores the new state and returns the previous one.
    pub fn set(&self, next: ConnectionState) -> ConnectionState {
        let mut guard = self.state.lock();
        let previous = *guard;
        *guard = next;
        self.cond.notify_all();
        previous
    }

    /// Blocks until the cell holds `target`, or until the timeout runs
    /// out. Returns whether the target state was observed.
    pub fn wait_for(&self, target: ConnectionState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock();
        while *guard != target {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if self.cond.wait_for(&mut guard, deadline - now).timed_out() {
                return *guard == target;
            }
        }
        true
    }
}
