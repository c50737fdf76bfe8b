//! Tracks in-flight sends so lifecycle-sensitive callers can wait for them.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Default)]
struct PendingState {
    next_id: u64,
    in_flight: BTreeSet<u64>,
}

impl PendingState {
    /// Id of the oldest send still in flight, or the next id to be handed
    /// out when nothing is in flight. Never decreases.
    fn oldest(&self) -> u64 {
        self.in_flight.first().copied().unwrap_or(self.next_id)
    }
}

/// Counter of in-flight sends.
///
/// Sends are numbered in start order. [`PendingSends::wait_for_pending`]
/// waits until the oldest in-flight id passes the id the next send would
/// get, which means every send started before the call has finished.
pub struct PendingSends {
    state: Mutex<PendingState>,
    oldest: watch::Sender<u64>,
}

impl PendingSends {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PendingState::default()),
            oldest: watch::Sender::new(0),
        }
    }

    /// Register a send; it counts as pending until the guard drops.
    pub fn begin(self: &Arc<Self>) -> PendingSendGuard {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.in_flight.insert(id);
        self.oldest.send_replace(state.oldest());
        PendingSendGuard {
            pending: Arc::clone(self),
            id,
        }
    }

    fn finish(&self, id: u64) {
        let mut state = self.state.lock();
        state.in_flight.remove(&id);
        self.oldest.send_replace(state.oldest());
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Resolve once every send in flight at the time of the call is done.
    /// Sends started later do not delay it.
    pub async fn wait_for_pending(&self) {
        let mut oldest = self.oldest.subscribe();
        let target = self.state.lock().next_id;
        // The sender lives as long as `self`, so this cannot fail.
        let _ = oldest.wait_for(|oldest| *oldest >= target).await;
    }
}

impl Default for PendingSends {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks one send as in flight until dropped.
pub struct PendingSendGuard {
    pending: Arc<PendingSends>,
    id: u64,
}

impl Drop for PendingSendGuard {
    fn drop(&mut self) {
        self.pending.finish(self.id);
    }
}
