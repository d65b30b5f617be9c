//! Change notification listeners.
//!
//! Listeners are notified of genuinely new additions and actual removals,
//! exactly once per fact; staged duplicates do not notify.

use parking_lot::Mutex;
use std::sync::Arc;
use stratum_db_core::Statement;

/// Receives statement-level change notifications from a connection
pub trait ConnectionListener: Send + Sync {
    /// A statement not previously present was added
    fn statement_added(&self, st: &Statement);

    /// A present statement was removed
    fn statement_removed(&self, st: &Statement);
}

/// The per-connection listener set
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.lock().push(listener);
    }

    pub(crate) fn remove(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    pub(crate) fn notify_added(&self, st: &Statement) {
        for listener in self.listeners.lock().iter() {
            listener.statement_added(st);
        }
    }

    pub(crate) fn notify_removed(&self, st: &Statement) {
        for listener in self.listeners.lock().iter() {
            listener.statement_removed(st);
        }
    }
}
