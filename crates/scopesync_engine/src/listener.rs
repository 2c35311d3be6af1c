//! Optional observers attached to sessions and peers.
//!
//! Listeners are never required for correctness. Every hook has a no-op
//! default, so an implementation only overrides what it cares about. The one
//! hook with influence is [`SessionListener::on_setup_conflict`], which may
//! choose the conflict action and supply reconciled setups.

use crate::negotiator::SetupConflict;
use crate::session::SessionState;
use scopesync_protocol::{BatchPartInfo, PartAck, RowFailure};
use std::sync::Arc;
use uuid::Uuid;

/// Callbacks fired while a session runs.
pub trait SessionListener: Send + Sync {
    /// A session moved between states.
    fn on_state_change(&self, _session_id: Uuid, _from: SessionState, _to: SessionState) {}

    /// Two setups disagree. The listener may change the action and the resolved setups.
    fn on_setup_conflict(&self, _conflict: &mut SetupConflict) {}

    /// The peer acknowledged an uploaded part.
    fn on_part_uploaded(&self, _session_id: Uuid, _ack: &PartAck) {}

    /// A part of the remote batch arrived.
    fn on_part_downloaded(&self, _session_id: Uuid, _part: &BatchPartInfo) {}

    /// A row failed to apply.
    fn on_apply_failure(&self, _session_id: Uuid, _failure: &RowFailure) {}
}

/// Ordered set of listeners.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Vec<Arc<dyn SessionListener>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ListenerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener. Listeners run in registration order.
    pub fn register(&mut self, listener: Arc<dyn SessionListener>) {
        self.listeners.push(listener);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Returns true if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn state_changed(&self, session_id: Uuid, from: SessionState, to: SessionState) {
        for listener in &self.listeners {
            listener.on_state_change(session_id, from, to);
        }
    }

    pub(crate) fn setup_conflict(&self, conflict: &mut SetupConflict) {
        for listener in &self.listeners {
            listener.on_setup_conflict(conflict);
        }
    }

    pub(crate) fn part_uploaded(&self, session_id: Uuid, ack: &PartAck) {
        for listener in &self.listeners {
            listener.on_part_uploaded(session_id, ack);
        }
    }

    pub(crate) fn part_downloaded(&self, session_id: Uuid, part: &BatchPartInfo) {
        for listener in &self.listeners {
            listener.on_part_downloaded(session_id, part);
        }
    }

    pub(crate) fn apply_failed(&self, session_id: Uuid, failure: &RowFailure) {
        for listener in &self.listeners {
            listener.on_apply_failure(session_id, failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        transitions: Mutex<Vec<(SessionState, SessionState)>>,
    }

    impl SessionListener for Recorder {
        fn on_state_change(&self, _session_id: Uuid, from: SessionState, to: SessionState) {
            self.transitions.lock().push((from, to));
        }
    }

    struct Silent;
    impl SessionListener for Silent {}

    #[test]
    fn listeners_run_in_order_and_defaults_are_no_ops() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = ListenerRegistry::new();
        registry.register(Arc::new(Silent));
        registry.register(recorder.clone());
        assert_eq!(registry.len(), 2);

        registry.state_changed(Uuid::nil(), SessionState::Idle, SessionState::Negotiating);
        registry.part_uploaded(
            Uuid::nil(),
            &PartAck {
                index: 0,
                applied_rows: 0,
                failures: Vec::new(),
            },
        );

        assert_eq!(
            *recorder.transitions.lock(),
            vec![(SessionState::Idle, SessionState::Negotiating)]
        );
    }
}
