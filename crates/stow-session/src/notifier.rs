//! Session lifecycle and attribute notifications.

use tracing::{debug, trace};

use crate::attribute::AttributeValue;
use crate::data::SessionData;

/// Receives lifecycle and attribute events.
///
/// All methods default to no-ops so implementors only override what they
/// observe. Implementations must not call back into the façade that fired
/// the event.
pub trait SessionNotifier: Send + Sync {
    fn session_created(&self, _session: &SessionData) {}

    fn session_destroyed(&self, _session: &SessionData, _expired: bool) {}

    fn session_id_changed(&self, _session: &SessionData, _old_id: &str) {}

    fn attribute_added(&self, _session: &SessionData, _name: &str, _value: &AttributeValue) {}

    fn attribute_replaced(
        &self,
        _session: &SessionData,
        _name: &str,
        _old: &AttributeValue,
        _new: &AttributeValue,
    ) {
    }

    fn attribute_removed(&self, _session: &SessionData, _name: &str, _old: &AttributeValue) {}

    /// First read of an attribute from the repository during this use.
    fn attribute_restored(&self, _session: &SessionData, _name: &str, _value: &AttributeValue) {}

    /// An attribute is about to be written by a commit.
    fn attribute_being_stored(&self, _session: &SessionData, _name: &str, _value: &AttributeValue) {
    }
}

/// Notifier that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl SessionNotifier for NoopNotifier {}

/// Notifier that logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl SessionNotifier for TracingNotifier {
    fn session_created(&self, session: &SessionData) {
        debug!(session_id = %session.id(), "Session created");
    }

    fn session_destroyed(&self, session: &SessionData, expired: bool) {
        debug!(session_id = %session.id(), expired, "Session destroyed");
    }

    fn session_id_changed(&self, session: &SessionData, old_id: &str) {
        debug!(session_id = %session.id(), old_id = %old_id, "Session id changed");
    }

    fn attribute_added(&self, session: &SessionData, name: &str, _value: &AttributeValue) {
        trace!(session_id = %session.id(), attribute = name, "Attribute added");
    }

    fn attribute_replaced(
        &self,
        session: &SessionData,
        name: &str,
        _old: &AttributeValue,
        _new: &AttributeValue,
    ) {
        trace!(session_id = %session.id(), attribute = name, "Attribute replaced");
    }

    fn attribute_removed(&self, session: &SessionData, name: &str, _old: &AttributeValue) {
        trace!(session_id = %session.id(), attribute = name, "Attribute removed");
    }
}

#[cfg(any(test, feature = "testing"))]
pub use recording::{NotifierEvent, RecordingNotifier};

#[cfg(any(test, feature = "testing"))]
mod recording {
    use parking_lot::Mutex;

    use super::*;

    /// Event captured by [`RecordingNotifier`].
    #[derive(Debug, Clone, PartialEq)]
    pub enum NotifierEvent {
        Created(String),
        Destroyed { id: String, expired: bool },
        IdChanged { old: String, new: String },
        Added(String, AttributeValue),
        Replaced(String, AttributeValue, AttributeValue),
        Removed(String, AttributeValue),
        Restored(String, AttributeValue),
        BeingStored(String, AttributeValue),
    }

    /// Notifier that records every event for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        events: Mutex<Vec<NotifierEvent>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<NotifierEvent> {
            self.events.lock().clone()
        }

        pub fn clear(&self) {
            self.events.lock().clear();
        }

        fn push(&self, event: NotifierEvent) {
            self.events.lock().push(event);
        }
    }

    impl SessionNotifier for RecordingNotifier {
        fn session_created(&self, session: &SessionData) {
            self.push(NotifierEvent::Created(session.id().to_string()));
        }

        fn session_destroyed(&self, session: &SessionData, expired: bool) {
            self.push(NotifierEvent::Destroyed {
                id: session.id().to_string(),
                expired,
            });
        }

        fn session_id_changed(&self, session: &SessionData, old_id: &str) {
            self.push(NotifierEvent::IdChanged {
                old: old_id.to_string(),
                new: session.id().to_string(),
            });
        }

        fn attribute_added(&self, _session: &SessionData, name: &str, value: &AttributeValue) {
            self.push(NotifierEvent::Added(name.to_string(), value.clone()));
        }

        fn attribute_replaced(
            &self,
            _session: &SessionData,
            name: &str,
            old: &AttributeValue,
            new: &AttributeValue,
        ) {
            self.push(NotifierEvent::Replaced(
                name.to_string(),
                old.clone(),
                new.clone(),
            ));
        }

        fn attribute_removed(&self, _session: &SessionData, name: &str, old: &AttributeValue) {
            self.push(NotifierEvent::Removed(name.to_string(), old.clone()));
        }

        fn attribute_restored(&self, _session: &SessionData, name: &str, value: &AttributeValue) {
            self.push(NotifierEvent::Restored(name.to_string(), value.clone()));
        }

        fn attribute_being_stored(
            &self,
            _session: &SessionData,
            name: &str,
            value: &AttributeValue,
        ) {
            self.push(NotifierEvent::BeingStored(name.to_string(), value.clone()));
        }
    }
}
