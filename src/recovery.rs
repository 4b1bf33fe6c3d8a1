//! Asking the runtime to restore an actor from its checkpoint.
//!
//! The coordinator does not restore state itself. It emits a
//! [`RecoveryEvent`] on the actor prototype's recovery stream and the
//! application routes it to whatever rebuilds the actor, usually by
//! calling [`crate::CheckpointCoordinator::fetch`].

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::DispatchError;
use crate::identity::ActorIdentity;

/// Request to restore the actor named by `identity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub identity: ActorIdentity,
    pub requested_at: DateTime<Utc>,
}

impl RecoveryEvent {
    pub fn new(identity: ActorIdentity) -> Self {
        Self {
            identity,
            requested_at: Utc::now(),
        }
    }

    /// Stream this event is dispatched on.
    pub fn stream_name(&self) -> String {
        recovery_stream_name(&self.identity)
    }
}

/// `<prototype>_recovery`
pub fn recovery_stream_name(identity: &ActorIdentity) -> String {
    format!("{}_recovery", identity.prototype())
}

/// Delivers recovery events into the application's event streams.
pub trait EventDispatcher: Send + Sync + 'static {
    fn dispatch(&self, stream_name: &str, event: RecoveryEvent) -> Result<(), DispatchError>;
}

#[test]
fn stream_is_named_after_prototype() {
    let event = RecoveryEvent::new(ActorIdentity::new("Counter", "k1"));
    assert_eq!(event.stream_name(), "Counter_recovery");
}

#[test]
fn event_serializes_with_timestamp() {
    let event = RecoveryEvent::new(ActorIdentity::new("Counter", "k1"));
    let json = serde_json::to_string(&event).unwrap();
    let found: RecoveryEvent = serde_json::from_str(&json).unwrap();
    assert_eq!(found, event);
}
