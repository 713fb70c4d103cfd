//! State trait: the user-supplied aggregate payload and its event applier.

use serde::{Serialize, de::DeserializeOwned};

use crate::event::Event;

/// A domain aggregate payload whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state. State is
/// built by folding domain events through the [`apply`](State::apply)
/// method; the runtime wraps it in a versioned snapshot and guarantees each
/// event is applied exactly once per committed version.
///
/// # Contract
///
/// - [`apply`](State::apply) must be a pure, total, deterministic function:
///   no I/O, no side effects. It takes ownership of the current state and a
///   reference to a domain event, returning the next state. It may be
///   re-invoked for the same event during recovery replays; idempotence
///   follows from version gating by the runtime, not from the applier.
pub trait State: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The set of events this aggregate can produce and apply.
    type Event: Event;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::Event) -> Self;

    /// Construct the initial payload for an aggregate with no history.
    ///
    /// Called when recovery finds neither a stored snapshot nor an archive.
    fn create() -> Self {
        Self::default()
    }

    /// Notification that the owning actor deactivated after doing
    /// meaningful work (it had unpersisted progress that was flushed).
    ///
    /// A deactivation that found the snapshot already current does not
    /// fire this hook.
    fn on_deactivated(&self) {}
}
