//! Event model: domain event trait, version/timestamp header, and the
//! fully-qualified event record appended to the log.
//!
//! This module provides the foundational data types that the actor,
//! archive, and storage layers all depend on. No I/O occurs here.

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Primary key of an aggregate.
///
/// Implemented for the three supported key shapes: `i64`, `String`, and
/// [`Uuid`]. The bounds cover everything the core needs: map keys in
/// storage backends, structured log fields, and serde round-trips.
pub trait StateId:
    Clone + Eq + Hash + Debug + Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl StateId for i64 {}
impl StateId for String {}
impl StateId for Uuid {}

/// A domain event an aggregate can produce and apply.
///
/// The type code identifies the concrete event on the wire; it is carried
/// in the transport envelope so consumers can route without deserializing
/// the payload. Domain events conventionally use adjacently tagged serde
/// (`#[serde(tag = "type", content = "data")]`).
pub trait Event: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable wire identifier for this event (e.g. `"order.placed"`).
    fn type_code(&self) -> &'static str;
}

/// Version and wall-clock header stamped on every committed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBasicInfo {
    /// Position in the aggregate's event sequence, starting at 1.
    pub version: u64,
    /// Milliseconds since the Unix epoch. Retro-dated events may carry a
    /// timestamp earlier than previously committed events.
    pub timestamp: i64,
}

/// A domain event together with its aggregate identity and header -- the
/// record shape appended to and read back from the event log.
///
/// Invariant at the append call site: `basic_info.version` equals the
/// aggregate's committed version plus one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize, E: Serialize",
    deserialize = "K: DeserializeOwned, E: DeserializeOwned"
))]
pub struct FullyEvent<K, E> {
    /// Primary key of the aggregate that raised the event.
    pub state_id: K,
    /// Version and timestamp header.
    pub basic_info: EventBasicInfo,
    /// The domain event payload.
    pub event: E,
}

impl<K: StateId, E: Event> FullyEvent<K, E> {
    /// The deduplication token for this event when the caller supplied no
    /// [`EventUid`]: the event's natural identity `"{state_id}_{version}"`.
    pub fn natural_key(&self) -> String {
        format!("{}_{}", self.state_id, self.basic_info.version)
    }
}

/// Caller-supplied idempotency token for a raise.
///
/// Carries both the deduplication key and the event timestamp, so a retried
/// raise reproduces the exact same event identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventUid {
    /// Unique key deduplicated by the event log per aggregate.
    pub unique_id: String,
    /// Timestamp (ms since epoch) to stamp on the event.
    pub timestamp: i64,
}

impl EventUid {
    /// Build a uid from a key and timestamp.
    pub fn new(unique_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            unique_id: unique_id.into(),
            timestamp,
        }
    }
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::CounterEvent;
    use super::*;

    #[test]
    fn natural_key_combines_id_and_version() {
        let fully = FullyEvent {
            state_id: "c-1".to_string(),
            basic_info: EventBasicInfo {
                version: 7,
                timestamp: 1_000,
            },
            event: CounterEvent::Incremented,
        };
        assert_eq!(fully.natural_key(), "c-1_7");
    }

    #[test]
    fn fully_event_roundtrips_through_json() {
        let fully = FullyEvent {
            state_id: 42i64,
            basic_info: EventBasicInfo {
                version: 1,
                timestamp: 500,
            },
            event: CounterEvent::Added { amount: 3 },
        };

        let bytes = serde_json::to_vec(&fully).expect("serialize should succeed");
        let back: FullyEvent<i64, CounterEvent> =
            serde_json::from_slice(&bytes).expect("deserialize should succeed");

        assert_eq!(back.state_id, 42);
        assert_eq!(back.basic_info, fully.basic_info);
        assert_eq!(back.event, fully.event);
    }

    #[test]
    fn type_code_distinguishes_variants() {
        assert_eq!(CounterEvent::Incremented.type_code(), "counter.incremented");
        assert_eq!(
            CounterEvent::Added { amount: 1 }.type_code(),
            "counter.added"
        );
    }

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        assert!(a > 1_500_000_000_000, "expected a modern epoch, got {a}");
    }
}
