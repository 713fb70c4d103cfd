//! In-memory aggregate snapshot: user payload plus the bookkeeping header
//! that carries the two-phase version discipline.
//!
//! The header advances in two steps on every raise: `increment_doing_version`
//! before the append, `update_version` after the apply. A failed append rolls
//! back with `decrement_doing_version`. The split counter is what lets the
//! runtime detect a torn commit after a crash or storage fault -- it must not
//! be collapsed into a single counter.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ActorError;
use crate::event::{EventBasicInfo, StateId};

/// Bookkeeping header of an aggregate snapshot.
///
/// `doing_version` is always `version` or `version + 1`; after every
/// successful append+apply cycle the two are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(serialize = "K: Serialize", deserialize = "K: DeserializeOwned"))]
pub struct SnapshotBase<K> {
    /// Primary key of the aggregate.
    pub state_id: K,
    /// Monotonically non-decreasing committed event version. Starts at 0.
    pub version: u64,
    /// Version currently being committed.
    pub doing_version: u64,
    /// Timestamp (ms) of the earliest event ever applied. May decrease when
    /// retro-dated events arrive.
    pub start_timestamp: i64,
    /// Lower bound used by the event log reader to scope range scans during
    /// recovery. May decrease when retro-dated events are raised.
    pub latest_min_event_timestamp: i64,
    /// True iff no unpersisted events exist since the last snapshot flush.
    pub is_latest: bool,
    /// Terminal flag; once true the snapshot rejects further events.
    pub is_over: bool,
}

impl<K: StateId> SnapshotBase<K> {
    /// Fresh header for an aggregate with no history.
    pub fn new(state_id: K) -> Self {
        Self {
            state_id,
            version: 0,
            doing_version: 0,
            start_timestamp: 0,
            latest_min_event_timestamp: 0,
            is_latest: false,
            is_over: false,
        }
    }

    /// Begin committing the next event.
    ///
    /// # Errors
    ///
    /// [`ActorError::StateInsecurity`] if a previous commit is still in
    /// flight (`doing_version != version`).
    pub fn increment_doing_version(&mut self) -> Result<(), ActorError> {
        if self.doing_version != self.version {
            return Err(self.insecurity());
        }
        self.doing_version = self.version + 1;
        Ok(())
    }

    /// Roll back a begun commit after a failed or duplicate append.
    pub fn decrement_doing_version(&mut self) {
        self.doing_version = self.version;
    }

    /// Commit the event whose header is `info`: `version` catches up to
    /// `doing_version` and the event timestamp is folded into the
    /// timestamp bounds.
    ///
    /// # Errors
    ///
    /// [`ActorError::StateInsecurity`] if `info.version` is not the version
    /// currently being committed.
    pub fn update_version(&mut self, info: &EventBasicInfo) -> Result<(), ActorError> {
        if self.doing_version != info.version {
            return Err(self.insecurity());
        }
        let first_event = self.version == 0;
        self.version = self.doing_version;
        if first_event {
            self.start_timestamp = info.timestamp;
            self.latest_min_event_timestamp = info.timestamp;
        } else if info.timestamp < self.start_timestamp {
            self.start_timestamp = info.timestamp;
        }
        Ok(())
    }

    fn insecurity(&self) -> ActorError {
        ActorError::StateInsecurity {
            state_id: self.state_id.to_string(),
            version: self.version,
            doing_version: self.doing_version,
        }
    }
}

/// A point-in-time aggregate snapshot: bookkeeping header plus user payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize, S: Serialize",
    deserialize = "K: DeserializeOwned, S: DeserializeOwned"
))]
pub struct Snapshot<K, S> {
    /// Version, timestamp, and lifecycle bookkeeping.
    pub base: SnapshotBase<K>,
    /// The aggregate payload at `base.version`.
    pub state: S,
}

impl<K: StateId, S> Snapshot<K, S> {
    /// Fresh snapshot at version 0 holding the given payload.
    pub fn new(state_id: K, state: S) -> Self {
        Self {
            base: SnapshotBase::new(state_id),
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(version: u64, timestamp: i64) -> EventBasicInfo {
        EventBasicInfo { version, timestamp }
    }

    #[test]
    fn fresh_base_starts_at_version_zero() {
        let base = SnapshotBase::new("a-1".to_string());
        assert_eq!(base.version, 0);
        assert_eq!(base.doing_version, 0);
        assert!(!base.is_latest);
        assert!(!base.is_over);
    }

    #[test]
    fn two_phase_commit_advances_both_counters() {
        let mut base = SnapshotBase::new("a-1".to_string());

        base.increment_doing_version()
            .expect("increment should succeed");
        assert_eq!(base.doing_version, 1);
        assert_eq!(base.version, 0);

        base.update_version(&info(1, 100))
            .expect("commit should succeed");
        assert_eq!(base.version, 1);
        assert_eq!(base.doing_version, 1);
    }

    #[test]
    fn increment_while_in_flight_is_insecure() {
        let mut base = SnapshotBase::new("a-1".to_string());
        base.increment_doing_version()
            .expect("first increment should succeed");

        let err = base
            .increment_doing_version()
            .expect_err("second increment must fail");
        assert!(matches!(err, ActorError::StateInsecurity { .. }));
    }

    #[test]
    fn commit_with_wrong_version_is_insecure() {
        let mut base = SnapshotBase::new("a-1".to_string());
        base.increment_doing_version()
            .expect("increment should succeed");

        let err = base
            .update_version(&info(5, 100))
            .expect_err("committing the wrong version must fail");
        assert!(matches!(err, ActorError::StateInsecurity { .. }));
    }

    #[test]
    fn decrement_rolls_back_a_failed_append() {
        let mut base = SnapshotBase::new("a-1".to_string());
        base.increment_doing_version()
            .expect("increment should succeed");

        base.decrement_doing_version();
        assert_eq!(base.doing_version, base.version);

        // The next raise can begin cleanly at the same version.
        base.increment_doing_version()
            .expect("increment after rollback should succeed");
        assert_eq!(base.doing_version, 1);
    }

    #[test]
    fn first_event_sets_both_timestamp_bounds() {
        let mut base = SnapshotBase::new("a-1".to_string());
        base.increment_doing_version().unwrap();
        base.update_version(&info(1, 250)).unwrap();

        assert_eq!(base.start_timestamp, 250);
        assert_eq!(base.latest_min_event_timestamp, 250);
    }

    #[test]
    fn retro_dated_event_lowers_start_timestamp() {
        let mut base = SnapshotBase::new("a-1".to_string());
        base.increment_doing_version().unwrap();
        base.update_version(&info(1, 200)).unwrap();

        base.increment_doing_version().unwrap();
        base.update_version(&info(2, 50)).unwrap();

        assert_eq!(base.start_timestamp, 50);
    }

    #[test]
    fn later_event_keeps_start_timestamp() {
        let mut base = SnapshotBase::new("a-1".to_string());
        base.increment_doing_version().unwrap();
        base.update_version(&info(1, 200)).unwrap();

        base.increment_doing_version().unwrap();
        base.update_version(&info(2, 900)).unwrap();

        assert_eq!(base.start_timestamp, 200);
    }

    #[test]
    fn snapshot_roundtrips_through_json() {
        let snapshot = Snapshot::new(7i64, crate::event::test_fixtures::Counter { value: 3 });
        let json = serde_json::to_string(&snapshot).expect("serialize should succeed");
        let back: Snapshot<i64, crate::event::test_fixtures::Counter> =
            serde_json::from_str(&json).expect("deserialize should succeed");
        assert_eq!(back, snapshot);
    }
}
