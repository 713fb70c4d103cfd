//! Storage gateway interfaces: the only shared surface between actors.
//!
//! The core consumes three durable stores -- the event log, the snapshot
//! store, and the archive store -- through the traits below. Backends are
//! host-provided and must be safe for concurrent use across actors;
//! per-`(state_id, version)` atomicity is required of the event log.
//! Within a single actor all calls are sequential.

use async_trait::async_trait;
use uuid::Uuid;

use crate::archive::ArchiveBrief;
use crate::error::StorageError;
use crate::event::{Event, FullyEvent, StateId};
use crate::snapshot::Snapshot;
use crate::state::State;

/// Append/range-read/prune access to the durable event log.
#[async_trait]
pub trait EventStorage<K: StateId, E: Event>: Send + Sync {
    /// Persist one event atomically, keyed by `(state_id, version)` and by
    /// `unique_key` for deduplication.
    ///
    /// Returns `false` if either key already exists -- the caller treats
    /// that as a benign duplicate, not a fault. `payload` carries the
    /// serialized event body for backends that store bytes verbatim.
    ///
    /// # Errors
    ///
    /// [`StorageError`] for infrastructure faults only.
    async fn append(
        &self,
        event: &FullyEvent<K, E>,
        payload: &[u8],
        unique_key: &str,
    ) -> Result<bool, StorageError>;

    /// Read events with `version` in `from_version..=to_version`, ascending
    /// by version.
    ///
    /// `from_timestamp` is a read hint: implementations may use it to skip
    /// partitions that cannot contain events in the range.
    async fn get_range(
        &self,
        state_id: &K,
        from_timestamp: i64,
        from_version: u64,
        to_version: u64,
    ) -> Result<Vec<FullyEvent<K, E>>, StorageError>;

    /// Remove events with `version <= up_to_version` from `from_timestamp`
    /// onward.
    async fn delete_previous(
        &self,
        state_id: &K,
        up_to_version: u64,
        from_timestamp: i64,
    ) -> Result<(), StorageError>;
}

/// Insert/update/flag/delete access to persisted snapshots.
#[async_trait]
pub trait SnapshotStorage<K: StateId, S: State>: Send + Sync {
    /// Fetch the persisted snapshot for an aggregate, if any.
    async fn get(&self, state_id: &K) -> Result<Option<Snapshot<K, S>>, StorageError>;

    /// First write of an aggregate's snapshot row.
    async fn insert(&self, snapshot: &Snapshot<K, S>) -> Result<(), StorageError>;

    /// Subsequent full write of an aggregate's snapshot row.
    async fn update(&self, snapshot: &Snapshot<K, S>) -> Result<(), StorageError>;

    /// Flip only the `is_latest` flag on the stored row.
    async fn update_is_latest(&self, state_id: &K, is_latest: bool) -> Result<(), StorageError>;

    /// Lower only the stored recovery read bound.
    async fn update_latest_min_event_timestamp(
        &self,
        state_id: &K,
        timestamp: i64,
    ) -> Result<(), StorageError>;

    /// Lower only the stored earliest-event timestamp.
    async fn update_start_timestamp(&self, state_id: &K, timestamp: i64)
    -> Result<(), StorageError>;

    /// Flip only the terminal flag on the stored row.
    async fn over(&self, state_id: &K, is_over: bool) -> Result<(), StorageError>;

    /// Remove the aggregate's snapshot row.
    async fn delete(&self, state_id: &K) -> Result<(), StorageError>;
}

/// Archive store access: brief metadata, snapshot bodies, and the
/// archive-event overflow used by the `Move` clearing policy.
#[async_trait]
pub trait ArchiveStorage<K: StateId, S: State>: Send + Sync {
    /// All archive briefs for an aggregate, sorted ascending by index.
    async fn get_briefs(&self, state_id: &K) -> Result<Vec<ArchiveBrief>, StorageError>;

    /// The snapshot body captured at the given archive's end version.
    async fn get_by_id(&self, brief_id: &Uuid) -> Result<Option<Snapshot<K, S>>, StorageError>;

    /// Persist a promoted archive: brief metadata plus the snapshot at its
    /// end version.
    async fn insert(
        &self,
        state_id: &K,
        brief: &ArchiveBrief,
        snapshot: &Snapshot<K, S>,
    ) -> Result<(), StorageError>;

    /// Remove a single archive (brief and body).
    async fn delete(&self, state_id: &K, brief_id: &Uuid) -> Result<(), StorageError>;

    /// Remove every archive of an aggregate.
    async fn delete_all(&self, state_id: &K) -> Result<(), StorageError>;

    /// Mark a brief's covered events as cleared from the hot log.
    async fn event_is_clear(&self, state_id: &K, brief_id: &Uuid) -> Result<(), StorageError>;

    /// Bulk-move events with `version <= end_version` into archive-event
    /// storage, scanning from `start_timestamp` onward.
    async fn event_archive(
        &self,
        state_id: &K,
        end_version: u64,
        start_timestamp: i64,
    ) -> Result<(), StorageError>;

    /// Flip the terminal flag on the aggregate's archive records.
    async fn over(&self, state_id: &K, is_over: bool) -> Result<(), StorageError>;
}
