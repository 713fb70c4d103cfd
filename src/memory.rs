//! In-process storage, bus, and observer backends.
//!
//! `MemoryStore` implements all three storage gateways over mutex-guarded
//! maps; `MemoryEventBus` and `MemoryObserverUnit` are recording, failable
//! counterparts for the bus and observer seams. The crate's own tests run
//! against these, and embedding hosts can use them for ephemeral aggregates
//! or harnesses. Locks are `std::sync::Mutex` and are held only across
//! short, non-awaiting sections.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::archive::ArchiveBrief;
use crate::bus::EventBusProducer;
use crate::error::StorageError;
use crate::event::{FullyEvent, StateId};
use crate::observer::{EventHandler, ObserverUnit};
use crate::snapshot::Snapshot;
use crate::state::State;
use crate::storage::{ArchiveStorage, EventStorage, SnapshotStorage};

/// All durable state of the in-memory backend for one aggregate type.
struct Inner<K, S: State> {
    /// Hot event log, version-ordered per aggregate.
    events: HashMap<K, BTreeMap<u64, FullyEvent<K, S::Event>>>,
    /// Deduplication keys seen per aggregate.
    unique_keys: HashMap<K, HashSet<String>>,
    /// Snapshot rows.
    snapshots: HashMap<K, Snapshot<K, S>>,
    /// Promoted archives: brief plus the snapshot at its end version.
    archives: HashMap<K, Vec<(ArchiveBrief, Snapshot<K, S>)>>,
    /// Cold storage for events relocated by the `Move` clearing policy.
    archived_events: HashMap<K, Vec<FullyEvent<K, S::Event>>>,
    /// Aggregates whose archive records carry the terminal flag.
    archive_over: HashSet<K>,
    /// Number of `get_range` calls served, across all aggregates.
    range_reads: u64,
}

impl<K, S: State> Default for Inner<K, S> {
    fn default() -> Self {
        Self {
            events: HashMap::new(),
            unique_keys: HashMap::new(),
            snapshots: HashMap::new(),
            archives: HashMap::new(),
            archived_events: HashMap::new(),
            archive_over: HashSet::new(),
            range_reads: 0,
        }
    }
}

/// In-memory implementation of the event log, snapshot store, and archive
/// store gateways.
///
/// Wrap in an [`Arc`] and hand the same instance to every actor of the
/// aggregate type.
pub struct MemoryStore<K: StateId, S: State> {
    inner: Mutex<Inner<K, S>>,
}

impl<K: StateId, S: State> Default for MemoryStore<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StateId, S: State> MemoryStore<K, S> {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn locked(&self) -> Result<MutexGuard<'_, Inner<K, S>>, StorageError> {
        self.inner
            .lock()
            .map_err(|e| StorageError::new(e.to_string()))
    }

    /// Number of events in the hot log for an aggregate.
    pub fn event_count(&self, state_id: &K) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.events.get(state_id).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    /// Number of events relocated to cold storage for an aggregate.
    pub fn archived_event_count(&self, state_id: &K) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.archived_events.get(state_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Number of stored archives for an aggregate.
    pub fn archive_count(&self, state_id: &K) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.archives.get(state_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// The stored snapshot row, if any.
    pub fn snapshot_row(&self, state_id: &K) -> Option<Snapshot<K, S>> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.snapshots.get(state_id).cloned())
    }

    /// Number of `get_range` calls served so far, across all aggregates.
    pub fn range_read_count(&self) -> u64 {
        self.inner.lock().map(|inner| inner.range_reads).unwrap_or(0)
    }

    /// Whether the aggregate's archive records carry the terminal flag.
    pub fn archive_is_over(&self, state_id: &K) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.archive_over.contains(state_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl<K: StateId, S: State> EventStorage<K, S::Event> for MemoryStore<K, S> {
    async fn append(
        &self,
        event: &FullyEvent<K, S::Event>,
        _payload: &[u8],
        unique_key: &str,
    ) -> Result<bool, StorageError> {
        let mut inner = self.locked()?;
        let version = event.basic_info.version;

        let version_taken = inner
            .events
            .get(&event.state_id)
            .is_some_and(|log| log.contains_key(&version));
        let key_taken = inner
            .unique_keys
            .get(&event.state_id)
            .is_some_and(|keys| keys.contains(unique_key));
        if version_taken || key_taken {
            return Ok(false);
        }

        inner
            .events
            .entry(event.state_id.clone())
            .or_default()
            .insert(version, event.clone());
        inner
            .unique_keys
            .entry(event.state_id.clone())
            .or_default()
            .insert(unique_key.to_string());
        Ok(true)
    }

    async fn get_range(
        &self,
        state_id: &K,
        _from_timestamp: i64,
        from_version: u64,
        to_version: u64,
    ) -> Result<Vec<FullyEvent<K, S::Event>>, StorageError> {
        // The timestamp is a partition-skip hint; a single map has no
        // partitions to skip.
        let mut inner = self.locked()?;
        inner.range_reads += 1;
        Ok(inner.events.get(state_id).map_or_else(Vec::new, |log| {
            log.range(from_version..=to_version).map(|(_, e)| e.clone()).collect()
        }))
    }

    async fn delete_previous(
        &self,
        state_id: &K,
        up_to_version: u64,
        _from_timestamp: i64,
    ) -> Result<(), StorageError> {
        let mut inner = self.locked()?;
        if let Some(log) = inner.events.get_mut(state_id) {
            log.retain(|version, _| *version > up_to_version);
        }
        Ok(())
    }
}

#[async_trait]
impl<K: StateId, S: State> SnapshotStorage<K, S> for MemoryStore<K, S> {
    async fn get(&self, state_id: &K) -> Result<Option<Snapshot<K, S>>, StorageError> {
        Ok(self.locked()?.snapshots.get(state_id).cloned())
    }

    async fn insert(&self, snapshot: &Snapshot<K, S>) -> Result<(), StorageError> {
        let mut inner = self.locked()?;
        if inner.snapshots.contains_key(&snapshot.base.state_id) {
            return Err(StorageError::new("snapshot row already exists"));
        }
        inner
            .snapshots
            .insert(snapshot.base.state_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn update(&self, snapshot: &Snapshot<K, S>) -> Result<(), StorageError> {
        let mut inner = self.locked()?;
        match inner.snapshots.get_mut(&snapshot.base.state_id) {
            Some(row) => {
                *row = snapshot.clone();
                Ok(())
            }
            None => Err(StorageError::new("snapshot row does not exist")),
        }
    }

    // The four field updates below match UPDATE-statement semantics: a
    // missing row is a no-op, not a fault. The raise path lowers timestamp
    // bounds before the first snapshot flush ever inserts a row.

    async fn update_is_latest(&self, state_id: &K, is_latest: bool) -> Result<(), StorageError> {
        let mut inner = self.locked()?;
        if let Some(row) = inner.snapshots.get_mut(state_id) {
            row.base.is_latest = is_latest;
        }
        Ok(())
    }

    async fn update_latest_min_event_timestamp(
        &self,
        state_id: &K,
        timestamp: i64,
    ) -> Result<(), StorageError> {
        let mut inner = self.locked()?;
        if let Some(row) = inner.snapshots.get_mut(state_id) {
            row.base.latest_min_event_timestamp = timestamp;
        }
        Ok(())
    }

    async fn update_start_timestamp(
        &self,
        state_id: &K,
        timestamp: i64,
    ) -> Result<(), StorageError> {
        let mut inner = self.locked()?;
        if let Some(row) = inner.snapshots.get_mut(state_id) {
            row.base.start_timestamp = timestamp;
        }
        Ok(())
    }

    async fn over(&self, state_id: &K, is_over: bool) -> Result<(), StorageError> {
        let mut inner = self.locked()?;
        if let Some(row) = inner.snapshots.get_mut(state_id) {
            row.base.is_over = is_over;
        }
        Ok(())
    }

    async fn delete(&self, state_id: &K) -> Result<(), StorageError> {
        self.locked()?.snapshots.remove(state_id);
        Ok(())
    }
}

#[async_trait]
impl<K: StateId, S: State> ArchiveStorage<K, S> for MemoryStore<K, S> {
    async fn get_briefs(&self, state_id: &K) -> Result<Vec<ArchiveBrief>, StorageError> {
        let inner = self.locked()?;
        let mut briefs: Vec<ArchiveBrief> = inner
            .archives
            .get(state_id)
            .map_or_else(Vec::new, |list| list.iter().map(|(b, _)| b.clone()).collect());
        briefs.sort_by_key(|b| b.index);
        Ok(briefs)
    }

    async fn get_by_id(&self, brief_id: &Uuid) -> Result<Option<Snapshot<K, S>>, StorageError> {
        let inner = self.locked()?;
        Ok(inner.archives.values().flatten().find_map(|(brief, snapshot)| {
            (brief.id == *brief_id).then(|| snapshot.clone())
        }))
    }

    async fn insert(
        &self,
        state_id: &K,
        brief: &ArchiveBrief,
        snapshot: &Snapshot<K, S>,
    ) -> Result<(), StorageError> {
        self.locked()?
            .archives
            .entry(state_id.clone())
            .or_default()
            .push((brief.clone(), snapshot.clone()));
        Ok(())
    }

    async fn delete(&self, state_id: &K, brief_id: &Uuid) -> Result<(), StorageError> {
        let mut inner = self.locked()?;
        if let Some(list) = inner.archives.get_mut(state_id) {
            list.retain(|(brief, _)| brief.id != *brief_id);
        }
        Ok(())
    }

    async fn delete_all(&self, state_id: &K) -> Result<(), StorageError> {
        self.locked()?.archives.remove(state_id);
        Ok(())
    }

    async fn event_is_clear(&self, state_id: &K, brief_id: &Uuid) -> Result<(), StorageError> {
        let mut inner = self.locked()?;
        match inner
            .archives
            .get_mut(state_id)
            .and_then(|list| list.iter_mut().find(|(brief, _)| brief.id == *brief_id))
        {
            Some((brief, _)) => {
                brief.event_is_cleared = true;
                Ok(())
            }
            None => Err(StorageError::new("archive brief does not exist")),
        }
    }

    async fn event_archive(
        &self,
        state_id: &K,
        end_version: u64,
        _start_timestamp: i64,
    ) -> Result<(), StorageError> {
        let mut inner = self.locked()?;
        let Some(log) = inner.events.get_mut(state_id) else {
            return Ok(());
        };
        let hot = log.split_off(&(end_version + 1));
        let moved: Vec<FullyEvent<K, S::Event>> = std::mem::replace(log, hot).into_values().collect();
        inner
            .archived_events
            .entry(state_id.clone())
            .or_default()
            .extend(moved);
        Ok(())
    }

    async fn over(&self, state_id: &K, is_over: bool) -> Result<(), StorageError> {
        let mut inner = self.locked()?;
        if is_over {
            inner.archive_over.insert(state_id.clone());
        } else {
            inner.archive_over.remove(state_id);
        }
        Ok(())
    }
}

/// Recording, failable event bus for tests and harnesses.
#[derive(Default)]
pub struct MemoryEventBus {
    published: Mutex<Vec<Vec<u8>>>,
    fail: AtomicBool,
}

impl MemoryEventBus {
    /// Create a bus that accepts every publish.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail (or succeed again).
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Every payload published so far.
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EventBusProducer for MemoryEventBus {
    async fn publish(&self, bytes: &[u8]) -> Result<(), StorageError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::new("bus unavailable"));
        }
        self.published
            .lock()
            .map_err(|e| StorageError::new(e.to_string()))?
            .push(bytes.to_vec());
        Ok(())
    }
}

/// Handler that records delivered bytes, shared across an observer unit.
struct RecordingHandler {
    handled: Arc<Mutex<Vec<Vec<u8>>>>,
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, bytes: &[u8]) -> Result<(), StorageError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::new("handler unavailable"));
        }
        self.handled
            .lock()
            .map_err(|e| StorageError::new(e.to_string()))?
            .push(bytes.to_vec());
        Ok(())
    }
}

/// Observer unit with a fixed number of observers whose committed versions
/// are settable from tests.
pub struct MemoryObserverUnit<K: StateId> {
    observer_count: usize,
    versions: Mutex<HashMap<K, Vec<u64>>>,
    handled: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_sync: AtomicBool,
    fail_handlers: Arc<AtomicBool>,
}

impl<K: StateId> MemoryObserverUnit<K> {
    /// Create a unit fronting `observer_count` observers, all at version 0.
    pub fn new(observer_count: usize) -> Self {
        Self {
            observer_count,
            versions: Mutex::new(HashMap::new()),
            handled: Arc::new(Mutex::new(Vec::new())),
            fail_sync: AtomicBool::new(false),
            fail_handlers: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set one observer's committed version for an aggregate.
    pub fn set_version(&self, state_id: &K, observer: usize, version: u64) {
        if let Ok(mut versions) = self.versions.lock() {
            let slots = versions
                .entry(state_id.clone())
                .or_insert_with(|| vec![0; self.observer_count]);
            slots[observer] = version;
        }
    }

    /// Make subsequent syncs report failure (or success again).
    pub fn set_fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::SeqCst);
    }

    /// Make the unit's handlers fail (or succeed again).
    pub fn set_fail_handlers(&self, fail: bool) {
        self.fail_handlers.store(fail, Ordering::SeqCst);
    }

    /// Every payload the unit's handlers consumed so far.
    pub fn handled(&self) -> Vec<Vec<u8>> {
        self.handled.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl<K: StateId> ObserverUnit<K> for MemoryObserverUnit<K> {
    async fn all_versions(&self, state_id: &K) -> Result<Vec<u64>, StorageError> {
        let versions = self
            .versions
            .lock()
            .map_err(|e| StorageError::new(e.to_string()))?;
        Ok(versions
            .get(state_id)
            .cloned()
            .unwrap_or_else(|| vec![0; self.observer_count]))
    }

    async fn sync_all(&self, state_id: &K, version: u64) -> Result<Vec<bool>, StorageError> {
        if self.fail_sync.load(Ordering::SeqCst) {
            let mut flags = vec![true; self.observer_count];
            if let Some(first) = flags.first_mut() {
                *first = false;
            }
            return Ok(flags);
        }
        let mut versions = self
            .versions
            .lock()
            .map_err(|e| StorageError::new(e.to_string()))?;
        versions.insert(state_id.clone(), vec![version; self.observer_count]);
        Ok(vec![true; self.observer_count])
    }

    async fn reset_all(&self, state_id: &K) -> Result<(), StorageError> {
        let mut versions = self
            .versions
            .lock()
            .map_err(|e| StorageError::new(e.to_string()))?;
        versions.insert(state_id.clone(), vec![0; self.observer_count]);
        Ok(())
    }

    fn event_handlers(&self) -> Vec<Arc<dyn EventHandler>> {
        (0..self.observer_count)
            .map(|_| {
                Arc::new(RecordingHandler {
                    handled: Arc::clone(&self.handled),
                    fail: Arc::clone(&self.fail_handlers),
                }) as Arc<dyn EventHandler>
            })
            .collect()
    }
}
