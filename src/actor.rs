//! The per-aggregate runtime core: raise pipeline, recovery engine, archive
//! engine, and lifecycle operations.
//!
//! A [`StateActor`] exclusively owns its in-memory snapshot, brief list,
//! pending archive, and snapshot bookkeeping for the duration of an
//! activation. The host guarantees single-threaded execution per actor; the
//! core never spawns background work that touches this state. Storage
//! gateways are the only shared surface.
//!
//! Raising an event walks a fixed pipeline: author the event at
//! `version + 1`, begin the two-phase version advance, append to the log,
//! apply to the snapshot, commit the version, grow the pending archive,
//! maybe flush the snapshot, publish to the bus. A failed append rolls the
//! version back; any other failure rebuilds the actor from persisted state
//! before the error surfaces.

use std::sync::Arc;

use crate::archive::{ArchiveBrief, BriefList};
use crate::bus::{EventBusProducer, encode_bare, encode_transport};
use crate::error::ActorError;
use crate::event::{Event, EventBasicInfo, EventUid, FullyEvent, StateId, now_ms};
use crate::observer::ObserverUnit;
use crate::options::{ActorOptions, EventArchiveType};
use crate::snapshot::Snapshot;
use crate::state::State;
use crate::storage::{ArchiveStorage, EventStorage, SnapshotStorage};

/// How a terminal transition disposes of the aggregate's durable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverType {
    /// Flag the aggregate as over; keep events, archives, and snapshot.
    None,
    /// Drop archives and move every event into archive-event storage.
    ArchivingEvent,
    /// Drop archives and delete every event.
    DeleteEvent,
    /// Drop archives, events, and the snapshot row.
    DeleteAll,
}

/// Builder that wires gateways into a [`StateActor`].
///
/// Event storage, snapshot storage, and the observer unit are required;
/// archive storage is required when archives are enabled in the options;
/// the bus is optional (without one, published events go straight to the
/// synchronous fan-out path).
pub struct ActorBuilder<K: StateId, S: State> {
    state_id: K,
    options: ActorOptions,
    event_storage: Option<Arc<dyn EventStorage<K, S::Event>>>,
    snapshot_storage: Option<Arc<dyn SnapshotStorage<K, S>>>,
    archive_storage: Option<Arc<dyn ArchiveStorage<K, S>>>,
    observer_unit: Option<Arc<dyn ObserverUnit<K>>>,
    event_bus: Option<Arc<dyn EventBusProducer>>,
}

impl<K: StateId, S: State> ActorBuilder<K, S> {
    /// Start a builder for the aggregate with the given primary key.
    pub fn new(state_id: K) -> Self {
        Self {
            state_id,
            options: ActorOptions::default(),
            event_storage: None,
            snapshot_storage: None,
            archive_storage: None,
            observer_unit: None,
            event_bus: None,
        }
    }

    /// Replace the default [`ActorOptions`].
    pub fn options(mut self, options: ActorOptions) -> Self {
        self.options = options;
        self
    }

    /// Wire the event log gateway.
    pub fn event_storage(mut self, storage: Arc<dyn EventStorage<K, S::Event>>) -> Self {
        self.event_storage = Some(storage);
        self
    }

    /// Wire the snapshot store gateway.
    pub fn snapshot_storage(mut self, storage: Arc<dyn SnapshotStorage<K, S>>) -> Self {
        self.snapshot_storage = Some(storage);
        self
    }

    /// Wire the archive store gateway.
    pub fn archive_storage(mut self, storage: Arc<dyn ArchiveStorage<K, S>>) -> Self {
        self.archive_storage = Some(storage);
        self
    }

    /// Wire the resolved observer unit.
    pub fn observer_unit(mut self, unit: Arc<dyn ObserverUnit<K>>) -> Self {
        self.observer_unit = Some(unit);
        self
    }

    /// Wire the event bus producer.
    pub fn event_bus(mut self, bus: Arc<dyn EventBusProducer>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Assemble the actor.
    ///
    /// The returned actor holds a fresh, unrecovered snapshot; call
    /// [`StateActor::activate`] before raising events.
    ///
    /// # Errors
    ///
    /// [`ActorError::MissingDependency`] if a required gateway was not
    /// wired.
    pub fn build(self) -> Result<StateActor<K, S>, ActorError> {
        let event_storage = self
            .event_storage
            .ok_or(ActorError::MissingDependency("event storage"))?;
        let snapshot_storage = self
            .snapshot_storage
            .ok_or(ActorError::MissingDependency("snapshot storage"))?;
        let observer_unit = self
            .observer_unit
            .ok_or(ActorError::MissingDependency("observer unit"))?;
        if self.options.archive.on && self.archive_storage.is_none() {
            return Err(ActorError::MissingDependency("archive storage"));
        }

        Ok(StateActor {
            snapshot: Snapshot::new(self.state_id, S::create()),
            snapshot_event_version: 0,
            snapshot_stored: false,
            new_archive: None,
            briefs: BriefList::default(),
            options: self.options,
            event_storage,
            snapshot_storage,
            archive_storage: self.archive_storage,
            observer_unit,
            event_bus: self.event_bus,
        })
    }
}

/// An activated event-sourced aggregate.
///
/// All operations take `&mut self`: the host schedules at most one
/// operation at a time per actor, and every suspension point resumes with
/// the actor still holding exclusive logical access to its state.
pub struct StateActor<K: StateId, S: State> {
    snapshot: Snapshot<K, S>,
    /// Version at which the last snapshot flush occurred.
    snapshot_event_version: u64,
    /// Whether a snapshot row exists in the store (insert vs. update).
    snapshot_stored: bool,
    /// The at-most-one in-flight archive accumulating events since the
    /// last promotion.
    new_archive: Option<ArchiveBrief>,
    briefs: BriefList,
    options: ActorOptions,
    event_storage: Arc<dyn EventStorage<K, S::Event>>,
    snapshot_storage: Arc<dyn SnapshotStorage<K, S>>,
    archive_storage: Option<Arc<dyn ArchiveStorage<K, S>>>,
    observer_unit: Arc<dyn ObserverUnit<K>>,
    event_bus: Option<Arc<dyn EventBusProducer>>,
}

impl<K: StateId, S: State> StateActor<K, S> {
    /// Start building an actor for the aggregate with the given key.
    pub fn builder(state_id: K) -> ActorBuilder<K, S> {
        ActorBuilder::new(state_id)
    }

    /// The aggregate's primary key.
    pub fn state_id(&self) -> &K {
        &self.snapshot.base.state_id
    }

    /// The current payload.
    pub fn state(&self) -> &S {
        &self.snapshot.state
    }

    /// The committed event version.
    pub fn version(&self) -> u64 {
        self.snapshot.base.version
    }

    /// Whether the aggregate is terminal.
    pub fn is_over(&self) -> bool {
        self.snapshot.base.is_over
    }

    /// The full snapshot (header plus payload).
    pub fn snapshot(&self) -> &Snapshot<K, S> {
        &self.snapshot
    }

    /// The promoted archive briefs currently retained, in index order.
    pub fn briefs(&self) -> &[ArchiveBrief] {
        self.briefs.as_slice()
    }

    /// The pending archive accumulating events since the last promotion.
    pub fn pending_archive(&self) -> Option<&ArchiveBrief> {
        self.new_archive.as_ref()
    }

    fn archives_on(&self) -> bool {
        self.options.archive.on && self.archive_storage.is_some()
    }

    /// The archive gateway, when archives are enabled.
    fn archive_gateway(&self) -> Option<Arc<dyn ArchiveStorage<K, S>>> {
        if self.options.archive.on {
            self.archive_storage.clone()
        } else {
            None
        }
    }

    // --- Lifecycle -------------------------------------------------------

    /// Bring the aggregate into memory: restore archive bookkeeping,
    /// recover the snapshot, rebuild the pending archive from the event
    /// tail, and optionally block on observer catch-up.
    ///
    /// # Errors
    ///
    /// Storage failures propagate; with
    /// [`sync_all_observers_on_activate`](ActorOptions::sync_all_observers_on_activate)
    /// set, a lagging observer fails activation with
    /// [`ActorError::SyncAllObserversFailed`].
    pub async fn activate(&mut self) -> Result<(), ActorError> {
        let state_id = self.snapshot.base.state_id.clone();
        tracing::debug!(state_id = %state_id, "activating aggregate");

        if let Some(archive) = self.archive_gateway() {
            self.briefs = BriefList::new(archive.get_briefs(&state_id).await?);

            // A last brief that never satisfied the promotion policy is a
            // partial archive: treat it as pending again.
            let partial = self.briefs.last().is_some_and(|last| {
                !last.event_is_cleared
                    && !last.is_completed(&self.options.archive, self.briefs.prev_of_last())
            });
            if partial && let Some(last) = self.briefs.pop_last() {
                archive.delete(&state_id, &last.id).await?;
                tracing::debug!(index = last.index, "demoting partial archive to pending");
                self.new_archive = Some(last);
            }
        }

        self.recover().await?;

        // Events committed after the last promotion and after the pending
        // archive's end were never folded into archive bookkeeping (e.g. a
        // crash before deactivation). Rebuild by replaying the tail.
        if self.archives_on() && self.snapshot.base.version > 0 {
            let last_end = self.briefs.last().map_or(0, |b| b.end_version);
            let pending_end = self.new_archive.as_ref().map_or(0, |b| b.end_version);
            let mut cursor = last_end.max(pending_end);
            while cursor < self.snapshot.base.version {
                let page = self
                    .event_storage
                    .get_range(
                        &state_id,
                        self.snapshot.base.latest_min_event_timestamp,
                        cursor + 1,
                        cursor + self.options.events_per_read,
                    )
                    .await?;
                if page.is_empty() {
                    break;
                }
                for event in &page {
                    self.event_archive(event).await?;
                    cursor = event.basic_info.version;
                }
                if (page.len() as u64) < self.options.events_per_read {
                    break;
                }
            }
        }

        if self.options.sync_all_observers_on_activate {
            let version = self.snapshot.base.version;
            let flags = self.observer_unit.sync_all(&state_id, version).await?;
            if flags.iter().any(|ok| !ok) {
                return Err(ActorError::SyncAllObserversFailed { version });
            }
        }

        Ok(())
    }

    /// Flush unpersisted progress and promote a worthwhile pending archive
    /// before the host unloads the actor.
    pub async fn deactivate(&mut self) -> Result<(), ActorError> {
        if self.snapshot.base.version > self.snapshot_event_version {
            self.save_snapshot(true, true).await?;
            self.snapshot.state.on_deactivated();
        }
        if self.archives_on() {
            let worthwhile = self.new_archive.as_ref().is_some_and(|pending| {
                pending.version_span() >= self.options.archive.min_version_interval_at_deactivate
            });
            if worthwhile {
                self.archive(true).await?;
            }
        }
        tracing::debug!(
            state_id = %self.snapshot.base.state_id,
            version = self.snapshot.base.version,
            "aggregate deactivated"
        );
        Ok(())
    }

    /// Rebuild the in-memory snapshot from persisted state: stored snapshot
    /// first, last archive body second, fresh payload last, then replay the
    /// event tail in bounded pages.
    ///
    /// Crash mid-replay is safe: replay is deterministic and version-gated.
    async fn recover(&mut self) -> Result<(), ActorError> {
        let state_id = self.snapshot.base.state_id.clone();

        let stored = self.snapshot_storage.get(&state_id).await?;
        self.snapshot_stored = stored.is_some();
        self.snapshot = match stored {
            Some(snapshot) => snapshot,
            None => {
                let from_archive = match (self.archive_gateway(), self.briefs.last()) {
                    (Some(archive), Some(last)) => archive.get_by_id(&last.id).await?,
                    _ => None,
                };
                from_archive.unwrap_or_else(|| Snapshot::new(state_id.clone(), S::create()))
            }
        };
        self.snapshot_event_version = self.snapshot.base.version;

        while !self.snapshot.base.is_latest {
            let from = self.snapshot.base.version + 1;
            let to = self.snapshot.base.version + self.options.events_per_read;
            let page = self
                .event_storage
                .get_range(
                    &state_id,
                    self.snapshot.base.latest_min_event_timestamp,
                    from,
                    to,
                )
                .await?;
            for event in &page {
                self.apply_committed(event)?;
            }
            if (page.len() as u64) < self.options.events_per_read {
                break;
            }
        }

        if self.snapshot.base.version - self.snapshot_event_version
            >= self.options.min_snapshot_version_interval
        {
            self.save_snapshot(true, true).await?;
        }

        tracing::debug!(
            state_id = %state_id,
            version = self.snapshot.base.version,
            "aggregate recovered"
        );
        Ok(())
    }

    /// Version-gated apply of one committed event during replay.
    fn apply_committed(&mut self, event: &FullyEvent<K, S::Event>) -> Result<(), ActorError> {
        self.snapshot.base.increment_doing_version()?;
        let state = std::mem::take(&mut self.snapshot.state);
        self.snapshot.state = state.apply(&event.event);
        self.snapshot.base.update_version(&event.basic_info)
    }

    // --- Raise pipeline --------------------------------------------------

    /// Raise a domain event, deriving its idempotency key from the event's
    /// natural identity.
    ///
    /// Returns `Ok(false)` when the event log rejected the append as a
    /// duplicate; the aggregate is unchanged.
    ///
    /// # Errors
    ///
    /// [`ActorError::StateIsOver`] on a terminal aggregate;
    /// [`ActorError::EventIsCleared`] when the event retro-dates into
    /// pruned history; storage and serialization failures after the actor
    /// rebuilt itself from persisted state.
    pub async fn raise(&mut self, event: S::Event) -> Result<bool, ActorError> {
        self.raise_with(event, None).await
    }

    /// Raise a domain event with a caller-supplied idempotency token.
    ///
    /// The uid carries both the deduplication key and the event timestamp,
    /// so a retried raise reproduces the same event identity and the log
    /// rejects the second append.
    pub async fn raise_with_uid(
        &mut self,
        event: S::Event,
        uid: EventUid,
    ) -> Result<bool, ActorError> {
        self.raise_with(event, Some(uid)).await
    }

    async fn raise_with(
        &mut self,
        event: S::Event,
        uid: Option<EventUid>,
    ) -> Result<bool, ActorError> {
        if self.snapshot.base.is_over {
            return Err(ActorError::StateIsOver {
                state_id: self.snapshot.base.state_id.to_string(),
            });
        }

        let timestamp = uid.as_ref().map_or_else(now_ms, |u| u.timestamp);
        let fully = FullyEvent {
            state_id: self.snapshot.base.state_id.clone(),
            basic_info: EventBasicInfo {
                version: self.snapshot.base.version + 1,
                timestamp,
            },
            event,
        };
        let unique_key = uid.map_or_else(|| fully.natural_key(), |u| u.unique_id);

        match self.raise_pipeline(&fully, &unique_key).await {
            Ok(committed) => Ok(committed),
            Err(err) => {
                tracing::error!(
                    state_id = %fully.state_id,
                    version = fully.basic_info.version,
                    error = %err,
                    "raise failed; rebuilding aggregate from storage"
                );
                if let Err(recover_err) = self.recover().await {
                    tracing::error!(
                        state_id = %fully.state_id,
                        error = %recover_err,
                        "recovery after failed raise also failed"
                    );
                } else if let Err(save_err) = self.save_snapshot(true, false).await {
                    tracing::error!(
                        state_id = %fully.state_id,
                        error = %save_err,
                        "snapshot flush after recovery failed"
                    );
                }
                Err(err)
            }
        }
    }

    async fn raise_pipeline(
        &mut self,
        fully: &FullyEvent<K, S::Event>,
        unique_key: &str,
    ) -> Result<bool, ActorError> {
        self.on_raise_start(&fully.basic_info).await?;
        self.snapshot.base.increment_doing_version()?;

        let payload = serde_json::to_vec(&fully.event)?;
        let appended = self.event_storage.append(fully, &payload, unique_key).await?;
        if !appended {
            self.snapshot.base.decrement_doing_version();
            self.on_raise_failed().await?;
            tracing::debug!(
                state_id = %fully.state_id,
                unique_key,
                "duplicate append skipped"
            );
            return Ok(false);
        }

        let state = std::mem::take(&mut self.snapshot.state);
        self.snapshot.state = state.apply(&fully.event);
        self.snapshot.base.update_version(&fully.basic_info)?;

        self.on_raised(fully).await?;
        self.save_snapshot(false, false).await?;
        self.publish_to_bus(fully, &payload).await;
        Ok(true)
    }

    /// Pre-append bookkeeping: invalidate the persisted latest flag, reject
    /// retro-dates into pruned history, persist lowered timestamp bounds,
    /// and unwind archives the event retro-dates into.
    async fn on_raise_start(&mut self, info: &EventBasicInfo) -> Result<(), ActorError> {
        let state_id = self.snapshot.base.state_id.clone();

        if self.snapshot.base.version > 0 && self.snapshot.base.is_latest {
            self.snapshot_storage
                .update_is_latest(&state_id, false)
                .await?;
            self.snapshot.base.is_latest = false;
        }

        // The cleared-window guard runs before the brief walk, so the walk
        // can never be asked to delete a cleared brief.
        if let Some(cleared) = self.briefs.cleared()
            && info.timestamp < cleared.start_timestamp
        {
            return Err(ActorError::EventIsCleared {
                timestamp: info.timestamp,
                cleared_start: cleared.start_timestamp,
            });
        }

        if info.timestamp < self.snapshot.base.latest_min_event_timestamp {
            self.snapshot_storage
                .update_latest_min_event_timestamp(&state_id, info.timestamp)
                .await?;
            self.snapshot.base.latest_min_event_timestamp = info.timestamp;
        }
        if info.timestamp < self.snapshot.base.start_timestamp {
            self.snapshot_storage
                .update_start_timestamp(&state_id, info.timestamp)
                .await?;
            self.snapshot.base.start_timestamp = info.timestamp;
        }

        // A retro-dated event overlapping promoted archives repairs them by
        // unwinding the offending briefs back into the pending archive.
        if let Some(archive) = self.archive_gateway()
            && self
                .briefs
                .last()
                .is_some_and(|last| info.timestamp < last.end_timestamp)
        {
            while let Some(folded) = self.briefs.fold_back(info.timestamp)? {
                archive.delete(&state_id, &folded.id).await?;
                tracing::debug!(
                    state_id = %state_id,
                    index = folded.index,
                    "folding archive back into pending"
                );
                match &mut self.new_archive {
                    Some(pending) => pending.combine(&folded),
                    None => self.new_archive = Some(folded),
                }
            }
        }

        Ok(())
    }

    /// A duplicate append is a natural promotion point for the pending
    /// archive: the aggregate is quiescent at a committed version.
    async fn on_raise_failed(&mut self) -> Result<(), ActorError> {
        if self.archives_on() && self.new_archive.is_some() {
            self.archive(false).await?;
        }
        Ok(())
    }

    async fn on_raised(&mut self, fully: &FullyEvent<K, S::Event>) -> Result<(), ActorError> {
        if self.archives_on() {
            self.event_archive(fully).await?;
        }
        Ok(())
    }

    /// Persist the snapshot when forced or when the configured version
    /// interval has elapsed since the last flush.
    async fn save_snapshot(&mut self, force: bool, is_latest: bool) -> Result<(), ActorError> {
        let due = self.snapshot.base.version - self.snapshot_event_version
            >= self.options.snapshot_version_interval;
        if !force && !due {
            return Ok(());
        }

        self.snapshot.base.is_latest = is_latest;
        if self.snapshot_stored {
            self.snapshot_storage.update(&self.snapshot).await?;
        } else {
            self.snapshot_storage.insert(&self.snapshot).await?;
            self.snapshot_stored = true;
        }
        self.snapshot_event_version = self.snapshot.base.version;
        tracing::debug!(
            state_id = %self.snapshot.base.state_id,
            version = self.snapshot.base.version,
            "snapshot persisted"
        );
        Ok(())
    }

    // --- Archive engine --------------------------------------------------

    /// Fold one committed event into the pending archive, creating it if
    /// absent, then promote if the policy is satisfied.
    async fn event_archive(&mut self, event: &FullyEvent<K, S::Event>) -> Result<(), ActorError> {
        match &mut self.new_archive {
            Some(pending) => pending.include(event),
            None => {
                let index = self.briefs.last().map_or(0, |last| last.index + 1);
                self.new_archive = Some(ArchiveBrief::from_event(index, event));
            }
        }
        self.archive(false).await
    }

    /// Promote the pending archive when forced or completed by policy.
    async fn archive(&mut self, force: bool) -> Result<(), ActorError> {
        if self.snapshot.base.version != self.snapshot.base.doing_version {
            return Err(ActorError::StateInsecurity {
                state_id: self.snapshot.base.state_id.to_string(),
                version: self.snapshot.base.version,
                doing_version: self.snapshot.base.doing_version,
            });
        }
        let Some(archive_store) = self.archive_gateway() else {
            return Ok(());
        };
        let promote = self.new_archive.as_ref().is_some_and(|pending| {
            force || pending.is_completed(&self.options.archive, self.briefs.last())
        });
        if !promote {
            return Ok(());
        }
        let Some(pending) = self.new_archive.take() else {
            return Ok(());
        };

        let state_id = self.snapshot.base.state_id.clone();
        archive_store.insert(&state_id, &pending, &self.snapshot).await?;
        tracing::info!(
            state_id = %state_id,
            index = pending.index,
            start_version = pending.start_version,
            end_version = pending.end_version,
            "archive promoted"
        );
        self.briefs.push(pending);
        self.on_archive_completed().await
    }

    /// Event-cleaning after a promotion: once enough non-cleared archives
    /// accumulate and every observer has passed the oldest one, clear its
    /// events out of the hot log.
    async fn on_archive_completed(&mut self) -> Result<(), ActorError> {
        if self.briefs.noncleared_len() < self.options.archive.max_snapshot_archive_records {
            return Ok(());
        }
        let Some(candidate) = self.briefs.oldest_noncleared().cloned() else {
            return Ok(());
        };

        let state_id = self.snapshot.base.state_id.clone();
        let versions = self.observer_unit.all_versions(&state_id).await?;
        if versions.iter().any(|v| *v < candidate.end_version) {
            tracing::debug!(
                state_id = %state_id,
                end_version = candidate.end_version,
                "observers behind; event clearing deferred"
            );
            return Ok(());
        }
        let Some(archive_store) = self.archive_gateway() else {
            return Ok(());
        };

        archive_store.event_is_clear(&state_id, &candidate.id).await?;
        self.briefs.mark_cleared(&candidate.id);

        // The cleared range must be covered by a persisted snapshot before
        // its events leave the hot log.
        if self.snapshot_event_version < candidate.end_version {
            self.save_snapshot(true, false).await?;
        }

        match self.options.archive.event_archive_type {
            EventArchiveType::Delete => {
                self.event_storage
                    .delete_previous(
                        &state_id,
                        candidate.end_version,
                        self.snapshot.base.start_timestamp,
                    )
                    .await?;
            }
            EventArchiveType::Move => {
                archive_store
                    .event_archive(
                        &state_id,
                        candidate.end_version,
                        self.snapshot.base.start_timestamp,
                    )
                    .await?;
            }
        }

        // Keep only the newest cleared brief as the cursor.
        for stale in self.briefs.drain_cleared_before(candidate.index) {
            archive_store.delete(&state_id, &stale.id).await?;
        }

        tracing::info!(
            state_id = %state_id,
            cleared_end_version = candidate.end_version,
            "archive events cleared"
        );
        Ok(())
    }

    // --- Terminal transitions -------------------------------------------

    /// Terminate the aggregate: no further events may be raised.
    ///
    /// # Errors
    ///
    /// [`ActorError::StateIsOver`] if already terminal;
    /// [`ActorError::StateInsecurity`] if a commit is in flight;
    /// [`ActorError::ObserverNotCompleted`] for non-[`None`](OverType::None)
    /// types while an observer lags behind the aggregate version.
    pub async fn over(&mut self, over_type: OverType) -> Result<(), ActorError> {
        let state_id = self.snapshot.base.state_id.clone();
        if self.snapshot.base.is_over {
            return Err(ActorError::StateIsOver {
                state_id: state_id.to_string(),
            });
        }
        if self.snapshot.base.version != self.snapshot.base.doing_version {
            return Err(ActorError::StateInsecurity {
                state_id: state_id.to_string(),
                version: self.snapshot.base.version,
                doing_version: self.snapshot.base.doing_version,
            });
        }

        if over_type != OverType::None {
            let versions = self.observer_unit.all_versions(&state_id).await?;
            if versions.iter().any(|v| *v < self.snapshot.base.version) {
                return Err(ActorError::ObserverNotCompleted {
                    required: self.snapshot.base.version,
                });
            }
        }

        self.snapshot.base.is_over = true;
        self.snapshot.base.is_latest = true;
        if self.snapshot_stored && self.snapshot_event_version == self.snapshot.base.version {
            // The stored row is current: flip the flags in place.
            self.snapshot_storage.over(&state_id, true).await?;
            self.snapshot_storage
                .update_is_latest(&state_id, true)
                .await?;
        } else {
            self.save_snapshot(true, true).await?;
        }

        match over_type {
            OverType::None => {
                if let Some(archive_store) = self.archive_gateway() {
                    archive_store.over(&state_id, true).await?;
                }
            }
            OverType::ArchivingEvent => {
                if let Some(archive_store) = self.archive_gateway() {
                    archive_store.delete_all(&state_id).await?;
                    self.briefs.clear();
                    self.new_archive = None;
                    archive_store
                        .event_archive(
                            &state_id,
                            self.snapshot.base.version,
                            self.snapshot.base.start_timestamp,
                        )
                        .await?;
                }
            }
            OverType::DeleteEvent => {
                if let Some(archive_store) = self.archive_gateway() {
                    archive_store.delete_all(&state_id).await?;
                    self.briefs.clear();
                    self.new_archive = None;
                }
                self.event_storage
                    .delete_previous(
                        &state_id,
                        self.snapshot.base.version,
                        self.snapshot.base.start_timestamp,
                    )
                    .await?;
            }
            OverType::DeleteAll => {
                if let Some(archive_store) = self.archive_gateway() {
                    archive_store.delete_all(&state_id).await?;
                    self.briefs.clear();
                    self.new_archive = None;
                }
                self.event_storage
                    .delete_previous(
                        &state_id,
                        self.snapshot.base.version,
                        self.snapshot.base.start_timestamp,
                    )
                    .await?;
                self.snapshot_storage.delete(&state_id).await?;
                self.snapshot_stored = false;
            }
        }

        tracing::info!(state_id = %state_id, ?over_type, "aggregate is over");
        Ok(())
    }

    /// Wipe the aggregate and start over at version 0, instructing every
    /// observer to do the same.
    pub async fn reset(&mut self) -> Result<(), ActorError> {
        let state_id = self.snapshot.base.state_id.clone();
        self.over(OverType::DeleteAll).await?;
        self.recover().await?;
        self.observer_unit.reset_all(&state_id).await?;
        tracing::info!(state_id = %state_id, "aggregate reset");
        Ok(())
    }

    // --- Publishing ------------------------------------------------------

    /// Fire-and-forget a bare message to the bus. Never touches the
    /// snapshot; failures are logged, not propagated.
    pub async fn publish<M: Event>(&self, message: &M) {
        let bytes = match encode_bare(message) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(
                    state_id = %self.snapshot.base.state_id,
                    error = %err,
                    "bare message encoding failed; not published"
                );
                return;
            }
        };
        if !self.try_bus(&bytes).await {
            tracing::warn!(
                state_id = %self.snapshot.base.state_id,
                type_code = message.type_code(),
                "bare publish not delivered"
            );
        }
    }

    /// Deliver a committed event downstream: bus with synchronous fan-out
    /// fallback, or the reverse order, per configuration. The event is
    /// already durable in the log, so delivery failures are logged and
    /// swallowed -- observers catch up through other paths.
    async fn publish_to_bus(&self, fully: &FullyEvent<K, S::Event>, payload: &[u8]) {
        let bytes = match encode_transport(fully, payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(
                    state_id = %fully.state_id,
                    error = %err,
                    "transport encoding failed; event not published"
                );
                return;
            }
        };

        let delivered = if self.options.priority_async_event_bus {
            self.try_bus(&bytes).await || self.fan_out(&bytes).await
        } else {
            self.fan_out(&bytes).await || self.try_bus(&bytes).await
        };
        if !delivered {
            tracing::warn!(
                state_id = %fully.state_id,
                version = fully.basic_info.version,
                "event delivery failed on both bus and fan-out paths"
            );
        }
    }

    async fn try_bus(&self, bytes: &[u8]) -> bool {
        let Some(bus) = &self.event_bus else {
            return false;
        };
        match bus.publish(bytes).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    state_id = %self.snapshot.base.state_id,
                    error = %err,
                    "bus publish failed"
                );
                false
            }
        }
    }

    async fn fan_out(&self, bytes: &[u8]) -> bool {
        let mut delivered = true;
        for handler in self.observer_unit.event_handlers() {
            if let Err(err) = handler.handle(bytes).await {
                tracing::warn!(
                    state_id = %self.snapshot.base.state_id,
                    error = %err,
                    "observer handler failed"
                );
                delivered = false;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::event::test_fixtures::{Counter, CounterEvent};
    use crate::memory::{MemoryEventBus, MemoryObserverUnit, MemoryStore};
    use crate::options::ArchiveOptions;

    struct Harness {
        store: Arc<MemoryStore<String, Counter>>,
        bus: Arc<MemoryEventBus>,
        observers: Arc<MemoryObserverUnit<String>>,
    }

    const ID: &str = "c-1";

    fn id() -> String {
        ID.to_string()
    }

    /// Options with archives off and an eager snapshot interval.
    fn plain_options() -> ActorOptions {
        ActorOptions {
            snapshot_version_interval: 1,
            archive: ArchiveOptions {
                on: false,
                ..ArchiveOptions::default()
            },
            ..ActorOptions::default()
        }
    }

    /// Archive options that promote after every second event and clear
    /// aggressively.
    fn eager_archive_options() -> ActorOptions {
        ActorOptions {
            snapshot_version_interval: 1,
            archive: ArchiveOptions {
                min_version_interval: 1,
                max_version_interval: 1_000,
                min_interval_ms: 0,
                max_snapshot_archive_records: 2,
                ..ArchiveOptions::default()
            },
            ..ActorOptions::default()
        }
    }

    fn harness() -> Harness {
        Harness {
            store: Arc::new(MemoryStore::new()),
            bus: Arc::new(MemoryEventBus::new()),
            observers: Arc::new(MemoryObserverUnit::new(2)),
        }
    }

    fn build_actor(h: &Harness, options: ActorOptions) -> StateActor<String, Counter> {
        StateActor::<String, Counter>::builder(id())
            .options(options)
            .event_storage(h.store.clone())
            .snapshot_storage(h.store.clone())
            .archive_storage(h.store.clone())
            .observer_unit(h.observers.clone())
            .event_bus(h.bus.clone())
            .build()
            .expect("build should succeed")
    }

    async fn activated(h: &Harness, options: ActorOptions) -> StateActor<String, Counter> {
        let mut actor = build_actor(h, options);
        actor.activate().await.expect("activate should succeed");
        actor
    }

    /// Raise `Incremented` with a deterministic uid at the given timestamp.
    async fn raise_at(
        actor: &mut StateActor<String, Counter>,
        key: &str,
        timestamp: i64,
    ) -> bool {
        actor
            .raise_with_uid(CounterEvent::Incremented, EventUid::new(key, timestamp))
            .await
            .expect("raise should succeed")
    }

    // --- Builder ---------------------------------------------------------

    #[test]
    fn builder_rejects_missing_event_storage() {
        let h = harness();
        let result = StateActor::<String, Counter>::builder(id())
            .snapshot_storage(h.store.clone())
            .archive_storage(h.store.clone())
            .observer_unit(h.observers.clone())
            .build();
        assert!(matches!(
            result,
            Err(ActorError::MissingDependency("event storage"))
        ));
    }

    #[test]
    fn builder_rejects_archives_on_without_archive_storage() {
        let h = harness();
        let result = StateActor::<String, Counter>::builder(id())
            .event_storage(h.store.clone())
            .snapshot_storage(h.store.clone())
            .observer_unit(h.observers.clone())
            .build();
        assert!(matches!(
            result,
            Err(ActorError::MissingDependency("archive storage"))
        ));
    }

    #[test]
    fn builder_allows_archives_off_without_archive_storage() {
        let h = harness();
        let result = StateActor::<String, Counter>::builder(id())
            .options(plain_options())
            .event_storage(h.store.clone())
            .snapshot_storage(h.store.clone())
            .observer_unit(h.observers.clone())
            .build();
        assert!(result.is_ok());
    }

    // --- Raise pipeline --------------------------------------------------

    #[tokio::test]
    async fn five_raises_commit_five_versions() {
        let h = harness();
        let mut actor = activated(&h, plain_options()).await;

        for n in 1..=5u64 {
            let committed = raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
            assert!(committed);
        }

        assert_eq!(actor.version(), 5);
        assert_eq!(actor.state().value, 5);
        assert_eq!(actor.snapshot().base.doing_version, 5);
        assert_eq!(h.bus.published().len(), 5, "every event reaches the bus");
    }

    #[tokio::test]
    async fn snapshot_persisted_when_interval_reached() {
        let h = harness();
        let options = ActorOptions {
            snapshot_version_interval: 5,
            ..plain_options()
        };
        let mut actor = activated(&h, options).await;

        for n in 1..=4u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }
        assert!(
            h.store.snapshot_row(&id()).is_none(),
            "interval not reached yet"
        );

        raise_at(&mut actor, "k5", 500).await;
        let row = h.store.snapshot_row(&id()).expect("row should exist at v5");
        assert_eq!(row.base.version, 5);
        assert_eq!(row.state.value, 5);
    }

    #[tokio::test]
    async fn reactivation_with_latest_snapshot_skips_log_reads() {
        let h = harness();
        let options = ActorOptions {
            snapshot_version_interval: 100,
            ..plain_options()
        };
        let mut actor = activated(&h, options.clone()).await;
        for n in 1..=5u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }
        actor.deactivate().await.expect("deactivate should succeed");

        let row = h.store.snapshot_row(&id()).expect("deactivate should flush");
        assert!(row.base.is_latest);

        let reads_before = h.store.range_read_count();
        let revived = activated(&h, options).await;
        assert_eq!(revived.version(), 5);
        assert_eq!(revived.state().value, 5);
        assert_eq!(
            h.store.range_read_count(),
            reads_before,
            "a latest snapshot needs zero log reads to recover"
        );
    }

    #[tokio::test]
    async fn reactivation_replays_events_past_the_snapshot() {
        let h = harness();
        let options = ActorOptions {
            snapshot_version_interval: 3,
            ..plain_options()
        };
        let mut actor = activated(&h, options.clone()).await;
        for n in 1..=5u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }
        // Snapshot row sits at v3; events 4 and 5 are only in the log.
        // Drop the actor without deactivating, as a crash would.
        drop(actor);

        let revived = activated(&h, options).await;
        assert_eq!(revived.version(), 5);
        assert_eq!(revived.state().value, 5);
    }

    #[tokio::test]
    async fn duplicate_uid_is_rejected_without_advancing() {
        let h = harness();
        let mut actor = activated(&h, plain_options()).await;

        let first = actor
            .raise_with_uid(CounterEvent::Incremented, EventUid::new("same", 100))
            .await
            .expect("first raise should succeed");
        assert!(first);

        let second = actor
            .raise_with_uid(CounterEvent::Incremented, EventUid::new("same", 100))
            .await
            .expect("duplicate raise should not error");
        assert!(!second, "duplicate uid must be rejected");
        assert_eq!(actor.version(), 1);
        assert_eq!(
            actor.snapshot().base.doing_version,
            1,
            "doing version must roll back after the duplicate"
        );
        assert_eq!(actor.state().value, 1);

        // A fresh event takes the same next version slot.
        let third = raise_at(&mut actor, "fresh", 200).await;
        assert!(third);
        assert_eq!(actor.version(), 2);
    }

    #[tokio::test]
    async fn retro_dated_event_lowers_persisted_bounds() {
        let h = harness();
        let mut actor = activated(&h, plain_options()).await;

        raise_at(&mut actor, "k1", 100).await;
        raise_at(&mut actor, "k2", 50).await;

        assert_eq!(actor.snapshot().base.start_timestamp, 50);
        assert_eq!(actor.snapshot().base.latest_min_event_timestamp, 50);

        let row = h.store.snapshot_row(&id()).expect("row should exist");
        assert_eq!(row.base.start_timestamp, 50);
        assert_eq!(row.base.latest_min_event_timestamp, 50);
    }

    #[tokio::test]
    async fn raise_on_terminal_aggregate_is_rejected() {
        let h = harness();
        let mut actor = activated(&h, plain_options()).await;
        raise_at(&mut actor, "k1", 100).await;
        h.observers.set_version(&id(), 0, 1);
        h.observers.set_version(&id(), 1, 1);
        actor.over(OverType::None).await.expect("over should succeed");

        let err = actor
            .raise(CounterEvent::Incremented)
            .await
            .expect_err("raise on a terminal aggregate must fail");
        assert!(matches!(err, ActorError::StateIsOver { .. }));
        assert_eq!(actor.version(), 1);
    }

    // --- Deactivate / reactivate round trip ------------------------------

    #[tokio::test]
    async fn deactivate_reactivate_preserves_folded_state() {
        let h = harness();
        let options = ActorOptions {
            snapshot_version_interval: 100,
            ..plain_options()
        };
        let mut actor = activated(&h, options.clone()).await;

        let events = [
            CounterEvent::Incremented,
            CounterEvent::Added { amount: 10 },
            CounterEvent::Decremented,
        ];
        for (n, event) in events.iter().enumerate() {
            actor
                .raise_with_uid(event.clone(), EventUid::new(format!("k{n}"), 100 * (n as i64 + 1)))
                .await
                .expect("raise should succeed");
        }
        actor.deactivate().await.expect("deactivate should succeed");

        let revived = activated(&h, options).await;
        assert_eq!(revived.version(), events.len() as u64);
        let expected = events
            .iter()
            .fold(Counter::default(), |state, e| state.apply(e));
        assert_eq!(revived.state(), &expected);
    }

    // --- Archive engine --------------------------------------------------

    #[tokio::test]
    async fn pending_archive_promotes_by_policy() {
        let h = harness();
        let mut actor = activated(&h, eager_archive_options()).await;

        raise_at(&mut actor, "k1", 100).await;
        assert_eq!(actor.briefs().len(), 0);
        let pending = actor.pending_archive().expect("pending should exist");
        assert_eq!((pending.start_version, pending.end_version), (1, 1));

        raise_at(&mut actor, "k2", 200).await;
        assert!(actor.pending_archive().is_none(), "pending was promoted");
        assert_eq!(actor.briefs().len(), 1);
        let brief = &actor.briefs()[0];
        assert_eq!(brief.index, 0);
        assert_eq!((brief.start_version, brief.end_version), (1, 2));
        assert_eq!(h.store.archive_count(&id()), 1);
    }

    #[tokio::test]
    async fn promoted_briefs_abut_in_version_space() {
        let h = harness();
        let mut actor = activated(&h, eager_archive_options()).await;
        // Observers stay at 0 so nothing is cleared.
        for n in 1..=6u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }

        let briefs = actor.briefs();
        assert_eq!(briefs.len(), 3);
        for pair in briefs.windows(2) {
            assert_eq!(pair[0].end_version + 1, pair[1].start_version);
            assert_eq!(pair[0].index + 1, pair[1].index);
        }
    }

    #[tokio::test]
    async fn clearing_deferred_while_observers_lag() {
        let h = harness();
        let mut actor = activated(&h, eager_archive_options()).await;
        for n in 1..=4u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }

        assert_eq!(actor.briefs().len(), 2);
        assert!(actor.briefs().iter().all(|b| !b.event_is_cleared));
        assert_eq!(h.store.event_count(&id()), 4, "no events pruned yet");
    }

    #[tokio::test]
    async fn oldest_brief_cleared_once_observers_catch_up() {
        let h = harness();
        h.observers.set_version(&id(), 0, 100);
        h.observers.set_version(&id(), 1, 100);
        let mut actor = activated(&h, eager_archive_options()).await;

        for n in 1..=4u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }

        // Second promotion hit the retention threshold: the oldest brief
        // was cleared and its events left the hot log.
        let cleared: Vec<bool> = actor.briefs().iter().map(|b| b.event_is_cleared).collect();
        assert_eq!(cleared, vec![true, false]);
        assert_eq!(h.store.event_count(&id()), 2, "events 1..=2 pruned");

        // Next promotion clears the second brief and drops the first.
        for n in 5..=6u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }
        assert_eq!(actor.briefs().len(), 2, "only cursor and newest retained");
        assert_eq!(actor.briefs()[0].index, 1);
        assert!(actor.briefs()[0].event_is_cleared);
        assert_eq!(h.store.archive_count(&id()), 2);
        assert_eq!(h.store.event_count(&id()), 2, "events 3..=4 pruned");
    }

    #[tokio::test]
    async fn move_policy_relocates_cleared_events() {
        let h = harness();
        h.observers.set_version(&id(), 0, 100);
        h.observers.set_version(&id(), 1, 100);
        let mut options = eager_archive_options();
        options.archive.event_archive_type = EventArchiveType::Move;
        let mut actor = activated(&h, options).await;

        for n in 1..=4u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }

        assert_eq!(h.store.event_count(&id()), 2);
        assert_eq!(h.store.archived_event_count(&id()), 2);
    }

    #[tokio::test]
    async fn retro_event_into_cleared_window_is_rejected() {
        let h = harness();
        h.observers.set_version(&id(), 0, 100);
        h.observers.set_version(&id(), 1, 100);
        let mut actor = activated(&h, eager_archive_options()).await;
        for n in 1..=4u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }
        // Brief 0 (ts 100..=200) is cleared.
        let version_before = actor.version();
        let value_before = actor.state().value;

        let err = actor
            .raise_with_uid(CounterEvent::Incremented, EventUid::new("retro", 50))
            .await
            .expect_err("retro-dating into pruned history must fail");
        assert!(matches!(err, ActorError::EventIsCleared { .. }));
        assert_eq!(actor.version(), version_before, "state unchanged");
        assert_eq!(actor.state().value, value_before);

        // The aggregate remains usable at the next version.
        assert!(raise_at(&mut actor, "k5", 500).await);
        assert_eq!(actor.version(), version_before + 1);
    }

    #[tokio::test]
    async fn retro_event_folds_overlapping_briefs_into_pending() {
        let h = harness();
        let mut actor = activated(&h, eager_archive_options()).await;
        // Observers stay at 0 so both briefs survive unconverted.
        for n in 1..=4u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }
        assert_eq!(actor.briefs().len(), 2);

        // A retro event at t=250 overlaps brief 1 (ts 300..=400) only:
        // brief 1 is unwound into the pending archive, absorbs the new
        // event, and -- eagerly completed again -- re-promotes in place.
        assert!(raise_at(&mut actor, "retro", 250).await);

        assert_eq!(actor.briefs().len(), 2);
        assert!(actor.pending_archive().is_none());
        assert_eq!(h.store.archive_count(&id()), 2);
        let merged = &actor.briefs()[1];
        assert_eq!(merged.index, 1);
        assert_eq!((merged.start_version, merged.end_version), (3, 5));
        assert_eq!((merged.start_timestamp, merged.end_timestamp), (250, 400));
        assert_eq!(
            actor.briefs()[0].end_version + 1,
            merged.start_version,
            "the re-promoted merge stays dense against its neighbor"
        );
        assert_eq!(actor.version(), 5);
        assert_eq!(actor.state().value, 5);
    }

    #[tokio::test]
    async fn retro_walk_stops_at_a_cleared_brief() {
        let h = harness();
        h.observers.set_version(&id(), 0, 100);
        h.observers.set_version(&id(), 1, 100);
        let mut actor = activated(&h, eager_archive_options()).await;
        for n in 1..=4u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }
        // Brief 0 (ts 100..=200) is cleared; brief 1 (ts 300..=400) is not.
        // t=150 is inside the cleared window but past its start, so the
        // walk (not the window guard) must reject it.
        let err = actor
            .raise_with_uid(CounterEvent::Incremented, EventUid::new("retro", 150))
            .await
            .expect_err("walk must refuse the cleared brief");
        assert!(matches!(err, ActorError::EventIsCleared { .. }));
        assert_eq!(actor.version(), 4);

        let cleared_still_stored = h.store.archive_count(&id()) >= 1;
        assert!(cleared_still_stored, "the cleared brief is never deleted");
    }

    #[tokio::test]
    async fn deactivate_force_archives_a_worthwhile_pending() {
        let h = harness();
        let mut options = eager_archive_options();
        // Promotion policy that never fires on its own.
        options.archive.min_interval_ms = i64::MAX;
        options.archive.max_version_interval = u64::MAX;
        options.archive.min_version_interval_at_deactivate = 2;
        let mut actor = activated(&h, options).await;

        for n in 1..=3u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }
        assert_eq!(h.store.archive_count(&id()), 0);

        actor.deactivate().await.expect("deactivate should succeed");
        assert_eq!(h.store.archive_count(&id()), 1, "span 2 forces the archive");
        assert!(actor.pending_archive().is_none());
    }

    #[tokio::test]
    async fn activation_demotes_a_partial_archive_to_pending() {
        let h = harness();
        let mut options = eager_archive_options();
        options.archive.min_interval_ms = i64::MAX;
        options.archive.max_version_interval = u64::MAX;
        options.archive.min_version_interval_at_deactivate = 1;
        let mut actor = activated(&h, options.clone()).await;
        for n in 1..=3u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }
        actor.deactivate().await.expect("deactivate should succeed");
        assert_eq!(h.store.archive_count(&id()), 1);

        // The stored archive never satisfied the promotion policy, so the
        // next activation pulls it back as the pending archive.
        let revived = activated(&h, options).await;
        assert_eq!(h.store.archive_count(&id()), 0);
        let pending = revived.pending_archive().expect("pending should exist");
        assert_eq!((pending.start_version, pending.end_version), (1, 3));
    }

    #[tokio::test]
    async fn activation_rebuilds_pending_archive_from_event_tail() {
        let h = harness();
        let options = eager_archive_options();
        let mut actor = activated(&h, options.clone()).await;
        for n in 1..=5u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }
        // Briefs cover 1..=4; v5 sits only in the pending archive, which
        // dies with the actor.
        assert_eq!(actor.pending_archive().map(|p| p.end_version), Some(5));
        drop(actor);

        let revived = activated(&h, options).await;
        let pending = revived.pending_archive().expect("tail rebuilt into pending");
        assert_eq!((pending.start_version, pending.end_version), (5, 5));
        assert_eq!(revived.version(), 5);
    }

    // --- Observer sync on activation -------------------------------------

    #[tokio::test]
    async fn activation_syncs_observers_when_configured() {
        let h = harness();
        let options = ActorOptions {
            sync_all_observers_on_activate: true,
            ..plain_options()
        };
        let mut actor = activated(&h, options.clone()).await;
        for n in 1..=3u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }
        actor.deactivate().await.expect("deactivate should succeed");

        let _revived = activated(&h, options).await;
        let versions = h
            .observers
            .all_versions(&id())
            .await
            .expect("versions should be readable");
        assert_eq!(versions, vec![3, 3]);
    }

    #[tokio::test]
    async fn activation_fails_when_observer_sync_fails() {
        let h = harness();
        let options = ActorOptions {
            sync_all_observers_on_activate: true,
            ..plain_options()
        };
        let mut actor = activated(&h, options.clone()).await;
        raise_at(&mut actor, "k1", 100).await;
        actor.deactivate().await.expect("deactivate should succeed");

        h.observers.set_fail_sync(true);
        let mut stale = build_actor(&h, options);
        let err = stale
            .activate()
            .await
            .expect_err("activation must fail on observer sync failure");
        assert!(matches!(err, ActorError::SyncAllObserversFailed { version: 1 }));
    }

    // --- Terminal transitions --------------------------------------------

    #[tokio::test]
    async fn over_requires_observers_to_be_caught_up() {
        let h = harness();
        let mut actor = activated(&h, plain_options()).await;
        for n in 1..=3u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }

        let err = actor
            .over(OverType::DeleteEvent)
            .await
            .expect_err("over must fail while observers lag");
        assert!(matches!(err, ActorError::ObserverNotCompleted { required: 3 }));
        assert!(!actor.is_over());
    }

    #[tokio::test]
    async fn over_delete_all_wipes_everything() {
        let h = harness();
        h.observers.set_version(&id(), 0, 100);
        h.observers.set_version(&id(), 1, 100);
        let mut actor = activated(&h, eager_archive_options()).await;
        for n in 1..=3u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }

        actor
            .over(OverType::DeleteAll)
            .await
            .expect("over should succeed");

        assert!(actor.is_over());
        assert!(h.store.snapshot_row(&id()).is_none(), "snapshot deleted");
        assert_eq!(h.store.event_count(&id()), 0, "events deleted");
        assert_eq!(h.store.archive_count(&id()), 0, "archives deleted");

        let err = actor
            .raise(CounterEvent::Incremented)
            .await
            .expect_err("raise after over must fail");
        assert!(matches!(err, ActorError::StateIsOver { .. }));
    }

    #[tokio::test]
    async fn over_archiving_event_moves_the_whole_log() {
        let h = harness();
        h.observers.set_version(&id(), 0, 100);
        h.observers.set_version(&id(), 1, 100);
        let mut actor = activated(&h, eager_archive_options()).await;
        for n in 1..=3u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }

        actor
            .over(OverType::ArchivingEvent)
            .await
            .expect("over should succeed");

        assert_eq!(h.store.event_count(&id()), 0);
        assert_eq!(h.store.archived_event_count(&id()), 3);
        assert_eq!(h.store.archive_count(&id()), 0);
        let row = h.store.snapshot_row(&id()).expect("snapshot kept");
        assert!(row.base.is_over);
        assert!(row.base.is_latest);
    }

    #[tokio::test]
    async fn over_none_only_flags() {
        let h = harness();
        let mut actor = activated(&h, eager_archive_options()).await;
        for n in 1..=3u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
        }

        actor.over(OverType::None).await.expect("over should succeed");

        assert!(actor.is_over());
        assert_eq!(h.store.event_count(&id()), 3, "events kept");
        assert!(h.store.archive_is_over(&id()), "archive over-flag set");
        let row = h.store.snapshot_row(&id()).expect("snapshot kept");
        assert!(row.base.is_over);
    }

    #[tokio::test]
    async fn over_twice_is_rejected() {
        let h = harness();
        let mut actor = activated(&h, plain_options()).await;
        actor.over(OverType::None).await.expect("first over should succeed");

        let err = actor
            .over(OverType::None)
            .await
            .expect_err("second over must fail");
        assert!(matches!(err, ActorError::StateIsOver { .. }));
    }

    #[tokio::test]
    async fn reset_then_replay_reproduces_the_payload() {
        let h = harness();
        h.observers.set_version(&id(), 0, 100);
        h.observers.set_version(&id(), 1, 100);
        let mut actor = activated(&h, plain_options()).await;

        let events = [
            CounterEvent::Incremented,
            CounterEvent::Added { amount: 7 },
            CounterEvent::Incremented,
        ];
        for (n, event) in events.iter().enumerate() {
            actor
                .raise_with_uid(event.clone(), EventUid::new(format!("a{n}"), 100 * (n as i64 + 1)))
                .await
                .expect("raise should succeed");
        }
        let original = actor.state().clone();

        actor.reset().await.expect("reset should succeed");
        assert_eq!(actor.version(), 0);
        assert!(!actor.is_over());
        assert_eq!(actor.state(), &Counter::default());
        let versions = h
            .observers
            .all_versions(&id())
            .await
            .expect("versions should be readable");
        assert_eq!(versions, vec![0, 0], "observers told to start over");

        for (n, event) in events.iter().enumerate() {
            actor
                .raise_with_uid(event.clone(), EventUid::new(format!("b{n}"), 100 * (n as i64 + 1)))
                .await
                .expect("re-raise should succeed");
        }
        assert_eq!(actor.state(), &original);
    }

    // --- Bus and fan-out -------------------------------------------------

    #[tokio::test]
    async fn bus_failure_falls_back_to_synchronous_fan_out() {
        let h = harness();
        h.bus.set_fail(true);
        let mut actor = activated(&h, plain_options()).await;

        assert!(raise_at(&mut actor, "k1", 100).await);

        assert!(h.bus.published().is_empty());
        assert_eq!(
            h.observers.handled().len(),
            2,
            "every handler received the event"
        );
    }

    #[tokio::test]
    async fn fan_out_first_when_bus_priority_is_off() {
        let h = harness();
        let options = ActorOptions {
            priority_async_event_bus: false,
            ..plain_options()
        };
        let mut actor = activated(&h, options).await;

        assert!(raise_at(&mut actor, "k1", 100).await);

        assert_eq!(h.observers.handled().len(), 2);
        assert!(h.bus.published().is_empty(), "bus untouched on success");
    }

    #[tokio::test]
    async fn fan_out_failure_falls_back_to_bus() {
        let h = harness();
        h.observers.set_fail_handlers(true);
        let options = ActorOptions {
            priority_async_event_bus: false,
            ..plain_options()
        };
        let mut actor = activated(&h, options).await;

        assert!(raise_at(&mut actor, "k1", 100).await);
        assert_eq!(h.bus.published().len(), 1);
    }

    #[tokio::test]
    async fn delivery_failure_never_fails_the_raise() {
        let h = harness();
        h.bus.set_fail(true);
        h.observers.set_fail_handlers(true);
        let mut actor = activated(&h, plain_options()).await;

        assert!(raise_at(&mut actor, "k1", 100).await);
        assert_eq!(actor.version(), 1, "the event is durable regardless");
    }

    #[tokio::test]
    async fn bare_publish_reaches_the_bus() {
        let h = harness();
        let actor = activated(&h, plain_options()).await;

        actor.publish(&CounterEvent::Added { amount: 9 }).await;

        let published = h.bus.published();
        assert_eq!(published.len(), 1);
        let msg: crate::bus::BareMessage =
            serde_json::from_slice(&published[0]).expect("envelope should decode");
        assert_eq!(msg.type_code, "counter.added");
        assert_eq!(actor.version(), 0, "bare publish never touches state");
    }

    // --- Invariants ------------------------------------------------------

    #[tokio::test]
    async fn version_equals_doing_version_after_every_operation() {
        let h = harness();
        h.observers.set_version(&id(), 0, 100);
        h.observers.set_version(&id(), 1, 100);
        let mut actor = activated(&h, eager_archive_options()).await;

        for n in 1..=6u64 {
            raise_at(&mut actor, &format!("k{n}"), 100 * n as i64).await;
            let base = &actor.snapshot().base;
            assert_eq!(base.version, base.doing_version);
            assert!(actor.version() >= 1);
        }
        actor.deactivate().await.expect("deactivate should succeed");
        let base = &actor.snapshot().base;
        assert_eq!(base.version, base.doing_version);
        assert!(base.start_timestamp <= base.latest_min_event_timestamp);
    }
}
