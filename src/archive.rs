//! Archive briefs and the brief list.
//!
//! An archive is a durable snapshot-at-a-version plus the event range it
//! covers; the *brief* is its metadata without the snapshot body. The actor
//! accumulates at most one pending brief between promotions, and keeps the
//! promoted briefs in an index-ordered [`BriefList`]. Retro-dated events are
//! handled by unwinding overlapping briefs back into the pending one rather
//! than being forbidden; [`BriefList::fold_back`] is that seam.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ActorError;
use crate::event::{Event, FullyEvent, StateId};
use crate::options::ArchiveOptions;

/// Metadata of one archive: its identity, dense position, and the version
/// and timestamp range it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveBrief {
    /// Archive identity, stable across promotion and merging.
    pub id: Uuid,
    /// 0-based position in the aggregate's archive sequence.
    pub index: u64,
    /// Lowest event version covered.
    pub start_version: u64,
    /// Highest event version covered.
    pub end_version: u64,
    /// Earliest event timestamp covered (ms).
    pub start_timestamp: i64,
    /// Latest event timestamp covered (ms).
    pub end_timestamp: i64,
    /// True once the covered events have been cleared from the hot log.
    pub event_is_cleared: bool,
}

impl ArchiveBrief {
    /// Start a pending brief from its first event.
    pub fn from_event<K: StateId, E: Event>(index: u64, event: &FullyEvent<K, E>) -> Self {
        Self {
            id: Uuid::new_v4(),
            index,
            start_version: event.basic_info.version,
            end_version: event.basic_info.version,
            start_timestamp: event.basic_info.timestamp,
            end_timestamp: event.basic_info.timestamp,
            event_is_cleared: false,
        }
    }

    /// Extend the brief with one more committed event.
    ///
    /// Versions arrive in commit order so `end_version` simply advances;
    /// timestamps may be retro-dated, so both bounds are min/max folds.
    pub fn include<K: StateId, E: Event>(&mut self, event: &FullyEvent<K, E>) {
        self.end_version = event.basic_info.version;
        self.start_timestamp = self.start_timestamp.min(event.basic_info.timestamp);
        self.end_timestamp = self.end_timestamp.max(event.basic_info.timestamp);
    }

    /// Merge another brief into this one (the retro-merge operation).
    ///
    /// Bounds become the min/max of both; the index becomes the smaller of
    /// the two so a re-promoted merge lands densely after the surviving
    /// list. The id of `self` is kept.
    pub fn combine(&mut self, other: &ArchiveBrief) {
        self.index = self.index.min(other.index);
        self.start_version = self.start_version.min(other.start_version);
        self.end_version = self.end_version.max(other.end_version);
        self.start_timestamp = self.start_timestamp.min(other.start_timestamp);
        self.end_timestamp = self.end_timestamp.max(other.end_timestamp);
    }

    /// Number of versions covered.
    pub fn version_span(&self) -> u64 {
        self.end_version - self.start_version
    }

    /// Promotion policy: enough wall time has passed since the previous
    /// archive and the brief spans enough versions, or the span alone has
    /// crossed the unconditional threshold.
    ///
    /// Without a previous archive the elapsed time is measured across the
    /// brief itself.
    pub fn is_completed(&self, options: &ArchiveOptions, prev: Option<&ArchiveBrief>) -> bool {
        let elapsed_ms = match prev {
            Some(prev) => self.end_timestamp - prev.end_timestamp,
            None => self.end_timestamp - self.start_timestamp,
        };
        let span = self.version_span();
        (elapsed_ms >= options.min_interval_ms && span >= options.min_version_interval)
            || span >= options.max_version_interval
    }
}

/// Index-ordered list of promoted archive briefs owned by one actor.
///
/// Wraps the raw `Vec` so the retro-merge walk, the cleared-cursor
/// bookkeeping, and the ordering invariant stay in one place.
#[derive(Debug, Clone, Default)]
pub struct BriefList {
    briefs: Vec<ArchiveBrief>,
}

impl BriefList {
    /// Wrap a stored brief list, restoring index order.
    pub fn new(mut briefs: Vec<ArchiveBrief>) -> Self {
        briefs.sort_by_key(|b| b.index);
        Self { briefs }
    }

    /// The newest (highest-index) brief.
    pub fn last(&self) -> Option<&ArchiveBrief> {
        self.briefs.last()
    }

    /// The brief immediately before the newest one.
    pub fn prev_of_last(&self) -> Option<&ArchiveBrief> {
        self.briefs.len().checked_sub(2).map(|i| &self.briefs[i])
    }

    /// The cleared cursor: the highest-index brief whose events have been
    /// cleared from the hot log.
    pub fn cleared(&self) -> Option<&ArchiveBrief> {
        self.briefs.iter().rev().find(|b| b.event_is_cleared)
    }

    /// Number of briefs whose events are still in the hot log.
    pub fn noncleared_len(&self) -> usize {
        self.briefs.iter().filter(|b| !b.event_is_cleared).count()
    }

    /// The oldest brief whose events are still in the hot log.
    pub fn oldest_noncleared(&self) -> Option<&ArchiveBrief> {
        self.briefs.iter().find(|b| !b.event_is_cleared)
    }

    /// Append a newly promoted brief.
    pub fn push(&mut self, brief: ArchiveBrief) {
        debug_assert!(
            self.briefs.last().is_none_or(|last| last.index < brief.index),
            "briefs must stay index-ordered"
        );
        self.briefs.push(brief);
    }

    /// Remove and return the newest brief.
    pub fn pop_last(&mut self) -> Option<ArchiveBrief> {
        self.briefs.pop()
    }

    /// Pop the newest brief if its covered range extends past
    /// `until_timestamp` -- one step of the retro-merge walk.
    ///
    /// Returns `Ok(None)` when no brief overlaps the timestamp and the
    /// walk is finished.
    ///
    /// # Errors
    ///
    /// [`ActorError::EventIsCleared`] if the overlapping brief has already
    /// been cleared: a retro-dated event may never reach into pruned
    /// history, and a cleared brief is never deleted by the walk.
    pub fn fold_back(&mut self, until_timestamp: i64) -> Result<Option<ArchiveBrief>, ActorError> {
        match self.briefs.last() {
            Some(last) if last.end_timestamp > until_timestamp => {
                if last.event_is_cleared {
                    return Err(ActorError::EventIsCleared {
                        timestamp: until_timestamp,
                        cleared_start: last.start_timestamp,
                    });
                }
                Ok(self.briefs.pop())
            }
            _ => Ok(None),
        }
    }

    /// Mark the brief with the given id as cleared.
    pub fn mark_cleared(&mut self, brief_id: &Uuid) {
        if let Some(brief) = self.briefs.iter_mut().find(|b| b.id == *brief_id) {
            brief.event_is_cleared = true;
        }
    }

    /// Remove and return every cleared brief older than `index`, keeping
    /// the newest cleared brief as the cursor.
    pub fn drain_cleared_before(&mut self, index: u64) -> Vec<ArchiveBrief> {
        let (drained, kept) = std::mem::take(&mut self.briefs)
            .into_iter()
            .partition(|b| b.event_is_cleared && b.index < index);
        self.briefs = kept;
        drained
    }

    /// Drop every brief (used by terminal transitions).
    pub fn clear(&mut self) {
        self.briefs.clear();
    }

    /// View of the retained briefs in index order.
    pub fn as_slice(&self) -> &[ArchiveBrief] {
        &self.briefs
    }
}
