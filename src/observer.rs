//! Observer-unit seam: downstream consumers that track a committed version
//! per aggregate.
//!
//! Observers are eventually consistent read models or side-effect handlers
//! fed by the event bus. The core never owns them; it consumes a single
//! resolved [`ObserverUnit`] per actor, wired in at build time. Archive
//! event-clearing and terminal transitions are gated on every observer's
//! committed version, and the synchronous fan-out path delivers event bytes
//! straight to the unit's handlers when the bus is unavailable.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::event::StateId;

/// A single synchronous fan-out target: receives the same serialized
/// transport bytes the bus would deliver.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Consume one serialized transport message.
    async fn handle(&self, bytes: &[u8]) -> Result<(), StorageError>;
}

/// The resolved observer group of one aggregate type.
///
/// An implementation typically fronts a registry of observer shards; the
/// actor resolves its unit once at build time and holds only this handle,
/// which keeps the actor -> registry -> actor reference cycle out of the
/// core.
#[async_trait]
pub trait ObserverUnit<K: StateId>: Send + Sync {
    /// The committed version of every observer for the given aggregate.
    async fn all_versions(&self, state_id: &K) -> Result<Vec<u64>, StorageError>;

    /// Ask every observer to catch up to `version`. One flag per observer;
    /// `false` means that observer could not reach the version.
    async fn sync_all(&self, state_id: &K, version: u64) -> Result<Vec<bool>, StorageError>;

    /// Instruct every observer to discard its state for the aggregate and
    /// start over.
    async fn reset_all(&self, state_id: &K) -> Result<(), StorageError>;

    /// The synchronous fan-out targets backing this unit.
    fn event_handlers(&self) -> Vec<Arc<dyn EventHandler>>;
}
