//! Event-sourced stateful actor runtime core.
//!
//! `statefold` provides the per-aggregate lifecycle of an event-sourced
//! actor system: an in-memory versioned snapshot, an append-only event log
//! behind a gateway trait, periodic snapshot persistence, and immutable
//! *archives* that let old events be pruned without losing
//! reconstructability. The actor host (scheduling, key delivery,
//! single-threaded-per-actor execution) and the concrete storage backends
//! live outside this crate, behind the trait seams in [`storage`],
//! [`ObserverUnit`], and [`EventBusProducer`].
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`State`] | User aggregate payload: folds domain events into state |
//! | [`StateActor`] | Per-aggregate runtime: raise, recover, archive, lifecycle |
//! | [`Snapshot`] | Payload plus version/timestamp bookkeeping header |
//! | [`ArchiveBrief`] | Metadata of one immutable snapshot-plus-range archive |
//! | [`EventStorage`] / [`SnapshotStorage`] / [`ArchiveStorage`] | Durable store gateways |
//! | [`ObserverUnit`] | Downstream consumers tracked by committed version |
//! | [`EventBusProducer`] | At-least-once bus with synchronous fan-out fallback |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use serde::{Deserialize, Serialize};
//! use statefold::memory::{MemoryEventBus, MemoryObserverUnit, MemoryStore};
//! use statefold::{Event, State, StateActor};
//!
//! // 1. Define your aggregate payload and its events.
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct Counter {
//!     value: u64,
//! }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! #[serde(tag = "type", content = "data")]
//! enum CounterEvent {
//!     Incremented,
//! }
//!
//! impl Event for CounterEvent {
//!     fn type_code(&self) -> &'static str {
//!         "counter.incremented"
//!     }
//! }
//!
//! impl State for Counter {
//!     type Event = CounterEvent;
//!
//!     fn apply(mut self, _event: &CounterEvent) -> Self {
//!         self.value += 1;
//!         self
//!     }
//! }
//!
//! # async fn run() -> Result<(), statefold::ActorError> {
//! // 2. Wire gateways and activate the actor.
//! let store = Arc::new(MemoryStore::<String, Counter>::new());
//! let mut actor = StateActor::<String, Counter>::builder("counter-1".to_string())
//!     .event_storage(store.clone())
//!     .snapshot_storage(store.clone())
//!     .archive_storage(store.clone())
//!     .observer_unit(Arc::new(MemoryObserverUnit::new(1)))
//!     .event_bus(Arc::new(MemoryEventBus::new()))
//!     .build()?;
//! actor.activate().await?;
//!
//! // 3. Raise events.
//! actor.raise(CounterEvent::Incremented).await?;
//! assert_eq!(actor.state().value, 1);
//! assert_eq!(actor.version(), 1);
//! # Ok(())
//! # }
//! ```

mod actor;
pub use actor::{ActorBuilder, OverType, StateActor};
mod archive;
pub use archive::{ArchiveBrief, BriefList};
mod bus;
pub use bus::{
    BareMessage, EventBusProducer, TransportMessage, decode_basic_info, encode_bare,
    encode_transport,
};
mod error;
pub use error::{ActorError, StorageError};
mod event;
pub use event::{Event, EventBasicInfo, EventUid, FullyEvent, StateId, now_ms};
pub mod memory;
mod observer;
pub use observer::{EventHandler, ObserverUnit};
mod options;
pub use options::{ActorOptions, ArchiveOptions, EventArchiveType};
mod snapshot;
pub use snapshot::{Snapshot, SnapshotBase};
mod state;
pub use state::State;
pub mod storage;
pub use storage::{ArchiveStorage, EventStorage, SnapshotStorage};
