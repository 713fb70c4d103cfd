//! Runtime configuration for the actor core and its archive subsystem.

/// Policy for what happens to events covered by a cleared archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventArchiveType {
    /// Remove cleared events from the event log entirely.
    #[default]
    Delete,
    /// Move cleared events into the archive-event store before removal
    /// from the hot log.
    Move,
}

/// Configuration of the archive subsystem.
///
/// Archives roll committed events into immutable, indexed
/// snapshot-plus-range records so old events can be pruned without losing
/// reconstructability. All fields have sensible defaults accessible via
/// [`ArchiveOptions::default()`].
///
/// # Examples
///
/// ```
/// use statefold::ArchiveOptions;
///
/// let opts = ArchiveOptions {
///     max_snapshot_archive_records: 3,
///     ..ArchiveOptions::default()
/// };
/// assert!(opts.on);
/// assert_eq!(opts.max_snapshot_archive_records, 3);
/// ```
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Master toggle for the archive subsystem.
    ///
    /// Default: `true`.
    pub on: bool,

    /// Minimum version span a pending archive must cover before the
    /// elapsed-time rule can promote it.
    ///
    /// Default: 500.
    pub min_version_interval: u64,

    /// Version span at which a pending archive is promoted regardless of
    /// elapsed wall time.
    ///
    /// Default: 5000.
    pub max_version_interval: u64,

    /// Minimum wall time (ms) that must elapse since the previous archive
    /// before a pending archive covering at least
    /// [`min_version_interval`](ArchiveOptions::min_version_interval)
    /// versions is promoted.
    ///
    /// Default: one hour.
    pub min_interval_ms: i64,

    /// Number of retained non-cleared archives at which the oldest becomes
    /// a candidate for event-clearing.
    ///
    /// Default: 5.
    pub max_snapshot_archive_records: usize,

    /// Minimum version span of the pending archive that forces a promotion
    /// at deactivation.
    ///
    /// Default: 1.
    pub min_version_interval_at_deactivate: u64,

    /// What to do with events covered by a cleared archive.
    ///
    /// Default: [`EventArchiveType::Delete`].
    pub event_archive_type: EventArchiveType,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            on: true,
            min_version_interval: 500,
            max_version_interval: 5_000,
            min_interval_ms: 60 * 60 * 1_000,
            max_snapshot_archive_records: 5,
            min_version_interval_at_deactivate: 1,
            event_archive_type: EventArchiveType::Delete,
        }
    }
}

/// Configuration consumed by a [`StateActor`](crate::StateActor).
///
/// # Examples
///
/// ```
/// use statefold::ActorOptions;
///
/// let opts = ActorOptions {
///     snapshot_version_interval: 10,
///     ..ActorOptions::default()
/// };
/// assert_eq!(opts.snapshot_version_interval, 10);
/// assert_eq!(opts.events_per_read, 1000);
/// ```
#[derive(Debug, Clone)]
pub struct ActorOptions {
    /// Page size for event-log range reads during recovery and archive
    /// reconstruction.
    ///
    /// Default: 1000.
    pub events_per_read: u64,

    /// Number of committed versions between automatic snapshot flushes on
    /// the raise path.
    ///
    /// Default: 500.
    pub snapshot_version_interval: u64,

    /// Minimum version delta that triggers a forced snapshot flush at the
    /// end of recovery.
    ///
    /// Default: 1.
    pub min_snapshot_version_interval: u64,

    /// When `true`, published events try the async bus first and fall back
    /// to synchronous observer fan-out; when `false`, the order is
    /// reversed.
    ///
    /// Default: `true`.
    pub priority_async_event_bus: bool,

    /// When `true`, activation blocks until every observer has caught up
    /// to the recovered version and fails if any cannot.
    ///
    /// Default: `false`.
    pub sync_all_observers_on_activate: bool,

    /// Archive subsystem configuration.
    pub archive: ArchiveOptions,
}

impl Default for ActorOptions {
    fn default() -> Self {
        Self {
            events_per_read: 1_000,
            snapshot_version_interval: 500,
            min_snapshot_version_interval: 1,
            priority_async_event_bus: true,
            sync_all_observers_on_activate: false,
            archive: ArchiveOptions::default(),
        }
    }
}
