//! Crate-level error types for the actor runtime and its storage gateways.

/// Failure reported by a storage, observer, or bus gateway.
///
/// The core treats gateway internals as opaque: whatever the backend's
/// native error was, it arrives here as a message plus an optional source.
/// Gateway implementations build one via [`StorageError::new`] or the
/// `From<serde_json::Error>` conversion.
#[derive(Debug, thiserror::Error)]
#[error("storage failure: {message}")]
pub struct StorageError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StorageError {
    /// Build a storage error from a plain message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Build a storage error wrapping an underlying driver error.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::with_source("payload codec failure", e)
    }
}

/// Error returned by the public operations of a
/// [`StateActor`](crate::StateActor).
///
/// Invariant failures ([`StateIsOver`](ActorError::StateIsOver),
/// [`StateInsecurity`](ActorError::StateInsecurity),
/// [`EventIsCleared`](ActorError::EventIsCleared)) are not locally
/// recoverable and surface to the caller as-is. Storage and serialization
/// failures inside a raise trigger a rebuild from persisted state before
/// they are re-thrown.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    /// A raise, reset, or delete was attempted on a terminal aggregate.
    #[error("aggregate {state_id} is over; no further events may be raised")]
    StateIsOver {
        /// Display form of the aggregate's primary key.
        state_id: String,
    },

    /// The `version == doing_version` invariant was broken at a checkpoint.
    ///
    /// Indicates a torn commit: an event append advanced the in-flight
    /// version but the matching apply/commit never happened.
    #[error("version invariant broken for {state_id}: committed {version}, doing {doing_version}")]
    StateInsecurity {
        /// Display form of the aggregate's primary key.
        state_id: String,
        /// The committed version.
        version: u64,
        /// The in-flight version.
        doing_version: u64,
    },

    /// A retro-dated event falls inside an archive window whose events
    /// have already been cleared from the log.
    #[error(
        "event at timestamp {timestamp} falls inside a cleared archive window starting at {cleared_start}"
    )]
    EventIsCleared {
        /// Timestamp of the rejected event.
        timestamp: i64,
        /// Start timestamp of the cleared archive window.
        cleared_start: i64,
    },

    /// A terminal transition was requested before every downstream
    /// observer caught up to the aggregate's version.
    #[error("observers have not completed up to version {required}")]
    ObserverNotCompleted {
        /// The version observers must reach.
        required: u64,
    },

    /// Activation-time observer synchronization reported a failure.
    #[error("syncing all observers to version {version} failed")]
    SyncAllObserversFailed {
        /// The version observers were asked to reach.
        version: u64,
    },

    /// A required collaborator was not wired into the builder.
    #[error("missing required dependency: {0}")]
    MissingDependency(&'static str),

    /// A storage gateway failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// An event or snapshot payload could not be encoded or decoded.
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_over_display_names_the_aggregate() {
        let err = ActorError::StateIsOver {
            state_id: "order-1".into(),
        };
        assert!(err.to_string().contains("order-1"));
    }

    #[test]
    fn state_insecurity_display_carries_both_versions() {
        let err = ActorError::StateInsecurity {
            state_id: "order-1".into(),
            version: 4,
            doing_version: 6,
        };
        let msg = err.to_string();
        assert!(msg.contains("committed 4"), "got: {msg}");
        assert!(msg.contains("doing 6"), "got: {msg}");
    }

    #[test]
    fn storage_error_from_serde_keeps_source() {
        let serde_err = serde_json::from_str::<u64>("not a number").unwrap_err();
        let err = StorageError::from(serde_err);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn actor_error_wraps_storage_transparently() {
        let err = ActorError::from(StorageError::new("connection reset"));
        assert!(err.to_string().contains("connection reset"));
    }

    // Verify `Send + Sync` bounds are satisfied so errors can cross thread
    // boundaries between actors.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<ActorError>();
            assert_send_sync::<StorageError>();
        }
    };
}
