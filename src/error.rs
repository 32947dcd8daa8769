//! Crate-level error types for storage, command execution, state retrieval,
//! and projections.

/// Error surfaced by an [`EventStorage`](crate::EventStorage) backend.
///
/// Backends classify their native failures into this shape: a violated
/// uniqueness constraint becomes [`DuplicateConflict`](StoreError::DuplicateConflict),
/// everything else that is not a caller mistake becomes
/// [`Fault`](StoreError::Fault).
///
/// `Clone` so that a single load failure can be reported to every command
/// queued behind it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness constraint was violated.
    ///
    /// Raised when an event ID already exists, when a `(stream, sequence)`
    /// pair is already taken (another writer advanced the stream), or when a
    /// projection index entry is written twice.
    #[error("duplicate conflict: {0}")]
    DuplicateConflict(String),

    /// Two distinct names hashed to the same key.
    ///
    /// Writes refuse to merge the streams; reads treat the colliding key as
    /// not found.
    #[error("key collision: '{requested}' hashes to the key owned by '{existing}'")]
    KeyCollision {
        /// The name the caller asked for.
        requested: String,
        /// The name already stored under the key.
        existing: String,
    },

    /// The request itself is malformed (zero or gapped sequence, empty
    /// batch, non-dense index entries).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Connectivity, I/O, or schema failure inside the backend.
    #[error("store fault: {0}")]
    Fault(String),
}

impl StoreError {
    /// Returns `true` for the optimistic-concurrency signal.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::DuplicateConflict(_))
    }
}

/// Error returned when executing a command against an aggregate fails.
///
/// Generic over `E`, the domain-specific error type that the aggregate's
/// command handler may produce (e.g., "product already exists").
///
/// # Type Parameters
///
/// * `E` - Domain error type, must implement `Error + Send + Sync + 'static`
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic.
    ///
    /// Wraps the domain-specific error returned from the aggregate's
    /// command handler, forwarding its `Display` and `Error` impls.
    /// Nothing was persisted.
    #[error(transparent)]
    Domain(E),

    /// Another writer advanced the stream past this actor's view.
    ///
    /// The actor has reloaded the stream. The command was not re-run; the
    /// caller may resubmit it.
    #[error("optimistic concurrency conflict: stream was advanced by another writer")]
    Conflict,

    /// The event store failed while loading or persisting events.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A produced domain event could not be encoded.
    #[error("event encoding failed: {0}")]
    Codec(String),

    /// The caller stopped waiting. The command may still complete.
    #[error("timed out waiting for the command result")]
    TimedOut,

    /// Actor task exited unexpectedly.
    ///
    /// The background actor that owns this aggregate has shut down,
    /// so no further commands can be processed through this handle.
    #[error("aggregate actor is no longer running")]
    ActorGone,
}

/// Error returned when reading the current state of an aggregate fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Loading the stream from the event store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Actor task exited unexpectedly.
    #[error("aggregate actor is no longer running")]
    ActorGone,
}

/// Error returned by projection and projection-stream operations.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// No projection or projection stream with this name was registered.
    #[error("projection '{0}' not registered")]
    NotRegistered(String),

    /// The registered projection under this name has a different type.
    #[error("projection '{0}' type mismatch")]
    TypeMismatch(String),

    /// Reading the log or the projection index failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Loading or saving a local checkpoint file failed.
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The indexer actor for the projection stream has exited.
    #[error("indexer for projection stream '{0}' is no longer running")]
    IndexerGone(String),
}

/// Error returned by [`AggregateStoreBuilder::open`](crate::AggregateStoreBuilder::open).
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// Creating the schema failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Reading a projection checkpoint file failed.
    #[error("failed to load projection checkpoint: {0}")]
    Io(#[from] std::io::Error),

    /// Two projection streams, or two projections, share a name.
    #[error("'{0}' is registered more than once")]
    DuplicateName(String),

    /// A projection reads a projection stream that was never registered.
    #[error("projection '{projection}' reads unregistered projection stream '{stream}'")]
    UnknownStream {
        /// The projection's name.
        projection: String,
        /// The missing projection stream.
        stream: String,
    },
}

/// Returned when an aggregate type refuses to be instantiated on a stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("aggregate type '{aggregate_type}' may not own stream '{stream_id}'")]
pub struct StreamNotOwned {
    /// The aggregate type that was requested.
    pub aggregate_type: &'static str,
    /// The stream it was requested for.
    pub stream_id: String,
}

/// Returned by [`AggregateStore::get`](crate::AggregateStore::get) and
/// [`AggregateStore::get_stream`](crate::AggregateStore::get_stream).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    /// The aggregate type's ownership predicate rejects the stream.
    #[error(transparent)]
    NotOwned(#[from] StreamNotOwned),

    /// A running actor of another aggregate type owns the stream.
    ///
    /// Only one actor per stream runs in a store; the stream becomes
    /// available again once that actor has stopped.
    #[error("stream '{stream_id}' is held by aggregate type '{owner}', not '{requested}'")]
    HeldByOther {
        /// The contested stream.
        stream_id: String,
        /// The aggregate type that was requested.
        requested: &'static str,
        /// The aggregate type whose actor owns the stream.
        owner: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal domain error for testing `ExecuteError<E>`.
    #[derive(Debug, thiserror::Error)]
    #[error("test domain error")]
    struct TestDomainError;

    #[test]
    fn execute_error_domain_displays_inner() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Domain(TestDomainError);
        assert_eq!(err.to_string(), "test domain error");
    }

    #[test]
    fn execute_error_conflict_display() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Conflict;
        assert_eq!(
            err.to_string(),
            "optimistic concurrency conflict: stream was advanced by another writer"
        );
    }

    #[test]
    fn execute_error_store_from_conversion() {
        let err: ExecuteError<TestDomainError> =
            ExecuteError::from(StoreError::Fault("disk gone".into()));
        assert!(matches!(err, ExecuteError::Store(StoreError::Fault(_))));
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn execute_error_actor_gone_display() {
        let err: ExecuteError<TestDomainError> = ExecuteError::ActorGone;
        assert_eq!(err.to_string(), "aggregate actor is no longer running");
    }

    #[test]
    fn store_error_conflict_classification() {
        assert!(StoreError::DuplicateConflict("x".into()).is_conflict());
        assert!(!StoreError::Fault("x".into()).is_conflict());
        assert!(!StoreError::InvalidArgument("x".into()).is_conflict());
    }

    #[test]
    fn key_collision_names_both_streams() {
        let err = StoreError::KeyCollision {
            requested: "a".into(),
            existing: "b".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("'a'") && msg.contains("'b'"));
    }

    #[test]
    fn projection_error_io_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = ProjectionError::from(io_err);
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn open_error_names_missing_stream() {
        let err = OpenError::UnknownStream {
            projection: "active-products".into(),
            stream: "$ce-product".into(),
        };
        assert_eq!(
            err.to_string(),
            "projection 'active-products' reads unregistered projection stream '$ce-product'"
        );
    }

    #[test]
    fn stream_not_owned_display() {
        let err = StreamNotOwned {
            aggregate_type: "product",
            stream_id: "$system".into(),
        };
        assert_eq!(
            err.to_string(),
            "aggregate type 'product' may not own stream '$system'"
        );
    }

    #[test]
    fn held_by_other_names_both_types() {
        let err = HandleError::HeldByOther {
            stream_id: "shared-1".into(),
            requested: "gauge",
            owner: "counter",
        };
        assert_eq!(
            err.to_string(),
            "stream 'shared-1' is held by aggregate type 'counter', not 'gauge'"
        );
    }

    // Verify `Send + Sync` bounds are satisfied so errors can cross task
    // boundaries through `tokio` channels.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<ExecuteError<TestDomainError>>();
            assert_send_sync::<StateError>();
            assert_send_sync::<StoreError>();
            assert_send_sync::<HandleError>();
            assert_send_sync::<ProjectionError>();
            assert_send_sync::<OpenError>();
        }
    };
}
