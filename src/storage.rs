//! Persistence backend contract and lazy readers built on top of it.
//!
//! Any storage adapter (SQL, embedded KV, in-memory) implements
//! [`EventStorage`]. The engine only ever talks to `Arc<dyn EventStorage>`,
//! so sequence assignment and uniqueness enforcement live entirely inside
//! the backend.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::error::StoreError;
use crate::event::{EventRecord, NewEvent};

/// One row of a projection stream: a dense ordinal pointing at a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProjectionIndexEntry {
    /// Dense, 1-based ordinal local to the projection stream.
    pub projection_sequence: u64,
    /// Global sequence of the indexed event.
    pub global_sequence: u64,
}

/// A log entry resolved through a projection stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedEvent {
    /// Ordinal of the entry within its projection stream.
    pub projection_sequence: u64,
    /// The underlying event.
    pub event: EventRecord,
}

/// Storage backend contract.
///
/// Implementations must:
///
/// * assign `global_sequence` at a single serialization point, so that
///   concurrent appends to unrelated streams still yield a gap-free total
///   order;
/// * enforce uniqueness of `event_id`, of `(stream key, stream_sequence)`,
///   and of both `(projection key, projection_sequence)` and
///   `(projection key, global_sequence)`, reporting violations as
///   [`StoreError::DuplicateConflict`];
/// * compare the stored name on every key hit (see
///   [`StreamKey`](crate::StreamKey)).
#[async_trait]
pub trait EventStorage: Send + Sync + 'static {
    /// Ensure the events, projection-index, and projection-checkpoint
    /// structures exist. Idempotent.
    async fn create_schema(&self) -> Result<(), StoreError>;

    /// Atomically append a batch to a stream.
    ///
    /// # Arguments
    ///
    /// * `stream_id` - Target stream name.
    /// * `expected_start` - Stream sequence the first event must receive.
    ///   Must be `>= 1` and no greater than the stream's current length + 1.
    /// * `events` - Non-empty batch; events receive consecutive stream and
    ///   global sequences.
    ///
    /// # Returns
    ///
    /// The global sequences assigned to the events, in batch order.
    ///
    /// # Errors
    ///
    /// * [`StoreError::DuplicateConflict`] if `expected_start` is already
    ///   taken or an event ID already exists. Nothing is appended.
    /// * [`StoreError::InvalidArgument`] for an empty batch or a sequence
    ///   that would leave a gap.
    /// * [`StoreError::KeyCollision`] if the stream key belongs to another
    ///   name.
    async fn append(
        &self,
        stream_id: &str,
        expected_start: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<u64>, StoreError>;

    /// Read up to `max_count` events of a stream starting at `from_sequence`
    /// (1-based), in ascending stream order. An unknown stream is empty.
    async fn read_stream(
        &self,
        stream_id: &str,
        from_sequence: u64,
        max_count: usize,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Read up to `max_count` events of the global log starting at
    /// `from_global` (1-based), in ascending global order.
    ///
    /// When `type_filter` is given, only events whose type is in the list
    /// are returned; `max_count` bounds the returned events.
    async fn read_global(
        &self,
        from_global: u64,
        max_count: usize,
        type_filter: Option<&[String]>,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// The last global sequence in the log, or 0 when empty.
    async fn head(&self) -> Result<u64, StoreError>;

    /// Resolve up to `max_count` entries of a projection stream, starting at
    /// `from_sequence` (1-based), back to their event records.
    async fn read_projection_stream(
        &self,
        projection: &str,
        from_sequence: u64,
        max_count: usize,
    ) -> Result<Vec<ProjectedEvent>, StoreError>;

    /// The last index entry of a projection stream, if any.
    async fn projection_head(
        &self,
        projection: &str,
    ) -> Result<Option<ProjectionIndexEntry>, StoreError>;

    /// Append index entries and move the checkpoint in one atomic commit.
    ///
    /// `entries` may be empty, in which case only the checkpoint moves.
    ///
    /// # Errors
    ///
    /// * [`StoreError::DuplicateConflict`] if any entry's sequence or global
    ///   sequence is already indexed for this projection stream.
    /// * [`StoreError::InvalidArgument`] if the entries do not continue the
    ///   dense sequence.
    async fn write_projection_index_entries(
        &self,
        projection: &str,
        entries: &[ProjectionIndexEntry],
        checkpoint: u64,
    ) -> Result<(), StoreError>;

    /// Set the checkpoint of a projection stream.
    async fn write_projection_checkpoint(
        &self,
        projection: &str,
        last_global: u64,
    ) -> Result<(), StoreError>;

    /// The checkpoint of a projection stream, or 0 if none was written.
    async fn read_projection_checkpoint(&self, projection: &str) -> Result<u64, StoreError>;

    /// Remove every index entry and the checkpoint of a projection stream.
    async fn clear_projection_index(&self, projection: &str) -> Result<(), StoreError>;
}

/// Lazily read a stream page by page.
///
/// Each page is fetched only when the previous one has been consumed. The
/// reader is restartable: calling again with a later `from_sequence`
/// continues where a previous reader stopped.
///
/// # Arguments
///
/// * `storage` - Backend to read from.
/// * `stream_id` - Stream name.
/// * `from_sequence` - First stream sequence to yield (1-based).
/// * `page_size` - Events fetched per `read_stream` call; clamped to at
///   least 1.
pub fn stream_events(
    storage: Arc<dyn EventStorage>,
    stream_id: String,
    from_sequence: u64,
    page_size: usize,
) -> impl Stream<Item = Result<EventRecord, StoreError>> + Send + 'static {
    let page_size = page_size.max(1);
    async_stream::try_stream! {
        let mut next = from_sequence.max(1);
        loop {
            let page = storage.read_stream(&stream_id, next, page_size).await?;
            let len = page.len();
            for record in page {
                next = record.stream_sequence + 1;
                yield record;
            }
            if len < page_size {
                break;
            }
        }
    }
}

/// Lazily read the global log page by page, starting at `from_global`.
pub fn global_events(
    storage: Arc<dyn EventStorage>,
    from_global: u64,
    page_size: usize,
) -> impl Stream<Item = Result<EventRecord, StoreError>> + Send + 'static {
    let page_size = page_size.max(1);
    async_stream::try_stream! {
        let mut next = from_global.max(1);
        loop {
            let page = storage.read_global(next, page_size, None).await?;
            let len = page.len();
            for record in page {
                next = record.global_sequence + 1;
                yield record;
            }
            if len < page_size {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::pin::pin;

    use tokio_stream::StreamExt;

    use super::*;
    use crate::memory::MemoryStorage;

    async fn seeded(stream: &str, count: usize) -> Arc<dyn EventStorage> {
        let storage = Arc::new(MemoryStorage::new());
        let batch = (0..count)
            .map(|i| NewEvent::new(format!("E{i}"), Vec::new()))
            .collect();
        storage.append(stream, 1, batch).await.unwrap();
        storage
    }

    #[tokio::test]
    async fn stream_events_pages_through_whole_stream() {
        let storage = seeded("counter-a", 7).await;
        let events: Vec<_> = stream_events(storage, "counter-a".into(), 1, 3)
            .collect::<Result<_, _>>()
            .await
            .unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.stream_sequence).collect();
        assert_eq!(seqs, (1..=7).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn stream_events_restarts_from_sequence() {
        let storage = seeded("counter-a", 5).await;
        let events: Vec<_> = stream_events(storage, "counter-a".into(), 4, 2)
            .collect::<Result<_, _>>()
            .await
            .unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.stream_sequence).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[tokio::test]
    async fn stream_events_is_lazy() {
        let storage = seeded("counter-a", 4).await;
        let mut events = pin!(stream_events(storage.clone(), "counter-a".into(), 1, 2));
        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.stream_sequence, 1);

        // Events appended after the reader started are still picked up by
        // later pages.
        storage
            .append("counter-a", 5, vec![NewEvent::new("Late", Vec::new())])
            .await
            .unwrap();
        let mut rest = Vec::new();
        while let Some(record) = events.next().await {
            rest.push(record.unwrap().event_type);
        }
        assert_eq!(rest, vec!["E1", "E2", "E3", "Late"]);
    }

    #[tokio::test]
    async fn unknown_stream_yields_nothing() {
        let storage: Arc<dyn EventStorage> = Arc::new(MemoryStorage::new());
        let mut events = pin!(stream_events(storage, "nobody".into(), 1, 10));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn global_events_interleaves_streams_in_commit_order() {
        let storage: Arc<dyn EventStorage> = Arc::new(MemoryStorage::new());
        storage
            .append("a-1", 1, vec![NewEvent::new("A1", Vec::new())])
            .await
            .unwrap();
        storage
            .append("b-1", 1, vec![NewEvent::new("B1", Vec::new())])
            .await
            .unwrap();
        storage
            .append("a-1", 2, vec![NewEvent::new("A2", Vec::new())])
            .await
            .unwrap();

        let types: Vec<String> = global_events(storage, 1, 2)
            .map(|r| r.map(|e| e.event_type))
            .collect::<Result<_, _>>()
            .await
            .unwrap();
        assert_eq!(types, vec!["A1", "B1", "A2"]);
    }
}
