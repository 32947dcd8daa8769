//! Event-sourcing engine over a pluggable append-only log.
//!
//! Aggregates execute commands inside per-stream actors, projection streams
//! are indexed in the background, and projections fold either the global
//! log or a projection stream into queryable read models.

mod actor;
pub use actor::{AggregateHandle, Committed, spawn_actor};
mod aggregate;
pub use aggregate::{Aggregate, fold_record};
mod command;
mod error;
mod event;
mod identity;
mod indexer;
mod memory;
mod projection;
mod storage;
mod store;

pub use command::{ACTOR_KEY, CORRELATION_ID_KEY, CommandContext};
pub use error::{
    ExecuteError, HandleError, OpenError, ProjectionError, StateError, StoreError, StreamNotOwned,
};
pub use event::{
    EventRecord, JSON_FORMAT, Metadata, NewEvent, decode_domain_event, decode_metadata,
    encode_domain_event, encode_metadata,
};
pub use identity::{StreamKey, category_of, stream_name};
pub use indexer::{
    CATEGORY_PREFIX, Classifier, EVENT_TYPE_PREFIX, IndexerConfig, IndexerHandle,
    ProjectionStream, spawn_indexer,
};
pub use memory::{KeyFn, MemoryStorage};
pub use projection::{Projection, ProjectionSource};
pub use storage::{EventStorage, ProjectedEvent, ProjectionIndexEntry, global_events, stream_events};
pub use store::{AggregateStore, AggregateStoreBuilder};
