//! In-process [`EventStorage`] backend.
//!
//! All tables live behind one `RwLock`, which is the single serialization
//! point for global sequence assignment. Uniqueness constraints are checked
//! under the write lock before anything is mutated, so every write is
//! all-or-nothing.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{EventRecord, NewEvent};
use crate::identity::StreamKey;
use crate::storage::{EventStorage, ProjectionIndexEntry, ProjectedEvent};

/// Maps a name to its storage key.
pub type KeyFn = fn(&str) -> StreamKey;

#[derive(Debug)]
struct StreamRow {
    name: String,
    /// Offsets into `Tables::events`, indexed by `stream_sequence - 1`.
    positions: Vec<usize>,
}

#[derive(Debug)]
struct ProjectionRow {
    name: String,
    /// Global sequences, indexed by `projection_sequence - 1`.
    entries: Vec<u64>,
    globals: HashSet<u64>,
    checkpoint: u64,
}

impl ProjectionRow {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            entries: Vec::new(),
            globals: HashSet::new(),
            checkpoint: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    /// The global log, indexed by `global_sequence - 1`.
    events: Vec<EventRecord>,
    streams: HashMap<StreamKey, StreamRow>,
    event_ids: HashSet<Uuid>,
    projections: HashMap<StreamKey, ProjectionRow>,
}

impl Tables {
    /// Look up a stream row, treating a name mismatch as not found.
    fn stream(&self, key: StreamKey, stream_id: &str) -> Option<&StreamRow> {
        self.streams.get(&key).filter(|row| row.name == stream_id)
    }

    fn projection(&self, key: StreamKey, name: &str) -> Option<&ProjectionRow> {
        self.projections.get(&key).filter(|row| row.name == name)
    }

    /// Get or create a projection row for writing.
    fn projection_mut(
        &mut self,
        key: StreamKey,
        name: &str,
    ) -> Result<&mut ProjectionRow, StoreError> {
        let row = self
            .projections
            .entry(key)
            .or_insert_with(|| ProjectionRow::new(name));
        if row.name != name {
            return Err(StoreError::KeyCollision {
                requested: name.to_owned(),
                existing: row.name.clone(),
            });
        }
        Ok(row)
    }
}

/// Event storage held entirely in memory.
///
/// Cheap to share behind an `Arc`; data is lost when the last reference is
/// dropped.
#[derive(Debug)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
    stream_key: KeyFn,
    projection_key: KeyFn,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create an empty store keyed by [`StreamKey::of`] and
    /// [`StreamKey::of_projection`].
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            stream_key: StreamKey::of,
            projection_key: StreamKey::of_projection,
        }
    }

    /// Create an empty store that derives every stream and projection key
    /// with `key_fn`.
    ///
    /// A degenerate function (e.g. one returning a constant) forces hash
    /// collisions, which is how collision handling is exercised.
    pub fn with_key_fn(key_fn: KeyFn) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            stream_key: key_fn,
            projection_key: key_fn,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Fault("memory storage lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Fault("memory storage lock poisoned".into()))
    }
}

#[async_trait]
impl EventStorage for MemoryStorage {
    async fn create_schema(&self) -> Result<(), StoreError> {
        // Tables exist from construction; only check the lock is usable.
        self.read().map(|_| ())
    }

    async fn append(
        &self,
        stream_id: &str,
        expected_start: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<u64>, StoreError> {
        if events.is_empty() {
            return Err(StoreError::InvalidArgument("empty batch".into()));
        }
        if expected_start == 0 {
            return Err(StoreError::InvalidArgument(
                "stream sequences start at 1".into(),
            ));
        }

        let key = (self.stream_key)(stream_id);
        let mut tables = self.write()?;

        let current = match tables.streams.get(&key) {
            Some(row) if row.name != stream_id => {
                return Err(StoreError::KeyCollision {
                    requested: stream_id.to_owned(),
                    existing: row.name.clone(),
                });
            }
            Some(row) => row.positions.len() as u64,
            None => 0,
        };
        if expected_start <= current {
            return Err(StoreError::DuplicateConflict(format!(
                "stream '{stream_id}' already has sequence {expected_start}"
            )));
        }
        if expected_start > current + 1 {
            return Err(StoreError::InvalidArgument(format!(
                "stream '{stream_id}' is at {current}; sequence {expected_start} would leave a gap"
            )));
        }

        let mut batch_ids = HashSet::with_capacity(events.len());
        for event in &events {
            if tables.event_ids.contains(&event.event_id) || !batch_ids.insert(event.event_id) {
                return Err(StoreError::DuplicateConflict(format!(
                    "event id {} already exists",
                    event.event_id
                )));
            }
        }

        // Every constraint holds; commit the whole batch.
        let mut globals = Vec::with_capacity(events.len());
        let mut positions = Vec::with_capacity(events.len());
        for (offset, event) in events.into_iter().enumerate() {
            let index = tables.events.len();
            let global = index as u64 + 1;
            let record = EventRecord::from_new(event, stream_id, expected_start + offset as u64, global);
            tables.event_ids.insert(record.event_id);
            tables.events.push(record);
            positions.push(index);
            globals.push(global);
        }
        tables
            .streams
            .entry(key)
            .or_insert_with(|| StreamRow {
                name: stream_id.to_owned(),
                positions: Vec::new(),
            })
            .positions
            .extend(positions);

        Ok(globals)
    }

    async fn read_stream(
        &self,
        stream_id: &str,
        from_sequence: u64,
        max_count: usize,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let key = (self.stream_key)(stream_id);
        let tables = self.read()?;
        let Some(row) = tables.stream(key, stream_id) else {
            return Ok(Vec::new());
        };
        let skip = from_sequence.max(1) as usize - 1;
        Ok(row
            .positions
            .iter()
            .skip(skip)
            .take(max_count)
            .map(|&i| tables.events[i].clone())
            .collect())
    }

    async fn read_global(
        &self,
        from_global: u64,
        max_count: usize,
        type_filter: Option<&[String]>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let tables = self.read()?;
        let skip = from_global.max(1) as usize - 1;
        let events = tables.events.iter().skip(skip);
        Ok(match type_filter {
            Some(types) => events
                .filter(|e| types.iter().any(|t| *t == e.event_type))
                .take(max_count)
                .cloned()
                .collect(),
            None => events.take(max_count).cloned().collect(),
        })
    }

    async fn head(&self) -> Result<u64, StoreError> {
        Ok(self.read()?.events.len() as u64)
    }

    async fn read_projection_stream(
        &self,
        projection: &str,
        from_sequence: u64,
        max_count: usize,
    ) -> Result<Vec<ProjectedEvent>, StoreError> {
        let key = (self.projection_key)(projection);
        let tables = self.read()?;
        let Some(row) = tables.projection(key, projection) else {
            return Ok(Vec::new());
        };
        let from = from_sequence.max(1);
        let mut out = Vec::new();
        for (offset, &global) in row
            .entries
            .iter()
            .skip(from as usize - 1)
            .take(max_count)
            .enumerate()
        {
            let event = tables
                .events
                .get(global as usize - 1)
                .cloned()
                .ok_or_else(|| {
                    StoreError::Fault(format!(
                        "projection '{projection}' points at missing global sequence {global}"
                    ))
                })?;
            out.push(ProjectedEvent {
                projection_sequence: from + offset as u64,
                event,
            });
        }
        Ok(out)
    }

    async fn projection_head(
        &self,
        projection: &str,
    ) -> Result<Option<ProjectionIndexEntry>, StoreError> {
        let key = (self.projection_key)(projection);
        let tables = self.read()?;
        Ok(tables.projection(key, projection).and_then(|row| {
            row.entries.last().map(|&global| ProjectionIndexEntry {
                projection_sequence: row.entries.len() as u64,
                global_sequence: global,
            })
        }))
    }

    async fn write_projection_index_entries(
        &self,
        projection: &str,
        entries: &[ProjectionIndexEntry],
        checkpoint: u64,
    ) -> Result<(), StoreError> {
        let key = (self.projection_key)(projection);
        let mut tables = self.write()?;
        let log_len = tables.events.len() as u64;
        let row = tables.projection_mut(key, projection)?;

        let len = row.entries.len() as u64;
        let mut batch_globals = HashSet::with_capacity(entries.len());
        for (offset, entry) in entries.iter().enumerate() {
            if entry.projection_sequence >= 1 && entry.projection_sequence <= len {
                return Err(StoreError::DuplicateConflict(format!(
                    "projection '{projection}' already has sequence {}",
                    entry.projection_sequence
                )));
            }
            if row.globals.contains(&entry.global_sequence)
                || !batch_globals.insert(entry.global_sequence)
            {
                return Err(StoreError::DuplicateConflict(format!(
                    "projection '{projection}' already indexes global sequence {}",
                    entry.global_sequence
                )));
            }
            let expected = len + 1 + offset as u64;
            if entry.projection_sequence != expected {
                return Err(StoreError::InvalidArgument(format!(
                    "projection '{projection}' expected sequence {expected}, got {}",
                    entry.projection_sequence
                )));
            }
            if entry.global_sequence == 0 || entry.global_sequence > log_len {
                return Err(StoreError::InvalidArgument(format!(
                    "global sequence {} is not in the log",
                    entry.global_sequence
                )));
            }
        }

        for entry in entries {
            row.entries.push(entry.global_sequence);
            row.globals.insert(entry.global_sequence);
        }
        row.checkpoint = checkpoint;
        Ok(())
    }

    async fn write_projection_checkpoint(
        &self,
        projection: &str,
        last_global: u64,
    ) -> Result<(), StoreError> {
        let key = (self.projection_key)(projection);
        let mut tables = self.write()?;
        tables.projection_mut(key, projection)?.checkpoint = last_global;
        Ok(())
    }

    async fn read_projection_checkpoint(&self, projection: &str) -> Result<u64, StoreError> {
        let key = (self.projection_key)(projection);
        let tables = self.read()?;
        Ok(tables
            .projection(key, projection)
            .map_or(0, |row| row.checkpoint))
    }

    async fn clear_projection_index(&self, projection: &str) -> Result<(), StoreError> {
        let key = (self.projection_key)(projection);
        let mut tables = self.write()?;
        match tables.projections.get(&key) {
            Some(row) if row.name != projection => Err(StoreError::KeyCollision {
                requested: projection.to_owned(),
                existing: row.name.clone(),
            }),
            Some(_) => {
                tables.projections.remove(&key);
                Ok(())
            }
            None => Ok(()),
        }
    }
}
