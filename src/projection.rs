//! Read models folded from the global log or from a projection stream.
//!
//! A projection reads either the whole log (optionally pre-filtered by
//! event type) or one projection stream maintained by an
//! [`indexer`](crate::indexer). Each runner tracks the last ordinal it
//! folded (a global sequence or a projection sequence) and ignores anything
//! at or below it, so redelivered events never corrupt state.

use std::any::Any;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProjectionError;
use crate::event::EventRecord;
use crate::storage::EventStorage;

/// Where a projection reads its events from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionSource {
    /// The global log in global order. With `event_types`, only events of
    /// the listed types are delivered.
    All {
        /// Optional event-type filter applied by the backend.
        event_types: Option<&'static [&'static str]>,
    },
    /// A named projection stream, in projection-sequence order.
    Stream(&'static str),
}

/// A read model derived from the event log.
///
/// Projections are eventually consistent: they catch up by reading new
/// events from their [`source`](Projection::source) and can be rebuilt from
/// scratch at any time.
///
/// # Contract
///
/// - [`apply`](Projection::apply) must be deterministic: given the same
///   sequence of events, it must produce the same state.
/// - Unknown event types should be silently ignored for forward
///   compatibility.
pub trait Projection:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Human-readable name, used as a directory name for checkpoints.
    const NAME: &'static str;

    /// Where events come from. Defaults to the whole global log.
    fn source() -> ProjectionSource {
        ProjectionSource::All { event_types: None }
    }

    /// Fold a single event into the read model.
    fn apply(&mut self, event: &EventRecord);
}

/// Persisted state of a projection including its resume position.
///
/// Serialized to JSON as `{ "state": <P>, "position": <N> }`, where
/// `position` is the last ordinal folded into `state` (0 when nothing has
/// been folded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ProjectionCheckpoint<P> {
    /// The projection's current state.
    pub state: P,
    /// Last folded global sequence (for [`ProjectionSource::All`]) or
    /// projection sequence (for [`ProjectionSource::Stream`]).
    pub position: u64,
}

impl<P: Default> Default for ProjectionCheckpoint<P> {
    fn default() -> Self {
        Self {
            state: P::default(),
            position: 0,
        }
    }
}

/// Save a projection checkpoint atomically.
///
/// Writes to a temporary file then renames to `checkpoint.json` in `dir`.
/// Creates `dir` if it does not exist.
///
/// # Arguments
///
/// * `dir` - Directory to store the checkpoint file in.
/// * `checkpoint` - The checkpoint to persist.
///
/// # Errors
///
/// Returns `io::Error` if directory creation, file writing, or renaming fails.
pub(crate) fn save_checkpoint<P: Projection>(
    dir: &Path,
    checkpoint: &ProjectionCheckpoint<P>,
) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("checkpoint.json");
    let tmp_path = dir.join("checkpoint.json.tmp");
    let json = serde_json::to_string_pretty(checkpoint).map_err(io::Error::other)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Load a projection checkpoint from disk.
///
/// Returns `Ok(None)` if the file does not exist or is corrupt.
/// A corrupt checkpoint is not a hard error -- the projection will rebuild.
///
/// # Errors
///
/// Returns `io::Error` for I/O failures other than file-not-found.
pub(crate) fn load_checkpoint<P: Projection>(
    dir: &Path,
) -> io::Result<Option<ProjectionCheckpoint<P>>> {
    let path = dir.join("checkpoint.json");
    match std::fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "corrupt projection checkpoint, will rebuild"
                );
                Ok(None)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Fold one event if its ordinal is past the checkpoint.
///
/// Returns `false` for redelivered events, which are skipped.
fn fold_event<P: Projection>(
    checkpoint: &mut ProjectionCheckpoint<P>,
    ordinal: u64,
    event: &EventRecord,
) -> bool {
    if ordinal <= checkpoint.position {
        return false;
    }
    checkpoint.state.apply(event);
    checkpoint.position = ordinal;
    true
}

/// Drives a projection's catch-up loop.
///
/// Manages the lifecycle of a single [`Projection`]: loading its persisted
/// checkpoint, catching up on new events page by page, and saving the
/// checkpoint back to disk when a checkpoint directory is configured.
pub(crate) struct ProjectionRunner<P: Projection> {
    checkpoint: ProjectionCheckpoint<P>,
    storage: Arc<dyn EventStorage>,
    /// `None` keeps the projection purely in memory (cold replay on start).
    checkpoint_dir: Option<PathBuf>,
    batch_size: usize,
}

impl<P: Projection> ProjectionRunner<P> {
    /// Create a new runner, resuming from an existing checkpoint if
    /// `checkpoint_dir` holds one.
    ///
    /// # Arguments
    ///
    /// * `storage` - Backend to read events from.
    /// * `checkpoint_dir` - Directory for this projection's checkpoint file,
    ///   or `None` to always start cold.
    /// * `batch_size` - Events read per storage call.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if reading an existing checkpoint file fails
    /// (other than file-not-found).
    pub(crate) fn new(
        storage: Arc<dyn EventStorage>,
        checkpoint_dir: Option<PathBuf>,
        batch_size: usize,
    ) -> io::Result<Self> {
        let checkpoint = match &checkpoint_dir {
            Some(dir) => load_checkpoint::<P>(dir)?.unwrap_or_default(),
            None => ProjectionCheckpoint::default(),
        };
        if checkpoint.position > 0 {
            tracing::debug!(
                projection_name = P::NAME,
                position = checkpoint.position,
                "resuming projection from checkpoint"
            );
        }
        Ok(Self {
            checkpoint,
            storage,
            checkpoint_dir,
            batch_size: batch_size.max(1),
        })
    }

    /// Returns the current projection state.
    pub(crate) fn state(&self) -> &P {
        &self.checkpoint.state
    }

    /// Fold everything past the checkpoint, then save the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Store`] if reading fails (events folded so
    /// far are kept) or [`ProjectionError::Io`] if saving fails.
    pub(crate) async fn catch_up(&mut self) -> Result<(), ProjectionError> {
        let folded = match P::source() {
            ProjectionSource::All { event_types } => self.catch_up_global(event_types).await?,
            ProjectionSource::Stream(name) => self.catch_up_stream(name).await?,
        };
        if folded > 0 {
            tracing::debug!(
                projection_name = P::NAME,
                folded,
                position = self.checkpoint.position,
                "projection caught up"
            );
            self.save()?;
        }
        Ok(())
    }

    async fn catch_up_global(
        &mut self,
        event_types: Option<&'static [&'static str]>,
    ) -> Result<usize, ProjectionError> {
        let filter: Option<Vec<String>> =
            event_types.map(|types| types.iter().map(|t| (*t).to_owned()).collect());
        let mut folded = 0;
        loop {
            let page = self
                .storage
                .read_global(
                    self.checkpoint.position + 1,
                    self.batch_size,
                    filter.as_deref(),
                )
                .await?;
            for event in &page {
                folded += usize::from(fold_event(
                    &mut self.checkpoint,
                    event.global_sequence,
                    event,
                ));
            }
            if page.len() < self.batch_size {
                return Ok(folded);
            }
        }
    }

    async fn catch_up_stream(&mut self, name: &str) -> Result<usize, ProjectionError> {
        let mut folded = 0;
        loop {
            let page = self
                .storage
                .read_projection_stream(name, self.checkpoint.position + 1, self.batch_size)
                .await?;
            for projected in &page {
                folded += usize::from(fold_event(
                    &mut self.checkpoint,
                    projected.projection_sequence,
                    &projected.event,
                ));
            }
            if page.len() < self.batch_size {
                return Ok(folded);
            }
        }
    }

    /// Forget all state; the next catch-up replays from ordinal 1.
    pub(crate) fn reset(&mut self) {
        self.checkpoint = ProjectionCheckpoint::default();
    }

    fn save(&self) -> io::Result<()> {
        match &self.checkpoint_dir {
            Some(dir) => save_checkpoint::<P>(dir, &self.checkpoint),
            None => Ok(()),
        }
    }
}

// --- Type-erased trait for store integration ---

/// Type-erased interface for projection runners.
///
/// Allows `AggregateStore` to hold heterogeneous projections without knowing
/// each concrete `P` type. Async methods use boxed futures for trait-object
/// compatibility.
pub(crate) trait ProjectionCatchUp: Send + Sync {
    /// Fold everything past the current checkpoint.
    fn catch_up(&mut self) -> Pin<Box<dyn Future<Output = Result<(), ProjectionError>> + Send + '_>>;

    /// Returns the last folded ordinal.
    fn position(&self) -> u64;

    /// Persist the current checkpoint, if a checkpoint directory is set.
    fn save(&self) -> io::Result<()>;

    /// Forget all state so the next catch-up is a cold replay.
    fn reset(&mut self);

    /// The projection stream this projection reads, if any.
    fn source_stream(&self) -> Option<&'static str>;

    /// Clone the current projection state into a type-erased box.
    ///
    /// The caller can downcast the returned `Box<dyn Any>` to the concrete
    /// projection type `P` to read the state.
    fn state_any(&self) -> Box<dyn Any + Send>;
}

impl<P: Projection> ProjectionCatchUp for ProjectionRunner<P> {
    fn catch_up(&mut self) -> Pin<Box<dyn Future<Output = Result<(), ProjectionError>> + Send + '_>> {
        Box::pin(ProjectionRunner::catch_up(self))
    }

    fn position(&self) -> u64 {
        self.checkpoint.position
    }

    fn save(&self) -> io::Result<()> {
        ProjectionRunner::save(self)
    }

    fn reset(&mut self) {
        ProjectionRunner::reset(self);
    }

    fn source_stream(&self) -> Option<&'static str> {
        match P::source() {
            ProjectionSource::Stream(name) => Some(name),
            ProjectionSource::All { .. } => None,
        }
    }

    fn state_any(&self) -> Box<dyn Any + Send> {
        Box::new(self.state().clone())
    }
}
