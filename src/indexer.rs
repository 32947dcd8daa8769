//! Projection stream definitions and the background indexer.
//!
//! A [`ProjectionStream`] names a derived ordered view of the log and the
//! predicate that decides which events belong to it. Each registered
//! projection stream gets exactly one indexer task, which scans the global
//! log from the stream's checkpoint, appends dense index entries for
//! matching events, and moves the checkpoint in the same commit.
//!
//! Indexing is triggered by commit notifications from aggregate actors, by
//! a poll interval (to pick up writers outside this process), and by
//! explicit [`IndexerHandle::catch_up`] / [`IndexerHandle::rebuild`] calls.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use crate::error::{ProjectionError, StoreError};
use crate::event::EventRecord;
use crate::storage::{EventStorage, ProjectionIndexEntry};

/// Name prefix of category projection streams.
pub const CATEGORY_PREFIX: &str = "$ce-";

/// Name prefix of event-type projection streams.
pub const EVENT_TYPE_PREFIX: &str = "$et-";

/// Decides whether an event belongs to a projection stream.
pub type Classifier = Arc<dyn Fn(&EventRecord) -> bool + Send + Sync>;

/// A named, derived ordered view of the log.
///
/// # Examples
///
/// ```
/// use eventstream_es::ProjectionStream;
///
/// let products = ProjectionStream::category("product");
/// assert_eq!(products.name(), "$ce-product");
///
/// let renames = ProjectionStream::event_type("Renamed");
/// assert_eq!(renames.name(), "$et-Renamed");
/// ```
#[derive(Clone)]
pub struct ProjectionStream {
    name: String,
    classifier: Classifier,
}

impl ProjectionStream {
    /// Define a projection stream with a custom predicate.
    ///
    /// # Arguments
    ///
    /// * `name` - Unique name of the projection stream.
    /// * `classifier` - Returns `true` for events that belong to it. Must be
    ///   deterministic, since re-indexing has to reproduce the same entries.
    pub fn new(
        name: impl Into<String>,
        classifier: impl Fn(&EventRecord) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            classifier: Arc::new(classifier),
        }
    }

    /// All events of streams in `category`, named `"$ce-{category}"`.
    pub fn category(category: impl Into<String>) -> Self {
        let category = category.into();
        let name = format!("{CATEGORY_PREFIX}{category}");
        Self::new(name, move |event| event.category() == category)
    }

    /// All events of type `event_type` across streams, named
    /// `"$et-{event_type}"`.
    pub fn event_type(event_type: impl Into<String>) -> Self {
        let event_type = event_type.into();
        let name = format!("{EVENT_TYPE_PREFIX}{event_type}");
        Self::new(name, move |event| event.event_type == event_type)
    }

    /// The projection stream's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `event` belongs to this projection stream.
    pub fn matches(&self, event: &EventRecord) -> bool {
        (self.classifier)(event)
    }
}

impl fmt::Debug for ProjectionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionStream")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Configuration for indexer tasks.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventstream_es::IndexerConfig;
///
/// let config = IndexerConfig {
///     poll_interval: Duration::from_millis(100),
///     ..IndexerConfig::default()
/// };
/// assert_eq!(config.batch_size, 500);
/// ```
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Events read from the global log per page. Each page is committed as
    /// one index write.
    ///
    /// Default: 500.
    pub batch_size: usize,

    /// How often to scan for events appended by other processes.
    ///
    /// Default: 1 second.
    pub poll_interval: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            poll_interval: Duration::from_secs(1),
        }
    }
}

type PassReply = oneshot::Sender<Result<u64, StoreError>>;

enum IndexerMessage {
    CatchUp { reply: PassReply },
    Rebuild { reply: PassReply },
}

/// The single owner of one projection stream's index and checkpoint.
struct Indexer {
    definition: ProjectionStream,
    storage: Arc<dyn EventStorage>,
    config: IndexerConfig,
    position: watch::Sender<u64>,
}

impl Indexer {
    /// Scan the log from the checkpoint to its current end.
    ///
    /// Each page commits its matching entries together with a checkpoint
    /// equal to the last scanned event, matched or not. Events at or below
    /// the last indexed global sequence are skipped, so a checkpoint that
    /// lags its entries only causes redundant reclassification.
    ///
    /// # Returns
    ///
    /// The checkpoint after the pass.
    async fn index_pass(&mut self) -> Result<u64, StoreError> {
        let name = self.definition.name();
        let batch_size = self.config.batch_size.max(1);
        let mut checkpoint = self.storage.read_projection_checkpoint(name).await?;
        let head = self.storage.projection_head(name).await?;
        let (mut next_sequence, last_indexed) = head.map_or((1, 0), |entry| {
            (entry.projection_sequence + 1, entry.global_sequence)
        });

        let mut indexed = 0usize;
        loop {
            let page = self
                .storage
                .read_global(checkpoint + 1, batch_size, None)
                .await?;
            let Some(last_global) = page.last().map(|event| event.global_sequence) else {
                break;
            };

            let mut entries = Vec::new();
            for event in &page {
                if event.global_sequence <= last_indexed || !self.definition.matches(event) {
                    continue;
                }
                entries.push(ProjectionIndexEntry {
                    projection_sequence: next_sequence,
                    global_sequence: event.global_sequence,
                });
                next_sequence += 1;
            }

            self.storage
                .write_projection_index_entries(name, &entries, last_global)
                .await?;
            indexed += entries.len();
            checkpoint = last_global;
            self.publish(checkpoint);

            if page.len() < batch_size {
                break;
            }
        }

        // Covers an empty log and a checkpoint loaded at startup.
        self.publish(checkpoint);
        if indexed > 0 {
            tracing::debug!(
                projection_stream = %name,
                indexed,
                checkpoint,
                "projection stream indexed"
            );
        }
        Ok(checkpoint)
    }

    /// Drop the index and checkpoint, then index from the start of the log.
    async fn rebuild(&mut self) -> Result<u64, StoreError> {
        let name = self.definition.name();
        tracing::info!(projection_stream = %name, "rebuilding projection stream");
        self.storage.clear_projection_index(name).await?;
        self.position.send_replace(0);
        self.index_pass().await
    }

    /// Run a pass triggered in the background; failures are logged and the
    /// next trigger retries from the committed checkpoint.
    async fn background_pass(&mut self) {
        if let Err(e) = self.index_pass().await {
            tracing::error!(
                projection_stream = %self.definition.name(),
                error = %e,
                "index pass failed"
            );
        }
    }

    fn publish(&self, checkpoint: u64) {
        self.position.send_if_modified(|position| {
            if *position != checkpoint {
                *position = checkpoint;
                true
            } else {
                false
            }
        });
    }
}

/// Run the indexer loop until shutdown or until every handle is dropped.
///
/// # Arguments
///
/// * `indexer` - The projection stream's indexer state.
/// * `rx` - Explicit catch-up and rebuild requests.
/// * `commits` - Highest global sequence committed in this process.
/// * `shutdown_rx` - Watch receiver that signals the loop to stop.
async fn run_indexer(
    mut indexer: Indexer,
    mut rx: mpsc::Receiver<IndexerMessage>,
    mut commits: watch::Receiver<u64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut poll = tokio::time::interval(indexer.config.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut commits_open = true;

    loop {
        // The first poll tick completes immediately, so the loop starts
        // with a catch-up pass.
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(IndexerMessage::CatchUp { reply }) => {
                    let result = indexer.index_pass().await;
                    let _ = reply.send(result);
                }
                Some(IndexerMessage::Rebuild { reply }) => {
                    let result = indexer.rebuild().await;
                    let _ = reply.send(result);
                }
                None => break,
            },
            changed = commits.changed(), if commits_open => {
                if changed.is_ok() {
                    indexer.background_pass().await;
                } else {
                    // Every writer is gone; rely on polling.
                    commits_open = false;
                }
            }
            _ = poll.tick() => indexer.background_pass().await,
            _ = shutdown_rx.changed() => break,
        }
    }

    tracing::debug!(
        projection_stream = %indexer.definition.name(),
        "indexer stopped"
    );
}

/// Handle for controlling a running indexer.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped or channel handles.
/// Dropping the handle does **not** stop the indexer -- call
/// [`shutdown`](IndexerHandle::shutdown).
#[derive(Clone)]
pub struct IndexerHandle {
    name: Arc<str>,
    sender: mpsc::Sender<IndexerMessage>,
    position: watch::Receiver<u64>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl fmt::Debug for IndexerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexerHandle")
            .field("name", &self.name)
            .field("checkpoint", &self.checkpoint())
            .finish()
    }
}

impl IndexerHandle {
    /// Name of the projection stream this indexer owns.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The last checkpoint this indexer committed (0 before its first pass).
    pub fn checkpoint(&self) -> u64 {
        *self.position.borrow()
    }

    /// Index everything committed so far and wait for it.
    ///
    /// # Returns
    ///
    /// The checkpoint after the pass.
    ///
    /// # Errors
    ///
    /// * [`ProjectionError::Store`] -- reading the log or writing the index
    ///   failed. The checkpoint stays at the last committed page.
    /// * [`ProjectionError::IndexerGone`] -- the indexer has stopped.
    pub async fn catch_up(&self) -> Result<u64, ProjectionError> {
        self.request(|reply| IndexerMessage::CatchUp { reply }).await
    }

    /// Clear the projection stream and re-index it from the start of the log.
    ///
    /// # Errors
    ///
    /// As for [`catch_up`](IndexerHandle::catch_up).
    pub async fn rebuild(&self) -> Result<u64, ProjectionError> {
        self.request(|reply| IndexerMessage::Rebuild { reply }).await
    }

    /// Wait until the indexer has scanned up to at least `global_sequence`.
    ///
    /// Does not trigger a pass on its own; commit notifications and polling
    /// drive the indexer forward.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::IndexerGone`] if the indexer stops first.
    pub async fn wait_for(&self, global_sequence: u64) -> Result<u64, ProjectionError> {
        let mut position = self.position.clone();
        position
            .wait_for(|checkpoint| *checkpoint >= global_sequence)
            .await
            .map(|checkpoint| *checkpoint)
            .map_err(|_| ProjectionError::IndexerGone(self.name.to_string()))
    }

    /// Signal the indexer to stop and wait for its task to finish.
    ///
    /// Calling `shutdown` more than once is safe.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(join_handle) = task
            && let Err(e) = join_handle.await
        {
            tracing::error!(projection_stream = %self.name, error = %e, "indexer task panicked");
        }
    }

    async fn request(
        &self,
        message: impl FnOnce(PassReply) -> IndexerMessage,
    ) -> Result<u64, ProjectionError> {
        let gone = || ProjectionError::IndexerGone(self.name.to_string());
        let (tx, rx) = oneshot::channel();
        self.sender.send(message(tx)).await.map_err(|_| gone())?;
        Ok(rx.await.map_err(|_| gone())??)
    }
}

/// Spawn the indexer task for one projection stream.
///
/// Callers must ensure at most one indexer runs per projection stream name;
/// [`AggregateStoreBuilder::open`](crate::AggregateStoreBuilder::open)
/// enforces this by rejecting duplicate registrations.
///
/// # Arguments
///
/// * `definition` - Name and classifier of the projection stream.
/// * `storage` - Backend holding the log and the projection index.
/// * `config` - Batch size and poll interval.
/// * `commits` - Notified with the highest global sequence committed by
///   aggregate actors in this process.
pub fn spawn_indexer(
    definition: ProjectionStream,
    storage: Arc<dyn EventStorage>,
    config: IndexerConfig,
    commits: watch::Receiver<u64>,
) -> IndexerHandle {
    let name: Arc<str> = Arc::from(definition.name());
    let (tx, rx) = mpsc::channel(8);
    let (position_tx, position_rx) = watch::channel(0);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let indexer = Indexer {
        definition,
        storage,
        config,
        position: position_tx,
    };
    let task = tokio::spawn(run_indexer(indexer, rx, commits, shutdown_rx));

    IndexerHandle {
        name,
        sender: tx,
        position: position_rx,
        shutdown_tx: Arc::new(shutdown_tx),
        task: Arc::new(tokio::sync::Mutex::new(Some(task))),
    }
}
