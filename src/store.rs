//! Top-level entry point that composes actor spawning, handle caching,
//! projection-stream indexers, and projections into a single
//! [`AggregateStore`] type.
//!
//! The store is opened via [`AggregateStoreBuilder`], which takes the
//! storage backend, spawns one indexer per registered projection stream,
//! and loads persisted projection checkpoints.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};

use crate::actor::{ActorConfig, AggregateHandle, spawn_actor_with_config};
use crate::aggregate::Aggregate;
use crate::error::{HandleError, OpenError, ProjectionError, StreamNotOwned};
use crate::identity::stream_name;
use crate::indexer::{IndexerConfig, IndexerHandle, ProjectionStream, spawn_indexer};
use crate::projection::{Projection, ProjectionCatchUp, ProjectionRunner};
use crate::storage::EventStorage;

/// A cached actor handle with its aggregate type erased.
trait CachedHandle: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn aggregate_type(&self) -> &'static str;

    fn is_alive(&self) -> bool;

    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

impl<A: Aggregate> CachedHandle for AggregateHandle<A> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn aggregate_type(&self) -> &'static str {
        A::AGGREGATE_TYPE
    }

    fn is_alive(&self) -> bool {
        AggregateHandle::is_alive(self)
    }

    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(AggregateHandle::shutdown(self))
    }
}

/// Type-erased handle cache keyed by stream name.
///
/// One entry per stream, whatever the aggregate type, so a stream never has
/// two actors. `Box<dyn CachedHandle>` lets a single map hold
/// `AggregateHandle<A>` for any concrete `A`. Downcasting recovers the
/// typed handle.
type HandleCache = HashMap<String, Box<dyn CachedHandle>>;

/// The live cached handle for `stream_id`, if any.
///
/// # Errors
///
/// [`HandleError::HeldByOther`] if a live actor of another aggregate type
/// owns the stream.
fn live_handle<A: Aggregate>(
    cache: &HandleCache,
    stream_id: &str,
) -> Result<Option<AggregateHandle<A>>, HandleError> {
    let Some(cached) = cache.get(stream_id).filter(|cached| cached.is_alive()) else {
        return Ok(None);
    };
    match cached.as_any().downcast_ref::<AggregateHandle<A>>() {
        Some(handle) => Ok(Some(handle.clone())),
        None => Err(HandleError::HeldByOther {
            stream_id: stream_id.to_owned(),
            requested: A::AGGREGATE_TYPE,
            owner: cached.aggregate_type(),
        }),
    }
}

/// Type-erased projection map keyed by projection name.
///
/// Each value is a `tokio::sync::Mutex<Box<dyn ProjectionCatchUp>>`, allowing
/// the store to interact with heterogeneous projection runners without knowing
/// each concrete `P` type. We use `tokio::sync::Mutex` because `catch_up` is
/// async.
type ProjectionMap = HashMap<String, tokio::sync::Mutex<Box<dyn ProjectionCatchUp>>>;

/// Default idle timeout for actors: 5 minutes.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default page size for stream replay and projection catch-up.
const DEFAULT_READ_BATCH_SIZE: usize = 256;

/// Central registry that manages aggregate instance lifecycles.
///
/// The store handles actor spawning, handle caching, projection-stream
/// indexing, and projection catch-up over a single storage backend.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct AggregateStore {
    storage: Arc<dyn EventStorage>,
    cache: Arc<RwLock<HandleCache>>,
    projections: Arc<ProjectionMap>,
    indexers: Arc<HashMap<String, IndexerHandle>>,
    commits: Arc<watch::Sender<u64>>,
    idle_timeout: Duration,
    read_batch_size: usize,
}

// Manual `Debug` because `dyn CachedHandle` is not `Debug` and we don't want to
// expose cache internals.
impl std::fmt::Debug for AggregateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut streams: Vec<&String> = self.indexers.keys().collect();
        streams.sort();
        let mut projections: Vec<&String> = self.projections.keys().collect();
        projections.sort();
        f.debug_struct("AggregateStore")
            .field("projection_streams", &streams)
            .field("projections", &projections)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl AggregateStore {
    /// Start configuring a store over `storage`.
    pub fn builder(storage: Arc<dyn EventStorage>) -> AggregateStoreBuilder {
        AggregateStoreBuilder::new(storage)
    }

    /// Get a handle to an aggregate instance, spawning its actor if needed.
    ///
    /// The instance lives on the stream `"{A::AGGREGATE_TYPE}-{id}"`.
    ///
    /// # Arguments
    ///
    /// * `id` - Unique instance identifier within the aggregate type.
    ///
    /// # Errors
    ///
    /// As for [`get_stream`](AggregateStore::get_stream).
    pub async fn get<A: Aggregate>(&self, id: &str) -> Result<AggregateHandle<A>, HandleError> {
        self.get_stream::<A>(&stream_name(A::AGGREGATE_TYPE, id))
            .await
    }

    /// Get a handle to the aggregate that owns an explicitly named stream.
    ///
    /// If the actor is already running (cached and alive), returns a clone
    /// of the existing handle. Otherwise spawns a new actor, which replays
    /// the stream on its first message. At most one actor per stream runs
    /// in this store, whatever its aggregate type.
    ///
    /// # Errors
    ///
    /// * [`HandleError::NotOwned`] -- [`Aggregate::owns_stream`] rejects
    ///   `stream_id`.
    /// * [`HandleError::HeldByOther`] -- a running actor of another
    ///   aggregate type owns `stream_id`.
    pub async fn get_stream<A: Aggregate>(
        &self,
        stream_id: &str,
    ) -> Result<AggregateHandle<A>, HandleError> {
        if !A::owns_stream(stream_id) {
            return Err(StreamNotOwned {
                aggregate_type: A::AGGREGATE_TYPE,
                stream_id: stream_id.to_owned(),
            }
            .into());
        }

        // Fast path: check cache with read lock.
        if let Some(handle) = live_handle::<A>(&*self.cache.read().await, stream_id)? {
            return Ok(handle);
        }

        // Slow path: re-check under the write lock so that concurrent
        // callers never spawn two actors for the same stream.
        let mut cache = self.cache.write().await;
        if let Some(handle) = live_handle::<A>(&cache, stream_id)? {
            return Ok(handle);
        }
        // Drop entries of idle-evicted or stopped actors.
        cache.retain(|_, cached| cached.is_alive());

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            stream_id = %stream_id,
            "spawning actor"
        );

        let config = ActorConfig {
            idle_timeout: self.idle_timeout,
            read_batch_size: self.read_batch_size,
            commits: Arc::clone(&self.commits),
        };
        let handle =
            spawn_actor_with_config::<A>(Arc::clone(&self.storage), stream_id.to_owned(), config);
        cache.insert(stream_id.to_owned(), Box::new(handle.clone()));
        Ok(handle)
    }

    /// Catch up and return the current state of a registered projection.
    ///
    /// For a projection reading a projection stream, the stream's indexer
    /// is caught up first, so every event committed before this call is
    /// reflected.
    ///
    /// # Returns
    ///
    /// A clone of the projection's current state after catching up.
    ///
    /// # Errors
    ///
    /// * [`ProjectionError::NotRegistered`] -- no projection named `P::NAME`.
    /// * [`ProjectionError::TypeMismatch`] -- the registered projection
    ///   under that name is a different type.
    /// * [`ProjectionError::Store`] / [`ProjectionError::Io`] -- catch-up
    ///   or checkpoint saving failed.
    pub async fn projection<P: Projection>(&self) -> Result<P, ProjectionError> {
        let runner_mutex = self
            .projections
            .get(P::NAME)
            .ok_or_else(|| ProjectionError::NotRegistered(P::NAME.to_owned()))?;
        let mut runner = runner_mutex.lock().await;
        if let Some(stream) = runner.source_stream() {
            self.indexer(stream)?.catch_up().await?;
        }
        runner.catch_up().await?;
        downcast_state::<P>(runner.state_any())
    }

    /// Discard a projection's state and fold it again from ordinal 1.
    ///
    /// # Errors
    ///
    /// As for [`projection`](AggregateStore::projection).
    pub async fn rebuild_projection<P: Projection>(&self) -> Result<P, ProjectionError> {
        let runner_mutex = self
            .projections
            .get(P::NAME)
            .ok_or_else(|| ProjectionError::NotRegistered(P::NAME.to_owned()))?;
        let mut runner = runner_mutex.lock().await;
        tracing::info!(projection_name = P::NAME, "rebuilding projection");
        runner.reset();
        if let Some(stream) = runner.source_stream() {
            self.indexer(stream)?.catch_up().await?;
        }
        runner.catch_up().await?;
        runner.save()?;
        downcast_state::<P>(runner.state_any())
    }

    /// Clear a projection stream's index and re-index it from the start of
    /// the log.
    ///
    /// Projections reading the stream are reset and replay it on their next
    /// query.
    ///
    /// # Returns
    ///
    /// The projection stream's checkpoint after re-indexing.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::NotRegistered`] for an unknown stream, otherwise
    /// as for [`IndexerHandle::rebuild`].
    pub async fn rebuild_projection_stream(&self, name: &str) -> Result<u64, ProjectionError> {
        let checkpoint = self.indexer(name)?.rebuild().await?;
        for runner_mutex in self.projections.values() {
            let mut runner = runner_mutex.lock().await;
            if runner.source_stream() == Some(name) {
                runner.reset();
            }
        }
        Ok(checkpoint)
    }

    /// The indexer of a registered projection stream.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::NotRegistered`] if no stream has this name.
    pub fn indexer(&self, name: &str) -> Result<&IndexerHandle, ProjectionError> {
        self.indexers
            .get(name)
            .ok_or_else(|| ProjectionError::NotRegistered(name.to_owned()))
    }

    /// The storage backend this store writes to.
    pub fn storage(&self) -> &Arc<dyn EventStorage> {
        &self.storage
    }

    /// Stop indexers and cached actors, and save projection checkpoints.
    ///
    /// Actors finish the messages already queued before stopping. Handles
    /// obtained afterwards via [`get`](AggregateStore::get) spawn fresh
    /// actors, but projection streams are no longer indexed.
    pub async fn shutdown(&self) {
        for indexer in self.indexers.values() {
            indexer.shutdown().await;
        }

        let handles: Vec<Box<dyn CachedHandle>> =
            self.cache.write().await.drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.shutdown().await;
        }

        for (name, runner_mutex) in self.projections.iter() {
            let runner = runner_mutex.lock().await;
            match runner.save() {
                Ok(()) => tracing::debug!(
                    projection = %name,
                    position = runner.position(),
                    "projection checkpoint saved"
                ),
                Err(e) => tracing::error!(
                    projection = %name,
                    error = %e,
                    "failed to save projection checkpoint"
                ),
            }
        }
    }
}

fn downcast_state<P: Projection>(state: Box<dyn Any + Send>) -> Result<P, ProjectionError> {
    state
        .downcast::<P>()
        .map(|b| *b)
        .map_err(|_| ProjectionError::TypeMismatch(P::NAME.to_owned()))
}

// --- Factory types for deferred construction ---

/// Factory for creating a type-erased projection runner.
type ProjectionFactory = Box<
    dyn FnOnce(
            Arc<dyn EventStorage>,
            Option<&Path>,
            usize,
        ) -> io::Result<Box<dyn ProjectionCatchUp>>
        + Send,
>;

/// Load a projection runner, with its checkpoint under
/// `base_dir/projections/<name>/`.
fn open_runner<P: Projection>(
    storage: Arc<dyn EventStorage>,
    base_dir: Option<&Path>,
    batch_size: usize,
) -> io::Result<Box<dyn ProjectionCatchUp>> {
    let checkpoint_dir = base_dir.map(|dir| dir.join("projections").join(P::NAME));
    let runner = ProjectionRunner::<P>::new(storage, checkpoint_dir, batch_size)?;
    Ok(Box::new(runner))
}

/// Builder for configuring and opening an [`AggregateStore`].
///
/// Collects configuration -- storage backend, timeouts, batch sizes,
/// projection streams, and projections -- then wires them together on
/// [`open`](AggregateStoreBuilder::open).
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use eventstream_es::{AggregateStore, MemoryStorage, ProjectionStream};
///
/// # async fn example() -> Result<(), eventstream_es::OpenError> {
/// let store = AggregateStore::builder(Arc::new(MemoryStorage::new()))
///     .projection_stream(ProjectionStream::category("product"))
///     .open()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct AggregateStoreBuilder {
    storage: Arc<dyn EventStorage>,
    checkpoint_dir: Option<PathBuf>,
    projection_streams: Vec<ProjectionStream>,
    projection_factories: Vec<(String, ProjectionFactory)>,
    idle_timeout: Duration,
    read_batch_size: usize,
    indexer_config: IndexerConfig,
}

impl AggregateStoreBuilder {
    /// Create a builder over `storage` with default settings.
    pub fn new(storage: Arc<dyn EventStorage>) -> Self {
        Self {
            storage,
            checkpoint_dir: None,
            projection_streams: Vec::new(),
            projection_factories: Vec::new(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            indexer_config: IndexerConfig::default(),
        }
    }

    /// Persist projection checkpoints under `path/projections/<name>/`.
    ///
    /// Without a checkpoint directory, projections replay from the start of
    /// their source every time the store is opened.
    ///
    /// # Arguments
    ///
    /// * `path` - Root directory for local projection checkpoints. Created
    ///   on first save if missing.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn checkpoint_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.checkpoint_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Register a projection stream and its classifier.
    ///
    /// One indexer is spawned per projection stream when the store opens.
    pub fn projection_stream(mut self, definition: ProjectionStream) -> Self {
        self.projection_streams.push(definition);
        self
    }

    /// Register a projection type to be managed by this store.
    ///
    /// The projection will be initialized (loading any existing checkpoint)
    /// when [`open`](AggregateStoreBuilder::open) is called.
    ///
    /// # Type Parameters
    ///
    /// * `P` - A type implementing [`Projection`].
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn projection<P: Projection>(mut self) -> Self {
        self.projection_factories
            .push((P::NAME.to_owned(), Box::new(open_runner::<P>)));
        self
    }

    /// Set the idle timeout for actor eviction.
    ///
    /// Actors that receive no messages for this duration shut down. The
    /// next [`get`](AggregateStore::get) call transparently re-spawns the
    /// actor, which replays its stream.
    ///
    /// Defaults to 5 minutes.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the page size for stream replay and projection catch-up.
    ///
    /// Defaults to 256.
    pub fn read_batch_size(mut self, size: usize) -> Self {
        self.read_batch_size = size.max(1);
        self
    }

    /// Set the configuration shared by all indexers.
    ///
    /// If not called, [`IndexerConfig::default()`] is used.
    pub fn indexer_config(mut self, config: IndexerConfig) -> Self {
        self.indexer_config = config;
        self
    }

    /// Create the schema, spawn indexers, load projections, and build the
    /// [`AggregateStore`]. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// * [`OpenError::Store`] -- the backend could not create its schema.
    /// * [`OpenError::DuplicateName`] -- a projection stream or projection
    ///   name is registered twice.
    /// * [`OpenError::UnknownStream`] -- a projection reads an unregistered
    ///   projection stream.
    /// * [`OpenError::Io`] -- reading a checkpoint file failed.
    pub async fn open(self) -> Result<AggregateStore, OpenError> {
        self.storage.create_schema().await?;

        // Validate everything before spawning any task.
        let mut stream_names = HashSet::new();
        for definition in &self.projection_streams {
            if !stream_names.insert(definition.name().to_owned()) {
                return Err(OpenError::DuplicateName(definition.name().to_owned()));
            }
        }

        let mut projections: ProjectionMap = HashMap::new();
        for (name, factory) in self.projection_factories {
            if projections.contains_key(&name) {
                return Err(OpenError::DuplicateName(name));
            }
            let runner = factory(
                Arc::clone(&self.storage),
                self.checkpoint_dir.as_deref(),
                self.read_batch_size,
            )?;
            if let Some(stream) = runner.source_stream()
                && !stream_names.contains(stream)
            {
                return Err(OpenError::UnknownStream {
                    projection: name,
                    stream: stream.to_owned(),
                });
            }
            projections.insert(name, tokio::sync::Mutex::new(runner));
        }

        let (commits_tx, _) = watch::channel(0u64);
        let commits = Arc::new(commits_tx);

        let mut indexers = HashMap::new();
        for definition in self.projection_streams {
            let name = definition.name().to_owned();
            let handle = spawn_indexer(
                definition,
                Arc::clone(&self.storage),
                self.indexer_config.clone(),
                commits.subscribe(),
            );
            indexers.insert(name, handle);
        }

        tracing::debug!(
            projection_streams = indexers.len(),
            projections = projections.len(),
            "aggregate store opened"
        );

        Ok(AggregateStore {
            storage: self.storage,
            cache: Arc::new(RwLock::new(HashMap::new())),
            projections: Arc::new(projections),
            indexers: Arc::new(indexers),
            commits,
            idle_timeout: self.idle_timeout,
            read_batch_size: self.read_batch_size,
        })
    }
}
