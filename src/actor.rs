//! Actor loop that owns one stream's aggregate state and processes commands.
//!
//! Each stream identity gets its own tokio task fed by a bounded `mpsc`
//! mailbox. Messages are handled strictly one at a time, including while a
//! command handler is suspended, which is what makes validation race-free
//! without locks. Unrelated streams run on separate tasks and proceed in
//! parallel.
//!
//! Public API: [`AggregateHandle`] (cloneable async handle), [`Committed`]
//! (the result of a successful command), and [`spawn_actor`].

use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::StreamExt;
use tracing::Instrument;

use crate::aggregate::{Aggregate, fold_record};
use crate::command::CommandContext;
use crate::error::{ExecuteError, StateError, StoreError};
use crate::event::encode_domain_event;
use crate::storage::{EventStorage, stream_events};

/// Capacity of each actor's mailbox. Senders wait when it is full.
const MAILBOX_CAPACITY: usize = 32;

/// Configuration for the actor loop.
///
/// Internal to the crate -- callers configure these through
/// [`AggregateStoreBuilder`](crate::AggregateStoreBuilder).
pub(crate) struct ActorConfig {
    /// How long the actor waits for a message before shutting down.
    /// An effectively infinite value means the actor never idles out.
    pub idle_timeout: Duration,
    /// Page size used when replaying the stream.
    pub read_batch_size: usize,
    /// Receives the highest global sequence this process has committed.
    pub commits: Arc<watch::Sender<u64>>,
}

impl ActorConfig {
    fn never_idle() -> Self {
        Self {
            // `u64::MAX / 2` avoids overflow when tokio adds the timeout
            // duration to the current `Instant`.
            idle_timeout: Duration::from_secs(u64::MAX / 2),
            read_batch_size: 256,
            commits: Arc::new(watch::channel(0).0),
        }
    }
}

/// The outcome of a successfully executed command.
pub struct Committed<A: Aggregate> {
    /// The domain events the handler produced, now persisted. Empty for a
    /// no-op command.
    pub events: Vec<A::DomainEvent>,
    /// Global sequences assigned to `events`, in order.
    pub global_sequences: Vec<u64>,
    /// The stream's last sequence after the command.
    pub stream_sequence: u64,
}

impl<A: Aggregate> Committed<A> {
    /// Whether the command was a no-op.
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
    }
}

impl<A: Aggregate> Clone for Committed<A> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
            global_sequences: self.global_sequences.clone(),
            stream_sequence: self.stream_sequence,
        }
    }
}

impl<A: Aggregate> fmt::Debug for Committed<A>
where
    A::DomainEvent: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Committed")
            .field("events", &self.events)
            .field("global_sequences", &self.global_sequences)
            .field("stream_sequence", &self.stream_sequence)
            .finish()
    }
}

/// Result type sent back through the `Execute` reply channel.
type ExecuteResult<A> = Result<Committed<A>, ExecuteError<<A as Aggregate>::Error>>;

/// Messages sent from `AggregateHandle` to the actor loop.
///
/// Each variant carries a `oneshot::Sender` for the actor to reply on
/// once the operation completes.
pub(crate) enum ActorMessage<A: Aggregate> {
    /// Execute a command against the aggregate.
    Execute {
        /// The domain command to execute.
        cmd: A::Command,
        /// Cross-cutting metadata (actor identity, correlation ID, etc.).
        ctx: CommandContext,
        /// Channel to send back the commit or an error.
        reply: oneshot::Sender<ExecuteResult<A>>,
    },

    /// Retrieve the current aggregate state.
    GetState {
        /// Channel to send back a clone of the current state or an error.
        reply: oneshot::Sender<Result<A, StateError>>,
    },

    /// Gracefully shut down the actor loop.
    Shutdown,
}

impl<A: Aggregate> ActorMessage<A> {
    /// Answer the message with a load failure.
    fn fail(self, err: StoreError) {
        match self {
            Self::Execute { reply, .. } => {
                let _ = reply.send(Err(ExecuteError::Store(err)));
            }
            Self::GetState { reply } => {
                let _ = reply.send(Err(StateError::Store(err)));
            }
            Self::Shutdown => {}
        }
    }
}

/// Replayed state and the stream sequence it reflects.
struct Loaded<A> {
    state: A,
    version: u64,
}

/// Per-stream state machine.
///
/// `loaded == None` covers both "not yet loaded" and "faulted"; either way
/// the next message triggers a fresh replay.
struct StreamActor<A: Aggregate> {
    stream_id: String,
    storage: Arc<dyn EventStorage>,
    config: ActorConfig,
    loaded: Option<Loaded<A>>,
}

impl<A: Aggregate> StreamActor<A> {
    /// Replay the stream from sequence 1 through [`fold_record`].
    ///
    /// # Errors
    ///
    /// Returns the storage error, or [`StoreError::Fault`] if the stream
    /// sequences are not contiguous.
    async fn load(&mut self) -> Result<(), StoreError> {
        self.loaded = None;
        let mut state = A::default();
        let mut version = 0u64;

        let mut records = pin!(stream_events(
            Arc::clone(&self.storage),
            self.stream_id.clone(),
            1,
            self.config.read_batch_size,
        ));
        while let Some(record) = records.next().await {
            let record = record?;
            if record.stream_sequence != version + 1 {
                return Err(StoreError::Fault(format!(
                    "stream '{}' jumps from sequence {version} to {}",
                    self.stream_id, record.stream_sequence
                )));
            }
            state = fold_record(state, &record);
            version = record.stream_sequence;
        }

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            stream_id = %self.stream_id,
            version,
            "aggregate loaded"
        );
        self.loaded = Some(Loaded { state, version });
        Ok(())
    }

    /// Handle a command, persist its events, and fold them into state.
    async fn execute(&mut self, cmd: A::Command, ctx: &CommandContext) -> ExecuteResult<A> {
        let Some(current) = self.loaded.as_ref() else {
            return Err(ExecuteError::Store(StoreError::Fault(
                "aggregate state not loaded".into(),
            )));
        };
        let version = current.version;

        // The handler may suspend; the mailbox is not polled meanwhile.
        let events = current.state.handle(cmd).await.map_err(ExecuteError::Domain)?;
        if events.is_empty() {
            return Ok(Committed {
                events,
                global_sequences: Vec::new(),
                stream_sequence: version,
            });
        }

        let metadata = ctx.to_metadata();
        let batch = events
            .iter()
            .map(|event| encode_domain_event(event, &metadata))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ExecuteError::Codec(e.to_string()))?;

        let global_sequences = match self.storage.append(&self.stream_id, version + 1, batch).await
        {
            Ok(globals) => globals,
            Err(err) if err.is_conflict() => {
                tracing::warn!(
                    stream_id = %self.stream_id,
                    expected = version + 1,
                    error = %err,
                    "append conflict, reloading stream"
                );
                if let Err(reload) = self.load().await {
                    tracing::warn!(stream_id = %self.stream_id, error = %reload, "reload failed");
                }
                return Err(ExecuteError::Conflict);
            }
            Err(err) => {
                // Whether anything was written is unknown; replay next time.
                self.loaded = None;
                return Err(ExecuteError::Store(err));
            }
        };

        let stream_sequence = version + events.len() as u64;
        if let Some(current) = self.loaded.as_mut() {
            let state = std::mem::take(&mut current.state);
            current.state = events.iter().fold(state, |state, event| state.apply(event));
            current.version = stream_sequence;
        }

        if let Some(&last) = global_sequences.last() {
            self.config.commits.send_if_modified(|head| {
                if last > *head {
                    *head = last;
                    true
                } else {
                    false
                }
            });
        }

        tracing::info!(count = events.len(), stream_sequence, "events appended");

        Ok(Committed {
            events,
            global_sequences,
            stream_sequence,
        })
    }
}

/// Runs the aggregate actor loop.
///
/// The loop exits when the channel closes (all senders dropped), a
/// `Shutdown` message is received, or the idle timeout elapses.
///
/// # Arguments
///
/// * `actor` - The stream's state machine, initially unloaded.
/// * `rx` - Receiving end of the mpsc channel carrying `ActorMessage`s.
async fn run_actor<A: Aggregate>(
    mut actor: StreamActor<A>,
    mut rx: mpsc::Receiver<ActorMessage<A>>,
) {
    loop {
        let msg = match tokio::time::timeout(actor.config.idle_timeout, rx.recv()).await {
            Ok(Some(ActorMessage::Shutdown)) | Ok(None) => break,
            Ok(Some(msg)) => msg,
            Err(_elapsed) => {
                tracing::info!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    stream_id = %actor.stream_id,
                    "actor idle, shutting down"
                );
                break;
            }
        };

        if actor.loaded.is_none()
            && let Err(err) = actor.load().await
        {
            tracing::warn!(
                aggregate_type = A::AGGREGATE_TYPE,
                stream_id = %actor.stream_id,
                error = %err,
                "aggregate load failed"
            );
            // Everything queued behind the failed load fails with it; the
            // next message retries.
            msg.fail(err.clone());
            while let Ok(queued) = rx.try_recv() {
                if matches!(queued, ActorMessage::Shutdown) {
                    return;
                }
                queued.fail(err.clone());
            }
            continue;
        }

        match msg {
            ActorMessage::Execute { cmd, ctx, reply } => {
                let span = tracing::info_span!(
                    "execute",
                    aggregate_type = A::AGGREGATE_TYPE,
                    stream_id = %actor.stream_id,
                );
                let result = actor.execute(cmd, &ctx).instrument(span).await;
                // If the receiver was dropped, the caller no longer cares
                // about the result. Silently discard it.
                let _ = reply.send(result);
            }
            ActorMessage::GetState { reply } => {
                let result = actor
                    .loaded
                    .as_ref()
                    .map(|loaded| loaded.state.clone())
                    .ok_or_else(|| {
                        StateError::Store(StoreError::Fault("aggregate state not loaded".into()))
                    });
                let _ = reply.send(result);
            }
            ActorMessage::Shutdown => break,
        }
    }
}

/// Async handle to a running aggregate actor.
///
/// Lightweight, cloneable, and `Send + Sync`. Communicates with the
/// actor task over a bounded channel.
///
/// # Type Parameters
///
/// * `A` - The [`Aggregate`] type this handle controls.
pub struct AggregateHandle<A: Aggregate> {
    sender: mpsc::Sender<ActorMessage<A>>,
    stream_id: Arc<str>,
}

// Manual `Clone` because `A` itself need not be `Clone` for the handle.
impl<A: Aggregate> Clone for AggregateHandle<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stream_id: Arc::clone(&self.stream_id),
        }
    }
}

impl<A: Aggregate> fmt::Debug for AggregateHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateHandle")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("stream_id", &self.stream_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<A: Aggregate> AggregateHandle<A> {
    /// Send a command to the aggregate and wait for the result.
    ///
    /// # Arguments
    ///
    /// * `cmd` - The domain command to execute against the aggregate.
    /// * `ctx` - Cross-cutting metadata (actor identity, correlation ID, etc.).
    ///
    /// # Returns
    ///
    /// The persisted domain events and their assigned sequences.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`] -- the aggregate rejected the command.
    /// * [`ExecuteError::Conflict`] -- another writer advanced the stream;
    ///   the actor has reloaded and the caller may resubmit.
    /// * [`ExecuteError::Store`] -- loading or appending failed.
    /// * [`ExecuteError::ActorGone`] -- the actor task has exited.
    pub async fn execute(
        &self,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<Committed<A>, ExecuteError<A::Error>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Execute {
                cmd,
                ctx,
                reply: tx,
            })
            .await
            .map_err(|_| ExecuteError::ActorGone)?;
        rx.await.map_err(|_| ExecuteError::ActorGone)?
    }

    /// Like [`execute`](Self::execute), but stop waiting after `limit`.
    ///
    /// Giving up does not cancel the command: once the actor has dequeued
    /// it, it runs to completion and its events are persisted.
    ///
    /// # Errors
    ///
    /// [`ExecuteError::TimedOut`] if no result arrived in time, otherwise as
    /// for [`execute`](Self::execute).
    pub async fn execute_timeout(
        &self,
        cmd: A::Command,
        ctx: CommandContext,
        limit: Duration,
    ) -> Result<Committed<A>, ExecuteError<A::Error>> {
        tokio::time::timeout(limit, self.execute(cmd, ctx))
            .await
            .map_err(|_| ExecuteError::TimedOut)?
    }

    /// Read the current aggregate state.
    ///
    /// # Errors
    ///
    /// * [`StateError::Store`] -- replaying the stream failed.
    /// * [`StateError::ActorGone`] -- the actor task has exited.
    pub async fn state(&self) -> Result<A, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::ActorGone)?;
        rx.await.map_err(|_| StateError::ActorGone)?
    }

    /// The stream this handle's actor owns.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Check whether the actor backing this handle is still running.
    ///
    /// Returns `false` if the actor task has exited (e.g. due to idle
    /// timeout or shutdown). The store uses this to evict stale handles
    /// from its cache and re-spawn the actor on the next `get` call.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Ask the actor to stop after the messages already queued.
    pub(crate) async fn shutdown(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown).await;
    }
}

/// Spawn a new aggregate actor with explicit configuration.
///
/// The actor starts unloaded and replays its stream when the first message
/// arrives. Must be called from within a tokio runtime.
pub(crate) fn spawn_actor_with_config<A: Aggregate>(
    storage: Arc<dyn EventStorage>,
    stream_id: String,
    config: ActorConfig,
) -> AggregateHandle<A> {
    let (tx, rx) = mpsc::channel::<ActorMessage<A>>(MAILBOX_CAPACITY);
    let handle = AggregateHandle {
        sender: tx,
        stream_id: Arc::from(stream_id.as_str()),
    };
    let actor = StreamActor {
        stream_id,
        storage,
        config,
        loaded: None,
    };
    tokio::spawn(run_actor::<A>(actor, rx));
    handle
}

/// Spawn a standalone aggregate actor for `stream_id`.
///
/// The actor never idles out and does not notify any indexer. Most callers
/// should go through [`AggregateStore::get`](crate::AggregateStore::get)
/// instead, which caches handles and wires commit notifications.
///
/// # Arguments
///
/// * `storage` - Backend holding the stream.
/// * `stream_id` - Name of the stream the actor owns.
pub fn spawn_actor<A: Aggregate>(
    storage: Arc<dyn EventStorage>,
    stream_id: impl Into<String>,
) -> AggregateHandle<A> {
    spawn_actor_with_config(storage, stream_id.into(), ActorConfig::never_idle())
}
