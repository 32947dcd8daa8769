//! Self-contained example demonstrating aggregates, a category projection
//! stream, and a projection folded from it, all over the in-memory backend.
//!
//! Run with: `cargo run --example product_catalog`
//!
//! Set `RUST_LOG=eventstream_es=debug` to watch actors and indexers work.

use std::collections::BTreeMap;
use std::sync::Arc;

use eventstream_es::{
    Aggregate, AggregateStore, CommandContext, EventRecord, ExecuteError, MemoryStorage,
    Projection, ProjectionSource, ProjectionStream, decode_domain_event,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Product aggregate
// ---------------------------------------------------------------------------

/// A catalog entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Product {
    is_created: bool,
    is_deleted: bool,
    name: String,
}

/// Commands accepted by the [`Product`] aggregate.
enum ProductCommand {
    Create { name: String },
    Rename { name: String },
    Delete,
}

/// Domain events produced by the [`Product`] aggregate.
///
/// Uses adjacently tagged serde serialization, the required format for all
/// `eventstream-es` domain events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum ProductEvent {
    Created { name: String },
    Renamed { name: String },
    Deleted,
}

/// Errors that can occur when handling a [`ProductCommand`].
#[derive(Debug, thiserror::Error)]
enum ProductError {
    #[error("product already exists")]
    AlreadyCreated,
    #[error("product does not exist or was deleted")]
    Missing,
}

impl Aggregate for Product {
    const AGGREGATE_TYPE: &'static str = "product";
    type Command = ProductCommand;
    type DomainEvent = ProductEvent;
    type Error = ProductError;

    async fn handle(&self, cmd: ProductCommand) -> Result<Vec<ProductEvent>, ProductError> {
        match cmd {
            ProductCommand::Create { name } => {
                if self.is_created {
                    return Err(ProductError::AlreadyCreated);
                }
                Ok(vec![ProductEvent::Created { name }])
            }
            ProductCommand::Rename { .. } | ProductCommand::Delete
                if !self.is_created || self.is_deleted =>
            {
                Err(ProductError::Missing)
            }
            ProductCommand::Rename { name } => Ok(vec![ProductEvent::Renamed { name }]),
            ProductCommand::Delete => Ok(vec![ProductEvent::Deleted]),
        }
    }

    fn apply(mut self, event: &ProductEvent) -> Self {
        match event {
            ProductEvent::Created { name } => {
                self.is_created = true;
                self.name = name.clone();
            }
            ProductEvent::Renamed { name } => self.name = name.clone(),
            ProductEvent::Deleted => self.is_deleted = true,
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Catalog projection (reads the `$ce-product` projection stream)
// ---------------------------------------------------------------------------

/// Active product names keyed by stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Catalog {
    active: BTreeMap<String, String>,
}

impl Projection for Catalog {
    const NAME: &'static str = "catalog";

    fn source() -> ProjectionSource {
        ProjectionSource::Stream("$ce-product")
    }

    fn apply(&mut self, event: &EventRecord) {
        match decode_domain_event::<ProductEvent>(event) {
            Some(ProductEvent::Created { name } | ProductEvent::Renamed { name }) => {
                self.active.insert(event.stream_id.clone(), name);
            }
            Some(ProductEvent::Deleted) => {
                self.active.remove(&event.stream_id);
            }
            None => {} // Forward compatibility: ignore unknown events.
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Checkpoints go to a temporary directory.
    let tmp = tempfile::tempdir()?;

    let store = AggregateStore::builder(Arc::new(MemoryStorage::new()))
        .checkpoint_dir(tmp.path())
        .projection_stream(ProjectionStream::category("product"))
        .projection::<Catalog>()
        .open()
        .await?;

    let ctx = CommandContext::default().with_actor("example-runner");

    let anvil = store.get::<Product>("anvil").await?;
    anvil
        .execute(ProductCommand::Create { name: "Anvil".into() }, ctx.clone())
        .await?;
    anvil
        .execute(ProductCommand::Rename { name: "Heavy Anvil".into() }, ctx.clone())
        .await?;

    let rope = store.get::<Product>("rope").await?;
    rope.execute(ProductCommand::Create { name: "Rope".into() }, ctx.clone())
        .await?;
    rope.execute(ProductCommand::Delete, ctx.clone()).await?;

    // A second create is rejected by the aggregate and persists nothing.
    match anvil
        .execute(ProductCommand::Create { name: "Anvil".into() }, ctx)
        .await
    {
        Err(ExecuteError::Domain(e)) => println!("rejected as expected: {e}"),
        other => println!("unexpected result: {other:?}"),
    }

    // Query the projection (catches up the indexer and itself).
    let catalog = store.projection::<Catalog>().await?;
    println!("active products: {:?}", catalog.active);

    assert_eq!(catalog.active.len(), 1);
    assert_eq!(
        catalog.active.get("product-anvil").map(String::as_str),
        Some("Heavy Anvil")
    );

    store.shutdown().await;
    println!("all assertions passed");

    Ok(())
}
