//! Product catalog domain shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use eventstream_es::{
    Aggregate, AggregateStore, CommandContext, EventRecord, EventStorage, MemoryStorage, NewEvent,
    Projection, ProjectionSource, ProjectionStream, decode_domain_event,
};
use serde::{Deserialize, Serialize};

/// A catalog entry that can be created once, renamed, and deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub is_created: bool,
    pub is_deleted: bool,
    pub name: String,
    pub renames: u32,
}

pub enum ProductCommand {
    Create { name: String },
    Rename { name: String },
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ProductEvent {
    Created { name: String },
    Renamed { name: String },
    Deleted,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ProductError {
    #[error("product already exists")]
    AlreadyCreated,
    #[error("product does not exist")]
    NotCreated,
    #[error("product was deleted")]
    Deleted,
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
            ProductCommand::Rename { name } => {
                self.ensure_live()?;
                // Already satisfied.
                if self.name == name {
                    return Ok(vec![]);
                }
                Ok(vec![ProductEvent::Renamed { name }])
            }
            ProductCommand::Delete => {
                self.ensure_live()?;
                Ok(vec![ProductEvent::Deleted])
            }
        }
    }

    fn apply(mut self, event: &ProductEvent) -> Self {
        match event {
            ProductEvent::Created { name } => {
                self.is_created = true;
                self.name = name.clone();
            }
            ProductEvent::Renamed { name } => {
                self.name = name.clone();
                self.renames += 1;
            }
            ProductEvent::Deleted => self.is_deleted = true,
        }
        self
    }

    fn owns_stream(stream_id: &str) -> bool {
        stream_id.starts_with("product-")
    }
}

impl Product {
    fn ensure_live(&self) -> Result<(), ProductError> {
        if !self.is_created {
            return Err(ProductError::NotCreated);
        }
        if self.is_deleted {
            return Err(ProductError::Deleted);
        }
        Ok(())
    }
}

/// Names of products that exist and are not deleted, keyed by stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveProducts {
    pub products: BTreeMap<String, String>,
}

impl Projection for ActiveProducts {
    const NAME: &'static str = "active-products";

    fn source() -> ProjectionSource {
        ProjectionSource::Stream("$ce-product")
    }

    fn apply(&mut self, event: &EventRecord) {
        match decode_domain_event::<ProductEvent>(event) {
            Some(ProductEvent::Created { name } | ProductEvent::Renamed { name }) => {
                self.products.insert(event.stream_id.clone(), name);
            }
            Some(ProductEvent::Deleted) => {
                self.products.remove(&event.stream_id);
            }
            None => {}
        }
    }
}

/// Counts every event in the log by type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTypeCounts {
    pub counts: BTreeMap<String, u64>,
}

impl Projection for EventTypeCounts {
    const NAME: &'static str = "event-type-counts";

    fn apply(&mut self, event: &EventRecord) {
        *self.counts.entry(event.event_type.clone()).or_default() += 1;
    }
}

pub fn ctx() -> CommandContext {
    CommandContext::default().with_actor("test")
}

pub fn create(name: &str) -> ProductCommand {
    ProductCommand::Create { name: name.into() }
}

pub fn rename(name: &str) -> ProductCommand {
    ProductCommand::Rename { name: name.into() }
}

/// A store over `storage` with the product category stream and both
/// projections registered.
pub async fn open_store(storage: Arc<dyn EventStorage>) -> AggregateStore {
    AggregateStore::builder(storage)
        .projection_stream(ProjectionStream::category("product"))
        .projection::<ActiveProducts>()
        .projection::<EventTypeCounts>()
        .open()
        .await
        .expect("failed to open store")
}

pub fn memory() -> Arc<dyn EventStorage> {
    Arc::new(MemoryStorage::new())
}

/// Append a raw event to a stream outside any aggregate.
pub async fn append_raw(storage: &dyn EventStorage, stream: &str, start: u64, event_type: &str) {
    storage
        .append(stream, start, vec![NewEvent::new(event_type, b"{}".to_vec())])
        .await
        .expect("raw append failed");
}
