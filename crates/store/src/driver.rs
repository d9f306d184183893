use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::document::Document;
use crate::query::{Filter, Sort, Update};
use crate::status::TopologyStatus;

/// Marker trait for `StoreDriver` errors.
pub trait StoreDriverError: Debug + Error + Send + Sync + 'static {}

/// The kind of change reported by a change feed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeOperation {
    /// A document was inserted.
    Insert,
    /// One or more documents were updated.
    Update,
    /// One or more documents were deleted.
    Delete,
}

/// A change event emitted by [`StoreDriver::watch`].
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    /// The collection the change happened in.
    pub collection: String,
    /// The kind of change.
    pub operation: ChangeOperation,
    /// The `_id` of the affected document, when the driver knows it.
    pub document_id: Option<Value>,
}

/// A trait representing a driver for a shared document store.
///
/// The driver owns connection management and retries transient network
/// failures per its [`DriverSettings`](crate::DriverSettings); callers only
/// ever see final failures. Conditional updates must be atomic: the
/// modified count returned by `update_one` is the sole mutual-exclusion
/// primitive available to callers.
#[async_trait]
pub trait StoreDriver: Clone + Send + Sync + 'static {
    /// The error type for driver operations.
    type Error: StoreDriverError;

    /// Finds documents matching `filter`, ordered by `sort`.
    ///
    /// `skip` documents are dropped from the front of the result before
    /// `limit` (when given) caps its length.
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &Sort,
        limit: Option<usize>,
        skip: usize,
    ) -> Result<Vec<Document>, Self::Error>;

    /// Inserts a document. Fails when its `_id` already exists.
    async fn insert(&self, collection: &str, document: Document) -> Result<(), Self::Error>;

    /// Atomically applies `update` to at most one matching document and
    /// returns the number of documents actually modified (0 or 1).
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<u64, Self::Error>;

    /// Atomically applies `update` to every matching document and returns
    /// the number of documents actually modified.
    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<u64, Self::Error>;

    /// Deletes every matching document and returns the number removed.
    async fn delete(&self, collection: &str, filter: &Filter) -> Result<u64, Self::Error>;

    /// Fetches a snapshot of the store's node set.
    async fn topology_status(&self) -> Result<TopologyStatus, Self::Error>;

    /// Subscribes to change events for `collection`.
    async fn watch(
        &self,
        collection: &str,
    ) -> Result<broadcast::Receiver<ChangeEvent>, Self::Error>;
}
