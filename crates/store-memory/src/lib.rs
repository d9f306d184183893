//! In-memory (single process) implementation of the store driver for local
//! development and tests.
//!
//! Every operation takes one process-wide mutex, so each conditional
//! update is atomic with respect to all other operations. That property
//! is what callers racing on `update_one` rely on.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use docbus_store::{
    ChangeEvent, ChangeOperation, Document, DriverSettings, Filter, MemberState, MemberStatus,
    Sort, StoreDriver, TopologyStatus, Update,
};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};

const WATCH_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct Shared {
    collections: HashMap<String, Vec<Document>>,
    watchers: HashMap<String, broadcast::Sender<ChangeEvent>>,
}

/// In-memory store driver.
#[derive(Clone, Debug)]
pub struct MemoryDriver {
    shared: Arc<Mutex<Shared>>,
    topology: Arc<Mutex<Option<TopologyStatus>>>,
    settings: DriverSettings,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    /// Creates a new `MemoryDriver` reporting a single-member topology.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(DriverSettings::default())
    }

    /// Creates a new `MemoryDriver` with the given settings.
    ///
    /// The settings are held but mostly unused; there is no network to
    /// retry against.
    #[must_use]
    pub fn with_settings(settings: DriverSettings) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            topology: Arc::new(Mutex::new(Some(Self::standalone_status()))),
            settings,
        }
    }

    fn standalone_status() -> TopologyStatus {
        TopologyStatus {
            set_name: "memory".to_string(),
            members: vec![MemberStatus {
                host: "localhost:27017".to_string(),
                state: MemberState::Primary,
                ok: true,
            }],
        }
    }

    /// Returns the settings this driver was created with.
    #[must_use]
    pub const fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Scripts the topology status returned by future status fetches.
    ///
    /// `None` makes `topology_status` fail, which is how degraded-cluster
    /// behavior is exercised in tests.
    pub async fn set_topology_status(&self, status: Option<TopologyStatus>) {
        *self.topology.lock().await = status;
    }

    /// Deletes documents whose integer `field` is at or before `now`.
    ///
    /// Stand-in for a server-side TTL index; returns the number removed.
    pub async fn purge_expired(&self, collection: &str, field: &str, now: i64) -> u64 {
        let filter = Filter::Lte(field.to_string(), Value::from(now));
        let mut shared = self.shared.lock().await;
        let removed = Self::delete_locked(&mut shared, collection, &filter);
        if removed > 0 {
            Self::publish(&shared, collection, ChangeOperation::Delete, None);
        }
        removed
    }

    fn delete_locked(shared: &mut Shared, collection: &str, filter: &Filter) -> u64 {
        let Some(documents) = shared.collections.get_mut(collection) else {
            return 0;
        };
        let before = documents.len();
        documents.retain(|document| !filter.matches(document));
        (before - documents.len()) as u64
    }

    fn publish(
        shared: &Shared,
        collection: &str,
        operation: ChangeOperation,
        document_id: Option<Value>,
    ) {
        if let Some(sender) = shared.watchers.get(collection) {
            // Nobody listening is fine.
            let _ = sender.send(ChangeEvent {
                collection: collection.to_string(),
                operation,
                document_id,
            });
        }
    }
}

#[async_trait]
impl StoreDriver for MemoryDriver {
    type Error = Error;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &Sort,
        limit: Option<usize>,
        skip: usize,
    ) -> Result<Vec<Document>, Self::Error> {
        let shared = self.shared.lock().await;
        let mut matches: Vec<Document> = shared
            .collections
            .get(collection)
            .into_iter()
            .flatten()
            .filter(|document| filter.matches(document))
            .cloned()
            .collect();

        // Stable sort keeps insertion order for equal keys.
        matches.sort_by(|a, b| sort.compare(a, b));

        let mut matches: Vec<Document> = matches.into_iter().skip(skip).collect();
        if let Some(limit) = limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn insert(&self, collection: &str, document: Document) -> Result<(), Self::Error> {
        let mut shared = self.shared.lock().await;
        let documents = shared.collections.entry(collection.to_string()).or_default();

        if let Some(id) = document.get("_id") {
            if documents
                .iter()
                .any(|existing| existing.get("_id") == Some(id))
            {
                return Err(Error::Duplicate(id.to_string()));
            }
        }

        let document_id = document.get("_id").cloned();
        documents.push(document);
        Self::publish(&shared, collection, ChangeOperation::Insert, document_id);
        Ok(())
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<u64, Self::Error> {
        let mut shared = self.shared.lock().await;
        let mut changed_id = None;

        if let Some(documents) = shared.collections.get_mut(collection) {
            for document in documents.iter_mut() {
                if filter.matches(document) {
                    if update.apply(document) {
                        changed_id = Some(document.get("_id").cloned());
                    }
                    break;
                }
            }
        }

        match changed_id {
            Some(document_id) => {
                Self::publish(&shared, collection, ChangeOperation::Update, document_id);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<u64, Self::Error> {
        let mut shared = self.shared.lock().await;
        let mut modified = 0;

        if let Some(documents) = shared.collections.get_mut(collection) {
            for document in documents.iter_mut() {
                if filter.matches(document) && update.apply(document) {
                    modified += 1;
                }
            }
        }

        if modified > 0 {
            Self::publish(&shared, collection, ChangeOperation::Update, None);
        }
        Ok(modified)
    }

    async fn delete(&self, collection: &str, filter: &Filter) -> Result<u64, Self::Error> {
        let mut shared = self.shared.lock().await;
        let removed = Self::delete_locked(&mut shared, collection, filter);
        if removed > 0 {
            Self::publish(&shared, collection, ChangeOperation::Delete, None);
        }
        Ok(removed)
    }

    async fn topology_status(&self) -> Result<TopologyStatus, Self::Error> {
        self.topology
            .lock()
            .await
            .clone()
            .ok_or(Error::TopologyUnavailable)
    }

    async fn watch(
        &self,
        collection: &str,
    ) -> Result<broadcast::Receiver<ChangeEvent>, Self::Error> {
        let mut shared = self.shared.lock().await;
        let sender = shared
            .watchers
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0);
        Ok(sender.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docbus_store::Order;
    use serde_json::json;

    fn doc(id: &str, priority: i64, timestamp: i64) -> Document {
        let mut document = Document::new();
        document.insert("_id", id);
        document.insert("priority", priority);
        document.insert("timestamp", timestamp);
        document
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let driver = MemoryDriver::new();
        driver.insert("msg", doc("a", 1000, 1)).await.unwrap();
        driver.insert("msg", doc("b", 100, 2)).await.unwrap();

        let all = driver
            .find("msg", &Filter::And(vec![]), &Sort::unsorted(), None, 0)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let low = driver
            .find("msg", &Filter::eq("_id", "b"), &Sort::unsorted(), None, 0)
            .await
            .unwrap();
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].get_str("_id"), Some("b"));
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let driver = MemoryDriver::new();
        driver.insert("msg", doc("a", 1000, 1)).await.unwrap();

        let result = driver.insert("msg", doc("a", 500, 2)).await;
        assert!(matches!(result, Err(Error::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_find_sort_skip_limit() {
        let driver = MemoryDriver::new();
        driver.insert("msg", doc("a", 500, 3)).await.unwrap();
        driver.insert("msg", doc("b", 100, 2)).await.unwrap();
        driver.insert("msg", doc("c", 100, 1)).await.unwrap();
        driver.insert("msg", doc("d", 900, 0)).await.unwrap();

        let sort = Sort::by("priority", Order::Asc).then("timestamp", Order::Asc);
        let found = driver
            .find("msg", &Filter::And(vec![]), &sort, Some(2), 1)
            .await
            .unwrap();

        let ids: Vec<_> = found.iter().filter_map(|d| d.get_str("_id")).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_conditional_update_one_modified_count() {
        let driver = MemoryDriver::new();
        let mut document = doc("a", 1000, 1);
        document.insert("locked_by", "ALL");
        driver.insert("msg", document).await.unwrap();

        let claim = |node: &str| {
            let filter = Filter::And(vec![
                Filter::eq("_id", "a"),
                Filter::eq("locked_by", "ALL"),
            ]);
            let update = Update::new().set("locked_by", node).set("locked", 42);
            (filter, update)
        };

        let (filter, update) = claim("node-1");
        assert_eq!(driver.update_one("msg", &filter, &update).await.unwrap(), 1);

        // Second claim sees the sentinel already replaced.
        let (filter, update) = claim("node-2");
        assert_eq!(driver.update_one("msg", &filter, &update).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let driver = MemoryDriver::new();
        let mut document = doc("race", 1000, 1);
        document.insert("locked_by", "ALL");
        driver.insert("msg", document).await.unwrap();

        let mut tasks = Vec::new();
        for node in 0..16 {
            let driver = driver.clone();
            tasks.push(tokio::spawn(async move {
                let filter = Filter::And(vec![
                    Filter::eq("_id", "race"),
                    Filter::eq("locked_by", "ALL"),
                ]);
                let update = Update::new().set("locked_by", format!("node-{node}"));
                driver.update_one("msg", &filter, &update).await.unwrap()
            }));
        }

        let results = futures::future::join_all(tasks).await;
        let winners: u64 = results.into_iter().map(Result::unwrap).sum();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_add_to_set_does_not_grow_on_repeat() {
        let driver = MemoryDriver::new();
        driver.insert("msg", doc("a", 1000, 1)).await.unwrap();

        let filter = Filter::eq("_id", "a");
        let update = Update::new().add_to_set("processed_by", "node-1");

        assert_eq!(driver.update_one("msg", &filter, &update).await.unwrap(), 1);
        assert_eq!(driver.update_one("msg", &filter, &update).await.unwrap(), 0);

        let found = driver
            .find("msg", &filter, &Sort::unsorted(), None, 0)
            .await
            .unwrap();
        assert_eq!(found[0].get_array("processed_by").map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let driver = MemoryDriver::new();
        let mut expired = doc("old", 1000, 1);
        expired.insert("delete_at", 500);
        let mut live = doc("new", 1000, 2);
        live.insert("delete_at", 5000);
        driver.insert("msg", expired).await.unwrap();
        driver.insert("msg", live).await.unwrap();

        assert_eq!(driver.purge_expired("msg", "delete_at", 1000).await, 1);

        let remaining = driver
            .find("msg", &Filter::And(vec![]), &Sort::unsorted(), None, 0)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].get_str("_id"), Some("new"));
    }

    #[tokio::test]
    async fn test_watch_reports_inserts_and_updates() {
        let driver = MemoryDriver::new();
        let mut receiver = driver.watch("msg").await.unwrap();

        driver.insert("msg", doc("a", 1000, 1)).await.unwrap();
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.operation, ChangeOperation::Insert);
        assert_eq!(event.document_id, Some(json!("a")));

        let filter = Filter::eq("_id", "a");
        let update = Update::new().set("priority", 1);
        driver.update_one("msg", &filter, &update).await.unwrap();
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.operation, ChangeOperation::Update);
    }

    #[tokio::test]
    async fn test_scripted_topology_status() {
        let driver = MemoryDriver::new();
        assert!(driver.topology_status().await.is_ok());

        driver.set_topology_status(None).await;
        assert!(matches!(
            driver.topology_status().await,
            Err(Error::TopologyUnavailable)
        ));
    }
}
