//! Document-store seam for hubsync: the `DocumentStore` trait, the
//! MongoDB-backed implementation and an in-memory double for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::TryStreamExt;
use hubsync_core::UpsertOutcome;
use mongodb::bson::{doc, Bson, Document};
use mongodb::Client;
use thiserror::Error;
use tracing::debug;

pub use mongodb::bson;

pub const CRATE_NAME: &str = "hubsync-store";

/// One "match, set all fields, insert if missing" operation.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOp {
    pub filter: Document,
    pub set: Document,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to document store: {0}")]
    Connect(#[source] mongodb::error::Error),
    #[error("reading from collection `{collection}`: {source}")]
    Read {
        collection: String,
        #[source]
        source: mongodb::error::Error,
    },
    #[error("writing to collection `{collection}` after {} applied operations: {source}", .partial.matched + .partial.upserted)]
    Write {
        collection: String,
        /// Tallies for the operations that did succeed before the failure.
        partial: UpsertOutcome,
        #[source]
        source: mongodb::error::Error,
    },
    #[error("document store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Tallies of operations that were applied before the error surfaced.
    pub fn partial_outcome(&self) -> UpsertOutcome {
        match self {
            StoreError::Write { partial, .. } => *partial,
            _ => UpsertOutcome::default(),
        }
    }
}

/// The two operations the sync core needs from a document store.
///
/// Implementations own their connection lifecycle; the contract is one
/// logical connection per call, torn down before the call returns.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Document>, StoreError>;

    /// Apply the batch in order. Atomic per document only: a mid-batch
    /// failure must still report tallies for the operations that succeeded
    /// (see [`StoreError::Write`]).
    async fn bulk_upsert(
        &self,
        collection: &str,
        ops: Vec<UpsertOp>,
    ) -> Result<UpsertOutcome, StoreError>;
}

/// MongoDB-backed store. Connects (and pings, to fail fast on an unreachable
/// server) inside every call and drops the client afterwards, so no
/// connection outlives a logical operation.
#[derive(Debug, Clone)]
pub struct MongoStore {
    uri: String,
    database: String,
}

impl MongoStore {
    pub fn new(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: database.into(),
        }
    }

    async fn connect(&self) -> Result<Client, StoreError> {
        let client = Client::with_uri_str(&self.uri)
            .await
            .map_err(StoreError::Connect)?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(StoreError::Connect)?;
        Ok(client)
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let client = self.connect().await?;
        let coll = client
            .database(&self.database)
            .collection::<Document>(collection);

        let cursor = coll.find(doc! {}).await.map_err(|source| StoreError::Read {
            collection: collection.to_string(),
            source,
        })?;
        let docs: Vec<Document> =
            cursor
                .try_collect()
                .await
                .map_err(|source| StoreError::Read {
                    collection: collection.to_string(),
                    source,
                })?;

        debug!(collection, count = docs.len(), "fetched documents");
        Ok(docs)
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        ops: Vec<UpsertOp>,
    ) -> Result<UpsertOutcome, StoreError> {
        let client = self.connect().await?;
        let coll = client
            .database(&self.database)
            .collection::<Document>(collection);

        let mut outcome = UpsertOutcome::default();
        for op in ops {
            let result = coll
                .update_one(op.filter, doc! { "$set": op.set })
                .upsert(true)
                .await
                .map_err(|source| StoreError::Write {
                    collection: collection.to_string(),
                    partial: outcome,
                    source,
                })?;
            outcome.absorb(UpsertOutcome {
                matched: result.matched_count,
                modified: result.modified_count,
                upserted: u64::from(result.upserted_id.is_some()),
            });
        }

        debug!(
            collection,
            matched = outcome.matched,
            modified = outcome.modified,
            upserted = outcome.upserted,
            "bulk upsert applied"
        );
        Ok(outcome)
    }
}

/// In-memory store used by tests and local dry runs. Matches filters by
/// exact field equality, which covers every key shape the pipeline writes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<BTreeMap<String, Vec<Document>>>,
    calls: AtomicUsize,
    offline: AtomicBool,
    fail_after: Mutex<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of store operations attempted so far, successful or not.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail as if the server were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next `bulk_upsert` fail after applying `applied` operations,
    /// reporting the tallies of the ones that went through.
    pub fn fail_after(&self, applied: usize) {
        *self.fail_after.lock().expect("store lock") = Some(applied);
    }

    /// Seed a collection directly, bypassing upsert semantics.
    pub fn insert_raw(&self, collection: &str, docs: Vec<Document>) {
        let mut collections = self.collections.lock().expect("store lock");
        collections
            .entry(collection.to_string())
            .or_default()
            .extend(docs);
    }

    pub fn dump(&self, collection: &str) -> Vec<Document> {
        let collections = self.collections.lock().expect("store lock");
        collections.get(collection).cloned().unwrap_or_default()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(
                "memory store marked offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, expected)| match doc.get(key) {
        Some(actual) => actual == expected,
        // An absent field matches an explicit null filter, as it does in
        // MongoDB equality matching.
        None => expected == &Bson::Null,
    })
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        self.check_online()?;
        Ok(self.dump(collection))
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        ops: Vec<UpsertOp>,
    ) -> Result<UpsertOutcome, StoreError> {
        self.check_online()?;

        let budget = self.fail_after.lock().expect("store lock").take();
        let mut collections = self.collections.lock().expect("store lock");
        let docs = collections.entry(collection.to_string()).or_default();

        let mut outcome = UpsertOutcome::default();
        let mut applied = 0;
        for op in ops {
            if budget == Some(applied) {
                return Err(StoreError::Write {
                    collection: collection.to_string(),
                    partial: outcome,
                    source: mongodb::error::Error::custom("write rejected by fail switch"),
                });
            }
            applied += 1;
            match docs.iter_mut().find(|doc| matches_filter(doc, &op.filter)) {
                Some(existing) => {
                    outcome.matched += 1;
                    let mut changed = false;
                    for (key, value) in op.set {
                        if existing.get(&key) != Some(&value) {
                            changed = true;
                        }
                        existing.insert(key, value);
                    }
                    if changed {
                        outcome.modified += 1;
                    }
                }
                None => {
                    let mut inserted = op.filter.clone();
                    for (key, value) in op.set {
                        inserted.insert(key, value);
                    }
                    docs.push(inserted);
                    outcome.upserted += 1;
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(id: &str, name: &str) -> UpsertOp {
        UpsertOp {
            filter: doc! { "id": id },
            set: doc! { "id": id, "name": name },
        }
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates_by_key() {
        let store = MemoryStore::new();

        let first = store
            .bulk_upsert("leads", vec![op("1", "Ada"), op("2", "Grace")])
            .await
            .expect("first batch");
        assert_eq!(first.upserted, 2);
        assert_eq!(first.matched, 0);

        let second = store
            .bulk_upsert("leads", vec![op("1", "Ada"), op("2", "Grace Hopper")])
            .await
            .expect("second batch");
        assert_eq!(second.upserted, 0);
        assert_eq!(second.matched, 2);
        assert_eq!(second.modified, 1);

        assert_eq!(store.dump("leads").len(), 2);
    }

    #[tokio::test]
    async fn null_filter_matches_absent_and_null_fields() {
        let store = MemoryStore::new();
        store.insert_raw("total_deals", vec![doc! { "total": 1 }]);

        let outcome = store
            .bulk_upsert(
                "total_deals",
                vec![UpsertOp {
                    filter: doc! { "id": Bson::Null },
                    set: doc! { "id": Bson::Null, "total": 2 },
                }],
            )
            .await
            .expect("upsert");
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.modified, 1);
        assert_eq!(store.dump("total_deals").len(), 1);
    }

    #[tokio::test]
    async fn mid_batch_failure_reports_tallies_of_applied_operations() {
        let store = MemoryStore::new();
        store.insert_raw("leads", vec![doc! { "id": "1", "name": "Ada" }]);
        store.fail_after(2);

        let err = store
            .bulk_upsert(
                "leads",
                vec![op("1", "Ada Lovelace"), op("2", "Grace"), op("3", "Edith")],
            )
            .await
            .expect_err("third op must fail");

        let partial = err.partial_outcome();
        assert_eq!(partial.matched, 1);
        assert_eq!(partial.modified, 1);
        assert_eq!(partial.upserted, 1);
        // The two applied operations are visible; the rejected one is not.
        assert_eq!(store.dump("leads").len(), 2);
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = MemoryStore::new();
        store.set_offline(true);

        let err = store.fetch_all("leads").await.expect_err("offline read");
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(err.partial_outcome().is_zero());
        assert_eq!(store.call_count(), 1);
    }
}
