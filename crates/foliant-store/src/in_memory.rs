use std::collections::HashMap;

use foliant_domain::Result;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::document_store::{DocumentStore, Row, WriteOp};

/// In-memory `DocumentStore` test double: collections are plain
/// `RwLock<HashMap<...>>` buckets of JSON documents, keyed by collection
/// name, with no file persistence of its own. Embedders needing
/// durability provide their own `DocumentStore`.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/introspection helper: all documents currently in a collection.
    pub fn dump(&self, collection: &str) -> Vec<Value> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    fn matches(doc: &Value, filter: &Value) -> bool {
        let (Value::Object(doc), Value::Object(filter)) = (doc, filter) else {
            return filter.is_null();
        };
        filter.iter().all(|(k, v)| doc.get(k) == Some(v))
    }

    fn merge(doc: &mut Value, update: &Value) {
        if let (Value::Object(doc), Value::Object(update)) = (doc, update) {
            for (k, v) in update {
                doc.insert(k.clone(), v.clone());
            }
        }
    }

    fn apply(&self, op: &WriteOp) -> String {
        let mut collections = self.collections.write();
        let docs = collections.entry(op.collection.clone()).or_default();

        if let Some(existing) = docs.iter_mut().find(|d| Self::matches(d, &op.filter)) {
            Self::merge(existing, &op.update);
            existing
                .get("_id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_default()
        } else {
            let id = Uuid::new_v4().to_string();
            let mut created = op.create.clone();
            if let Value::Object(map) = &mut created {
                map.insert("_id".to_string(), Value::String(id.clone()));
            }
            docs.push(created);
            id
        }
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn query(&self, _graphql: &str) -> Result<Vec<Row>> {
        // A real client would parse `_graphql` and filter server-side;
        // the in-memory double returns every document across every
        // collection, which is sufficient for exercising job resume in
        // tests without a query-language dependency.
        let collections = self.collections.read();
        Ok(collections.values().flatten().cloned().collect())
    }

    async fn upsert(&self, op: WriteOp) -> Result<()> {
        self.apply(&op);
        Ok(())
    }

    fn send(&self, op: WriteOp) {
        self.apply(&op);
    }

    async fn send_sync(&self, op: WriteOp) -> Result<String> {
        Ok(self.apply(&op))
    }

    async fn send_many_sync(&self, ops: Vec<WriteOp>) -> Result<Vec<String>> {
        Ok(ops.iter().map(|op| self.apply(op)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let store = InMemoryDocumentStore::new();
        let id1 = store
            .send_sync(WriteOp::upsert(
                "Book",
                json!({"title": "Moby Dick"}),
                json!({"title": "Moby Dick", "pages": 0}),
                json!({"pages": 0}),
            ))
            .await
            .unwrap();

        let id2 = store
            .send_sync(WriteOp::upsert(
                "Book",
                json!({"title": "Moby Dick"}),
                json!({"title": "Moby Dick"}),
                json!({"pages": 135}),
            ))
            .await
            .unwrap();

        assert_eq!(id1, id2);
        let docs = store.dump("Book");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["pages"], json!(135));
    }

    #[tokio::test]
    async fn query_returns_all_documents() {
        let store = InMemoryDocumentStore::new();
        store.send(WriteOp::upsert(
            "Page",
            json!({"n": 1}),
            json!({"n": 1}),
            json!({}),
        ));
        let rows = store.query("{ pages { n } }").await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
