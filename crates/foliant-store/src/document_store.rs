use foliant_domain::Result;
use serde_json::Value;

/// A write operation against the document store, fire-and-forget or
/// awaited depending on which trait method dispatches it.
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub collection: String,
    pub filter: Value,
    pub create: Value,
    pub update: Value,
}

impl WriteOp {
    pub fn upsert(collection: impl Into<String>, filter: Value, create: Value, update: Value) -> Self {
        Self {
            collection: collection.into(),
            filter,
            create,
            update,
        }
    }
}

/// One row returned by `Query`.
pub type Row = Value;

/// The external document-store collaborator. Collections are referenced
/// by name only (`Book`, `Page`, `OcrResult`, `ToC`, `TocEntry`,
/// `AgentRun`, `Prompt`, `BookPromptOverride`); the core never assumes a
/// specific query engine beyond GraphQL-style filter syntax.
///
/// The core depends only on this trait — a real client (e.g. a GraphQL
/// HTTP client against an external store) lives outside this crate.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Run a GraphQL-style query, returning raw rows.
    async fn query(&self, graphql: &str) -> Result<Vec<Row>>;

    /// Upsert by filter; fire-and-forget semantics left to the caller.
    async fn upsert(&self, op: WriteOp) -> Result<()>;

    /// Fire-and-forget write; the caller does not wait for a doc id.
    fn send(&self, op: WriteOp);

    /// Write and wait for the created/updated document id.
    async fn send_sync(&self, op: WriteOp) -> Result<String>;

    /// Batch write-and-wait, returning one doc id per input op in order.
    async fn send_many_sync(&self, ops: Vec<WriteOp>) -> Result<Vec<String>>;
}
