//! The document-store collaborator trait, job/agent persistence record
//! shapes, and an in-memory test double.

pub mod document_store;
pub mod in_memory;
pub mod records;

pub use document_store::{DocumentStore, Row, WriteOp};
pub use in_memory::InMemoryDocumentStore;
pub use records::{
    agent_run_write_op, truncate, AgentRunRecord, AgentRunStatus, JobRecord, JobStatus, AGENT_RUN_COLLECTION,
    JOB_COLLECTION,
};
