use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document_store::WriteOp;

/// Collection name job records are upserted into.
pub const JOB_COLLECTION: &str = "jobs";

/// Collection name agent observability records are upserted into.
pub const AGENT_RUN_COLLECTION: &str = "AgentRun";

/// Lifecycle status of a persisted job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

/// The persisted record of one job instance.
///
/// `bookkeeping` is opaque to the store and scheduler: it holds whatever
/// job-type-specific state (operation states, related-record doc ids,
/// agent state exports) the job needs to resume, serialized as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub record_id: String,
    pub job_type: String,
    pub status: JobStatus,
    /// The book id (or other natural key) this job operates on.
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub bookkeeping: serde_json::Value,
}

impl JobRecord {
    pub fn new(record_id: impl Into<String>, job_type: impl Into<String>, key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            record_id: record_id.into(),
            job_type: job_type.into(),
            status: JobStatus::Pending,
            key: key.into(),
            created_at: now,
            updated_at: now,
            bookkeeping: serde_json::Value::Null,
        }
    }
}

/// Status of a persisted agent observability record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Running,
    Completed,
    Failed,
}

/// Observability record for one agent conversation, persisted to the
/// document store's `AgentRun` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunRecord {
    pub agent_id: String,
    pub agent_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_id: Option<String>,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub iterations: u32,
    pub status: AgentRunStatus,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Truncated (~1KB/message) JSON-encoded transcript.
    pub messages_json: String,
    pub tool_calls_json: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_json: Option<String>,
}

/// Build the upsert-by-`agent_id` write op for one `AgentRunRecord`.
/// Repeated calls for the same `agent_id` merge into a single document,
/// so callers can upsert the same record at creation and again at
/// completion without tracking the store-assigned doc id in between.
pub fn agent_run_write_op(record: &AgentRunRecord) -> serde_json::Result<WriteOp> {
    let value = serde_json::to_value(record)?;
    let filter = serde_json::json!({ "agent_id": record.agent_id });
    Ok(WriteOp::upsert(AGENT_RUN_COLLECTION, filter, value.clone(), value))
}

/// Truncate a string at a byte boundary close to `max_len`, preserving
/// UTF-8 validity, for capping transcript previews.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_short_string_unchanged() {
        assert_eq!(truncate("hello", 100), "hello");
    }

    #[test]
    fn truncate_long_string_is_capped() {
        let long = "a".repeat(2000);
        let t = truncate(&long, 1024);
        assert!(t.len() <= 1024 + 3);
        assert!(t.ends_with("..."));
    }
}
