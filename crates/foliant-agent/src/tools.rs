use foliant_domain::ToolDefinition;
use serde_json::Value;

/// The capability object an `Agent` is polymorphic over.
///
/// Implementations own whatever local state a tool-using task needs (a
/// book's ToC candidates, a page cursor, etc.) and decide when the
/// conversation is finished.
#[async_trait::async_trait]
pub trait Tools: Send + Sync {
    /// OpenAI-style function schemas offered to the model.
    fn schema(&self) -> Vec<ToolDefinition>;

    /// Execute one tool call. Returns a JSON string (never raw bytes) or
    /// an error string. A tool with nothing to report must still return
    /// a syntactically valid JSON string (`"{}"` is acceptable).
    async fn execute(&self, name: &str, args: Value) -> Result<String, String>;

    /// Whether the task this agent is driving is finished.
    fn is_complete(&self) -> bool;

    /// Vision attachments for the *next* LLM call only. Never persisted
    /// into conversation history.
    fn images(&self) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// The opaque outcome, valid once `is_complete()` is true.
    fn result(&self) -> Value {
        Value::Null
    }
}
