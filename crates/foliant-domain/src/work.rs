use serde::{Deserialize, Serialize};

use crate::message::{Message, ToolDefinition};

/// Which pool a work unit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Llm,
    Ocr,
    Cpu,
}

/// A chat completion request, as sent to an `LlmProvider`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    /// JSON schema the response must conform to, if any.
    #[serde(default)]
    pub response_format: Option<serde_json::Value>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// An OCR request: one page image plus its page number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrRequest {
    pub image_bytes: Vec<u8>,
    pub page_number: u32,
}

/// A local CPU task request: an opaque tag plus an opaque payload. The
/// scheduler never interprets `task_tag`/`payload`; only the owning job
/// and pool implementation understand them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuRequest {
    pub task_tag: String,
    pub payload: serde_json::Value,
}

/// Per-work-unit metrics attribution, carried through to `WorkResult` so
/// the scheduler can stamp logs/metrics without the pool needing to know
/// about book/stage semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsTag {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_cid: Option<String>,
}

/// The exactly-one-of-three request payload a work unit carries. The
/// variant must match `WorkUnit::kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkRequest {
    Chat(ChatRequest),
    Ocr(OcrRequest),
    Cpu(CpuRequest),
}

impl WorkRequest {
    pub fn kind(&self) -> WorkKind {
        match self {
            WorkRequest::Chat(_) => WorkKind::Llm,
            WorkRequest::Ocr(_) => WorkKind::Ocr,
            WorkRequest::Cpu(_) => WorkKind::Cpu,
        }
    }
}

/// A single dispatchable operation: one model call, one OCR call, or one
/// local CPU task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: uuid::Uuid,
    pub job_id: String,
    /// Pool name this unit is routed to (e.g. "openai-gpt4o", "tesseract").
    pub provider: String,
    pub request: WorkRequest,
    #[serde(default)]
    pub metrics: MetricsTag,
    /// Retry attempt counter, incremented on each re-emission of an
    /// equivalent unit.
    #[serde(default)]
    pub retry: u32,
}

impl WorkUnit {
    pub fn kind(&self) -> WorkKind {
        self.request.kind()
    }
}

/// Token/latency/cost accounting a provider may report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageInfo {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResult {
    pub content: String,
    #[serde(default)]
    pub structured_output: Option<serde_json::Value>,
    #[serde(default)]
    pub reasoning_details: Option<serde_json::Value>,
    #[serde(default)]
    pub tool_calls: Vec<crate::message::ToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuResult {
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkPayload {
    Chat(ChatResult),
    Ocr(OcrResult),
    Cpu(CpuResult),
}

/// The outcome of dispatching one `WorkUnit` through a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkResult {
    pub work_unit_id: uuid::Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<WorkPayload>,
    #[serde(default)]
    pub usage: UsageInfo,
}

impl WorkResult {
    pub fn ok(work_unit_id: uuid::Uuid, payload: WorkPayload, usage: UsageInfo) -> Self {
        Self {
            work_unit_id,
            success: true,
            error: None,
            payload: Some(payload),
            usage,
        }
    }

    pub fn err(work_unit_id: uuid::Uuid, error: impl Into<String>) -> Self {
        Self {
            work_unit_id,
            success: false,
            error: Some(error.into()),
            payload: None,
            usage: UsageInfo::default(),
        }
    }

    /// Whether this failure should be retried, per the `retryable:`/
    /// `transient:` error-string prefix convention.
    pub fn is_retryable_failure(&self) -> bool {
        !self.success
            && self
                .error
                .as_deref()
                .map(|e| e.starts_with("retryable:") || e.starts_with("transient:"))
                .unwrap_or(false)
    }

    pub fn chat(&self) -> Option<&ChatResult> {
        match &self.payload {
            Some(WorkPayload::Chat(c)) => Some(c),
            _ => None,
        }
    }

    pub fn ocr(&self) -> Option<&OcrResult> {
        match &self.payload {
            Some(WorkPayload::Ocr(o)) => Some(o),
            _ => None,
        }
    }

    pub fn cpu(&self) -> Option<&CpuResult> {
        match &self.payload {
            Some(WorkPayload::Cpu(c)) => Some(c),
            _ => None,
        }
    }
}
