//! Shared types for the foliant document-pipeline scheduler and agent
//! runtime: work units, results, messages, operation state, and the
//! workspace-wide error/config types.

pub mod config;
pub mod error;
pub mod message;
pub mod operation_state;
pub mod work;

pub use error::{Error, Result};
pub use message::{Message, Role, ToolCall, ToolDefinition};
pub use operation_state::{OpStatus, OperationState};
pub use work::{
    ChatRequest, ChatResult, CpuRequest, CpuResult, MetricsTag, OcrRequest, OcrResult, UsageInfo,
    WorkKind, WorkPayload, WorkRequest, WorkResult, WorkUnit,
};
