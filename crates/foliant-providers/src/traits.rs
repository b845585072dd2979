use foliant_domain::{ChatRequest, ChatResult, CpuRequest, CpuResult, OcrRequest, OcrResult};

/// Result type providers return. Providers classify their own failures as
/// transient/permanent by prefixing the error string with `"retryable:"`
/// or `"permanent:"`; the pool does not otherwise interpret provider
/// errors.
pub type ProviderResult<T> = std::result::Result<T, String>;

/// Trait every LLM adapter implements. The core never ships a concrete
/// implementation beyond test mocks — a real HTTP client is an external
/// collaborator.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> ProviderResult<ChatResult>;

    /// A unique identifier, used for pool naming/logging.
    fn name(&self) -> &str;
}

/// Trait every OCR adapter implements.
#[async_trait::async_trait]
pub trait OcrProvider: Send + Sync {
    async fn recognize(&self, req: &OcrRequest) -> ProviderResult<OcrResult>;

    fn name(&self) -> &str;
}

/// Trait every local CPU executor implements (e.g. image preprocessing,
/// layout analysis — concrete implementations live outside this crate).
#[async_trait::async_trait]
pub trait CpuExecutor: Send + Sync {
    async fn execute(&self, req: &CpuRequest) -> ProviderResult<CpuResult>;

    fn name(&self) -> &str;
}
