//! In-process test doubles for the provider traits. Not behind `#[cfg(test)]`
//! so downstream crates (`foliant-scheduler`, `foliant-pipeline`) can use
//! them in their own test suites without re-implementing mocks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use foliant_domain::{ChatRequest, ChatResult, CpuRequest, CpuResult, OcrRequest, OcrResult};

use crate::traits::{CpuExecutor, LlmProvider, OcrProvider, ProviderResult};

/// Scripted chat responses, returned in order. Panics if exhausted.
pub struct MockLlmProvider {
    name: String,
    responses: Mutex<Vec<ProviderResult<ChatResult>>>,
    calls: AtomicUsize,
}

impl MockLlmProvider {
    pub fn new(name: impl Into<String>, responses: Vec<ProviderResult<ChatResult>>) -> Self {
        Self {
            name: name.into(),
            responses: Mutex::new(responses),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockLlmProvider {
    async fn chat(&self, _req: &ChatRequest) -> ProviderResult<ChatResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err("permanent: mock exhausted".to_string());
        }
        responses.remove(0)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Always recognizes pages as a fixed string, for pipeline tests.
pub struct MockOcrProvider {
    name: String,
    text: String,
}

impl MockOcrProvider {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

#[async_trait::async_trait]
impl OcrProvider for MockOcrProvider {
    async fn recognize(&self, req: &OcrRequest) -> ProviderResult<OcrResult> {
        Ok(OcrResult {
            text: format!("{} (page {})", self.text, req.page_number),
            confidence: Some(0.99),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Echoes the request payload back as the result, for pipeline tests.
pub struct MockCpuExecutor {
    name: String,
}

impl MockCpuExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait::async_trait]
impl CpuExecutor for MockCpuExecutor {
    async fn execute(&self, req: &CpuRequest) -> ProviderResult<CpuResult> {
        Ok(CpuResult {
            payload: req.payload.clone(),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
