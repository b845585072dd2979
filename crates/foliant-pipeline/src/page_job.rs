//! One page's `extract → OCR → blend → label` pipeline, as a single
//! `Job`. Each stage is guarded by an `OperationState` with its own
//! bounded retry count; a transient pool failure re-emits the same
//! stage's work unit with an incremented retry counter, while repeated
//! permanent/exhausted failure marks that stage terminally failed and
//! the page moves on — one stage's exhaustion never blocks the others.

use std::collections::HashMap;

use foliant_domain::config::RetryConfig;
use foliant_domain::{
    ChatRequest, CpuRequest, Error, MetricsTag, OcrRequest, OperationState, Result, WorkRequest, WorkResult, WorkUnit,
};
use foliant_scheduler::{Job, JobContext, ProgressCount};
use foliant_store::{WriteOp, JOB_COLLECTION};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Stage {
    Extract,
    Ocr,
    Blend,
    Label,
}

const STAGES: [Stage; 4] = [Stage::Extract, Stage::Ocr, Stage::Blend, Stage::Label];

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Ocr => "ocr",
            Stage::Blend => "blend",
            Stage::Label => "label",
        }
    }
}

pub struct PageJob {
    id: String,
    record_id: Option<String>,
    book_id: String,
    page_number: u32,
    image_bytes: Vec<u8>,
    cpu_pool: String,
    ocr_pool: String,
    llm_pool: String,
    states: HashMap<Stage, OperationState>,
    retries: HashMap<Stage, u32>,
    results: HashMap<Stage, Value>,
    /// Work-unit id of the currently in-flight stage, if any.
    inflight: Option<(Stage, Uuid)>,
}

impl PageJob {
    pub fn new(
        book_id: impl Into<String>,
        page_number: u32,
        image_bytes: Vec<u8>,
        cpu_pool: impl Into<String>,
        ocr_pool: impl Into<String>,
        llm_pool: impl Into<String>,
    ) -> Self {
        let book_id = book_id.into();
        let id = format!("page:{book_id}:{page_number}");
        Self {
            id,
            record_id: None,
            book_id,
            page_number,
            image_bytes,
            cpu_pool: cpu_pool.into(),
            ocr_pool: ocr_pool.into(),
            llm_pool: llm_pool.into(),
            states: STAGES.iter().map(|s| (*s, OperationState::new())).collect(),
            retries: HashMap::new(),
            results: HashMap::new(),
            inflight: None,
        }
    }

    fn metrics(&self, stage: Stage) -> MetricsTag {
        MetricsTag {
            book_id: Some(self.book_id.clone()),
            stage: Some(stage.name().to_string()),
            item_key: Some(self.page_number.to_string()),
            prompt_key: None,
            prompt_cid: None,
        }
    }

    fn build_unit(&self, stage: Stage) -> WorkUnit {
        let retry = self.retries.get(&stage).copied().unwrap_or(0);
        let (provider, request) = match stage {
            Stage::Extract => (
                self.cpu_pool.clone(),
                WorkRequest::Cpu(CpuRequest {
                    task_tag: "extract".to_string(),
                    payload: serde_json::json!({ "page_number": self.page_number }),
                }),
            ),
            Stage::Ocr => (
                self.ocr_pool.clone(),
                WorkRequest::Ocr(OcrRequest {
                    image_bytes: self.image_bytes.clone(),
                    page_number: self.page_number,
                }),
            ),
            Stage::Blend => {
                let extracted = self.results.get(&Stage::Extract).cloned().unwrap_or(Value::Null);
                let ocr_text = self
                    .results
                    .get(&Stage::Ocr)
                    .and_then(|v| v.get("text"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                (
                    self.llm_pool.clone(),
                    WorkRequest::Chat(ChatRequest {
                        model: "default".to_string(),
                        messages: vec![
                            foliant_domain::Message::system("Blend extracted layout with OCR text."),
                            foliant_domain::Message::user(format!(
                                "extracted={extracted} ocr_text={ocr_text}"
                            )),
                        ],
                        tools: Vec::new(),
                        response_format: None,
                        temperature: None,
                        max_tokens: None,
                    }),
                )
            }
            Stage::Label => {
                let blended = self.results.get(&Stage::Blend).cloned().unwrap_or(Value::Null);
                (
                    self.llm_pool.clone(),
                    WorkRequest::Chat(ChatRequest {
                        model: "default".to_string(),
                        messages: vec![
                            foliant_domain::Message::system("Label the content type of this page."),
                            foliant_domain::Message::user(format!("blended={blended}")),
                        ],
                        tools: Vec::new(),
                        response_format: None,
                        temperature: None,
                        max_tokens: None,
                    }),
                )
            }
        };

        WorkUnit {
            id: Uuid::new_v4(),
            job_id: self.id.clone(),
            provider,
            request,
            metrics: self.metrics(stage),
            retry,
        }
    }

    /// Find the earliest non-terminal stage and start it, or `None` if
    /// every stage has reached a terminal sub-state.
    fn emit_next(&mut self) -> Vec<WorkUnit> {
        for stage in STAGES {
            let state = self.states.get_mut(&stage).expect("all stages present");
            if state.is_terminal() {
                continue;
            }
            if state.can_start() {
                state.start();
            }
            let unit = self.build_unit(stage);
            self.inflight = Some((stage, unit.id));
            return vec![unit];
        }
        Vec::new()
    }

    fn store_result(&mut self, stage: Stage, payload: &foliant_domain::WorkPayload) {
        let value = match payload {
            foliant_domain::WorkPayload::Cpu(c) => c.payload.clone(),
            foliant_domain::WorkPayload::Ocr(o) => serde_json::json!({ "text": o.text, "confidence": o.confidence }),
            foliant_domain::WorkPayload::Chat(c) => serde_json::json!({ "content": c.content }),
        };
        self.results.insert(stage, value);
    }

    /// Serialize `states`/`retries`/`results`/`image_bytes` into the
    /// opaque `bookkeeping` blob `JobRecord` carries, so a crash-resumed
    /// job (built fresh by `factory` with no image bytes of its own) can
    /// reconstruct exactly where it left off.
    fn bookkeeping_value(&self) -> Value {
        let states: serde_json::Map<String, Value> = STAGES
            .iter()
            .map(|s| (s.name().to_string(), serde_json::to_value(self.states[s]).unwrap_or(Value::Null)))
            .collect();
        let retries: serde_json::Map<String, Value> = STAGES
            .iter()
            .map(|s| (s.name().to_string(), Value::from(self.retries.get(s).copied().unwrap_or(0))))
            .collect();
        let results: serde_json::Map<String, Value> = STAGES
            .iter()
            .filter_map(|s| self.results.get(s).map(|v| (s.name().to_string(), v.clone())))
            .collect();
        serde_json::json!({
            "states": states,
            "retries": retries,
            "results": results,
            "image_bytes": self.image_bytes,
        })
    }

    fn apply_bookkeeping(&mut self, value: &Value) {
        if let Some(states) = value.get("states").and_then(|v| v.as_object()) {
            for stage in STAGES {
                if let Some(s) = states
                    .get(stage.name())
                    .and_then(|v| serde_json::from_value::<OperationState>(v.clone()).ok())
                {
                    self.states.insert(stage, s);
                }
            }
        }
        if let Some(retries) = value.get("retries").and_then(|v| v.as_object()) {
            for stage in STAGES {
                if let Some(r) = retries.get(stage.name()).and_then(|v| v.as_u64()) {
                    self.retries.insert(stage, r as u32);
                }
            }
        }
        if let Some(results) = value.get("results").and_then(|v| v.as_object()) {
            for stage in STAGES {
                if let Some(r) = results.get(stage.name()) {
                    self.results.insert(stage, r.clone());
                }
            }
        }
        if let Some(bytes) = value
            .get("image_bytes")
            .and_then(|v| serde_json::from_value::<Vec<u8>>(v.clone()).ok())
        {
            if !bytes.is_empty() {
                self.image_bytes = bytes;
            }
        }
    }

    /// Load this job's prior bookkeeping from its own `JobRecord`, if any
    /// exists yet (a fresh submission has none). No-op if `record_id`
    /// hasn't been assigned.
    async fn load_bookkeeping(&mut self, ctx: &JobContext) -> Result<()> {
        let Some(record_id) = self.record_id.clone() else {
            return Ok(());
        };
        let rows = ctx
            .store
            .query("{ jobs { record_id bookkeeping } }")
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        for row in rows {
            if row.get("record_id").and_then(|v| v.as_str()) == Some(record_id.as_str()) {
                if let Some(bookkeeping) = row.get("bookkeeping") {
                    if !bookkeeping.is_null() {
                        self.apply_bookkeeping(bookkeeping);
                    }
                }
                break;
            }
        }
        Ok(())
    }

    /// Any stage found `InProgress` after loading prior bookkeeping was
    /// running when the process that owned it died; treat it as crashed.
    fn recover_crashed_stages(&mut self, max_retries: u32) {
        for stage in STAGES {
            let state = self.states.get_mut(&stage).expect("all stages present");
            if matches!(state.status, foliant_domain::OpStatus::InProgress) {
                state.recover_from_crash(max_retries);
                self.retries.insert(stage, state.retries);
            }
        }
    }

    async fn persist_bookkeeping(&self, ctx: &JobContext) -> Result<()> {
        let Some(record_id) = &self.record_id else {
            return Ok(());
        };
        let bookkeeping = self.bookkeeping_value();
        ctx.store
            .upsert(WriteOp::upsert(
                JOB_COLLECTION,
                serde_json::json!({ "record_id": record_id }),
                serde_json::json!({ "record_id": record_id, "bookkeeping": bookkeeping.clone() }),
                serde_json::json!({ "bookkeeping": bookkeeping }),
            ))
            .await
            .map_err(|e| Error::Persistence(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Job for PageJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_record_id(&mut self, record_id: String) {
        self.record_id = Some(record_id);
    }

    fn record_id(&self) -> Option<&str> {
        self.record_id.as_deref()
    }

    fn job_type(&self) -> &str {
        "page"
    }

    async fn start(&mut self, ctx: &JobContext) -> Result<Vec<WorkUnit>> {
        self.load_bookkeeping(ctx).await?;
        self.recover_crashed_stages(ctx.retry.max_retries);
        self.persist_bookkeeping(ctx).await?;
        let units = self.emit_next();
        self.persist_bookkeeping(ctx).await?;
        Ok(units)
    }

    async fn on_complete(&mut self, ctx: &JobContext, result: WorkResult) -> Result<Vec<WorkUnit>> {
        let Some((stage, expected)) = self.inflight else {
            return Err(Error::Programmer(format!("page job {} has no in-flight stage", self.id)));
        };
        if result.work_unit_id != expected {
            return Err(Error::Programmer(format!(
                "page job {} received a result for an unexpected work unit",
                self.id
            )));
        }
        self.inflight = None;

        let RetryConfig { max_retries } = ctx.retry;

        if result.success {
            if let Some(payload) = &result.payload {
                self.store_result(stage, payload);
            }
            let state = self.states.get_mut(&stage).expect("all stages present");
            state.complete();
        } else if result.is_retryable_failure() {
            let state = self.states.get_mut(&stage).expect("all stages present");
            let permanently_failed = state.fail(max_retries);
            if !permanently_failed {
                *self.retries.entry(stage).or_insert(0) += 1;
            }
        } else {
            // Permanent failure: jumps straight to `Failed` regardless of
            // remaining retry budget.
            let state = self.states.get_mut(&stage).expect("all stages present");
            state.fail(0);
        }

        let units = self.emit_next();
        self.persist_bookkeeping(ctx).await?;
        Ok(units)
    }

    fn done(&self) -> bool {
        self.states.values().all(|s| s.is_terminal())
    }

    fn succeeded(&self) -> bool {
        self.states.values().all(|s| matches!(s.status, foliant_domain::OpStatus::Complete))
    }

    fn progress(&self) -> HashMap<String, ProgressCount> {
        let completed = self.states.values().filter(|s| s.is_terminal()).count() as u32;
        let mut progress = HashMap::new();
        progress.insert(
            self.id.clone(),
            ProgressCount {
                expected: STAGES.len() as u32,
                completed,
            },
        );
        progress
    }

    fn status(&self) -> HashMap<String, String> {
        let mut status = HashMap::new();
        status.insert("book_id".to_string(), self.book_id.clone());
        status.insert("page_number".to_string(), self.page_number.to_string());
        for stage in STAGES {
            status.insert(stage.name().to_string(), format!("{:?}", self.states[&stage].status));
        }
        status
    }

    fn metrics_tag(&self) -> MetricsTag {
        self.metrics(Stage::Extract)
    }
}

/// Builds a skeleton `PageJob` from its own id (`key` is either the bare
/// `book_id:page_number` or the full `page:book_id:page_number`, as
/// `Scheduler::resume` passes `JobRecord.key` straight through). The
/// skeleton has no image bytes of its own; `start` restores them from
/// `bookkeeping` before emitting any work.
pub fn factory(cpu_pool: String, ocr_pool: String, llm_pool: String) -> foliant_scheduler::JobFactory {
    std::sync::Arc::new(move |_record_id: String, key: Value| {
        let raw = key.as_str().unwrap_or_default();
        let stripped = raw.strip_prefix("page:").unwrap_or(raw);
        let (book_id, page_number) = stripped
            .rsplit_once(':')
            .map(|(b, p)| (b.to_string(), p.parse::<u32>().unwrap_or(0)))
            .unwrap_or_else(|| (stripped.to_string(), 0));
        Box::new(PageJob::new(book_id, page_number, Vec::new(), cpu_pool.clone(), ocr_pool.clone(), llm_pool.clone()))
            as Box<dyn Job>
    })
}

#[cfg(test)]
mod tests {
    use foliant_domain::{CpuResult, OcrResult, OpStatus};

    use super::*;

    fn ctx() -> JobContext {
        JobContext {
            store: std::sync::Arc::new(foliant_store::InMemoryDocumentStore::default()),
            metrics: std::sync::Arc::new(foliant_scheduler::NoopMetricsSink),
            retry: RetryConfig { max_retries: 3 },
            cancel: foliant_scheduler::CancelToken::new(),
            scheduler: std::sync::Weak::new(),
        }
    }

    #[tokio::test]
    async fn start_emits_extract_first() {
        let mut job = PageJob::new("book-1", 1, vec![1, 2, 3], "cpu", "ocr", "llm");
        let units = job.start(&ctx()).await.unwrap();
        assert_eq!(units.len(), 1);
        assert!(matches!(units[0].request, WorkRequest::Cpu(_)));
    }

    #[tokio::test]
    async fn stages_run_in_order_and_job_succeeds() {
        let mut job = PageJob::new("book-1", 1, vec![1, 2, 3], "cpu", "ocr", "llm");
        let c = ctx();

        let extract = job.start(&c).await.unwrap().remove(0);
        let next = job
            .on_complete(
                &c,
                WorkResult::ok(
                    extract.id,
                    foliant_domain::WorkPayload::Cpu(CpuResult {
                        payload: serde_json::json!({ "layout": "two-column" }),
                    }),
                    foliant_domain::UsageInfo::default(),
                ),
            )
            .await
            .unwrap();
        let ocr = next[0].clone();
        assert!(matches!(ocr.request, WorkRequest::Ocr(_)));

        let next = job
            .on_complete(
                &c,
                WorkResult::ok(
                    ocr.id,
                    foliant_domain::WorkPayload::Ocr(OcrResult {
                        text: "hello".to_string(),
                        confidence: Some(0.9),
                    }),
                    foliant_domain::UsageInfo::default(),
                ),
            )
            .await
            .unwrap();
        let blend = next[0].clone();
        assert!(matches!(blend.request, WorkRequest::Chat(_)));

        let next = job
            .on_complete(
                &c,
                WorkResult::ok(
                    blend.id,
                    foliant_domain::WorkPayload::Chat(foliant_domain::ChatResult {
                        content: "blended".to_string(),
                        structured_output: None,
                        reasoning_details: None,
                        tool_calls: Vec::new(),
                    }),
                    foliant_domain::UsageInfo::default(),
                ),
            )
            .await
            .unwrap();
        let label = next[0].clone();
        assert!(matches!(label.request, WorkRequest::Chat(_)));

        let next = job
            .on_complete(
                &c,
                WorkResult::ok(
                    label.id,
                    foliant_domain::WorkPayload::Chat(foliant_domain::ChatResult {
                        content: "figure".to_string(),
                        structured_output: None,
                        reasoning_details: None,
                        tool_calls: Vec::new(),
                    }),
                    foliant_domain::UsageInfo::default(),
                ),
            )
            .await
            .unwrap();

        assert!(next.is_empty());
        assert!(job.done());
        assert!(job.succeeded());
    }

    #[tokio::test]
    async fn retryable_failure_re_emits_same_stage_with_incremented_retry() {
        let mut job = PageJob::new("book-1", 1, vec![1, 2, 3], "cpu", "ocr", "llm");
        let c = ctx();

        let extract = job.start(&c).await.unwrap().remove(0);
        assert_eq!(extract.retry, 0);
        let retried = job
            .on_complete(&c, WorkResult::err(extract.id, "transient: pool busy"))
            .await
            .unwrap();
        let reissued = retried[0].clone();
        assert!(matches!(reissued.request, WorkRequest::Cpu(_)));
        assert_eq!(reissued.retry, 1);
    }

    #[tokio::test]
    async fn permanent_failure_marks_stage_failed_and_moves_on() {
        let mut job = PageJob::new("book-1", 1, vec![1, 2, 3], "cpu", "ocr", "llm");
        let c = ctx();

        let extract = job.start(&c).await.unwrap().remove(0);
        let next = job
            .on_complete(&c, WorkResult::err(extract.id, "permanent: bad image"))
            .await
            .unwrap();
        assert!(matches!(next[0].request, WorkRequest::Ocr(_)));
        assert_eq!(job.states[&Stage::Extract].status, OpStatus::Failed);
        assert!(!job.done());
    }

    #[tokio::test]
    async fn mismatched_work_unit_id_is_rejected() {
        let mut job = PageJob::new("book-1", 1, vec![1, 2, 3], "cpu", "ocr", "llm");
        let c = ctx();
        job.start(&c).await.unwrap();
        let bogus = WorkResult::err(Uuid::new_v4(), "permanent: nope");
        assert!(job.on_complete(&c, bogus).await.is_err());
    }

    #[tokio::test]
    async fn resumed_job_recovers_in_progress_stage_from_bookkeeping() {
        let c = ctx();
        let mut original = PageJob::new("book-1", 2, vec![9, 9, 9], "cpu", "ocr", "llm");
        original.set_record_id("rec-1".to_string());
        original.start(&c).await.unwrap();
        assert_eq!(original.states[&Stage::Extract].status, OpStatus::InProgress);

        let factory = factory("cpu".to_string(), "ocr".to_string(), "llm".to_string());
        let mut resumed = factory("ignored-id".to_string(), Value::String("page:book-1:2".to_string()));
        resumed.set_record_id("rec-1".to_string());
        let units = resumed.start(&c).await.unwrap();

        assert_eq!(units.len(), 1);
        assert!(matches!(units[0].request, WorkRequest::Cpu(_)));
        assert_eq!(units[0].retry, 1);
    }
}
