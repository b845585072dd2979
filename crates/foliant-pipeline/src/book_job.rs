//! A book's sequential chain of scoped stages — metadata extraction, ToC
//! discovery, ToC extraction, ToC linking, ToC finalization — as one
//! `Job`. ToC discovery is driven by a multi-turn tool-using agent rather
//! than a single request/response exchange; every other stage is a
//! single work unit.
//!
//! Finalization, on success, chains into a `build_structure` job via the
//! scheduler handle carried on `JobContext` rather than returning another
//! work unit of its own — that follow-up job runs under its own id and
//! its own record, not as one more stage of this one.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use foliant_domain::config::RetryConfig;
use foliant_domain::{
    ChatRequest, CpuRequest, Error, Message, MetricsTag, OperationState, Result, WorkRequest, WorkResult, WorkUnit,
};
use foliant_scheduler::{Job, JobContext, ProgressCount};
use foliant_store::{agent_run_write_op, AgentRunRecord, AgentRunStatus, WriteOp, JOB_COLLECTION};
use serde_json::Value;
use uuid::Uuid;

use crate::toc_finder::TocFinderTools;
use foliant_agent::{Agent, AgentWorkUnit, Tools};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Stage {
    Metadata,
    TocFinder,
    TocExtract,
    TocLink,
    TocFinalize,
}

const STAGES: [Stage; 5] = [
    Stage::Metadata,
    Stage::TocFinder,
    Stage::TocExtract,
    Stage::TocLink,
    Stage::TocFinalize,
];

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Metadata => "metadata",
            Stage::TocFinder => "toc_finder",
            Stage::TocExtract => "toc_extract",
            Stage::TocLink => "toc_link",
            Stage::TocFinalize => "toc_finalize",
        }
    }
}

pub struct BookJob {
    id: String,
    record_id: Option<String>,
    book_id: String,
    cpu_pool: String,
    llm_pool: String,
    states: HashMap<Stage, OperationState>,
    retries: HashMap<Stage, u32>,
    results: HashMap<Stage, Value>,
    inflight: Option<(Stage, Uuid)>,
    toc_agent: Option<Agent<TocFinderTools>>,
    toc_agent_started_at: Option<DateTime<Utc>>,
    structure_submitted: bool,
}

impl BookJob {
    pub fn new(book_id: impl Into<String>, cpu_pool: impl Into<String>, llm_pool: impl Into<String>) -> Self {
        let book_id = book_id.into();
        let id = format!("book:{book_id}");
        Self {
            id,
            record_id: None,
            book_id,
            cpu_pool: cpu_pool.into(),
            llm_pool: llm_pool.into(),
            states: STAGES.iter().map(|s| (*s, OperationState::new())).collect(),
            retries: HashMap::new(),
            results: HashMap::new(),
            inflight: None,
            toc_agent: None,
            toc_agent_started_at: None,
            structure_submitted: false,
        }
    }

    fn metrics(&self, stage: Stage) -> MetricsTag {
        MetricsTag {
            book_id: Some(self.book_id.clone()),
            stage: Some(stage.name().to_string()),
            item_key: None,
            prompt_key: None,
            prompt_cid: None,
        }
    }

    fn cpu_unit(&self, stage: Stage, task_tag: &str, payload: Value) -> WorkUnit {
        WorkUnit {
            id: Uuid::new_v4(),
            job_id: self.id.clone(),
            provider: self.cpu_pool.clone(),
            request: WorkRequest::Cpu(CpuRequest {
                task_tag: task_tag.to_string(),
                payload,
            }),
            metrics: self.metrics(stage),
            retry: self.retries.get(&stage).copied().unwrap_or(0),
        }
    }

    fn llm_unit(&self, stage: Stage, request: ChatRequest) -> WorkUnit {
        WorkUnit {
            id: Uuid::new_v4(),
            job_id: self.id.clone(),
            provider: self.llm_pool.clone(),
            request: WorkRequest::Chat(request),
            metrics: self.metrics(stage),
            retry: self.retries.get(&stage).copied().unwrap_or(0),
        }
    }

    /// Drive the ToC-finder agent until it needs an LLM call or is done.
    /// Tool calls execute inline, exactly as in the standalone agent-job
    /// adapter; unlike that adapter this is only one stage among several
    /// this job runs in sequence.
    async fn drive_toc_finder(&mut self) -> Option<WorkUnit> {
        let agent = self.toc_agent.as_mut().expect("toc agent present while stage active");
        loop {
            let units = agent.next_work_units();
            if units.is_empty() {
                return None;
            }
            let is_llm = matches!(units[0], AgentWorkUnit::Llm(_));
            if is_llm {
                let AgentWorkUnit::Llm(request) = units.into_iter().next().expect("checked non-empty") else {
                    unreachable!()
                };
                let unit = self.llm_unit(Stage::TocFinder, request);
                return Some(unit);
            }
            for unit in units {
                let AgentWorkUnit::Tool {
                    call_id,
                    tool_name,
                    arguments,
                } = unit
                else {
                    continue;
                };
                let outcome = agent.tools().execute(&tool_name, arguments).await;
                match outcome {
                    Ok(result) => agent.handle_tool_result(call_id, Some(result), None),
                    Err(err) => agent.handle_tool_result(call_id, None, Some(err)),
                }
            }
        }
    }

    async fn start_stage(&mut self, ctx: &JobContext, stage: Stage) -> Result<Option<WorkUnit>> {
        let unit = match stage {
            Stage::Metadata => Some(self.cpu_unit(
                Stage::Metadata,
                "extract_metadata",
                serde_json::json!({ "book_id": self.book_id }),
            )),
            Stage::TocFinder => {
                let mut agent = Agent::new(format!("toc-finder:{}", self.book_id), "default", 10, TocFinderTools::default());
                agent.seed(
                    "Locate the page range containing the table of contents.",
                    format!("book_id={}", self.book_id),
                );
                self.toc_agent = Some(agent);
                self.toc_agent_started_at = Some(Utc::now());
                self.persist_toc_agent_run(ctx, AgentRunStatus::Running, None, None).await?;
                self.drive_toc_finder().await
            }
            Stage::TocExtract => {
                let range = self.results.get(&Stage::TocFinder).cloned().unwrap_or(Value::Null);
                Some(self.cpu_unit(
                    Stage::TocExtract,
                    "extract_toc_entries",
                    serde_json::json!({ "book_id": self.book_id, "page_range": range }),
                ))
            }
            Stage::TocLink => {
                let entries = self.results.get(&Stage::TocExtract).cloned().unwrap_or(Value::Null);
                Some(self.llm_unit(
                    Stage::TocLink,
                    ChatRequest {
                        model: "default".to_string(),
                        messages: vec![
                            Message::system("Link each table-of-contents entry to the page it describes."),
                            Message::user(format!("entries={entries}")),
                        ],
                        tools: Vec::new(),
                        response_format: None,
                        temperature: None,
                        max_tokens: None,
                    },
                ))
            }
            Stage::TocFinalize => {
                let linked = self.results.get(&Stage::TocLink).cloned().unwrap_or(Value::Null);
                Some(self.cpu_unit(
                    Stage::TocFinalize,
                    "finalize_toc",
                    serde_json::json!({ "book_id": self.book_id, "linked": linked }),
                ))
            }
        };
        Ok(unit)
    }

    async fn emit_next(&mut self, ctx: &JobContext) -> Result<Vec<WorkUnit>> {
        for stage in STAGES {
            {
                let state = self.states.get_mut(&stage).expect("all stages present");
                if state.is_terminal() {
                    continue;
                }
                if state.can_start() {
                    state.start();
                }
            }
            if let Some(unit) = self.start_stage(ctx, stage).await? {
                self.inflight = Some((stage, unit.id));
                return Ok(vec![unit]);
            }
            // The ToC-finder agent finished without another LLM call
            // (e.g. it called its `done` tool on the first turn): treat
            // that as stage completion and fall through to the next one.
            let state = self.states.get_mut(&stage).expect("all stages present");
            state.complete();
        }
        Ok(Vec::new())
    }

    fn store_result(&mut self, stage: Stage, payload: &foliant_domain::WorkPayload) {
        let value = match payload {
            foliant_domain::WorkPayload::Cpu(c) => c.payload.clone(),
            foliant_domain::WorkPayload::Ocr(o) => serde_json::json!({ "text": o.text }),
            foliant_domain::WorkPayload::Chat(c) => serde_json::json!({ "content": c.content }),
        };
        self.results.insert(stage, value);
    }

    /// Upsert the ToC-finder agent's observability record, keyed by its own
    /// `agent_id`. A no-op once the agent has been taken (`toc_agent` is
    /// `None`) — callers persist the completion record before taking it.
    async fn persist_toc_agent_run(
        &self,
        ctx: &JobContext,
        status: AgentRunStatus,
        completed_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> Result<()> {
        let Some(agent) = self.toc_agent.as_ref() else {
            return Ok(());
        };
        let Some(started_at) = self.toc_agent_started_at else {
            return Ok(());
        };
        let snapshot = agent.export_state();
        let messages_json = serde_json::to_string(&snapshot.messages).unwrap_or_default();
        let record = AgentRunRecord {
            agent_id: agent.id.clone(),
            agent_type: "toc_finder".to_string(),
            book_id: Some(self.book_id.clone()),
            job_id: self.id.clone(),
            started_at,
            completed_at,
            iterations: agent.iteration(),
            status,
            success: matches!(status, AgentRunStatus::Completed),
            error,
            messages_json: foliant_store::truncate(&messages_json, 4096),
            tool_calls_json: String::new(),
            result_json: Some(agent.tools().result().to_string()),
        };
        let op = agent_run_write_op(&record).map_err(Error::Json)?;
        ctx.store.upsert(op).await
    }

    /// Serialize `states`/`retries`/`results`/`structure_submitted` into
    /// the opaque `bookkeeping` blob `JobRecord` carries. The ToC-finder
    /// agent's own conversation state is never persisted here: a crash
    /// mid-conversation simply resets the whole `TocFinder` stage and the
    /// agent restarts from scratch on resume.
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
            "structure_submitted": self.structure_submitted,
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
        if let Some(submitted) = value.get("structure_submitted").and_then(|v| v.as_bool()) {
            self.structure_submitted = submitted;
        }
    }

    /// Load this job's prior bookkeeping from its own `JobRecord`, if any
    /// exists yet. No-op if `record_id` hasn't been assigned.
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
    /// `TocFinder` never survives a crash mid-conversation: its stage is
    /// reset (or failed) exactly like every other stage, and the agent
    /// itself restarts from scratch the next time the stage is entered.
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
impl Job for BookJob {
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
        "book"
    }

    async fn start(&mut self, ctx: &JobContext) -> Result<Vec<WorkUnit>> {
        self.load_bookkeeping(ctx).await?;
        self.recover_crashed_stages(ctx.retry.max_retries);
        self.persist_bookkeeping(ctx).await?;
        let units = self.emit_next(ctx).await?;
        self.persist_bookkeeping(ctx).await?;
        Ok(units)
    }

    async fn on_complete(&mut self, ctx: &JobContext, result: WorkResult) -> Result<Vec<WorkUnit>> {
        let Some((stage, expected)) = self.inflight else {
            return Err(Error::Programmer(format!("book job {} has no in-flight stage", self.id)));
        };
        if result.work_unit_id != expected {
            return Err(Error::Programmer(format!(
                "book job {} received a result for an unexpected work unit",
                self.id
            )));
        }
        self.inflight = None;

        let RetryConfig { max_retries } = ctx.retry;

        if stage == Stage::TocFinder && result.success {
            // Route the LLM reply back into the agent and keep driving it;
            // only once the agent itself is done does the stage complete.
            if let Some(chat_result) = result.chat().cloned() {
                if let Some(agent) = self.toc_agent.as_mut() {
                    agent.handle_llm_result(chat_result);
                }
            }
            if let Some(unit) = self.drive_toc_finder().await {
                self.inflight = Some((stage, unit.id));
                self.persist_bookkeeping(ctx).await?;
                return Ok(vec![unit]);
            }
            self.persist_toc_agent_run(ctx, AgentRunStatus::Completed, Some(Utc::now()), None).await?;
            if let Some(agent) = self.toc_agent.take() {
                self.results.insert(Stage::TocFinder, agent.tools().result());
            }
            self.states.get_mut(&stage).expect("present").complete();
            let units = self.emit_next(ctx).await?;
            self.persist_bookkeeping(ctx).await?;
            return Ok(units);
        }

        if result.success {
            if let Some(payload) = &result.payload {
                self.store_result(stage, payload);
            }
            let state = self.states.get_mut(&stage).expect("all stages present");
            state.complete();

            if stage == Stage::TocFinalize && !self.structure_submitted {
                self.structure_submitted = true;
                if let Some(scheduler) = ctx.scheduler.upgrade() {
                    scheduler
                        .submit_by_type("build_structure", Value::String(self.book_id.clone()))
                        .await?;
                }
            }
        } else if result.is_retryable_failure() {
            let state = self.states.get_mut(&stage).expect("all stages present");
            let permanently_failed = state.fail(max_retries);
            if !permanently_failed {
                *self.retries.entry(stage).or_insert(0) += 1;
            } else if stage == Stage::TocFinder {
                let error = result.error.clone();
                self.persist_toc_agent_run(ctx, AgentRunStatus::Failed, Some(Utc::now()), error).await?;
                self.toc_agent = None;
            }
        } else {
            let state = self.states.get_mut(&stage).expect("all stages present");
            state.fail(0);
            if stage == Stage::TocFinder {
                let error = result.error.clone();
                self.persist_toc_agent_run(ctx, AgentRunStatus::Failed, Some(Utc::now()), error).await?;
                self.toc_agent = None;
            }
        }

        let units = self.emit_next(ctx).await?;
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
        for stage in STAGES {
            status.insert(stage.name().to_string(), format!("{:?}", self.states[&stage].status));
        }
        status
    }

    fn metrics_tag(&self) -> MetricsTag {
        self.metrics(Stage::Metadata)
    }
}

/// `key` is either the bare `book_id`, as `Scheduler::submit_by_type` passes
/// it, or the full `book:book_id`, as `Scheduler::resume` passes
/// `JobRecord.key` (= `job.id()`) straight through.
pub fn factory(cpu_pool: String, llm_pool: String) -> foliant_scheduler::JobFactory {
    std::sync::Arc::new(move |_record_id: String, key: Value| {
        let raw = key.as_str().unwrap_or_default();
        let book_id = raw.strip_prefix("book:").unwrap_or(raw).to_string();
        Box::new(BookJob::new(book_id, cpu_pool.clone(), llm_pool.clone())) as Box<dyn Job>
    })
}

#[cfg(test)]
mod tests {
    use foliant_domain::{ChatResult, CpuResult, OpStatus, ToolCall, UsageInfo};

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
    async fn start_emits_metadata_first() {
        let mut job = BookJob::new("book-1", "cpu", "llm");
        let units = job.start(&ctx()).await.unwrap();
        assert_eq!(units.len(), 1);
        assert!(matches!(units[0].request, WorkRequest::Cpu(_)));
    }

    #[tokio::test]
    async fn toc_finder_drives_through_a_tool_call_before_completing() {
        let mut job = BookJob::new("book-1", "cpu", "llm");
        let c = ctx();

        let metadata = job.start(&c).await.unwrap().remove(0);
        let next = job
            .on_complete(
                &c,
                WorkResult::ok(
                    metadata.id,
                    foliant_domain::WorkPayload::Cpu(CpuResult { payload: serde_json::json!({}) }),
                    UsageInfo::default(),
                ),
            )
            .await
            .unwrap();
        let toc_finder_call = next[0].clone();
        assert!(matches!(toc_finder_call.request, WorkRequest::Chat(_)));

        // The model calls the `done` tool on the first turn, so the agent
        // finishes with no further LLM calls and the book job advances.
        let next = job
            .on_complete(
                &c,
                WorkResult::ok(
                    toc_finder_call.id,
                    foliant_domain::WorkPayload::Chat(ChatResult {
                        content: String::new(),
                        structured_output: None,
                        reasoning_details: None,
                        tool_calls: vec![ToolCall {
                            call_id: "call-1".to_string(),
                            function_name: "done".to_string(),
                            arguments_json: "{}".to_string(),
                        }],
                    }),
                    UsageInfo::default(),
                ),
            )
            .await
            .unwrap();

        assert_eq!(job.states[&Stage::TocFinder].status, OpStatus::Complete);
        assert!(matches!(next[0].request, WorkRequest::Cpu(_)));
    }

    #[tokio::test]
    async fn mismatched_work_unit_id_is_rejected() {
        let mut job = BookJob::new("book-1", "cpu", "llm");
        let c = ctx();
        job.start(&c).await.unwrap();
        let bogus = WorkResult::err(Uuid::new_v4(), "permanent: nope");
        assert!(job.on_complete(&c, bogus).await.is_err());
    }

    #[tokio::test]
    async fn permanent_metadata_failure_does_not_block_later_stages() {
        let mut job = BookJob::new("book-1", "cpu", "llm");
        let c = ctx();
        let metadata = job.start(&c).await.unwrap().remove(0);
        let next = job
            .on_complete(&c, WorkResult::err(metadata.id, "permanent: no metadata"))
            .await
            .unwrap();
        assert_eq!(job.states[&Stage::Metadata].status, OpStatus::Failed);
        assert!(!next.is_empty());
    }

    #[tokio::test]
    async fn resumed_job_recovers_in_progress_stage_from_bookkeeping() {
        let c = ctx();
        let mut original = BookJob::new("book-1", "cpu", "llm");
        original.set_record_id("rec-1".to_string());
        original.start(&c).await.unwrap();
        assert_eq!(original.states[&Stage::Metadata].status, OpStatus::InProgress);

        let factory = factory("cpu".to_string(), "llm".to_string());
        let mut resumed = factory("ignored-id".to_string(), Value::String("book:book-1".to_string()));
        resumed.set_record_id("rec-1".to_string());
        let units = resumed.start(&c).await.unwrap();

        assert_eq!(units.len(), 1);
        assert!(matches!(units[0].request, WorkRequest::Cpu(_)));
        assert_eq!(units[0].retry, 1);
    }
}
