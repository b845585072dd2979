//! Presents an `Agent` to the scheduler as a `Job`: drives
//! `Agent::next_work_units`/`handle_*` instead of dispatching directly,
//! executing tool calls inline (they're local and synchronous from the
//! scheduler's point of view) and turning only LLM calls into
//! scheduler-visible `WorkUnit`s.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use foliant_domain::{ChatRequest, Error, MetricsTag, Result, WorkRequest, WorkResult, WorkUnit};
use foliant_scheduler::{Job, JobContext, ProgressCount};
use foliant_store::{agent_run_write_op, AgentRunRecord, AgentRunStatus};
use uuid::Uuid;

use crate::agent::{Agent, AgentWorkUnit};
use crate::tools::Tools;

/// The one in-flight LLM call an `AgentJob` ever has outstanding, kept
/// alongside the request that produced it so a failed call can be
/// re-issued rather than silently dropped.
struct PendingLlm {
    work_unit_id: Uuid,
    request: ChatRequest,
    retry: u32,
}

/// Adapts one `Agent<T>` into a schedulable job. Tool-call work units are
/// executed immediately inside `start`/`on_complete` (they never leave
/// the process); LLM work units are handed to the scheduler and their
/// result routed back in on the next `on_complete`.
pub struct AgentJob<T: Tools> {
    id: String,
    record_id: Option<String>,
    job_type: &'static str,
    provider: String,
    book_id: Option<String>,
    agent: Agent<T>,
    metrics: MetricsTag,
    started_at: DateTime<Utc>,
    /// The one in-flight LLM `WorkUnit`, if any. An `AgentJob` never has
    /// more than one outstanding scheduler-visible unit: tool calls are
    /// drained synchronously before an LLM unit is ever emitted.
    pending_llm: Option<PendingLlm>,
    /// Set once the retry budget for a failing LLM call is exhausted;
    /// once present the job is permanently done and unsuccessful, rather
    /// than left as a zombie with no further work units and no live
    /// `pending_llm`.
    terminal_failure: Option<String>,
}

impl<T: Tools> AgentJob<T> {
    pub fn new(
        id: impl Into<String>,
        job_type: &'static str,
        provider: impl Into<String>,
        book_id: Option<String>,
        agent: Agent<T>,
        metrics: MetricsTag,
    ) -> Self {
        Self {
            id: id.into(),
            record_id: None,
            job_type,
            provider: provider.into(),
            book_id,
            agent,
            metrics,
            started_at: Utc::now(),
            pending_llm: None,
            terminal_failure: None,
        }
    }

    /// Drain `next_work_units` until either an LLM call must be made or
    /// the agent has finished; tool calls are executed inline.
    async fn drive(&mut self) -> Result<Vec<WorkUnit>> {
        loop {
            let units = self.agent.next_work_units();
            if units.is_empty() {
                return Ok(Vec::new());
            }

            let is_llm = matches!(units[0], AgentWorkUnit::Llm(_));
            if is_llm {
                let AgentWorkUnit::Llm(request) = units.into_iter().next().expect("checked non-empty") else {
                    unreachable!()
                };
                let unit = self.llm_work_unit(request.clone(), 0);
                self.pending_llm = Some(PendingLlm {
                    work_unit_id: unit.id,
                    request,
                    retry: 0,
                });
                return Ok(vec![unit]);
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
                let outcome = self.agent.tools().execute(&tool_name, arguments).await;
                match outcome {
                    Ok(result) => self.agent.handle_tool_result(call_id, Some(result), None),
                    Err(err) => self.agent.handle_tool_result(call_id, None, Some(err)),
                }
            }
            // Loop again: either more tool calls are still pending or the
            // agent is now ready to emit the next LLM call.
        }
    }

    fn llm_work_unit(&self, request: ChatRequest, retry: u32) -> WorkUnit {
        WorkUnit {
            id: Uuid::new_v4(),
            job_id: self.id.clone(),
            provider: self.provider.clone(),
            request: WorkRequest::Chat(request),
            metrics: self.metrics.clone(),
            retry,
        }
    }

    fn run_status(&self) -> AgentRunStatus {
        if self.succeeded() {
            AgentRunStatus::Completed
        } else {
            AgentRunStatus::Failed
        }
    }

    /// Upsert this agent's observability record, keyed by `agent_id` so
    /// repeated calls (creation, then completion) merge into one document
    /// rather than accumulating duplicates.
    async fn persist_run(&self, ctx: &JobContext, status: AgentRunStatus, completed_at: Option<DateTime<Utc>>) -> Result<()> {
        let snapshot = self.agent.export_state();
        let tool_calls: Vec<_> = snapshot.messages.iter().flat_map(|m| m.tool_calls.clone()).collect();
        let messages_json = serde_json::to_string(&snapshot.messages).unwrap_or_default();
        let tool_calls_json = serde_json::to_string(&tool_calls).unwrap_or_default();

        let record = AgentRunRecord {
            agent_id: self.agent.id.clone(),
            agent_type: self.job_type.to_string(),
            book_id: self.book_id.clone(),
            job_id: self.id.clone(),
            started_at: self.started_at,
            completed_at,
            iterations: self.agent.iteration(),
            status,
            success: snapshot.result.as_ref().map(|r| r.success).unwrap_or(false),
            error: self
                .terminal_failure
                .clone()
                .or_else(|| snapshot.result.as_ref().and_then(|r| r.error.clone())),
            messages_json: foliant_store::truncate(&messages_json, 4096),
            tool_calls_json: foliant_store::truncate(&tool_calls_json, 4096),
            result_json: snapshot.result.as_ref().map(|r| r.result.to_string()),
        };
        let op = agent_run_write_op(&record).map_err(Error::Json)?;
        ctx.store.upsert(op).await
    }
}

#[async_trait::async_trait]
impl<T: Tools + Send + Sync> Job for AgentJob<T> {
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
        self.job_type
    }

    async fn start(&mut self, ctx: &JobContext) -> Result<Vec<WorkUnit>> {
        self.persist_run(ctx, AgentRunStatus::Running, None).await?;
        let units = self.drive().await?;
        if self.done() {
            self.persist_run(ctx, self.run_status(), Some(Utc::now())).await?;
        }
        Ok(units)
    }

    async fn on_complete(&mut self, ctx: &JobContext, result: WorkResult) -> Result<Vec<WorkUnit>> {
        let Some(pending) = self.pending_llm.take() else {
            return Err(Error::Programmer(format!(
                "agent job {} received a result with no pending LLM call",
                self.id
            )));
        };
        if result.work_unit_id != pending.work_unit_id {
            self.pending_llm = Some(pending);
            return Err(Error::Programmer(format!(
                "agent job {} received a result for an unexpected work unit",
                self.id
            )));
        }

        let next = if !result.success {
            let error = result.error.unwrap_or_else(|| "llm call failed".to_string());
            if pending.retry + 1 >= ctx.retry.max_retries {
                self.terminal_failure = Some(error);
                Ok(Vec::new())
            } else {
                let next_retry = pending.retry + 1;
                let unit = self.llm_work_unit(pending.request.clone(), next_retry);
                self.pending_llm = Some(PendingLlm {
                    work_unit_id: unit.id,
                    request: pending.request,
                    retry: next_retry,
                });
                Ok(vec![unit])
            }
        } else {
            match result.chat().cloned() {
                Some(chat_result) => {
                    self.agent.handle_llm_result(chat_result);
                    self.drive().await
                }
                None => Err(Error::Programmer("expected a chat payload".to_string())),
            }
        };

        if self.done() {
            self.persist_run(ctx, self.run_status(), Some(Utc::now())).await?;
        }

        next
    }

    fn done(&self) -> bool {
        self.terminal_failure.is_some() || self.agent.is_done()
    }

    fn succeeded(&self) -> bool {
        self.terminal_failure.is_none() && self.agent.result().map(|r| r.success).unwrap_or(false)
    }

    fn progress(&self) -> HashMap<String, ProgressCount> {
        let mut progress = HashMap::new();
        progress.insert(
            "iterations".to_string(),
            ProgressCount {
                expected: 0,
                completed: self.agent.iteration(),
            },
        );
        progress
    }

    fn status(&self) -> HashMap<String, String> {
        let mut status = HashMap::new();
        status.insert("agent_id".to_string(), self.agent.id.clone());
        status.insert("iteration".to_string(), self.agent.iteration().to_string());
        status.insert("done".to_string(), self.done().to_string());
        if let Some(error) = &self.terminal_failure {
            status.insert("error".to_string(), error.clone());
        } else if let Some(result) = self.agent.result() {
            if let Some(error) = &result.error {
                status.insert("error".to_string(), error.clone());
            }
        }
        status
    }

    fn metrics_tag(&self) -> MetricsTag {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use foliant_domain::{ChatResult, UsageInfo};
    use serde_json::{json, Value};

    use super::*;
    use crate::tools::Tools;

    struct EchoTools {
        complete: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl Tools for EchoTools {
        fn schema(&self) -> Vec<foliant_domain::ToolDefinition> {
            Vec::new()
        }

        async fn execute(&self, _name: &str, _args: Value) -> std::result::Result<String, String> {
            Ok("{}".to_string())
        }

        fn is_complete(&self) -> bool {
            self.complete.load(std::sync::atomic::Ordering::SeqCst)
        }

        fn result(&self) -> Value {
            json!({ "ok": true })
        }
    }

    fn ctx() -> JobContext {
        JobContext {
            store: std::sync::Arc::new(foliant_store::InMemoryDocumentStore::default()),
            metrics: std::sync::Arc::new(foliant_scheduler::NoopMetricsSink),
            retry: Default::default(),
            cancel: foliant_scheduler::CancelToken::new(),
            scheduler: std::sync::Weak::new(),
        }
    }

    fn echo_job(complete: bool) -> AgentJob<EchoTools> {
        let tools = EchoTools {
            complete: std::sync::atomic::AtomicBool::new(complete),
        };
        let mut agent = Agent::new("a1", "gpt", 5, tools);
        agent.seed("system prompt", "do the thing");
        AgentJob::new("job-1", "test_agent", "mock-llm", None, agent, MetricsTag::default())
    }

    #[tokio::test]
    async fn start_emits_one_llm_unit_when_no_tool_calls_pending() {
        let mut job = echo_job(false);

        let units = job.start(&ctx()).await.unwrap();
        assert_eq!(units.len(), 1);
        assert!(matches!(units[0].request, WorkRequest::Chat(_)));
    }

    #[tokio::test]
    async fn on_complete_with_no_tool_calls_and_complete_tools_finishes_job() {
        let mut job = echo_job(true);

        let units = job.start(&ctx()).await.unwrap();
        let work_id = units[0].id;

        let result = WorkResult::ok(
            work_id,
            foliant_domain::WorkPayload::Chat(ChatResult {
                content: "done".to_string(),
                structured_output: None,
                reasoning_details: None,
                tool_calls: Vec::new(),
            }),
            UsageInfo::default(),
        );
        let follow_up = job.on_complete(&ctx(), result).await.unwrap();
        assert!(follow_up.is_empty());
        assert!(job.done());
        assert!(job.succeeded());
    }

    #[tokio::test]
    async fn on_complete_rejects_mismatched_work_unit_id() {
        let mut job = echo_job(true);
        job.start(&ctx()).await.unwrap();

        let bogus = WorkResult::ok(
            Uuid::new_v4(),
            foliant_domain::WorkPayload::Chat(ChatResult {
                content: String::new(),
                structured_output: None,
                reasoning_details: None,
                tool_calls: Vec::new(),
            }),
            UsageInfo::default(),
        );
        assert!(job.on_complete(&ctx(), bogus).await.is_err());
    }

    #[tokio::test]
    async fn retryable_llm_failure_re_emits_same_request_with_incremented_retry() {
        let mut job = echo_job(true);
        let c = ctx();
        let units = job.start(&c).await.unwrap();
        let first_id = units[0].id;

        let retried = job
            .on_complete(&c, WorkResult::err(first_id, "transient: upstream busy"))
            .await
            .unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].retry, 1);
        assert!(!job.done());

        // Succeeding on the retried call still finishes the job normally.
        let result = WorkResult::ok(
            retried[0].id,
            foliant_domain::WorkPayload::Chat(ChatResult {
                content: "done".to_string(),
                structured_output: None,
                reasoning_details: None,
                tool_calls: Vec::new(),
            }),
            UsageInfo::default(),
        );
        let follow_up = job.on_complete(&c, result).await.unwrap();
        assert!(follow_up.is_empty());
        assert!(job.done());
        assert!(job.succeeded());
    }

    #[tokio::test]
    async fn exhausted_retry_budget_fails_job_instead_of_going_silent() {
        let mut job = echo_job(true);
        let c = JobContext {
            retry: foliant_domain::config::RetryConfig { max_retries: 2 },
            ..ctx()
        };

        let mut unit = job.start(&c).await.unwrap().remove(0);
        for attempt in 0..2 {
            let next = job
                .on_complete(&c, WorkResult::err(unit.id, "transient: still busy"))
                .await
                .unwrap();
            if attempt == 0 {
                assert_eq!(next.len(), 1, "budget not yet exhausted, expected a re-emitted unit");
                unit = next.into_iter().next().unwrap();
            } else {
                assert!(next.is_empty(), "budget exhausted, job must finish rather than emit more work");
            }
        }

        assert!(job.done());
        assert!(!job.succeeded());
    }
}
