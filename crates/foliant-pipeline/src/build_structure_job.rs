//! The one-shot job a finalized table of contents chains into: assembling
//! the book's final structure document out of its linked ToC entries.

use std::collections::HashMap;

use foliant_domain::{CpuRequest, Error, MetricsTag, Result, WorkRequest, WorkResult, WorkUnit};
use foliant_scheduler::{Job, JobContext, ProgressCount};
use serde_json::Value;
use uuid::Uuid;

pub struct BuildStructureJob {
    id: String,
    record_id: Option<String>,
    book_id: String,
    cpu_pool: String,
    inflight: Option<Uuid>,
    done: bool,
    succeeded: bool,
}

impl BuildStructureJob {
    pub fn new(book_id: impl Into<String>, cpu_pool: impl Into<String>) -> Self {
        let book_id = book_id.into();
        let id = format!("build_structure:{book_id}");
        Self {
            id,
            record_id: None,
            book_id,
            cpu_pool: cpu_pool.into(),
            inflight: None,
            done: false,
            succeeded: false,
        }
    }
}

#[async_trait::async_trait]
impl Job for BuildStructureJob {
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
        "build_structure"
    }

    async fn start(&mut self, _ctx: &JobContext) -> Result<Vec<WorkUnit>> {
        let unit = WorkUnit {
            id: Uuid::new_v4(),
            job_id: self.id.clone(),
            provider: self.cpu_pool.clone(),
            request: WorkRequest::Cpu(CpuRequest {
                task_tag: "build_structure".to_string(),
                payload: serde_json::json!({ "book_id": self.book_id }),
            }),
            metrics: MetricsTag {
                book_id: Some(self.book_id.clone()),
                stage: Some("build_structure".to_string()),
                item_key: None,
                prompt_key: None,
                prompt_cid: None,
            },
            retry: 0,
        };
        self.inflight = Some(unit.id);
        Ok(vec![unit])
    }

    async fn on_complete(&mut self, _ctx: &JobContext, result: WorkResult) -> Result<Vec<WorkUnit>> {
        let Some(expected) = self.inflight else {
            return Err(Error::Programmer(format!("{} has no in-flight work unit", self.id)));
        };
        if result.work_unit_id != expected {
            return Err(Error::Programmer(format!(
                "{} received a result for an unexpected work unit",
                self.id
            )));
        }
        self.inflight = None;
        self.done = true;
        self.succeeded = result.success;
        Ok(Vec::new())
    }

    fn done(&self) -> bool {
        self.done
    }

    fn succeeded(&self) -> bool {
        self.succeeded
    }

    fn progress(&self) -> HashMap<String, ProgressCount> {
        let mut progress = HashMap::new();
        progress.insert(
            self.id.clone(),
            ProgressCount {
                expected: 1,
                completed: if self.done { 1 } else { 0 },
            },
        );
        progress
    }

    fn status(&self) -> HashMap<String, String> {
        let mut status = HashMap::new();
        status.insert("book_id".to_string(), self.book_id.clone());
        status.insert("done".to_string(), self.done.to_string());
        status
    }

    fn metrics_tag(&self) -> MetricsTag {
        MetricsTag {
            book_id: Some(self.book_id.clone()),
            stage: Some("build_structure".to_string()),
            item_key: None,
            prompt_key: None,
            prompt_cid: None,
        }
    }
}

/// `key` is either the bare `book_id`, as `Scheduler::submit_by_type` passes
/// it, or the full `build_structure:book_id`, as `Scheduler::resume` passes
/// `JobRecord.key` (= `job.id()`) straight through.
pub fn factory(cpu_pool: String) -> foliant_scheduler::JobFactory {
    std::sync::Arc::new(move |_record_id: String, key: Value| {
        let raw = key.as_str().unwrap_or_default();
        let book_id = raw.strip_prefix("build_structure:").unwrap_or(raw).to_string();
        Box::new(BuildStructureJob::new(book_id, cpu_pool.clone())) as Box<dyn Job>
    })
}
