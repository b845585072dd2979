//! The `Job` trait: the generic stage protocol every concrete pipeline
//! stage implements so the scheduler can drive it without knowing what
//! it does (`start` → drain work-unit results → `on_complete`, repeated
//! until `done()`).

use std::collections::HashMap;

use foliant_domain::{MetricsTag, Result, WorkResult, WorkUnit};

use crate::context::JobContext;

/// How many of a job's expected work units have completed, for progress
/// reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressCount {
    pub expected: u32,
    pub completed: u32,
}

/// A unit of scheduler-visible work: page extraction, a ToC-finding
/// agent turn, a metadata pass, or any other stage a pipeline composes.
///
/// `start`/`on_complete` return the next batch of `WorkUnit`s to dispatch
/// (empty once the job has nothing left to do, not necessarily once it's
/// `done()` — a job may still be writing out results after its last
/// external call completes).
#[async_trait::async_trait]
pub trait Job: Send + Sync {
    /// Stable identifier used for tracking/routing/cancellation.
    fn id(&self) -> &str;

    /// The persistence-layer record id, once the scheduler has created
    /// one. Jobs resumed from storage are constructed with it already
    /// set; jobs submitted fresh have it assigned right after `start`.
    fn set_record_id(&mut self, record_id: String);

    fn record_id(&self) -> Option<&str>;

    /// A stable type tag (e.g. `"page"`, `"toc_finder"`) used for
    /// `JobRecord::job_type`, factory lookup, and metrics.
    fn job_type(&self) -> &str;

    async fn start(&mut self, ctx: &JobContext) -> Result<Vec<WorkUnit>>;

    async fn on_complete(&mut self, ctx: &JobContext, result: WorkResult) -> Result<Vec<WorkUnit>>;

    /// True once the job has no further work units to emit and has
    /// finished writing out whatever results it owns.
    fn done(&self) -> bool;

    /// Whether the job's terminal state, once `done()`, represents
    /// success. Meaningless (and unchecked) before `done()`.
    fn succeeded(&self) -> bool;

    fn progress(&self) -> HashMap<String, ProgressCount>;

    fn status(&self) -> HashMap<String, String>;

    fn metrics_tag(&self) -> MetricsTag;
}

/// Builds a fresh `Job` from a type tag and opaque metadata, used both
/// for `Scheduler::submit_by_type` and for reconstructing jobs from
/// persisted `JobRecord`s at resume time.
pub type JobFactory = std::sync::Arc<dyn Fn(String, serde_json::Value) -> Box<dyn Job> + Send + Sync>;
