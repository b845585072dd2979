//! The bundle of collaborators a `Job` gets on every call, so jobs never
//! reach for globals.

use std::sync::{Arc, Weak};

use foliant_domain::config::RetryConfig;
use foliant_store::DocumentStore;

use crate::cancel::CancelToken;
use crate::metrics::MetricsSink;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn DocumentStore>,
    pub metrics: Arc<dyn MetricsSink>,
    pub retry: RetryConfig,
    pub cancel: CancelToken,
    /// A handle back to the scheduler that owns this job, so a job can
    /// submit a follow-up job by type from its own `on_complete` (e.g.
    /// finalize triggers a structure-build job). Weak to avoid a
    /// reference cycle with the scheduler's own job table.
    pub scheduler: Weak<Scheduler>,
}
