//! The dispatch loop: routes `WorkUnit`s to pools, routes `WorkResult`s
//! back to the job that issued them, persists job records, and resumes
//! in-flight jobs at boot.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use foliant_domain::config::SchedulerConfig;
use foliant_domain::{Error, MetricsTag, Result, WorkResult, WorkUnit};
use foliant_store::{DocumentStore, JobRecord, JobStatus, WriteOp, JOB_COLLECTION};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::cancel::{CancelMap, CancelToken};
use crate::context::JobContext;
use crate::job::{Job, JobFactory};
use crate::metrics::MetricsSink;
use crate::pool::Pool;
use crate::tracker::WorkUnitTracker;

#[derive(Clone)]
struct TrackedInfo {
    job_id: String,
    metrics: MetricsTag,
}

struct JobHandle {
    job: AsyncMutex<Box<dyn Job>>,
    cancel: CancelToken,
}

/// Central dispatcher. Cheap to clone (everything behind `Arc`); the
/// idiom is to build one, `Arc` it, and hand clones to whatever submits
/// jobs.
pub struct Scheduler {
    pools: RwLock<HashMap<String, Arc<dyn Pool>>>,
    kind_routes: RwLock<HashMap<foliant_domain::WorkKind, String>>,
    factories: RwLock<HashMap<String, JobFactory>>,
    jobs: RwLock<HashMap<String, Arc<JobHandle>>>,
    tracker: WorkUnitTracker<TrackedInfo>,
    store: Arc<dyn DocumentStore>,
    metrics: Arc<dyn MetricsSink>,
    config: SchedulerConfig,
    cancel_map: CancelMap,
    results_tx: mpsc::Sender<WorkResult>,
    results_rx: AsyncMutex<Option<mpsc::Receiver<WorkResult>>>,
    self_weak: OnceLock<Weak<Scheduler>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: Arc<dyn DocumentStore>, metrics: Arc<dyn MetricsSink>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1024);
        let scheduler = Arc::new(Self {
            pools: RwLock::new(HashMap::new()),
            kind_routes: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            tracker: WorkUnitTracker::new(),
            store,
            metrics,
            config,
            cancel_map: CancelMap::new(),
            results_tx: tx,
            results_rx: AsyncMutex::new(Some(rx)),
            self_weak: OnceLock::new(),
        });
        let _ = scheduler.self_weak.set(Arc::downgrade(&scheduler));
        scheduler
    }

    pub fn register_pool(&self, pool: Arc<dyn Pool>) {
        self.pools.write().insert(pool.name().to_string(), pool);
    }

    /// Fixes a `WorkKind` (OCR/CPU) to a single named pool, used when the
    /// unit's `provider` field is descriptive rather than a pool key.
    pub fn register_kind_route(&self, kind: foliant_domain::WorkKind, pool_name: impl Into<String>) {
        self.kind_routes.write().insert(kind, pool_name.into());
    }

    pub fn register_factory(&self, job_type: impl Into<String>, factory: JobFactory) {
        self.factories.write().insert(job_type.into(), factory);
    }

    fn job_context(&self, cancel: CancelToken) -> JobContext {
        JobContext {
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            retry: self.config.retry.clone(),
            cancel,
            scheduler: self.self_weak.get().cloned().unwrap_or_default(),
        }
    }

    fn pool_for(&self, unit: &WorkUnit) -> Option<Arc<dyn Pool>> {
        match unit.kind() {
            foliant_domain::WorkKind::Llm => self.pools.read().get(&unit.provider).cloned(),
            kind => {
                let name = self.kind_routes.read().get(&kind).cloned()?;
                self.pools.read().get(&name).cloned()
            }
        }
    }

    fn route(&self, job_id: &str, units: Vec<WorkUnit>, cancel: CancelToken) -> Result<()> {
        for unit in units {
            let pool = self.pool_for(&unit).ok_or_else(|| {
                Error::Programmer(format!(
                    "no pool registered for provider={} kind={:?}",
                    unit.provider,
                    unit.kind()
                ))
            })?;
            self.tracker.register(
                unit.id,
                TrackedInfo {
                    job_id: job_id.to_string(),
                    metrics: unit.metrics.clone(),
                },
            );
            pool.submit(unit, Some(cancel.clone()), self.results_tx.clone());
        }
        Ok(())
    }

    async fn persist_new(&self, job: &dyn Job) -> Result<String> {
        let record_id = uuid::Uuid::new_v4().to_string();
        let record = JobRecord::new(record_id.clone(), job.job_type(), job.id().to_string());
        self.store
            .send_sync(WriteOp::upsert(
                JOB_COLLECTION,
                serde_json::json!({ "record_id": record_id }),
                serde_json::to_value(&record).map_err(Error::Json)?,
                Value::Null,
            ))
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(record_id)
    }

    async fn persist_status(&self, record_id: &str, status: JobStatus) -> Result<()> {
        self.store
            .send_sync(WriteOp::upsert(
                JOB_COLLECTION,
                serde_json::json!({ "record_id": record_id }),
                Value::Null,
                serde_json::json!({ "status": status }),
            ))
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Submit a freshly-constructed job, persist its record, run `start`,
    /// and route whatever work units it emits.
    pub async fn submit(self: &Arc<Self>, mut job: Box<dyn Job>) -> Result<String> {
        let job_id = job.id().to_string();
        let cancel = self.cancel_map.register(&job_id, None);
        let ctx = self.job_context(cancel.clone());

        let record_id = self.persist_new(job.as_ref()).await?;
        job.set_record_id(record_id.clone());

        let units = job.start(&ctx).await?;
        self.jobs.write().insert(
            job_id.clone(),
            Arc::new(JobHandle {
                job: AsyncMutex::new(job),
                cancel: cancel.clone(),
            }),
        );
        self.route(&job_id, units, cancel)?;
        self.persist_status(&record_id, JobStatus::Running).await?;
        Ok(job_id)
    }

    /// Build a job from a registered factory and submit it. `key` is
    /// opaque metadata the factory interprets (e.g. a book id).
    pub async fn submit_by_type(self: &Arc<Self>, job_type: &str, key: Value) -> Result<String> {
        let factory = self
            .factories
            .read()
            .get(job_type)
            .cloned()
            .ok_or_else(|| Error::Programmer(format!("no factory registered for job_type={job_type}")))?;
        let id = uuid::Uuid::new_v4().to_string();
        let job = factory(id, key);
        self.submit(job).await
    }

    pub fn cancel(&self, job_id: &str) {
        self.cancel_map.cancel_job(job_id);
    }

    pub fn cancel_group(&self, group: &str) {
        self.cancel_map.cancel_group(group);
    }

    fn job_snapshot(&self, job_id: &str) -> Option<Arc<JobHandle>> {
        self.jobs.read().get(job_id).cloned()
    }

    async fn finish_if_done(&self, job_id: &str, handle: &Arc<JobHandle>) {
        let job = handle.job.lock().await;
        if !job.done() {
            return;
        }
        let status = if job.succeeded() { JobStatus::Complete } else { JobStatus::Failed };
        if let Some(record_id) = job.record_id() {
            let _ = self.persist_status(record_id, status).await;
        }
        drop(job);
        self.jobs.write().remove(job_id);
        self.cancel_map.remove(job_id);
    }

    /// Reconstruct and resume every job whose persisted record is still
    /// `pending`/`running` — crash recovery across a scheduler restart.
    pub async fn resume(self: &Arc<Self>) -> Result<usize> {
        let rows = self
            .store
            .query("{ jobs { record_id job_type key status } }")
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;

        let mut resumed = 0usize;
        for row in rows {
            let status = row.get("status").and_then(|v| v.as_str()).unwrap_or("");
            if status != "pending" && status != "running" {
                continue;
            }
            let job_type = match row.get("job_type").and_then(|v| v.as_str()) {
                Some(t) => t.to_string(),
                None => continue,
            };
            let key = row
                .get("key")
                .and_then(|v| v.as_str())
                .map(|s| Value::String(s.to_string()))
                .unwrap_or(Value::Null);
            let record_id = row
                .get("record_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            let factory = match self.factories.read().get(&job_type).cloned() {
                Some(f) => f,
                None => {
                    tracing::warn!(job_type = %job_type, record_id = %record_id, "no factory registered; cannot resume");
                    continue;
                }
            };
            let job_id = uuid::Uuid::new_v4().to_string();
            let mut job = factory(job_id.clone(), key);
            job.set_record_id(record_id.clone());

            let cancel = self.cancel_map.register(&job_id, None);
            let ctx = self.job_context(cancel.clone());
            // `start` re-reads this job's own bookkeeping from `ctx.store`
            // and runs `OperationState::recover_from_crash` on whatever it
            // finds `in_progress`, so calling it exactly as for a fresh job
            // is correct whether this is a first submission or a resume.
            let units = job.start(&ctx).await?;
            self.jobs.write().insert(
                job_id.clone(),
                Arc::new(JobHandle {
                    job: AsyncMutex::new(job),
                    cancel: cancel.clone(),
                }),
            );
            self.route(&job_id, units, cancel)?;
            self.persist_status(&record_id, JobStatus::Running).await?;
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Run the dispatch loop until `shutdown` is cancelled. One scheduler
    /// instance must not call this twice concurrently — the results
    /// channel receiver is taken on first call.
    pub async fn start(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut rx = self
            .results_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Programmer("scheduler already started".to_string()))?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    return Ok(());
                }
                maybe_result = rx.recv() => {
                    let Some(result) = maybe_result else { return Ok(()) };
                    self.handle_result(result).await;
                }
            }
        }
    }

    async fn handle_result(&self, result: WorkResult) {
        let Some(info) = self.tracker.get_and_remove(&result.work_unit_id) else {
            tracing::warn!(work_unit_id = %result.work_unit_id, "result for unknown/already-handled work unit");
            return;
        };
        let Some(handle) = self.job_snapshot(&info.job_id) else {
            tracing::warn!(job_id = %info.job_id, "result for job no longer registered");
            return;
        };

        if result.success {
            self.metrics.record_usage(&info.metrics, &result.usage);
        } else {
            self.metrics
                .record_failure(&info.metrics, result.error.as_deref().unwrap_or("unknown error"));
        }

        let ctx = self.job_context(handle.cancel.clone());
        let next_units = {
            let mut job = handle.job.lock().await;
            job.on_complete(&ctx, result).await
        };

        match next_units {
            Ok(units) => {
                if let Err(e) = self.route(&info.job_id, units, handle.cancel.clone()) {
                    tracing::warn!(job_id = %info.job_id, error = %e, "failed to route follow-up work units");
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %info.job_id, error = %e, "job on_complete returned error");
            }
        }

        self.finish_if_done(&info.job_id, &handle).await;
    }
}
