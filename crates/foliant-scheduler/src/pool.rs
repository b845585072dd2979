//! Worker pools: one per external collaborator, each owning its own
//! concurrency limit and pacing. A pool dispatches a task onto a bounded
//! worker set and reports the result back over a channel instead of
//! blocking the caller.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use foliant_domain::config::PoolConfig;
use foliant_domain::{UsageInfo, WorkRequest, WorkResult, WorkUnit};
use foliant_providers::{CpuExecutor, LlmProvider, OcrProvider, SharedRateLimiter};
use tokio::sync::{mpsc, Semaphore};

use crate::cancel::CancelToken;

/// Turns a provider's raw error string into a pool-level classification:
/// a `"retryable:"`/`"transient:"` prefix means the caller should retry,
/// anything else is permanent.
fn classify(raw: String) -> String {
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("retryable:") || lower.starts_with("transient:") {
        raw
    } else if lower.starts_with("permanent:") {
        raw
    } else {
        format!("permanent: {raw}")
    }
}

/// A named pool of admission-controlled capacity for one external
/// collaborator. `submit` is non-blocking: it enqueues a spawned task and
/// returns immediately, replying on the given channel once the call
/// finishes.
pub trait Pool: Send + Sync {
    fn name(&self) -> &str;

    fn submit(&self, unit: WorkUnit, cancel: Option<CancelToken>, reply: mpsc::Sender<WorkResult>);

    fn inflight(&self) -> usize;

    /// Units that have been submitted but not yet admitted past this
    /// pool's concurrency/rate limiter.
    fn queue_depth(&self) -> usize;

    /// Whether `queue_depth` has reached this pool's configured
    /// `high_water_mark`.
    fn is_backpressured(&self) -> bool;
}

struct Admission {
    semaphore: Arc<Semaphore>,
    rate_limiter: SharedRateLimiter,
    inflight: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
    high_water_mark: usize,
}

impl Admission {
    fn new(config: &PoolConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            rate_limiter: Arc::new(foliant_providers::RateLimiter::new(config.requests_per_second)),
            inflight: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
            high_water_mark: config.high_water_mark,
        }
    }

    fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    fn is_backpressured(&self) -> bool {
        self.queue_depth() >= self.high_water_mark
    }
}

pub struct LlmPool {
    name: String,
    provider: Arc<dyn LlmProvider>,
    admission: Admission,
}

impl LlmPool {
    /// `config.name` is ignored here: an `LlmPool` is keyed by the
    /// provider's own name, since that's what `WorkUnit::provider`
    /// addresses it by.
    pub fn new(provider: Arc<dyn LlmProvider>, config: PoolConfig) -> Self {
        Self {
            name: provider.name().to_string(),
            provider,
            admission: Admission::new(&config),
        }
    }
}

impl Pool for LlmPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, unit: WorkUnit, cancel: Option<CancelToken>, reply: mpsc::Sender<WorkResult>) {
        let provider = self.provider.clone();
        let semaphore = self.admission.semaphore.clone();
        let rate_limiter = self.admission.rate_limiter.clone();
        let inflight = self.admission.inflight.clone();
        let queued = self.admission.queued.clone();
        queued.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            rate_limiter.acquire().await;
            queued.fetch_sub(1, Ordering::SeqCst);

            if cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                let _ = reply.send(WorkResult::err(unit.id, "canceled")).await;
                return;
            }

            inflight.fetch_add(1, Ordering::SeqCst);
            let started = std::time::Instant::now();
            let result = match &unit.request {
                WorkRequest::Chat(req) => provider.chat(req).await,
                _ => Err("permanent: llm pool received a non-chat request".to_string()),
            };
            inflight.fetch_sub(1, Ordering::SeqCst);

            let latency_ms = started.elapsed().as_millis() as u64;
            let work_result = match result {
                Ok(chat_result) => WorkResult::ok(
                    unit.id,
                    foliant_domain::WorkPayload::Chat(chat_result),
                    UsageInfo {
                        latency_ms,
                        ..Default::default()
                    },
                ),
                Err(e) => WorkResult::err(unit.id, classify(e)),
            };
            let _ = reply.send(work_result).await;
        });
    }

    fn inflight(&self) -> usize {
        self.admission.inflight.load(Ordering::SeqCst)
    }

    fn queue_depth(&self) -> usize {
        self.admission.queue_depth()
    }

    fn is_backpressured(&self) -> bool {
        self.admission.is_backpressured()
    }
}

pub struct OcrPool {
    name: String,
    provider: Arc<dyn OcrProvider>,
    admission: Admission,
}

impl OcrPool {
    pub fn new(provider: Arc<dyn OcrProvider>, config: PoolConfig) -> Self {
        Self {
            name: config.name.clone(),
            provider,
            admission: Admission::new(&config),
        }
    }
}

impl Pool for OcrPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, unit: WorkUnit, cancel: Option<CancelToken>, reply: mpsc::Sender<WorkResult>) {
        let provider = self.provider.clone();
        let semaphore = self.admission.semaphore.clone();
        let rate_limiter = self.admission.rate_limiter.clone();
        let inflight = self.admission.inflight.clone();
        let queued = self.admission.queued.clone();
        queued.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            rate_limiter.acquire().await;
            queued.fetch_sub(1, Ordering::SeqCst);

            if cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                let _ = reply.send(WorkResult::err(unit.id, "canceled")).await;
                return;
            }

            inflight.fetch_add(1, Ordering::SeqCst);
            let started = std::time::Instant::now();
            let result = match &unit.request {
                WorkRequest::Ocr(req) => provider.recognize(req).await,
                _ => Err("permanent: ocr pool received a non-ocr request".to_string()),
            };
            inflight.fetch_sub(1, Ordering::SeqCst);

            let latency_ms = started.elapsed().as_millis() as u64;
            let work_result = match result {
                Ok(ocr_result) => WorkResult::ok(
                    unit.id,
                    foliant_domain::WorkPayload::Ocr(ocr_result),
                    UsageInfo {
                        latency_ms,
                        ..Default::default()
                    },
                ),
                Err(e) => WorkResult::err(unit.id, classify(e)),
            };
            let _ = reply.send(work_result).await;
        });
    }

    fn inflight(&self) -> usize {
        self.admission.inflight.load(Ordering::SeqCst)
    }

    fn queue_depth(&self) -> usize {
        self.admission.queue_depth()
    }

    fn is_backpressured(&self) -> bool {
        self.admission.is_backpressured()
    }
}

pub struct CpuPool {
    name: String,
    executor: Arc<dyn CpuExecutor>,
    admission: Admission,
}

impl CpuPool {
    /// CPU work is local; no external rate limit applies, but `config`'s
    /// `requests_per_second` still paces it through the same admission
    /// primitive so one misconfigured job can't starve the runtime —
    /// callers typically build `PoolConfig` for a CPU pool with a
    /// generous rate.
    pub fn new(executor: Arc<dyn CpuExecutor>, config: PoolConfig) -> Self {
        Self {
            name: config.name.clone(),
            executor,
            admission: Admission::new(&config),
        }
    }
}

impl Pool for CpuPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, unit: WorkUnit, cancel: Option<CancelToken>, reply: mpsc::Sender<WorkResult>) {
        let executor = self.executor.clone();
        let semaphore = self.admission.semaphore.clone();
        let inflight = self.admission.inflight.clone();
        let queued = self.admission.queued.clone();
        queued.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            queued.fetch_sub(1, Ordering::SeqCst);

            if cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                let _ = reply.send(WorkResult::err(unit.id, "canceled")).await;
                return;
            }

            inflight.fetch_add(1, Ordering::SeqCst);
            let started = std::time::Instant::now();
            let result = match &unit.request {
                WorkRequest::Cpu(req) => executor.execute(req).await,
                _ => Err("permanent: cpu pool received a non-cpu request".to_string()),
            };
            inflight.fetch_sub(1, Ordering::SeqCst);

            let latency_ms = started.elapsed().as_millis() as u64;
            let work_result = match result {
                Ok(cpu_result) => WorkResult::ok(
                    unit.id,
                    foliant_domain::WorkPayload::Cpu(cpu_result),
                    UsageInfo {
                        latency_ms,
                        ..Default::default()
                    },
                ),
                Err(e) => WorkResult::err(unit.id, classify(e)),
            };
            let _ = reply.send(work_result).await;
        });
    }

    fn inflight(&self) -> usize {
        self.admission.inflight.load(Ordering::SeqCst)
    }

    fn queue_depth(&self) -> usize {
        self.admission.queue_depth()
    }

    fn is_backpressured(&self) -> bool {
        self.admission.is_backpressured()
    }
}
