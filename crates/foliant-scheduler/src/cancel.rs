//! Per-job cancellation flags: a plain atomic bool checked at call sites
//! rather than a future-based preemption mechanism, so in-flight external
//! calls are never torn down mid-flight — only admission of the *next*
//! unit is refused once a job is marked cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Job-id keyed registry of `CancelToken`s, with group fan-out: cancelling
/// a group (e.g. a book id) cancels every job registered under it.
#[derive(Default)]
pub struct CancelMap {
    by_job: RwLock<HashMap<String, CancelToken>>,
    groups: RwLock<HashMap<String, Vec<String>>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_id: &str, group: Option<&str>) -> CancelToken {
        let token = CancelToken::new();
        self.by_job.write().insert(job_id.to_string(), token.clone());
        if let Some(group) = group {
            self.groups
                .write()
                .entry(group.to_string())
                .or_default()
                .push(job_id.to_string());
        }
        token
    }

    pub fn get(&self, job_id: &str) -> Option<CancelToken> {
        self.by_job.read().get(job_id).cloned()
    }

    pub fn cancel_job(&self, job_id: &str) {
        if let Some(token) = self.by_job.read().get(job_id) {
            token.cancel();
        }
    }

    pub fn cancel_group(&self, group: &str) {
        if let Some(job_ids) = self.groups.read().get(group) {
            let by_job = self.by_job.read();
            for job_id in job_ids {
                if let Some(token) = by_job.get(job_id) {
                    token.cancel();
                }
            }
        }
    }

    pub fn remove(&self, job_id: &str) {
        self.by_job.write().remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_group_cancels_every_member() {
        let map = CancelMap::new();
        let a = map.register("job-a", Some("book-1"));
        let b = map.register("job-b", Some("book-1"));
        let c = map.register("job-c", Some("book-2"));

        map.cancel_group("book-1");

        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(!c.is_cancelled());
    }

    #[test]
    fn cancel_job_only_affects_that_job() {
        let map = CancelMap::new();
        let a = map.register("job-a", None);
        let b = map.register("job-b", None);
        map.cancel_job("job-a");
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
    }
}
