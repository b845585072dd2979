//! In-memory registry mapping an in-flight work-unit id back to the job
//! that issued it, so a completed work unit can be routed back to the
//! job that's waiting on it.

use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

/// Thread-safe `work_unit_id -> T` map. `T` carries whatever the
/// scheduler needs to route a result back to its job (just the job id,
/// in practice).
pub struct WorkUnitTracker<T: Clone> {
    inner: RwLock<HashMap<Uuid, T>>,
}

impl<T: Clone> Default for WorkUnitTracker<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone> WorkUnitTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, info: T) {
        self.inner.write().insert(id, info);
    }

    pub fn get(&self, id: &Uuid) -> Option<T> {
        self.inner.read().get(id).cloned()
    }

    pub fn remove(&self, id: &Uuid) {
        self.inner.write().remove(id);
    }

    pub fn get_and_remove(&self, id: &Uuid) -> Option<T> {
        self.inner.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_get_and_remove_clears_entry() {
        let tracker: WorkUnitTracker<String> = WorkUnitTracker::new();
        let id = Uuid::new_v4();
        tracker.register(id, "job-1".to_string());
        assert_eq!(tracker.get(&id), Some("job-1".to_string()));
        assert_eq!(tracker.get_and_remove(&id), Some("job-1".to_string()));
        assert_eq!(tracker.get(&id), None);
    }

    #[test]
    fn unknown_id_returns_none() {
        let tracker: WorkUnitTracker<String> = WorkUnitTracker::new();
        assert_eq!(tracker.get(&Uuid::new_v4()), None);
    }
}
