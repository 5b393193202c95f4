use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::job::JobId;

/// Default number of concurrently running jobs allowed per owner.
pub const DEFAULT_PER_OWNER_LIMIT: usize = 10;

/// Per-owner and global slot accounting for running jobs.
///
/// Each owner's slot set sits behind its own mutex reached through a registry
/// map, so unrelated owners never serialize on one lock. The global count is
/// an atomic reserved before the owner check and rolled back on refusal, so
/// the global limit is never exceeded even under concurrent acquisition.
pub struct ConcurrencyController {
    per_owner_limit: usize,
    global_limit: Option<usize>,
    global_running: AtomicUsize,
    owners: Mutex<HashMap<String, Arc<Mutex<HashSet<JobId>>>>>,
}

impl ConcurrencyController {
    pub fn new(per_owner_limit: usize, global_limit: Option<usize>) -> Self {
        Self {
            per_owner_limit,
            global_limit,
            global_running: AtomicUsize::new(0),
            owners: Mutex::new(HashMap::new()),
        }
    }

    fn owner_slots(&self, owner_id: &str) -> Arc<Mutex<HashSet<JobId>>> {
        let mut owners = self.owners.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            owners
                .entry(owner_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(HashSet::new()))),
        )
    }

    fn reserve_global(&self) -> bool {
        match self.global_limit {
            Some(limit) => self
                .global_running
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    if n < limit {
                        Some(n + 1)
                    } else {
                        None
                    }
                })
                .is_ok(),
            None => {
                self.global_running.fetch_add(1, Ordering::SeqCst);
                true
            }
        }
    }

    fn unreserve_global(&self) {
        self.global_running.fetch_sub(1, Ordering::SeqCst);
    }

    /// Claim a slot for the job. Returns false when the owner or global
    /// limit is reached. Re-acquiring a slot the job already holds succeeds
    /// without claiming a second one.
    pub fn try_acquire(&self, owner_id: &str, job_id: &JobId) -> bool {
        if !self.reserve_global() {
            debug!(owner_id, job_id = %job_id, "Global slot limit reached");
            return false;
        }

        let slots = self.owner_slots(owner_id);
        let mut slots = slots.lock().unwrap_or_else(|e| e.into_inner());

        if slots.contains(job_id) {
            self.unreserve_global();
            return true;
        }

        if slots.len() >= self.per_owner_limit {
            drop(slots);
            self.unreserve_global();
            debug!(owner_id, job_id = %job_id, "Owner slot limit reached");
            return false;
        }

        slots.insert(job_id.clone());
        true
    }

    /// Release the job's slot. Idempotent: a duplicate release is a no-op.
    pub fn release(&self, owner_id: &str, job_id: &JobId) {
        let slots = self.owner_slots(owner_id);
        let mut slots = slots.lock().unwrap_or_else(|e| e.into_inner());

        if slots.remove(job_id) {
            self.unreserve_global();
            debug!(owner_id, job_id = %job_id, "Slot released");
        }
    }

    pub fn owner_running(&self, owner_id: &str) -> usize {
        let slots = self.owner_slots(owner_id);
        let slots = slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.len()
    }

    pub fn global_running(&self) -> usize {
        self.global_running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn grants_up_to_the_owner_limit() {
        let controller = ConcurrencyController::new(2, None);

        let a = JobId::new();
        let b = JobId::new();
        let c = JobId::new();

        assert!(controller.try_acquire("u1", &a));
        assert!(controller.try_acquire("u1", &b));
        assert!(!controller.try_acquire("u1", &c));
        assert_eq!(controller.owner_running("u1"), 2);

        // Another owner is unaffected
        assert!(controller.try_acquire("u2", &c));
    }

    #[test]
    fn release_is_idempotent() {
        let controller = ConcurrencyController::new(1, None);
        let job = JobId::new();

        assert!(controller.try_acquire("u1", &job));
        controller.release("u1", &job);
        controller.release("u1", &job);

        assert_eq!(controller.owner_running("u1"), 0);
        assert_eq!(controller.global_running(), 0);

        // Slot is usable again after release
        assert!(controller.try_acquire("u1", &job));
    }

    #[test]
    fn reacquire_does_not_double_count() {
        let controller = ConcurrencyController::new(1, None);
        let job = JobId::new();

        assert!(controller.try_acquire("u1", &job));
        assert!(controller.try_acquire("u1", &job));
        assert_eq!(controller.owner_running("u1"), 1);
        assert_eq!(controller.global_running(), 1);
    }

    #[test]
    fn global_limit_caps_across_owners() {
        let controller = ConcurrencyController::new(10, Some(3));

        let jobs: Vec<JobId> = (0..4).map(|_| JobId::new()).collect();
        assert!(controller.try_acquire("u1", &jobs[0]));
        assert!(controller.try_acquire("u2", &jobs[1]));
        assert!(controller.try_acquire("u3", &jobs[2]));
        assert!(!controller.try_acquire("u4", &jobs[3]));

        controller.release("u2", &jobs[1]);
        assert!(controller.try_acquire("u4", &jobs[3]));
    }

    #[test]
    fn refused_acquire_rolls_back_the_global_reservation() {
        let controller = ConcurrencyController::new(1, Some(5));
        let a = JobId::new();
        let b = JobId::new();

        assert!(controller.try_acquire("u1", &a));
        assert!(!controller.try_acquire("u1", &b));
        assert_eq!(controller.global_running(), 1);
    }

    #[test]
    fn concurrent_acquires_never_exceed_the_limit() {
        let controller = Arc::new(ConcurrencyController::new(10, None));

        let handles: Vec<_> = (0..11)
            .map(|_| {
                let controller = Arc::clone(&controller);
                thread::spawn(move || controller.try_acquire("u1", &JobId::new()))
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();

        assert_eq!(granted, 10);
        assert_eq!(controller.owner_running("u1"), 10);
    }
}
