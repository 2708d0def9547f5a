//! Dependency manager: parks jobs waiting on another job's terminal status,
//! wakes them on notification. Holds only job ids, never job data — the
//! façade in `queue.rs` owns the jobs themselves.

use dashmap::{DashMap, DashSet};

use crate::job::JobStatus;
use crate::opcode::{Dependency, JobStatusTag};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepOutcome {
    Continue,
    Wait,
    Cancel,
    WrongStatus(String),
    Error(String),
}

fn tag_for(status: JobStatus) -> Option<JobStatusTag> {
    match status {
        JobStatus::Success => Some(JobStatusTag::Success),
        JobStatus::Error => Some(JobStatusTag::Error),
        JobStatus::Canceled => Some(JobStatusTag::Canceled),
        _ => None,
    }
}

/// `QueueLock` must be held (at least shared) by the caller before calling
/// into this manager, and the acquire order is always `QueueLock` then
/// `DepMgrLock` — this type's internal lock never outlives a single method
/// call, so that ordering is automatic as long as callers don't call back
/// into the queue from inside a closure passed here.
pub struct DependencyManager {
    waiters: DashMap<u64, DashSet<u64>>,
}

impl DependencyManager {
    pub fn new() -> Self {
        DependencyManager { waiters: DashMap::new() }
    }

    /// Evaluate one dependency for `job_id`. `lookup` resolves the current
    /// derived status of another job; returning `None` means "job not
    /// found", which is always an error.
    pub fn check_and_register<F>(&self, job_id: u64, dep: &Dependency, lookup: F) -> DepOutcome
    where
        F: FnOnce(u64) -> Option<JobStatus>,
    {
        if dep.job_id == job_id {
            return DepOutcome::Error(format!("job {job_id} depends on itself"));
        }

        let status = match lookup(dep.job_id) {
            Some(s) => s,
            None => return DepOutcome::Error(format!("dependency job {} not found", dep.job_id)),
        };

        if !status.is_terminal() {
            self.waiters.entry(dep.job_id).or_default().insert(job_id);
            return DepOutcome::Wait;
        }

        self.remove_waiter(dep.job_id, job_id);

        if status == JobStatus::Canceled && !dep.allowed.contains(&JobStatusTag::Canceled) {
            return DepOutcome::Cancel;
        }

        match tag_for(status) {
            Some(tag) if dep.allowed.is_empty() || dep.allowed.contains(&tag) => DepOutcome::Continue,
            _ => DepOutcome::WrongStatus(format!(
                "job {} finished with status '{}'",
                dep.job_id, status
            )),
        }
    }

    /// Remove and return every job id parked on `dep_job_id`. Must only be
    /// called after the caller has observed `dep_job_id`'s processor return
    /// FINISHED.
    pub fn notify_waiters(&self, dep_job_id: u64) -> Vec<u64> {
        match self.waiters.remove(&dep_job_id) {
            Some((_, set)) => set.into_iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn job_waiting(&self, job_id: u64) -> bool {
        self.waiters.iter().any(|entry| entry.value().contains(&job_id))
    }

    fn remove_waiter(&self, dep_job_id: u64, job_id: u64) {
        if let Some(set) = self.waiters.get(&dep_job_id) {
            set.remove(&job_id);
        }
    }
}

impl Default for DependencyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(job_id: u64, allowed: Vec<JobStatusTag>) -> Dependency {
        Dependency { job_id, allowed }
    }

    #[test]
    fn self_dependency_is_an_error() {
        let mgr = DependencyManager::new();
        let outcome = mgr.check_and_register(1, &dep(1, vec![]), |_| Some(JobStatus::Success));
        assert_eq!(outcome, DepOutcome::Error("job 1 depends on itself".into()));
    }

    #[test]
    fn unknown_dependency_is_an_error() {
        let mgr = DependencyManager::new();
        let outcome = mgr.check_and_register(1, &dep(2, vec![]), |_| None);
        assert_eq!(outcome, DepOutcome::Error("dependency job 2 not found".into()));
    }

    #[test]
    fn non_terminal_dependency_parks_the_job() {
        let mgr = DependencyManager::new();
        let outcome = mgr.check_and_register(1, &dep(2, vec![]), |_| Some(JobStatus::Running));
        assert_eq!(outcome, DepOutcome::Wait);
        assert!(mgr.job_waiting(1));
    }

    #[test]
    fn empty_allowed_list_accepts_any_terminal_status() {
        let mgr = DependencyManager::new();
        let outcome = mgr.check_and_register(1, &dep(2, vec![]), |_| Some(JobStatus::Error));
        assert_eq!(outcome, DepOutcome::Continue);
    }

    #[test]
    fn wrong_status_when_not_in_allowed_list() {
        let mgr = DependencyManager::new();
        let outcome = mgr.check_and_register(
            1,
            &dep(2, vec![JobStatusTag::Success]),
            |_| Some(JobStatus::Error),
        );
        assert_eq!(
            outcome,
            DepOutcome::WrongStatus("job 2 finished with status 'error'".into())
        );
    }

    #[test]
    fn canceled_dependency_cancels_unless_allowed() {
        let mgr = DependencyManager::new();
        let outcome = mgr.check_and_register(1, &dep(2, vec![]), |_| Some(JobStatus::Canceled));
        assert_eq!(outcome, DepOutcome::Cancel);

        let outcome = mgr.check_and_register(
            1,
            &dep(2, vec![JobStatusTag::Canceled]),
            |_| Some(JobStatus::Canceled),
        );
        assert_eq!(outcome, DepOutcome::Continue);
    }

    #[test]
    fn notify_waiters_drains_and_clears() {
        let mgr = DependencyManager::new();
        mgr.check_and_register(1, &dep(2, vec![]), |_| Some(JobStatus::Running));
        mgr.check_and_register(3, &dep(2, vec![]), |_| Some(JobStatus::Running));
        let mut woken = mgr.notify_waiters(2);
        woken.sort();
        assert_eq!(woken, vec![1, 3]);
        assert!(mgr.notify_waiters(2).is_empty());
        assert!(!mgr.job_waiting(1));
    }
}
