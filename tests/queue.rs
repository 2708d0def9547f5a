//! End-to-end scenarios driving the queue as a library, in-process, with a
//! scripted [`OpcodeExecutor`] standing in for the external collaborator.
//! Uses `tempfile::TempDir` for an isolated queue directory per test.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use clusterjobd::config::QueueConfig;
use clusterjobd::executor::{ExecCallbacks, ExecOutcome, NoopExecutor, OpcodeExecutor};
use clusterjobd::job::JobStatus;
use clusterjobd::opcode::{Dependency, JobStatusTag, OpCode};
use clusterjobd::queue::Queue;

fn test_config(dir: &std::path::Path) -> QueueConfig {
    let mut config = QueueConfig::default();
    config.queue_dir = Some(dir.to_path_buf());
    config.threads = 2;
    config
}

fn wait_until<F: FnMut() -> bool>(deadline: Duration, mut predicate: F) -> bool {
    let stop = Instant::now() + deadline;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= stop {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

// Scenario 1: single opcode success.
#[test]
fn single_opcode_job_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Queue::open(test_config(dir.path()), Arc::new(NoopExecutor)).unwrap();

    let id = queue.submit_job(vec![OpCode::new(serde_json::json!({"op": "noop"}))]).unwrap();
    assert_eq!(id, 1);

    assert!(wait_until(Duration::from_secs(5), || {
        queue.job_status(id) == Some(JobStatus::Success)
    }));

    queue.shutdown();
}

struct BlockingExecutor {
    gate: Arc<(Mutex<bool>, Condvar)>,
}

impl OpcodeExecutor for BlockingExecutor {
    fn exec(&self, _input: &serde_json::Value, callbacks: &ExecCallbacks, _timeout: Option<Duration>) -> ExecOutcome {
        let (lock, cvar) = &*self.gate;
        let mut proceed = lock.lock().unwrap();
        while !*proceed {
            if callbacks.cancel_requested() {
                return ExecOutcome::Cancel;
            }
            let (guard, _) = cvar.wait_timeout(proceed, Duration::from_millis(10)).unwrap();
            proceed = guard;
        }
        callbacks.notify_start();
        ExecOutcome::Success(None)
    }
}

// Scenario 2: cancel before start.
#[test]
fn cancel_while_waiting_ends_canceled() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new((Mutex::new(false), Condvar::new()));
    let queue = Queue::open(test_config(dir.path()), Arc::new(BlockingExecutor { gate: gate.clone() })).unwrap();

    let id = queue.submit_job(vec![OpCode::new(serde_json::json!({}))]).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        queue.job_status(id) == Some(JobStatus::Waiting)
    }));

    let (ok, message) = queue.cancel_job(id);
    assert!(ok);
    assert_eq!(message, format!("Job {id} will be canceled"));

    assert!(wait_until(Duration::from_secs(5), || {
        queue.job_status(id) == Some(JobStatus::Canceled)
    }));

    queue.shutdown();
}

struct AlwaysLockTimeoutExecutor {
    calls: AtomicUsize,
}

impl OpcodeExecutor for AlwaysLockTimeoutExecutor {
    fn exec(&self, _input: &serde_json::Value, _callbacks: &ExecCallbacks, _timeout: Option<Duration>) -> ExecOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ExecOutcome::LockTimeout
    }
}

// Scenario 3: priority raise once the backoff schedule is exhausted.
#[test]
fn lock_timeout_exhaustion_raises_priority() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.backoff_schedule = vec![0.01, 0.01];
    let executor = Arc::new(AlwaysLockTimeoutExecutor { calls: AtomicUsize::new(0) });
    let queue = Queue::open(config, executor.clone()).unwrap();

    let id = queue
        .submit_job(vec![OpCode::new(serde_json::json!({})).with_priority(-10)])
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        queue.job_priority(id).map(|p| p < -10).unwrap_or(false)
    }));

    queue.shutdown();
}

// Scenario 4: dependency CONTINUE — B waits for A's success.
#[test]
fn dependency_continues_after_success() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Queue::open(test_config(dir.path()), Arc::new(NoopExecutor)).unwrap();

    let a = queue.submit_job(vec![OpCode::new(serde_json::json!({}))]).unwrap();
    assert!(wait_until(Duration::from_secs(5), || queue.job_status(a) == Some(JobStatus::Success)));

    let dep = Dependency { job_id: a, allowed: vec![JobStatusTag::Success] };
    let b_op = OpCode::new(serde_json::json!({})).with_dependency(dep);
    let b = queue.submit_job(vec![b_op]).unwrap();

    assert!(wait_until(Duration::from_secs(5), || queue.job_status(b) == Some(JobStatus::Success)));

    queue.shutdown();
}

struct FailFirstExecutor;

impl OpcodeExecutor for FailFirstExecutor {
    fn exec(&self, input: &serde_json::Value, callbacks: &ExecCallbacks, _timeout: Option<Duration>) -> ExecOutcome {
        callbacks.notify_start();
        if input.get("fail").and_then(|v| v.as_bool()).unwrap_or(false) {
            ExecOutcome::Error("boom".into())
        } else {
            ExecOutcome::Success(None)
        }
    }
}

// Scenario 5: dependency WRONGSTATUS — B's opcode fails with a message
// naming A's actual terminal status.
#[test]
fn dependency_on_failed_job_reports_wrong_status() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Queue::open(test_config(dir.path()), Arc::new(FailFirstExecutor)).unwrap();

    let a = queue.submit_job(vec![OpCode::new(serde_json::json!({"fail": true}))]).unwrap();
    assert!(wait_until(Duration::from_secs(5), || queue.job_status(a) == Some(JobStatus::Error)));

    let dep = Dependency { job_id: a, allowed: vec![JobStatusTag::Success] };
    let b_op = OpCode::new(serde_json::json!({})).with_dependency(dep);
    let b = queue.submit_job(vec![b_op]).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        queue.job_status(b) == Some(JobStatus::Error)
    }));

    let snapshot = queue.query_jobs(|s| s.id == b);
    assert_eq!(snapshot.len(), 1);

    queue.shutdown();
}

// Scenario 6: crash recovery — a job file left behind with its current
// opcode still RUNNING (as an unclean process exit would leave it) is
// reconciled to an error on the next open instead of hanging forever.
#[test]
fn recovers_unclean_shutdown_on_open() {
    use clusterjobd::job::Job;
    use clusterjobd::opcode::OpStatus;

    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path()).unwrap();

    let mut job = Job::new(1, vec![OpCode::new(serde_json::json!({}))]);
    job.ops[0].status = OpStatus::Running;
    let bytes = serde_json::to_vec_pretty(&job.to_record()).unwrap();
    std::fs::write(dir.path().join("job-1"), bytes).unwrap();
    std::fs::write(dir.path().join("serial"), "1\n").unwrap();

    let recovered = Queue::open(test_config(dir.path()), Arc::new(NoopExecutor)).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        recovered.job_status(1).map(|s| s.is_terminal()).unwrap_or(false)
    }));
    assert_eq!(recovered.job_status(1), Some(JobStatus::Error));
    recovered.shutdown();
}

// Self-dependency is always rejected.
#[test]
fn queue_size_hard_limit_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.queue_size_hard_limit = 1;
    let gate = Arc::new((Mutex::new(false), Condvar::new()));
    let queue = Queue::open(config, Arc::new(BlockingExecutor { gate })).unwrap();

    queue.submit_job(vec![OpCode::new(serde_json::json!({}))]).unwrap();
    let err = queue.submit_job(vec![OpCode::new(serde_json::json!({}))]).unwrap_err();
    assert!(matches!(err, clusterjobd::error::QueueError::JobQueueFull { .. }));

    queue.shutdown();
}

#[test]
fn archived_job_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Queue::open(test_config(dir.path()), Arc::new(NoopExecutor)).unwrap();
    let id = queue.submit_job(vec![OpCode::new(serde_json::json!({}))]).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        queue.job_status(id).map(|s| s.is_terminal()).unwrap_or(false)
    }));
    assert!(queue.archive_job(id).unwrap());
    assert!(!queue.archive_job(id).unwrap());
    queue.shutdown();
}

#[test]
fn second_master_cannot_open_same_queue_dir() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Queue::open(test_config(dir.path()), Arc::new(NoopExecutor)).unwrap();
    let second = Queue::open(test_config(dir.path()), Arc::new(NoopExecutor));
    assert!(second.is_err());
    queue.shutdown();
}
