//! The public façade: submit, cancel, reprioritize, archive, query, wait and
//! drain/shutdown, plus startup recovery.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::depmgr::DependencyManager;
use crate::error::QueueError;
use crate::executor::OpcodeExecutor;
use crate::job::{Job, JobRecord, JobStatus, MarkReason};
use crate::notifier::ChangeNotifier;
use crate::opcode::{LogLevel, OpCode, OpStatus, PRIO_HIGHEST};
use crate::persist::{atomic_write, Replicator};
use crate::pool::{TaskOutcome, WorkerPool};
use crate::processor::{self, ProcessResult, TimeoutStrategy};
use crate::serial::SerialAllocator;

/// A read-only projection of a job, cheap to clone, used for queries and
/// the wait-for-changes comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub id: u64,
    pub status: JobStatus,
    pub log_serial: u64,
    pub received_timestamp: crate::timestamp::Timestamp,
    pub start_timestamp: Option<crate::timestamp::Timestamp>,
    pub end_timestamp: Option<crate::timestamp::Timestamp>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        JobSnapshot {
            id: job.id,
            status: job.derived_status(),
            log_serial: job.log_serial,
            received_timestamp: job.received_timestamp,
            start_timestamp: job.start_timestamp,
            end_timestamp: job.end_timestamp,
        }
    }
}

pub enum WaitOutcome {
    Changed(JobSnapshot),
    NotChanged,
    Gone,
}

pub struct Queue {
    queue_dir: PathBuf,
    archive_dir: PathBuf,
    config: QueueConfig,
    state_lock: RwLock<()>,
    jobs: DashMap<u64, Arc<Mutex<Job>>>,
    serial: SerialAllocator,
    replicator: Replicator,
    notifier: ChangeNotifier,
    depmgr: DependencyManager,
    pool: Mutex<Option<WorkerPool>>,
    drained: AtomicBool,
    shutting_down: AtomicBool,
    executor: Arc<dyn OpcodeExecutor>,
    timeout_strategies: DashMap<u64, TimeoutStrategy>,
    lock_file: Mutex<Option<File>>,
}

impl Queue {
    /// Open (or create) a queue directory, recover any jobs left mid-flight
    /// by an unclean shutdown, acquire the advisory master lock, and start
    /// the worker pool.
    pub fn open(config: QueueConfig, executor: Arc<dyn OpcodeExecutor>) -> anyhow::Result<Arc<Queue>> {
        let queue_dir = config.queue_dir();
        std::fs::create_dir_all(&queue_dir)?;
        let archive_dir = queue_dir.join("archive");
        std::fs::create_dir_all(&archive_dir)?;

        let lock_file = acquire_master_lock(&queue_dir)?;

        let replicator = if config.peer_nodes.is_empty() {
            Replicator::none()
        } else {
            Replicator::new(config.peer_nodes.clone(), Box::new(crate::persist::NoopRpcRunner))
        };

        let drained = queue_dir.join("queue.drained").exists();

        let queue = Arc::new(Queue {
            serial: SerialAllocator::new(&queue_dir),
            queue_dir,
            archive_dir,
            config,
            state_lock: RwLock::new(()),
            jobs: DashMap::new(),
            replicator,
            notifier: ChangeNotifier::new(),
            depmgr: DependencyManager::new(),
            pool: Mutex::new(None),
            drained: AtomicBool::new(drained),
            shutting_down: AtomicBool::new(false),
            executor,
            timeout_strategies: DashMap::new(),
            lock_file: Mutex::new(Some(lock_file)),
        });

        let recovered = queue.inspect_queue()?;

        let threads = queue.config.threads;
        let dispatch_queue = Arc::downgrade(&queue);
        let pool = WorkerPool::start(threads, move |job_id| match dispatch_queue.upgrade() {
            Some(q) => q.run_processor_cycle(job_id),
            None => TaskOutcome::Done,
        });
        *queue.pool.lock().unwrap() = Some(pool);
        if let Some(pool) = &*queue.pool.lock().unwrap() {
            pool.add_many_tasks(recovered);
        }

        Ok(queue)
    }

    // ---- internals used by `processor::process` ----

    pub(crate) fn state_lock(&self) -> &RwLock<()> {
        &self.state_lock
    }

    pub(crate) fn job_cell(&self, id: u64) -> Option<Arc<Mutex<Job>>> {
        self.jobs.get(&id).map(|r| r.value().clone())
    }

    pub(crate) fn dep_manager(&self) -> &DependencyManager {
        &self.depmgr
    }

    pub(crate) fn executor(&self) -> &dyn OpcodeExecutor {
        self.executor.as_ref()
    }

    pub fn job_status(&self, id: u64) -> Option<JobStatus> {
        self.job_cell(id).map(|cell| cell.lock().unwrap().derived_status())
    }

    pub(crate) fn persist_job(&self, job: &Job) {
        self.persist_job_to(job, true);
    }

    fn persist_job_to(&self, job: &Job, replicate: bool) {
        let path = self.job_path(job.id, job.archived);
        let record = job.to_record();
        match serde_json::to_vec_pretty(&record) {
            Ok(bytes) => {
                if let Err(e) = self.replicator.update_file(&path, &bytes, replicate) {
                    warn!(job_id = job.id, error = %e, "failed to persist job");
                }
            }
            Err(e) => warn!(job_id = job.id, error = %e, "failed to serialize job"),
        }
    }

    fn job_path(&self, id: u64, archived: bool) -> PathBuf {
        if archived {
            self.archive_dir.join(shard_of(id)).join(format!("job-{id}"))
        } else {
            self.queue_dir.join(format!("job-{id}"))
        }
    }

    pub(crate) fn take_timeout_strategy(&self, id: u64) -> TimeoutStrategy {
        self.timeout_strategies
            .remove(&id)
            .map(|(_, s)| s)
            .unwrap_or_else(|| TimeoutStrategy::new(&self.config.backoff_schedule))
    }

    pub(crate) fn store_timeout_strategy(&self, id: u64, strategy: TimeoutStrategy) {
        self.timeout_strategies.insert(id, strategy);
    }

    pub(crate) fn clear_timeout_strategy(&self, id: u64) {
        self.timeout_strategies.remove(&id);
    }

    pub(crate) fn save_timeout_strategy_reset(&self, id: u64) {
        self.timeout_strategies.insert(id, TimeoutStrategy::new(&self.config.backoff_schedule));
    }

    pub(crate) fn notify_op_start(&self, job_id: u64, op_index: usize) {
        let Some(cell) = self.job_cell(job_id) else { return };
        let mut job = cell.lock().unwrap();
        if job.ops[op_index].status != OpStatus::Waiting {
            return;
        }
        job.ops[op_index].status = OpStatus::Running;
        job.ops[op_index].exec_timestamp = Some(crate::timestamp::Timestamp::now());
        self.persist_job_to(&job, true);
    }

    pub(crate) fn append_log(&self, job_id: u64, op_index: usize, level: LogLevel, message: &str) {
        let Some(cell) = self.job_cell(job_id) else { return };
        let mut job = cell.lock().unwrap();
        let serial = job.next_log_serial();
        job.ops[op_index].append_log(serial, level, message);
        self.persist_job_to(&job, false);
    }

    pub(crate) fn current_op_priority(&self, job_id: u64, op_index: usize) -> Option<i32> {
        let cell = self.job_cell(job_id)?;
        let job = cell.lock().unwrap();
        job.ops.get(op_index).map(|op| op.priority)
    }

    pub(crate) fn op_cancel_requested(&self, job_id: u64, op_index: usize) -> bool {
        let Some(cell) = self.job_cell(job_id) else { return false };
        let job = cell.lock().unwrap();
        job.ops.get(op_index).map(|op| op.status == OpStatus::Canceling).unwrap_or(false)
    }

    pub(crate) fn submit_many_from_callback(&self, many: Vec<Vec<OpCode>>) -> Vec<Result<u64, String>> {
        self.submit_many_jobs(many, false)
            .into_iter()
            .map(|r| r.map_err(|e| e.to_string()))
            .collect()
    }

    fn run_processor_cycle(self: Arc<Self>, job_id: u64) -> TaskOutcome {
        match processor::process(&self, job_id) {
            ProcessResult::Finished => {
                let woken = self.depmgr.notify_waiters(job_id);
                if !woken.is_empty() {
                    if let Some(pool) = &*self.pool.lock().unwrap() {
                        let items: Vec<(u64, i32)> = woken
                            .into_iter()
                            .filter_map(|id| self.job_cell(id).and_then(|cell| {
                                let job = cell.lock().unwrap();
                                job.current_op_index().map(|idx| (id, job.ops[idx].priority))
                            }))
                            .collect();
                        pool.add_many_tasks(items);
                    }
                }
                TaskOutcome::Done
            }
            ProcessResult::WaitDep => TaskOutcome::Done,
            ProcessResult::Defer(priority) => TaskOutcome::Requeue(priority),
        }
    }

    // ---- façade operations ----

    pub fn submit_job(&self, ops: Vec<OpCode>) -> Result<u64, QueueError> {
        self.submit_one(ops, false)
    }

    pub fn submit_job_to_drained_queue(&self, ops: Vec<OpCode>) -> Result<u64, QueueError> {
        self.submit_one(ops, true)
    }

    fn submit_one(&self, ops: Vec<OpCode>, bypass_drain: bool) -> Result<u64, QueueError> {
        self.submit_many_jobs(vec![ops], bypass_drain)
            .into_iter()
            .next()
            .unwrap_or_else(|| crate::error::bug("submit_many_jobs(1 item) returned no result"))
    }

    pub fn submit_many_jobs(
        &self,
        jobs: Vec<Vec<OpCode>>,
        bypass_drain: bool,
    ) -> Vec<Result<u64, QueueError>> {
        let _guard = self.state_lock.write().unwrap();

        if self.shutting_down.load(AtomicOrdering::SeqCst) {
            return jobs.iter().map(|_| Err(QueueError::JobQueueShuttingDown)).collect();
        }
        if !bypass_drain && self.drained.load(AtomicOrdering::SeqCst) {
            return jobs.iter().map(|_| Err(QueueError::JobQueueDrainError)).collect();
        }
        if self.jobs.len() + jobs.len() > self.config.queue_size_hard_limit {
            return jobs
                .iter()
                .map(|_| Err(QueueError::JobQueueFull {
                    current: self.jobs.len(),
                    limit: self.config.queue_size_hard_limit,
                }))
                .collect();
        }

        let ids = match self.serial.allocate(jobs.len() as u64, &self.replicator) {
            Ok(ids) => ids,
            Err(e) => return jobs.iter().map(|_| Err(QueueError::generic(e.to_string()))).collect(),
        };
        if ids.len() != jobs.len() {
            crate::error::bug(format!(
                "serial allocator returned {} ids for {} jobs",
                ids.len(),
                jobs.len()
            ));
        }

        let mut enqueue = Vec::with_capacity(jobs.len());
        let mut results = Vec::with_capacity(jobs.len());
        for (id, ops) in ids.into_iter().zip(jobs.into_iter()) {
            if ops.is_empty() {
                results.push(Err(QueueError::generic("a job must have at least one opcode")));
                continue;
            }
            let job = Job::new(id, ops);
            self.persist_job_to(&job, true);
            let priority = job.ops[0].priority;
            self.jobs.insert(id, Arc::new(Mutex::new(job)));
            enqueue.push((id, priority));
            results.push(Ok(id));
            info!(job_id = id, "job submitted");
        }

        if let Some(pool) = &*self.pool.lock().unwrap() {
            pool.add_many_tasks(enqueue);
        }

        results
    }

    pub fn cancel_job(&self, id: u64) -> (bool, String) {
        let Some(cell) = self.job_cell(id) else {
            return (false, QueueError::JobLost(id).to_string());
        };
        let mut job = cell.lock().unwrap();
        match job.derived_status() {
            JobStatus::Queued => {
                job.mark_unfinished_ops(MarkReason::Canceled);
                job.finalize();
                self.persist_job_to(&job, true);
                (true, format!("Job {id} canceled"))
            }
            JobStatus::Waiting => {
                if let Some(idx) = job.current_op_index() {
                    job.ops[idx].status = OpStatus::Canceling;
                }
                self.persist_job_to(&job, true);
                drop(job);
                if let Some(pool) = &*self.pool.lock().unwrap() {
                    pool.change_task_priority(id, PRIO_HIGHEST);
                }
                (true, format!("Job {id} will be canceled"))
            }
            status => (false, format!("Job {id} is in status '{status}', cannot be canceled")),
        }
    }

    pub fn change_job_priority(&self, id: u64, priority: i32) -> (bool, String) {
        let Some(cell) = self.job_cell(id) else {
            return (false, QueueError::JobLost(id).to_string());
        };
        let mut job = cell.lock().unwrap();
        if job.derived_status().is_terminal() {
            return (false, format!("Job {id} is already finished"));
        }
        for op in job.ops.iter_mut() {
            if !op.status.is_terminal() {
                op.priority = priority.clamp(crate::opcode::PRIO_HIGHEST, crate::opcode::PRIO_LOWEST);
            }
        }
        self.persist_job_to(&job, true);
        drop(job);
        if let Some(pool) = &*self.pool.lock().unwrap() {
            pool.change_task_priority(id, priority);
        }
        (true, format!("Job {id} priority changed to {priority}"))
    }

    pub fn archive_job(&self, id: u64) -> Result<bool, QueueError> {
        let _guard = self.state_lock.write().unwrap();
        let Some((_, cell)) = self.jobs.remove(&id) else {
            return Ok(false);
        };
        let mut job = cell.lock().unwrap();
        if !job.derived_status().is_terminal() {
            self.jobs.insert(id, cell.clone());
            return Err(QueueError::generic(format!("job {id} is not finished, cannot archive")));
        }
        if job.archived {
            return Ok(false);
        }
        let old_path = self.job_path(id, false);
        job.archived = true;
        let new_path = self.job_path(id, true);
        let record = job.to_record();
        let bytes = serde_json::to_vec_pretty(&record)
            .map_err(|e| QueueError::ProgrammerError(format!("job record {id} failed to serialize: {e}")))?;
        let new_parent = new_path.parent().unwrap_or_else(|| {
            crate::error::bug(format!("archive path {} has no parent directory", new_path.display()))
        });
        std::fs::create_dir_all(new_parent).map_err(|e| QueueError::generic(e.to_string()))?;
        // Persist the archived record in place, then rename atomically so the
        // job is never visible in both the queue and archive trees at once.
        atomic_write(&old_path, &bytes).map_err(|e| QueueError::generic(e.to_string()))?;
        self.replicator
            .rename_files(&[(old_path.clone(), new_path.clone())])
            .map_err(|e| QueueError::generic(e.to_string()))?;
        self.notifier.forget(&old_path);
        Ok(true)
    }

    /// Archive every terminal job whose `end_timestamp` is at least
    /// `age_secs` old. Stops once `timeout` has elapsed, returning how many
    /// jobs it archived and how many it left for next time.
    pub fn auto_archive_jobs(&self, age_secs: i64, timeout: Duration) -> (usize, usize) {
        let deadline = Instant::now() + timeout;
        let now = crate::timestamp::Timestamp::now();
        let candidates: Vec<u64> = self
            .jobs
            .iter()
            .filter_map(|entry| {
                let job = entry.value().lock().unwrap();
                let status = job.derived_status();
                let end = job.end_timestamp?;
                if status.is_terminal() && end.age_secs_since(&now) >= age_secs {
                    Some(job.id)
                } else {
                    None
                }
            })
            .collect();

        let mut archived = 0;
        let mut skipped = 0;
        for id in candidates {
            if Instant::now() >= deadline {
                skipped += 1;
                continue;
            }
            match self.archive_job(id) {
                Ok(true) => archived += 1,
                _ => skipped += 1,
            }
        }
        (archived, skipped)
    }

    pub fn query_jobs(&self, filter: impl Fn(&JobSnapshot) -> bool) -> Vec<JobSnapshot> {
        self.jobs
            .iter()
            .map(|entry| JobSnapshot::from(&*entry.value().lock().unwrap()))
            .filter(|snapshot| filter(snapshot))
            .collect()
    }

    /// Legacy-shaped query: look up a fixed list of ids, preserving order,
    /// `None` for anything missing.
    pub fn old_style_query_jobs(&self, ids: &[u64]) -> Vec<Option<JobSnapshot>> {
        ids.iter()
            .map(|id| self.job_cell(*id).map(|cell| JobSnapshot::from(&*cell.lock().unwrap())))
            .collect()
    }

    pub fn wait_for_job_changes(
        &self,
        id: u64,
        prev_status: Option<JobStatus>,
        prev_log_serial: u64,
        timeout: Duration,
    ) -> WaitOutcome {
        let Some(cell) = self.job_cell(id) else {
            return WaitOutcome::Gone;
        };
        let snapshot = JobSnapshot::from(&*cell.lock().unwrap());
        if Some(snapshot.status) != prev_status || snapshot.log_serial != prev_log_serial {
            return WaitOutcome::Changed(snapshot);
        }

        let path = self.job_path(id, false);
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WaitOutcome::NotChanged;
            }
            let changed = self.notifier.wait(&path, remaining);
            let Some(cell) = self.job_cell(id) else {
                return WaitOutcome::Gone;
            };
            let snapshot = JobSnapshot::from(&*cell.lock().unwrap());
            if Some(snapshot.status) != prev_status || snapshot.log_serial != prev_log_serial {
                return WaitOutcome::Changed(snapshot);
            }
            if !changed && Instant::now() >= deadline {
                return WaitOutcome::NotChanged;
            }
        }
    }

    pub fn set_drain_flag(&self, drained: bool) -> anyhow::Result<()> {
        let flag_path = self.queue_dir.join("queue.drained");
        if drained {
            self.replicator.update_file(&flag_path, b"", true)?;
        } else {
            let _ = std::fs::remove_file(&flag_path);
        }
        self.drained.store(drained, AtomicOrdering::SeqCst);
        Ok(())
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(AtomicOrdering::SeqCst)
    }

    /// Stop accepting new jobs and pause the pool. Returns whether any
    /// worker is still mid-task.
    pub fn prepare_shutdown(&self) -> bool {
        self.shutting_down.store(true, AtomicOrdering::SeqCst);
        if let Some(pool) = &*self.pool.lock().unwrap() {
            pool.set_active(false);
            return pool.has_running_tasks();
        }
        false
    }

    pub fn shutdown(&self) {
        if let Some(pool) = self.pool.lock().unwrap().take() {
            pool.terminate_workers();
        }
        if let Some(file) = self.lock_file.lock().unwrap().take() {
            let _ = file.unlock();
        }
        info!("queue shut down");
    }

    /// Scan every job file on disk, reconcile whatever an unclean shutdown
    /// left behind, and return the `(id, priority)` pairs that should be
    /// handed to the worker pool.
    fn inspect_queue(&self) -> anyhow::Result<Vec<(u64, i32)>> {
        let mut enqueue = Vec::new();
        let mut count = 0usize;
        let started = Instant::now();

        let entries = match std::fs::read_dir(&self.queue_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(enqueue),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if !name.starts_with("job-") {
                continue;
            }
            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not read job file during recovery");
                    continue;
                }
            };
            let record: JobRecord = match serde_json::from_slice(&bytes) {
                Ok(r) => r,
                Err(e) => {
                    let id = name.strip_prefix("job-").and_then(|s| s.parse::<u64>().ok());
                    let corrupted = QueueError::JobFileCorrupted(id.unwrap_or(0), e.to_string());
                    let dest = match id {
                        Some(id) => self.job_path(id, true),
                        None => self.archive_dir.join(name),
                    };
                    warn!(path = %path.display(), error = %corrupted, dest = %dest.display(), "job file corrupted, archiving for manual inspection");
                    if let Some(parent) = dest.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    if let Err(move_err) = std::fs::rename(&path, &dest) {
                        warn!(path = %path.display(), error = %move_err, "failed to archive corrupted job file");
                    }
                    continue;
                }
            };

            let mut job = Job::from_record(record, true, false);
            match job.derived_status() {
                JobStatus::Queued => {
                    if let Some(idx) = job.current_op_index() {
                        enqueue.push((job.id, job.ops[idx].priority));
                    }
                }
                JobStatus::Waiting => {
                    for op in job.ops.iter_mut() {
                        if op.status == OpStatus::Waiting {
                            op.status = OpStatus::Queued;
                        }
                    }
                    if let Some(idx) = job.current_op_index() {
                        enqueue.push((job.id, job.ops[idx].priority));
                    }
                    self.persist_job_to(&job, true);
                }
                JobStatus::Running | JobStatus::Canceling => {
                    job.mark_unfinished_ops(MarkReason::UncleanShutdown);
                    job.finalize();
                    self.persist_job_to(&job, true);
                }
                _ => {}
            }

            self.jobs.insert(job.id, Arc::new(Mutex::new(job)));

            count += 1;
            if count % 1000 == 0 || started.elapsed() > Duration::from_secs(10) {
                debug!(count, "queue recovery progress");
            }
        }

        info!(count, enqueued = enqueue.len(), "queue recovery complete");
        Ok(enqueue)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Priority of the opcode a job is currently parked or running at, if
    /// it has one left to run. Exposed mainly for tests asserting the
    /// priority-escalation behavior on repeated lock timeouts.
    pub fn job_priority(&self, id: u64) -> Option<i32> {
        let cell = self.job_cell(id)?;
        let job = cell.lock().unwrap();
        job.current_op_index().map(|idx| job.ops[idx].priority)
    }
}

fn shard_of(id: u64) -> String {
    format!("{:05}", id / 10_000)
}

fn acquire_master_lock(queue_dir: &Path) -> anyhow::Result<File> {
    let lock_path = queue_dir.join("lock");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)?;
    file.try_lock_exclusive().map_err(|_| {
        anyhow::anyhow!(
            "another master holds the lock at {}; is it already running?",
            lock_path.display()
        )
    })?;
    Ok(file)
}
