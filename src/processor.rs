//! Per-job state machine. Drives one opcode at a time through
//! Wait -> Run -> Finalize, retrying lock-timeouts against a backoff
//! schedule and escalating priority once that schedule is exhausted.

use std::time::Duration;

use tracing::debug;

use crate::depmgr::DepOutcome;
use crate::executor::{ExecCallbacks, ExecOutcome};
use crate::job::MarkReason;
use crate::opcode::{JobStatusTag, LogLevel, OpStatus};
use crate::queue::Queue;

/// What the worker pool should do once a processing cycle returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessResult {
    Finished,
    Defer(i32),
    WaitDep,
}

/// Backoff schedule for lock-acquire retries. `peek()` returning `None`
/// signals the next attempt would block indefinitely, which is the trigger
/// to consider raising the opcode's priority.
#[derive(Debug, Clone)]
pub struct TimeoutStrategy {
    schedule: Vec<f64>,
    idx: usize,
}

impl TimeoutStrategy {
    pub fn new(schedule: &[f64]) -> Self {
        TimeoutStrategy { schedule: schedule.to_vec(), idx: 0 }
    }

    pub fn peek(&self) -> Option<f64> {
        self.schedule.get(self.idx).copied()
    }

    pub fn next(&mut self) -> Option<f64> {
        let value = self.peek();
        if value.is_some() {
            self.idx += 1;
        }
        value
    }

    pub fn reset(&mut self) {
        self.idx = 0;
    }
}

/// Run one processing cycle for `job_id`: resolve dependencies, hand the
/// current opcode to the executor, and apply whatever it returns.
pub fn process(queue: &Queue, job_id: u64) -> ProcessResult {
    let guard = queue.state_lock().read().unwrap();

    let Some(job_cell) = queue.job_cell(job_id) else {
        drop(guard);
        return ProcessResult::Finished;
    };
    let mut job = job_cell.lock().unwrap();

    if job.derived_status().is_terminal() {
        drop(job);
        drop(guard);
        return ProcessResult::Finished;
    }

    let Some(op_index) = job.current_op_index() else {
        job.finalize();
        queue.persist_job(&job);
        drop(job);
        drop(guard);
        return ProcessResult::Finished;
    };

    if job.ops[op_index].status == OpStatus::Canceling {
        job.ops[op_index].mark_canceled();
        job.mark_unfinished_ops(MarkReason::Canceled);
        job.finalize();
        queue.persist_job(&job);
        drop(job);
        drop(guard);
        return ProcessResult::Finished;
    }

    job.mark_started_if_needed();
    if job.ops[op_index].status == OpStatus::Queued {
        job.ops[op_index].status = OpStatus::Waiting;
        if job.ops[op_index].start_timestamp.is_none() {
            job.ops[op_index].start_timestamp = Some(crate::timestamp::Timestamp::now());
        }
        queue.persist_job(&job);
    }

    // Dependency resolution, front to back.
    let deps = job.ops[op_index].depends.clone();
    for dep in &deps {
        let outcome = queue.dep_manager().check_and_register(job_id, dep, |dep_id| {
            queue.job_status(dep_id)
        });
        match outcome {
            DepOutcome::Wait => {
                queue.save_timeout_strategy_reset(job_id);
                drop(job);
                drop(guard);
                return ProcessResult::WaitDep;
            }
            DepOutcome::Continue => continue,
            DepOutcome::Cancel => {
                job.ops[op_index].mark_canceled();
                job.mark_unfinished_ops(MarkReason::Canceled);
                job.finalize();
                queue.persist_job(&job);
                drop(job);
                drop(guard);
                return ProcessResult::Finished;
            }
            DepOutcome::WrongStatus(msg) | DepOutcome::Error(msg) => {
                job.ops[op_index].mark_error(msg);
                job.mark_unfinished_ops(MarkReason::PrecedingFailed);
                job.finalize();
                queue.persist_job(&job);
                drop(job);
                drop(guard);
                return ProcessResult::Finished;
            }
        }
    }

    let priority = job.ops[op_index].priority;
    let input = job.ops[op_index].input.clone();
    drop(job);
    drop(guard);

    let mut strategy = queue.take_timeout_strategy(job_id);
    let timeout = strategy.peek().map(Duration::from_secs_f64);

    let callbacks = build_callbacks(queue, job_id, op_index, priority);
    let outcome = queue.executor().exec(&input, &callbacks, timeout);

    let guard = queue.state_lock().read().unwrap();
    let Some(job_cell) = queue.job_cell(job_id) else {
        drop(guard);
        return ProcessResult::Finished;
    };
    let mut job = job_cell.lock().unwrap();

    let result = match outcome {
        ExecOutcome::Success(value) => {
            job.ops[op_index].mark_success(value);
            job.cursor = op_index + 1;
            queue.clear_timeout_strategy(job_id);
            if job.current_op_index().is_none() {
                job.finalize();
                queue.persist_job(&job);
                ProcessResult::Finished
            } else {
                queue.persist_job(&job);
                ProcessResult::Defer(job.ops[job.cursor].priority)
            }
        }
        ExecOutcome::LockTimeout => {
            strategy.next();
            if strategy.peek().is_none() && job.ops[op_index].priority > crate::opcode::PRIO_HIGHEST {
                job.ops[op_index].priority -= 1;
                strategy.reset();
                debug!(job_id, op_index, new_priority = job.ops[op_index].priority, "raising priority after lock timeout exhaustion");
            }
            let next_priority = job.ops[op_index].priority;
            queue.persist_job(&job);
            queue.store_timeout_strategy(job_id, strategy);
            ProcessResult::Defer(next_priority)
        }
        ExecOutcome::Cancel => {
            job.ops[op_index].status = OpStatus::Canceling;
            queue.persist_job(&job);
            queue.clear_timeout_strategy(job_id);
            ProcessResult::Defer(job.ops[op_index].priority)
        }
        ExecOutcome::QueueShutdown => {
            job.ops[op_index].status = OpStatus::Queued;
            queue.persist_job(&job);
            queue.clear_timeout_strategy(job_id);
            ProcessResult::Defer(job.ops[op_index].priority)
        }
        ExecOutcome::Error(message) => {
            job.ops[op_index].mark_error(message);
            job.mark_unfinished_ops(MarkReason::PrecedingFailed);
            job.finalize();
            queue.persist_job(&job);
            queue.clear_timeout_strategy(job_id);
            ProcessResult::Finished
        }
    };

    drop(job);
    drop(guard);
    result
}

fn build_callbacks(queue: &Queue, job_id: u64, op_index: usize, priority: i32) -> ExecCallbacks<'_> {
    ExecCallbacks::new(
        job_id,
        move || queue.notify_op_start(job_id, op_index),
        move |level: LogLevel, message: &str| queue.append_log(job_id, op_index, level, message),
        move || queue.current_op_priority(job_id, op_index).unwrap_or(priority),
        move || queue.op_cancel_requested(job_id, op_index),
        move |many| queue.submit_many_from_callback(many),
    )
}

/// Convert a job's terminal status into the tag used in dependency specs,
/// exposed for the queue façade's `WaitForJobChanges` bookkeeping.
pub fn terminal_tag(status: crate::job::JobStatus) -> Option<JobStatusTag> {
    match status {
        crate::job::JobStatus::Success => Some(JobStatusTag::Success),
        crate::job::JobStatus::Error => Some(JobStatusTag::Error),
        crate::job::JobStatus::Canceled => Some(JobStatusTag::Canceled),
        _ => None,
    }
}
