//! Job records and the derived-status algorithm.

use serde::{Deserialize, Serialize};

use crate::opcode::{OpCode, OpStatus};
use crate::timestamp::Timestamp;

/// A job's status, derived purely from the statuses of its opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Waiting,
    Running,
    Canceling,
    Canceled,
    Success,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Canceling => "canceling",
            JobStatus::Canceled => "canceled",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Canceled | JobStatus::Success | JobStatus::Error)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A job: a non-empty ordered sequence of opcodes plus bookkeeping fields.
/// `ops_iter` / `processor_lock` are runtime-only and never serialized.
#[derive(Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub ops: Vec<OpCode>,
    pub received_timestamp: Timestamp,
    pub start_timestamp: Option<Timestamp>,
    pub end_timestamp: Option<Timestamp>,
    pub log_serial: u64,
    #[serde(skip)]
    pub writable: bool,
    pub archived: bool,
    /// Index of the next non-terminal opcode to resume from; persisted so a
    /// restored job doesn't have to rescan, though [`Job::derived_status`]
    /// never trusts it blindly.
    pub cursor: usize,
}

impl Job {
    pub fn new(id: u64, ops: Vec<OpCode>) -> Self {
        assert!(!ops.is_empty(), "a job must have at least one opcode");
        Job {
            id,
            ops,
            received_timestamp: Timestamp::now(),
            start_timestamp: None,
            end_timestamp: None,
            log_serial: 0,
            writable: true,
            archived: false,
            cursor: 0,
        }
    }

    /// Pure function of opcode statuses.
    pub fn derived_status(&self) -> JobStatus {
        for op in &self.ops {
            match op.status {
                OpStatus::Canceling => return JobStatus::Canceling,
                OpStatus::Error => return JobStatus::Error,
                OpStatus::Canceled => return JobStatus::Canceled,
                _ => {}
            }
        }
        if self.ops.iter().all(|op| op.status == OpStatus::Success) {
            return JobStatus::Success;
        }
        if self.ops.iter().all(|op| op.status == OpStatus::Queued) {
            return JobStatus::Queued;
        }
        // Last non-QUEUED/non-SUCCESS status wins among WAITING/RUNNING.
        self.ops
            .iter()
            .rev()
            .find_map(|op| match op.status {
                OpStatus::Waiting => Some(JobStatus::Waiting),
                OpStatus::Running => Some(JobStatus::Running),
                _ => None,
            })
            .unwrap_or(JobStatus::Queued)
    }

    /// Recomputes `log_serial` from the opcodes' logs rather than trusting
    /// the stored value.
    pub fn recompute_log_serial(&mut self) {
        self.log_serial = self
            .ops
            .iter()
            .flat_map(|op| op.log.iter())
            .map(|entry| entry.serial)
            .max()
            .unwrap_or(0);
    }

    pub fn next_log_serial(&mut self) -> u64 {
        self.log_serial += 1;
        self.log_serial
    }

    /// The opcode the processor should resume at, or `None` if every opcode
    /// has reached a terminal status.
    pub fn current_op_index(&self) -> Option<usize> {
        self.ops[self.cursor..]
            .iter()
            .position(|op| !op.status.is_terminal())
            .map(|offset| self.cursor + offset)
    }

    pub fn mark_started_if_needed(&mut self) {
        if self.start_timestamp.is_none() {
            self.start_timestamp = Some(Timestamp::now());
        }
    }

    pub fn finalize(&mut self) {
        self.end_timestamp = Some(Timestamp::now());
    }

    pub fn is_finalized(&self) -> bool {
        self.end_timestamp.is_some()
    }

    /// A failing or canceling opcode propagates to every opcode after it
    /// that hasn't already terminated.
    pub fn mark_unfinished_ops(&mut self, reason: MarkReason) {
        for op in self.ops.iter_mut() {
            if op.status.is_terminal() {
                continue;
            }
            match reason {
                MarkReason::PrecedingFailed => op.mark_error("preceding opcode failed"),
                MarkReason::Canceled => op.mark_canceled(),
                MarkReason::UncleanShutdown => op.mark_error("unclean master daemon shutdown"),
            }
        }
    }

    /// Serializable snapshot used for on-disk persistence: identical to
    /// `Job` today but kept as a named conversion point so persistence and
    /// in-memory representation can diverge later without touching callers.
    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            id: self.id,
            ops: self.ops.clone(),
            received_timestamp: self.received_timestamp,
            start_timestamp: self.start_timestamp,
            end_timestamp: self.end_timestamp,
            log_serial: self.log_serial,
            archived: self.archived,
            cursor: self.cursor,
        }
    }

    pub fn from_record(record: JobRecord, writable: bool, archived: bool) -> Self {
        let mut job = Job {
            id: record.id,
            ops: record.ops,
            received_timestamp: record.received_timestamp,
            start_timestamp: record.start_timestamp,
            end_timestamp: record.end_timestamp,
            log_serial: record.log_serial,
            writable,
            archived,
            cursor: record.cursor,
        };
        job.recompute_log_serial();
        job
    }
}

#[derive(Debug, Clone, Copy)]
pub enum MarkReason {
    PrecedingFailed,
    Canceled,
    UncleanShutdown,
}

/// The subset of [`Job`] that is actually written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: u64,
    pub ops: Vec<OpCode>,
    pub received_timestamp: Timestamp,
    pub start_timestamp: Option<Timestamp>,
    pub end_timestamp: Option<Timestamp>,
    pub log_serial: u64,
    pub archived: bool,
    pub cursor: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::OpCode;

    fn op(status: OpStatus) -> OpCode {
        let mut op = OpCode::new(serde_json::json!({}));
        op.status = status;
        op
    }

    #[test]
    fn all_queued_is_queued() {
        let job = Job::new(1, vec![op(OpStatus::Queued), op(OpStatus::Queued)]);
        assert_eq!(job.derived_status(), JobStatus::Queued);
    }

    #[test]
    fn all_success_is_success() {
        let job = Job::new(1, vec![op(OpStatus::Success), op(OpStatus::Success)]);
        assert_eq!(job.derived_status(), JobStatus::Success);
    }

    #[test]
    fn error_anywhere_wins() {
        let job = Job::new(1, vec![op(OpStatus::Success), op(OpStatus::Error), op(OpStatus::Queued)]);
        assert_eq!(job.derived_status(), JobStatus::Error);
    }

    #[test]
    fn canceling_beats_running() {
        let job = Job::new(1, vec![op(OpStatus::Running), op(OpStatus::Canceling)]);
        assert_eq!(job.derived_status(), JobStatus::Canceling);
    }

    #[test]
    fn running_beats_queued_tail() {
        let job = Job::new(1, vec![op(OpStatus::Success), op(OpStatus::Running), op(OpStatus::Queued)]);
        assert_eq!(job.derived_status(), JobStatus::Running);
    }

    #[test]
    fn mark_unfinished_ops_skips_terminal() {
        let mut job = Job::new(
            1,
            vec![op(OpStatus::Error), op(OpStatus::Running), op(OpStatus::Queued)],
        );
        job.mark_unfinished_ops(MarkReason::PrecedingFailed);
        assert_eq!(job.ops[0].status, OpStatus::Error); // untouched, was already terminal
        assert_eq!(job.ops[1].status, OpStatus::Error);
        assert_eq!(job.ops[2].status, OpStatus::Error);
    }

    #[test]
    fn record_round_trip_recomputes_log_serial() {
        let mut job = Job::new(1, vec![op(OpStatus::Queued)]);
        let s1 = job.next_log_serial();
        job.ops[0].append_log(s1, crate::opcode::LogLevel::Info, "hi");
        job.log_serial = 999; // corrupt it
        let record = job.to_record();
        let restored = Job::from_record(
            JobRecord {
                log_serial: 999,
                ..record
            },
            true,
            false,
        );
        assert_eq!(restored.log_serial, 1);
    }

    #[test]
    fn current_op_index_skips_terminal_prefix() {
        let job = Job::new(1, vec![op(OpStatus::Success), op(OpStatus::Queued)]);
        assert_eq!(job.current_op_index(), Some(1));
    }

    #[test]
    fn current_op_index_none_when_all_terminal() {
        let job = Job::new(1, vec![op(OpStatus::Success), op(OpStatus::Error)]);
        assert_eq!(job.current_op_index(), None);
    }
}
