//! Opcode records: the unit of work inside a job.

use serde::{Deserialize, Serialize};

use crate::timestamp::Timestamp;

/// Status of a single opcode within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Queued,
    Waiting,
    Running,
    Canceling,
    Canceled,
    Success,
    Error,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Queued => "queued",
            OpStatus::Waiting => "waiting",
            OpStatus::Running => "running",
            OpStatus::Canceling => "canceling",
            OpStatus::Canceled => "canceled",
            OpStatus::Success => "success",
            OpStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OpStatus::Canceled | OpStatus::Success | OpStatus::Error)
    }
}

impl std::fmt::Display for OpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reference to another job this opcode depends on, plus the set of that
/// job's terminal statuses this opcode is willing to continue on. An empty
/// `allowed` list means "any terminal status is fine".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub job_id: u64,
    pub allowed: Vec<JobStatusTag>,
}

/// A terminal job status, used only inside [`Dependency::allowed`]. Kept
/// distinct from [`crate::job::JobStatus`] so a dependency spec can be
/// serialized without pulling in the non-terminal variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatusTag {
    Success,
    Error,
    Canceled,
}

/// One line of an opcode's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub serial: u64,
    pub timestamp: Timestamp,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Opaque, externally-defined operation payload. The engine never
/// interprets its contents beyond passing it to the [`crate::executor::OpcodeExecutor`].
pub type OpInput = serde_json::Value;

/// One opcode within a job: its input, current status, result, log, priority
/// and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpCode {
    pub input: OpInput,
    pub status: OpStatus,
    pub result: Option<serde_json::Value>,
    pub log: Vec<LogEntry>,
    pub priority: i32,
    pub depends: Vec<Dependency>,
    pub start_timestamp: Option<Timestamp>,
    pub exec_timestamp: Option<Timestamp>,
    pub end_timestamp: Option<Timestamp>,
}

/// Highest (most urgent) priority value allowed.
pub const PRIO_HIGHEST: i32 = -20;
/// Lowest (least urgent) priority value allowed.
pub const PRIO_LOWEST: i32 = 19;
/// Default priority for newly submitted opcodes.
pub const PRIO_DEFAULT: i32 = 0;

impl OpCode {
    pub fn new(input: OpInput) -> Self {
        OpCode {
            input,
            status: OpStatus::Queued,
            result: None,
            log: Vec::new(),
            priority: PRIO_DEFAULT,
            depends: Vec::new(),
            start_timestamp: None,
            exec_timestamp: None,
            end_timestamp: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority.clamp(PRIO_HIGHEST, PRIO_LOWEST);
        self
    }

    pub fn with_dependency(mut self, dep: Dependency) -> Self {
        self.depends.push(dep);
        self
    }

    pub fn append_log(&mut self, next_serial: u64, level: LogLevel, message: impl Into<String>) {
        self.log.push(LogEntry {
            serial: next_serial,
            timestamp: Timestamp::now(),
            level,
            message: message.into(),
        });
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = OpStatus::Error;
        self.result = Some(serde_json::json!({ "error": message.into() }));
        self.end_timestamp = Some(Timestamp::now());
    }

    pub fn mark_canceled(&mut self) {
        self.status = OpStatus::Canceled;
        self.end_timestamp = Some(Timestamp::now());
    }

    pub fn mark_success(&mut self, result: Option<serde_json::Value>) {
        self.status = OpStatus::Success;
        self.result = result;
        self.end_timestamp = Some(Timestamp::now());
    }
}
