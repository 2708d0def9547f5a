//! The seam between the engine and the outside world: opcodes are opaque to
//! the engine, so running one is delegated to an [`OpcodeExecutor`]
//! implementation the embedder supplies.

use std::time::Duration;

use crate::opcode::{LogLevel, OpInput};

/// What an executor call resolved to.
pub enum ExecOutcome {
    Success(Option<serde_json::Value>),
    /// Could not acquire whatever external lock the opcode needs within the
    /// timeout; the processor will retry, possibly raising priority.
    LockTimeout,
    /// The executor observed a cancel request via [`ExecCallbacks::cancel_requested`].
    Cancel,
    /// The queue is shutting down; the opcode should go back to QUEUED.
    QueueShutdown,
    Error(String),
}

/// The narrow capability set an executor gets. Built fresh per call by the
/// processor; an executor must not retain it past the call.
pub struct ExecCallbacks<'a> {
    pub job_id: u64,
    notify_start: Box<dyn Fn() + 'a>,
    feedback: Box<dyn Fn(LogLevel, &str) + 'a>,
    current_priority: Box<dyn Fn() -> i32 + 'a>,
    cancel_requested: Box<dyn Fn() -> bool + 'a>,
    submit_many: Box<dyn Fn(Vec<Vec<crate::opcode::OpCode>>) -> Vec<Result<u64, String>> + 'a>,
}

impl<'a> ExecCallbacks<'a> {
    pub fn new(
        job_id: u64,
        notify_start: impl Fn() + 'a,
        feedback: impl Fn(LogLevel, &str) + 'a,
        current_priority: impl Fn() -> i32 + 'a,
        cancel_requested: impl Fn() -> bool + 'a,
        submit_many: impl Fn(Vec<Vec<crate::opcode::OpCode>>) -> Vec<Result<u64, String>> + 'a,
    ) -> Self {
        ExecCallbacks {
            job_id,
            notify_start: Box::new(notify_start),
            feedback: Box::new(feedback),
            current_priority: Box::new(current_priority),
            cancel_requested: Box::new(cancel_requested),
            submit_many: Box::new(submit_many),
        }
    }

    pub fn notify_start(&self) {
        (self.notify_start)()
    }

    pub fn feedback(&self, level: LogLevel, message: &str) {
        (self.feedback)(level, message)
    }

    pub fn current_priority(&self) -> i32 {
        (self.current_priority)()
    }

    pub fn cancel_requested(&self) -> bool {
        (self.cancel_requested)()
    }

    pub fn submit_many_jobs(&self, jobs: Vec<Vec<crate::opcode::OpCode>>) -> Vec<Result<u64, String>> {
        (self.submit_many)(jobs)
    }
}

pub trait OpcodeExecutor: Send + Sync {
    fn exec(&self, input: &OpInput, callbacks: &ExecCallbacks, timeout: Option<Duration>) -> ExecOutcome;
}

/// Executes every opcode as an immediate success with a null result. Useful
/// for embedding contexts (and tests) that only care about queue mechanics.
pub struct NoopExecutor;

impl OpcodeExecutor for NoopExecutor {
    fn exec(&self, _input: &OpInput, callbacks: &ExecCallbacks, _timeout: Option<Duration>) -> ExecOutcome {
        callbacks.notify_start();
        ExecOutcome::Success(None)
    }
}
