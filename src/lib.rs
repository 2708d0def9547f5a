//! Durable, priority-aware cluster job queue and worker pool engine.
//!
//! A [`queue::Queue`] accepts jobs (sequences of opaque [`opcode::OpCode`]s),
//! persists them under a queue directory, and drives them through a bounded
//! [`pool::WorkerPool`] via the [`processor`] state machine. Jobs may depend
//! on one another through [`depmgr::DependencyManager`]; callers can block
//! for progress via [`queue::Queue::wait_for_job_changes`], backed by
//! [`notifier::ChangeNotifier`].

pub mod config;
pub mod depmgr;
pub mod error;
pub mod executor;
pub mod job;
pub mod notifier;
pub mod opcode;
pub mod persist;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod serial;
pub mod timestamp;
