//! Command-line front end over [`clusterjobd::queue::Queue`]. Subcommands
//! submit, cancel, reprioritize, and query jobs against a single-node queue
//! directory. All stdout is JSON only; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use clusterjobd::config::QueueConfig;
use clusterjobd::executor::NoopExecutor;
use clusterjobd::opcode::OpCode;
use clusterjobd::queue::{JobSnapshot, Queue, WaitOutcome};

const SCHEMA_VERSION: &str = "0.1";

#[derive(Serialize)]
struct Response<T: Serialize> {
    schema_version: &'static str,
    ok: bool,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    data: T,
}

impl<T: Serialize> Response<T> {
    fn new(kind: &'static str, data: T) -> Self {
        Response { schema_version: SCHEMA_VERSION, ok: true, kind, data }
    }

    fn print(&self) {
        match serde_json::to_string(self) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("failed to serialize response: {e}"),
        }
    }
}

#[derive(Serialize)]
struct ErrorData {
    code: &'static str,
    message: String,
}

fn print_error(code: &'static str, message: impl Into<String>) -> ! {
    let response = Response {
        schema_version: SCHEMA_VERSION,
        ok: false,
        kind: "error",
        data: ErrorData { code, message: message.into() },
    };
    response.print();
    std::process::exit(1);
}

/// Render a job snapshot as JSON with RFC3339 timestamps, the only place in
/// the CLI that needs human-readable wall-clock time rather than the raw
/// `(secs, micros)` pair the on-disk format stores.
fn snapshot_json(snapshot: &JobSnapshot) -> serde_json::Value {
    serde_json::json!({
        "job_id": snapshot.id,
        "status": snapshot.status.as_str(),
        "received_at": snapshot.received_timestamp.to_rfc3339(),
        "started_at": snapshot.start_timestamp.map(|t| t.to_rfc3339()),
        "ended_at": snapshot.end_timestamp.map(|t| t.to_rfc3339()),
    })
}

#[derive(Debug, Parser)]
#[command(name = "clusterjobd")]
#[command(about = "Cluster job queue and worker pool", long_about = None)]
struct Cli {
    /// Queue directory; defaults to CLUSTERJOBD_ROOT or a platform data dir.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a job with a single opcode carrying `payload` as its input.
    Submit {
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },

    /// Cancel a queued or waiting job.
    Cancel { job_id: u64 },

    /// Change the priority of a not-yet-terminal job.
    Priority { job_id: u64, priority: i32 },

    /// Get the derived status of a job.
    Status { job_id: u64 },

    /// List every job currently tracked by the queue.
    List,

    /// Block until a job changes status or `timeout_secs` elapses.
    Wait {
        job_id: u64,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },

    /// Move a terminal job's file into the archive tree.
    Archive { job_id: u64 },

    /// Toggle the drain flag; a drained queue rejects new submissions.
    Drain {
        #[arg(long)]
        off: bool,
    },

    /// Stop accepting new jobs, pause workers, and release the master lock.
    Shutdown,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run(cli) {
        print_error("internal_error", format!("{e:#}"));
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = QueueConfig::load(None)?;
    if let Some(root) = &cli.root {
        config.queue_dir = Some(root.clone());
    }
    let queue = Queue::open(config, Arc::new(NoopExecutor))?;

    match cli.command {
        Command::Submit { payload, priority } => {
            let input: serde_json::Value = serde_json::from_str(&payload)?;
            let op = OpCode::new(input).with_priority(priority);
            match queue.submit_job(vec![op]) {
                Ok(id) => Response::new("submit", serde_json::json!({ "job_id": id })).print(),
                Err(e) => print_error("submit_failed", e.to_string()),
            }
        }

        Command::Cancel { job_id } => {
            let (ok, message) = queue.cancel_job(job_id);
            Response::new("cancel", serde_json::json!({ "job_id": job_id, "ok": ok, "message": message })).print();
        }

        Command::Priority { job_id, priority } => {
            let (ok, message) = queue.change_job_priority(job_id, priority);
            Response::new("priority", serde_json::json!({ "job_id": job_id, "ok": ok, "message": message })).print();
        }

        Command::Status { job_id } => {
            match queue.query_jobs(|s| s.id == job_id).into_iter().next() {
                Some(snapshot) => Response::new("status", snapshot_json(&snapshot)).print(),
                None => print_error("job_not_found", format!("job {job_id} not found")),
            }
        }

        Command::List => {
            let jobs = queue.query_jobs(|_| true);
            let jobs_json: Vec<_> = jobs.iter().map(snapshot_json).collect();
            Response::new("list", serde_json::json!({ "jobs": jobs_json })).print();
        }

        Command::Wait { job_id, timeout_secs } => {
            match queue.wait_for_job_changes(job_id, None, 0, Duration::from_secs(timeout_secs)) {
                WaitOutcome::Changed(snapshot) => {
                    let mut data = snapshot_json(&snapshot);
                    data["changed"] = serde_json::json!(true);
                    Response::new("wait", data).print()
                }
                WaitOutcome::NotChanged => {
                    Response::new("wait", serde_json::json!({ "job_id": job_id, "changed": false })).print()
                }
                WaitOutcome::Gone => print_error("job_not_found", format!("job {job_id} not found")),
            }
        }

        Command::Archive { job_id } => match queue.archive_job(job_id) {
            Ok(archived) => {
                Response::new("archive", serde_json::json!({ "job_id": job_id, "archived": archived })).print()
            }
            Err(e) => print_error("archive_failed", e.to_string()),
        },

        Command::Drain { off } => {
            queue.set_drain_flag(!off)?;
            Response::new("drain", serde_json::json!({ "drained": queue.is_drained() })).print();
        }

        Command::Shutdown => {
            let had_running = queue.prepare_shutdown();
            queue.shutdown();
            Response::new("shutdown", serde_json::json!({ "had_running_tasks": had_running })).print();
        }
    }

    Ok(())
}
