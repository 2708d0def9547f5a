//! Ambient configuration: queue directory resolution, worker pool sizing,
//! timeout-strategy backoff schedule, and peer node list. Nothing in the
//! engine reads environment variables directly except this module and the
//! CLI front-end; the engine itself only ever sees a fully-resolved
//! [`QueueConfig`].

use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::Deserialize;

/// Default number of worker threads, matching the reference cluster
/// manager's `JOBQUEUE_THREADS`.
pub const DEFAULT_THREADS: usize = 25;

/// Default hard cap on the number of job files allowed on disk at once.
pub const DEFAULT_QUEUE_SIZE_HARD_LIMIT: usize = 25_000;

/// Default lock-acquire backoff schedule in seconds, consumed by
/// [`crate::processor::TimeoutStrategy`]. The final `None` entry signals an
/// unbounded final attempt, which is the trigger for a priority raise.
pub const DEFAULT_BACKOFF_SCHEDULE: &[f64] = &[1.0, 5.0, 10.0, 30.0, 60.0];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory job files, the serial file, and the drain flag live in.
    pub queue_dir: Option<PathBuf>,
    pub threads: usize,
    pub queue_size_hard_limit: usize,
    pub backoff_schedule: Vec<f64>,
    /// Addresses of other master candidates to best-effort replicate to.
    pub peer_nodes: Vec<String>,
    /// Seconds a terminal job must sit before `auto_archive` considers it.
    pub auto_archive_age_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            queue_dir: None,
            threads: DEFAULT_THREADS,
            queue_size_hard_limit: DEFAULT_QUEUE_SIZE_HARD_LIMIT,
            backoff_schedule: DEFAULT_BACKOFF_SCHEDULE.to_vec(),
            peer_nodes: Vec::new(),
            auto_archive_age_secs: 21 * 24 * 3600,
        }
    }
}

impl QueueConfig {
    /// Load configuration, applying (in precedence order): an explicit path,
    /// the `CLUSTERJOBD_CONFIG` environment variable, then built-in defaults.
    pub fn load(explicit_path: Option<&Path>) -> anyhow::Result<QueueConfig> {
        let path = explicit_path
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("CLUSTERJOBD_CONFIG").map(PathBuf::from));

        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(&p).map_err(|e| {
                    anyhow::anyhow!("failed to read config file {}: {e}", p.display())
                })?;
                toml::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("invalid config file {}: {e}", p.display()))?
            }
            None => QueueConfig::default(),
        };

        if config.queue_dir.is_none() {
            config.queue_dir = Some(resolve_queue_dir(None));
        }
        if config.backoff_schedule.is_empty() {
            config.backoff_schedule = DEFAULT_BACKOFF_SCHEDULE.to_vec();
        }
        Ok(config)
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.queue_dir
            .clone()
            .unwrap_or_else(|| resolve_queue_dir(None))
    }
}

/// Resolve the queue directory: CLI/explicit override, else
/// `CLUSTERJOBD_ROOT` environment variable, else platform data dir via
/// `directories`, else `./clusterjobd-data`.
pub fn resolve_queue_dir(explicit: Option<&str>) -> PathBuf {
    if let Some(p) = explicit {
        return PathBuf::from(p);
    }
    if let Some(p) = std::env::var_os("CLUSTERJOBD_ROOT") {
        return PathBuf::from(p);
    }
    if let Some(base) = BaseDirs::new() {
        return base.data_local_dir().join("clusterjobd").join("queue");
    }
    PathBuf::from("clusterjobd-data")
}
