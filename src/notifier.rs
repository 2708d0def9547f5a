//! Change-notifier: lets a caller block until a job file changes. Backed by
//! the OS file-watch facility via `notify` where available, falling back to
//! a bounded-backoff poll of the file's mtime and size otherwise.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use notify::{RecursiveMode, Watcher};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    mtime: Option<SystemTime>,
    len: u64,
}

fn fingerprint(path: &Path) -> Fingerprint {
    match std::fs::metadata(path) {
        Ok(meta) => Fingerprint { mtime: meta.modified().ok(), len: meta.len() },
        Err(_) => Fingerprint { mtime: None, len: 0 },
    }
}

/// Tracks a last-seen fingerprint per watched path so repeated waiters on
/// the same job file can tell "unchanged" from "first time seeing this
/// file". The first call for a path is lazy setup: it establishes the
/// baseline and returns immediately (true), so the caller re-reads the file
/// and calls again; subsequent calls genuinely block.
pub struct ChangeNotifier {
    baselines: DashMap<PathBuf, Fingerprint>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        ChangeNotifier { baselines: DashMap::new() }
    }

    /// Returns true if `path` changed (or this is the first observation),
    /// false if `timeout` elapsed with no change.
    pub fn wait(&self, path: &Path, timeout: Duration) -> bool {
        let current = fingerprint(path);
        let previous = self.baselines.insert(path.to_path_buf(), current);
        let baseline = match previous {
            None => return true,
            Some(b) => b,
        };
        if current != baseline {
            return true;
        }
        let changed = block_until_change(path, baseline, timeout);
        if changed {
            self.baselines.insert(path.to_path_buf(), fingerprint(path));
        }
        changed
    }

    /// Drop the cached baseline for a path, e.g. once a job is archived and
    /// no longer worth tracking.
    pub fn forget(&self, path: &Path) {
        self.baselines.remove(path);
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

fn block_until_change(path: &Path, baseline: Fingerprint, timeout: Duration) -> bool {
    let (tx, rx) = channel();
    let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let _ = tx.send(res);
    });

    let mut watcher = match watcher {
        Ok(w) => w,
        Err(e) => {
            debug!(error = %e, "failed to construct file watcher; falling back to polling");
            return poll_until_change(path, baseline, timeout);
        }
    };

    if watcher.watch(path, RecursiveMode::NonRecursive).is_err() {
        debug!(path = %path.display(), "failed to register watch; falling back to polling");
        return poll_until_change(path, baseline, timeout);
    }

    match rx.recv_timeout(timeout) {
        Ok(Ok(_event)) => true,
        Ok(Err(_)) => poll_until_change(path, baseline, timeout),
        Err(RecvTimeoutError::Timeout) => false,
        Err(RecvTimeoutError::Disconnected) => poll_until_change(path, baseline, timeout),
    }
}

/// Polling fallback: check the fingerprint every `step` up to `timeout`
/// total, with a small backoff cap so a busy queue directory isn't hammered.
fn poll_until_change(path: &Path, baseline: Fingerprint, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut step = Duration::from_millis(20);
    let max_step = Duration::from_millis(500);
    loop {
        if fingerprint(path) != baseline {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(step.min(deadline.saturating_duration_since(Instant::now())));
        step = (step * 2).min(max_step);
    }
}
