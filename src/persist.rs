//! Atomic file persistence and best-effort replication to peer master
//! candidates, via the standard write-temp-then-rename pattern.

use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::{debug, error};

/// What a replication push needs to know how to reach a peer. A real
/// deployment would implement this over RPC; the engine only depends on the
/// trait so it can be swapped out or mocked in tests.
pub trait RpcRunner: Send + Sync {
    /// Push `data` to `path` on `node`. Returns an error string on failure;
    /// the caller never treats a single peer failure as fatal.
    fn push_file(&self, node: &str, path: &Path, data: &[u8]) -> Result<(), String>;
}

/// An `RpcRunner` with no peers; replication becomes a no-op. Used when a
/// single-node deployment has no master candidates configured.
pub struct NoopRpcRunner;

impl RpcRunner for NoopRpcRunner {
    fn push_file(&self, _node: &str, _path: &Path, _data: &[u8]) -> Result<(), String> {
        Ok(())
    }
}

/// Write `data` to `path` atomically: write to a sibling temp file in the
/// same directory, then rename over the destination. Avoids ever exposing a
/// half-written file to a concurrent reader. Job files carry operator
/// input and results, so they're written 0640 rather than the tempfile
/// default of 0600 — readable by the owning group, not by the world.
pub fn atomic_write(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path {} has no parent directory", path.display()))?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    set_job_file_permissions(tmp.as_file())?;
    tmp.persist(path)
        .map_err(|e| anyhow::anyhow!("failed to persist {}: {}", path.display(), e.error))?;
    Ok(())
}

#[cfg(unix)]
fn set_job_file_permissions(file: &fs::File) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o640))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_job_file_permissions(_file: &fs::File) -> anyhow::Result<()> {
    Ok(())
}

/// Replicator: writes a file locally then best-effort pushes it to every
/// configured peer.
pub struct Replicator {
    peers: Vec<String>,
    rpc: Box<dyn RpcRunner>,
}

impl Replicator {
    pub fn new(peers: Vec<String>, rpc: Box<dyn RpcRunner>) -> Self {
        Replicator { peers, rpc }
    }

    pub fn none() -> Self {
        Replicator { peers: Vec::new(), rpc: Box::new(NoopRpcRunner) }
    }

    /// Write `data` to `path` locally, then push it to every peer if
    /// `replicate` is true. More than half the peers failing is logged at
    /// error level but does not fail the call: the master owns truth, peers
    /// catch up later.
    pub fn update_file(&self, path: &Path, data: &[u8], replicate: bool) -> anyhow::Result<()> {
        atomic_write(path, data)?;
        if replicate && !self.peers.is_empty() {
            self.push_to_peers(path, data);
        }
        Ok(())
    }

    pub fn rename_files(&self, pairs: &[(std::path::PathBuf, std::path::PathBuf)]) -> anyhow::Result<()> {
        for (old, new) in pairs {
            if let Some(dir) = new.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::rename(old, new)?;
        }
        Ok(())
    }

    fn push_to_peers(&self, path: &Path, data: &[u8]) {
        let mut failures = 0usize;
        for node in &self.peers {
            match self.rpc.push_file(node, path, data) {
                Ok(()) => debug!(node, path = %path.display(), "replicated"),
                Err(e) => {
                    debug!(node, path = %path.display(), error = %e, "replication to peer failed");
                    failures += 1;
                }
            }
        }
        if failures * 2 > self.peers.len() {
            error!(
                failures,
                total = self.peers.len(),
                path = %path.display(),
                "more than half of peers failed to receive replicated file"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn atomic_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job-1");
        atomic_write(&path, b"hello").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }

    struct FailingRpc {
        calls: Arc<AtomicUsize>,
    }

    impl RpcRunner for FailingRpc {
        fn push_file(&self, _node: &str, _path: &Path, _data: &[u8]) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err("unreachable".into())
        }
    }

    #[test]
    fn replication_failure_does_not_fail_update() {
        let calls = Arc::new(AtomicUsize::new(0));
        let replicator = Replicator::new(
            vec!["node-a".into(), "node-b".into()],
            Box::new(FailingRpc { calls: calls.clone() }),
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job-1");
        replicator.update_file(&path, b"data", true).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(fs::read(&path).unwrap(), b"data");
    }
}
