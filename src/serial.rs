//! On-disk monotonic job-id allocator.

use std::path::{Path, PathBuf};

use crate::persist::Replicator;

pub struct SerialAllocator {
    path: PathBuf,
}

impl SerialAllocator {
    pub fn new(queue_dir: &Path) -> Self {
        SerialAllocator { path: queue_dir.join("serial") }
    }

    fn read_last(&self) -> anyhow::Result<u64> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(text.trim().parse().unwrap_or(0)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Reserve `n` consecutive ids, persist the new high-water mark, and
    /// return the reserved range. The caller must hold the queue's
    /// exclusive lock; this type does no locking of its own. The serial
    /// file is written and replicated before any job file is written, so
    /// every master candidate agrees on the next id even if this one dies
    /// immediately after.
    pub fn allocate(&self, n: u64, replicator: &Replicator) -> anyhow::Result<Vec<u64>> {
        assert!(n > 0, "must allocate at least one id");
        let last = self.read_last()?;
        let ids: Vec<u64> = (last + 1..=last + n).collect();
        let new_last = last + n;
        replicator.update_file(&self.path, format!("{new_last}\n").as_bytes(), true)?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_increasing_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = SerialAllocator::new(dir.path());
        let replicator = Replicator::none();
        let first = alloc.allocate(3, &replicator).unwrap();
        assert_eq!(first, vec![1, 2, 3]);
        let second = alloc.allocate(2, &replicator).unwrap();
        assert_eq!(second, vec![4, 5]);
    }

    #[test]
    fn missing_serial_file_starts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = SerialAllocator::new(dir.path());
        assert_eq!(alloc.allocate(1, &Replicator::none()).unwrap(), vec![1]);
    }
}
