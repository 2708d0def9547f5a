//! Priority-ordered worker pool. The priority queue is a `BinaryHeap` with a
//! reversed `Ord` so a numerically lower priority (more urgent) pops first,
//! ties broken FIFO by insertion sequence.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info};

/// What a dispatched task tells the pool to do once it returns.
pub enum TaskOutcome {
    /// The job reached a terminal status, or is parked on a dependency and
    /// will be re-enqueued by the dependency manager later. Don't requeue.
    Done,
    /// Re-queue the job at (possibly a new) priority — the processor
    /// returned DEFER.
    Requeue(i32),
}

#[derive(Debug, Eq, PartialEq)]
struct Entry {
    priority: i32,
    seq: u64,
    job_id: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.priority.cmp(&self.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

type Dispatch = dyn Fn(u64) -> TaskOutcome + Send + Sync;

struct Inner {
    heap: Mutex<BinaryHeap<Entry>>,
    cv: Condvar,
    active: AtomicBool,
    shutting_down: AtomicBool,
    running: AtomicUsize,
    next_seq: AtomicU64,
    dispatch: Box<Dispatch>,
}

/// A bounded set of worker threads consuming a shared priority queue. The
/// callback passed to [`WorkerPool::start`] is responsible for actually
/// processing a job — the pool only knows about ids and priorities.
pub struct WorkerPool {
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `threads` workers that call `dispatch(job_id)` whenever a job
    /// is popped from the priority queue.
    pub fn start<F>(threads: usize, dispatch: F) -> Self
    where
        F: Fn(u64) -> TaskOutcome + Send + Sync + 'static,
    {
        let inner = Arc::new(Inner {
            heap: Mutex::new(BinaryHeap::new()),
            cv: Condvar::new(),
            active: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            running: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            dispatch: Box::new(dispatch),
        });

        let mut handles = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let inner = inner.clone();
            handles.push(std::thread::spawn(move || worker_loop(worker_id, inner)));
        }

        WorkerPool { inner, handles: Mutex::new(handles) }
    }

    pub fn add_many_tasks(&self, items: impl IntoIterator<Item = (u64, i32)>) {
        let mut heap = self.inner.heap.lock().unwrap();
        for (job_id, priority) in items {
            let seq = self.inner.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
            heap.push(Entry { priority, seq, job_id });
        }
        drop(heap);
        self.inner.cv.notify_all();
    }

    pub fn add_task(&self, job_id: u64, priority: i32) {
        self.add_many_tasks([(job_id, priority)]);
    }

    /// Re-heap a pending (not yet picked up) task to a new priority. Returns
    /// false if the task is unknown or already running — the caller should
    /// treat that as non-fatal.
    pub fn change_task_priority(&self, job_id: u64, new_priority: i32) -> bool {
        let mut heap = self.inner.heap.lock().unwrap();
        let items: Vec<Entry> = heap.drain().collect();
        let mut found = false;
        let mut rebuilt = BinaryHeap::with_capacity(items.len());
        for mut entry in items {
            if entry.job_id == job_id {
                entry.priority = new_priority;
                found = true;
            }
            rebuilt.push(entry);
        }
        *heap = rebuilt;
        found
    }

    pub fn set_active(&self, active: bool) {
        self.inner.active.store(active, AtomicOrdering::SeqCst);
        if active {
            self.inner.cv.notify_all();
        }
    }

    pub fn has_running_tasks(&self) -> bool {
        self.inner.running.load(AtomicOrdering::SeqCst) > 0
    }

    pub fn pending_count(&self) -> usize {
        self.inner.heap.lock().unwrap().len()
    }

    pub fn terminate_workers(self) {
        self.inner.shutting_down.store(true, AtomicOrdering::SeqCst);
        self.inner.cv.notify_all();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        info!("worker pool terminated");
    }
}

fn worker_loop(worker_id: usize, inner: Arc<Inner>) {
    loop {
        let job_id = {
            let mut heap = inner.heap.lock().unwrap();
            loop {
                if inner.shutting_down.load(AtomicOrdering::SeqCst) {
                    return;
                }
                if inner.active.load(AtomicOrdering::SeqCst) {
                    if let Some(entry) = heap.pop() {
                        break entry.job_id;
                    }
                }
                heap = inner.cv.wait(heap).unwrap();
            }
        };

        inner.running.fetch_add(1, AtomicOrdering::SeqCst);
        debug!(worker_id, job_id, "worker picked up job");
        let outcome = (inner.dispatch)(job_id);
        inner.running.fetch_sub(1, AtomicOrdering::SeqCst);

        if let TaskOutcome::Requeue(priority) = outcome {
            let seq = inner.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
            inner.heap.lock().unwrap().push(Entry { priority, seq, job_id });
            inner.cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn entries_order_by_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        heap.push(Entry { priority: 5, seq: 0, job_id: 1 });
        heap.push(Entry { priority: 0, seq: 1, job_id: 2 });
        heap.push(Entry { priority: 0, seq: 2, job_id: 3 });
        assert_eq!(heap.pop().unwrap().job_id, 2);
        assert_eq!(heap.pop().unwrap().job_id, 3);
        assert_eq!(heap.pop().unwrap().job_id, 1);
    }

    #[test]
    fn pool_dispatches_in_priority_order() {
        let (tx, rx) = mpsc::channel();
        let pool = WorkerPool::start(1, move |job_id| {
            tx.send(job_id).unwrap();
            TaskOutcome::Done
        });
        pool.add_many_tasks([(1, 5), (2, 0), (3, 0)]);

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        }
        assert_eq!(seen, vec![2, 3, 1]);
        pool.terminate_workers();
    }

    #[test]
    fn change_priority_on_unknown_task_returns_false() {
        let pool = WorkerPool::start(1, |_| TaskOutcome::Done);
        assert!(!pool.change_task_priority(999, -5));
        pool.terminate_workers();
    }

    #[test]
    fn set_active_false_pauses_dispatch() {
        let (tx, rx) = mpsc::channel();
        let pool = WorkerPool::start(1, move |job_id| {
            tx.send(job_id).unwrap();
            TaskOutcome::Done
        });
        pool.set_active(false);
        pool.add_task(1, 0);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        pool.set_active(true);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        pool.terminate_workers();
    }
}
