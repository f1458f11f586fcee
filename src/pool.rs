//! Worker Pool (spec.md §4.3).
//!
//! The teacher's [`Scheduler`](crate) statically partitions a flat test list
//! into `max_parallel` batches up front, because its unit of work has no
//! dependency ordering. A DAG executor can't do that: modules become
//! runnable at unpredictable times as their dependencies finish, so
//! admission has to be a dynamic gate rather than a precomputed batch
//! assignment. We reach for `tokio::sync::Semaphore` directly for that gate,
//! the same concurrency primitive the teacher already depends on via
//! `tokio`, just used as a counting admission control instead of a batch
//! splitter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

/// Bounds the number of modules running their command body concurrently.
pub struct WorkerPool {
    semaphore: Semaphore,
    ids: IdPool,
}

impl WorkerPool {
    /// Creates a pool admitting up to `capacity` concurrent workers.
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Semaphore::new(capacity),
            ids: IdPool::new(capacity),
        }
    }

    /// Blocks until a worker slot is free, then returns a guard holding it.
    /// The guard's `id()` is stable for the lifetime of the acquisition and
    /// reused by later acquisitions once released, useful for log lines
    /// like `[worker 2] module finished`.
    pub async fn acquire(&self) -> WorkerSlot<'_> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("worker pool semaphore is never closed");
        let id = self.ids.take();
        WorkerSlot {
            _permit: permit,
            ids: &self.ids,
            id,
        }
    }
}

/// An acquired worker slot. Releases its permit and returns its id to the
/// free-list on drop.
pub struct WorkerSlot<'a> {
    _permit: SemaphorePermit<'a>,
    ids: &'a IdPool,
    id: usize,
}

impl WorkerSlot<'_> {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for WorkerSlot<'_> {
    fn drop(&mut self) {
        self.ids.give_back(self.id);
    }
}

/// Hands out small integer worker ids, reused as slots free up, so log
/// output reads `[worker 0]`, `[worker 1]`, ... rather than a monotonically
/// increasing counter.
struct IdPool {
    free: std::sync::Mutex<Vec<usize>>,
    next: AtomicUsize,
    capacity: usize,
}

impl IdPool {
    fn new(capacity: usize) -> Self {
        Self {
            free: std::sync::Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            capacity,
        }
    }

    fn take(&self) -> usize {
        if let Some(id) = self.free.lock().unwrap().pop() {
            return id;
        }
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        debug_assert!(id < self.capacity, "more ids handed out than capacity");
        id
    }

    fn give_back(&self, id: usize) {
        self.free.lock().unwrap().push(id);
    }
}

/// Shared handle to a [`WorkerPool`], convenient for threading through
/// `tokio_scoped::scope` spawns that each need their own reference.
pub type SharedWorkerPool = Arc<WorkerPool>;
