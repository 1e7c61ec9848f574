//! The executor seam and two stock implementations.
//!
//! The scheduler never creates threads of its own: whenever a wakeup or a
//! spawn discovers that a party must run and the work should leave the
//! current stack, it hands a closure to the injected [`Executor`]. The only
//! requirement is that the closure runs on some thread eventually; there is
//! no ordering guarantee between closures, and `run` must be callable from
//! any thread, including from inside a worker.
//!
//! [`ThreadPoolExecutor`] is the production-shaped implementation: a fixed
//! set of workers parked on a condvar around a shared injector queue.
//! [`InlineExecutor`] runs every closure on the caller's stack and exists
//! for deterministic single-threaded tests.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::trace;

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send>;

/// Schedules closures onto worker threads.
pub trait Executor: Send + Sync + 'static {
    /// Runs `job` on some thread, eventually.
    fn run(&self, job: Job);
}

/// Shared state between the pool handle and its workers.
struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    work_available: Condvar,
    shutdown: AtomicBool,
}

/// A fixed-size worker pool.
///
/// Workers pop jobs from one shared injector queue and park on a condvar
/// when it is empty. Dropping the pool drains the queue: workers finish
/// whatever is enqueued (including jobs enqueued by running jobs) before
/// joining.
///
/// Keep at least one reference to the pool outside the parties it serves.
/// A pool whose final `Arc` is dropped inside one of its own workers (for
/// example via the last handle to a party that owned it) would join the
/// dropping thread from itself.
pub struct ThreadPoolExecutor {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolExecutor {
    /// Creates a pool with `threads` workers.
    ///
    /// # Panics
    ///
    /// Panics if `threads` is zero.
    #[must_use]
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0, "a worker pool needs at least one thread");
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..threads)
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("party-worker-{index}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { shared, workers }
    }

    /// Number of worker threads.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.workers.len()
    }
}

impl Default for ThreadPoolExecutor {
    /// A pool sized to the machine, capped at 8 workers.
    fn default() -> Self {
        let threads = std::thread::available_parallelism().map_or(4, usize::from).min(8);
        Self::new(threads)
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.work_available.wait(&mut queue);
            }
        };
        job();
    }
}

impl Executor for ThreadPoolExecutor {
    fn run(&self, job: Job) {
        self.shared.queue.lock().push_back(job);
        self.shared.work_available.notify_one();
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        {
            // Flip the flag under the queue lock: a worker is then either
            // before its shutdown check (and will see the flag) or already
            // parked (and will be notified). Flipping outside the lock can
            // slip between the two and strand a parked worker.
            let _queue = self.shared.queue.lock();
            self.shared.shutdown.store(true, Ordering::Release);
        }
        self.shared.work_available.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                trace!("worker thread panicked during shutdown");
            }
        }
    }
}

impl fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("threads", &self.workers.len())
            .finish_non_exhaustive()
    }
}

/// Runs every job immediately on the calling thread.
///
/// Deterministic and single-threaded; intended for tests. Anything that
/// blocks waiting for a job it posted itself will deadlock here, exactly as
/// it would starve a one-thread pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl InlineExecutor {
    /// Creates the inline executor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Executor for InlineExecutor {
    fn run(&self, job: Job) {
        job();
    }
}
