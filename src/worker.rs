//! The worker pool driving handler steps.
//!
//! A [`WorkQueue`] is an unbounded FIFO of step callbacks guarded by a mutex
//! and a condition variable. [`WorkerPool`] runs N OS threads that pop
//! callbacks, invoke them, and re-enqueue the ones that report more work.
//! Callbacks are not pinned to threads: any worker may pick up the next step
//! of any handler, which is why handler state crosses the queue as `Send`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use std::sync::Arc;

/// A single unit of handler work. Returns `true` when finished, `false` to
/// be re-enqueued at the back of the queue.
pub type Job = Box<dyn FnMut() -> bool + Send>;

#[derive(Default)]
struct QueueInner {
    jobs: VecDeque<Job>,
    terminated: bool,
}

/// An unbounded FIFO work queue shared between the I/O task and the workers.
#[derive(Default)]
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("WorkQueue")
            .field("jobs", &inner.jobs.len())
            .field("terminated", &inner.terminated)
            .finish()
    }
}

impl WorkQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a job to the back of the queue.
    ///
    /// Jobs pushed after [`WorkQueue::terminate`] are silently dropped; the
    /// request they belong to is abandoned as part of shutdown.
    pub fn push(&self, job: Job) {
        let mut inner = self.lock();
        if inner.terminated {
            return;
        }
        inner.jobs.push_front(job);
        self.available.notify_one();
    }

    /// Removes and returns the oldest job, blocking while the queue is empty.
    ///
    /// Returns [`None`] once the queue has been terminated, even if jobs
    /// remain; in-flight requests are abandoned on shutdown.
    #[must_use]
    pub fn pop(&self) -> Option<Job> {
        let mut inner = self.lock();
        loop {
            if inner.terminated {
                return None;
            }
            if let Some(job) = inner.jobs.pop_back() {
                return Some(job);
            }
            inner = self
                .available
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// The number of queued jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Tests whether the queue is currently empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    /// Marks the queue terminated and wakes every blocked worker.
    pub fn terminate(&self) {
        let mut inner = self.lock();
        inner.terminated = true;
        inner.jobs.clear();
        self.available.notify_all();
    }
}


/// A fixed set of worker threads consuming a shared [`WorkQueue`].
#[derive(Debug)]
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `count` worker threads; 0 selects the available hardware
    /// parallelism. At least one worker always runs.
    #[must_use]
    pub fn start(count: usize) -> Self {
        let count = match count {
            0 => std::thread::available_parallelism().map_or(1, usize::from),
            n => n,
        };
        let queue = Arc::new(WorkQueue::new());

        let threads = (0..count)
            .map(|idx| {
                let queue = Arc::clone(&queue);
                std::thread::Builder::new()
                    .name(format!("fcgi-worker-{idx}"))
                    .spawn(move || worker_main(&queue))
                    .expect("spawning worker thread failed")
            })
            .collect();
        tracing::debug!(workers = count, "worker pool started");
        Self { queue, threads }
    }

    /// The queue feeding this pool.
    #[inline]
    #[must_use]
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// The number of worker threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Terminates the queue and joins all workers.
    pub fn shutdown(self) {
        self.queue.terminate();
        for handle in self.threads {
            if handle.join().is_err() {
                tracing::error!("worker thread exited with a panic");
            }
        }
        tracing::debug!("worker pool stopped");
    }
}

fn worker_main(queue: &WorkQueue) {
    while let Some(mut job) = queue.pop() {
        if !job() {
            queue.push(job);
            // Keep a lone unfinished job from monopolizing the CPU
            std::thread::yield_now();
        }
    }
    tracing::trace!("worker exiting");
}
