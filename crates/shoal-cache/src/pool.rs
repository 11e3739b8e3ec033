//! Bounded background worker pool.
//!
//! Two modes, chosen by the queue depth: a queued thread pool whose
//! producers block while the queue is full, or spawn-on-demand threads
//! that fall back to running the job in the caller once the thread limit
//! is reached. Both limits are adjustable at runtime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    queue: Mutex<VecDeque<Job>>,
    /// Workers block here until a job is queued.
    job_ready: Condvar,
    /// Producers block here while the queue is full.
    slot_free: Condvar,
    queue_capacity: AtomicUsize,
    thread_capacity: AtomicUsize,
    /// Long-lived queued-mode workers.
    worker_count: AtomicUsize,
    /// Short-lived spawn-mode threads.
    spawned_count: AtomicUsize,
    shutdown: AtomicBool,
}

/// Executes submitted jobs with bounded concurrency.
pub struct BackgroundPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundPool {
    /// A queue depth of zero selects spawn-on-demand mode.
    pub fn new(worker_threads: usize, queue_depth: usize) -> Self {
        let pool = Self {
            inner: Arc::new(PoolInner {
                queue: Mutex::new(VecDeque::new()),
                job_ready: Condvar::new(),
                slot_free: Condvar::new(),
                queue_capacity: AtomicUsize::new(queue_depth),
                thread_capacity: AtomicUsize::new(worker_threads),
                worker_count: AtomicUsize::new(0),
                spawned_count: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
            }),
            workers: Mutex::new(Vec::new()),
        };
        if queue_depth > 0 {
            pool.spawn_workers(worker_threads);
        }
        pool
    }

    /// Executes `job` in the background, blocking the caller while the
    /// queue is full. In spawn mode an over-limit job runs synchronously
    /// in the caller instead.
    pub fn run(&self, job: impl FnOnce() + Send + 'static) {
        let job: Job = Box::new(job);
        if self.inner.queue_capacity.load(Ordering::Acquire) == 0 {
            self.run_unqueued(job, true);
            return;
        }

        let mut queue = self.inner.queue.lock().expect("pool queue poisoned");
        loop {
            let capacity = self.inner.queue_capacity.load(Ordering::Acquire);
            if capacity == 0 {
                // Reconfigured to spawn mode while we waited.
                drop(queue);
                self.run_unqueued(job, true);
                return;
            }
            if self.inner.shutdown.load(Ordering::Acquire) || queue.len() < capacity {
                break;
            }
            queue = self
                .inner
                .slot_free
                .wait(queue)
                .expect("pool queue poisoned");
        }
        queue.push_back(job);
        self.inner.job_ready.notify_one();
    }

    /// Executes `job` in the background unless the queue (or, in spawn
    /// mode, the thread limit) is saturated. Returns whether the job was
    /// accepted.
    pub fn try_run(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let job: Job = Box::new(job);
        if self.inner.queue_capacity.load(Ordering::Acquire) == 0 {
            return self.run_unqueued(job, false);
        }

        let mut queue = self.inner.queue.lock().expect("pool queue poisoned");
        if queue.len() >= self.inner.queue_capacity.load(Ordering::Acquire) {
            return false;
        }
        queue.push_back(job);
        self.inner.job_ready.notify_one();
        true
    }

    /// Adjusts both limits at runtime. Shrinking lets excess workers
    /// drain on their next wake; queued jobs are never dropped.
    pub fn change_configuration(&self, worker_threads: usize, queue_depth: usize) {
        self.inner
            .thread_capacity
            .store(worker_threads, Ordering::Release);
        self.inner
            .queue_capacity
            .store(queue_depth, Ordering::Release);

        if queue_depth > 0 {
            let current = self.inner.worker_count.load(Ordering::Acquire);
            if worker_threads > current {
                self.spawn_workers(worker_threads - current);
            }
        }
        // Wake everyone so excess workers and blocked producers observe
        // the new limits.
        self.inner.job_ready.notify_all();
        self.inner.slot_free.notify_all();
        debug!(worker_threads, queue_depth, "pool reconfigured");
    }

    fn spawn_workers(&self, count: usize) {
        let mut workers = self.workers.lock().expect("pool worker list poisoned");
        for _ in 0..count {
            let inner = Arc::clone(&self.inner);
            inner.worker_count.fetch_add(1, Ordering::AcqRel);
            match std::thread::Builder::new()
                .name("shoal-bg".to_owned())
                .spawn(move || worker_loop(inner))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    self.inner.worker_count.fetch_sub(1, Ordering::AcqRel);
                    warn!(error = %e, "failed to spawn pool worker");
                }
            }
        }
    }

    /// Spawn-on-demand execution. With `sync_fallback`, an over-limit job
    /// runs in the caller; otherwise it is dropped and false is returned.
    fn run_unqueued(&self, job: Job, sync_fallback: bool) -> bool {
        let reserved = self
            .inner
            .spawned_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < self.inner.thread_capacity.load(Ordering::Acquire) {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok();

        if reserved {
            let inner = Arc::clone(&self.inner);
            let spawned = std::thread::Builder::new()
                .name("shoal-bg-adhoc".to_owned())
                .spawn(move || {
                    job();
                    inner.spawned_count.fetch_sub(1, Ordering::AcqRel);
                });
            if let Err(e) = spawned {
                self.inner.spawned_count.fetch_sub(1, Ordering::AcqRel);
                warn!(error = %e, "failed to spawn ad hoc worker");
                return false;
            }
            return true;
        }

        if sync_fallback {
            job();
        }
        sync_fallback
    }
}

impl Drop for BackgroundPool {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.job_ready.notify_all();
        self.inner.slot_free.notify_all();

        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .expect("pool worker list poisoned")
            .drain(..)
            .collect();
        for worker in workers {
            let _ = worker.join();
        }
        // Ad hoc threads hold no pool state beyond the counter; wait for
        // them so jobs never outlive the pool owner.
        while self.inner.spawned_count.load(Ordering::Acquire) > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let job = {
            let mut queue = inner.queue.lock().expect("pool queue poisoned");
            loop {
                if inner.shutdown.load(Ordering::Acquire) {
                    inner.worker_count.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
                // Shrunk below the live worker count, or switched to
                // spawn mode: this worker drains out.
                let over_limit = inner.worker_count.load(Ordering::Acquire)
                    > inner.thread_capacity.load(Ordering::Acquire)
                    || inner.queue_capacity.load(Ordering::Acquire) == 0;
                if over_limit && queue.is_empty() {
                    inner.worker_count.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
                if let Some(job) = queue.pop_front() {
                    inner.slot_free.notify_all();
                    break job;
                }
                queue = inner.job_ready.wait(queue).expect("pool queue poisoned");
            }
        };
        job();
    }
}
