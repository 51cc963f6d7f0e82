//! Fixed-size worker pool with a bounded backlog.
//!
//! Jobs are queued on a bounded channel and matched to idle workers by a
//! single dispatcher thread:
//!
//! ```text
//! handle(job) ──► [ job queue (backlog) ] ──► dispatcher ──► worker slot
//!                                                 ▲               │
//!                                                 └── ready ids ◄─┘
//! ```
//!
//! The queue is the only backpressure point: `handle` blocks while the
//! backlog is full, and the dispatcher blocks while every worker is busy.
//! At most `workers` jobs execute at once.
//!
//! ## Shutdown
//!
//! `stop` closes the queue for new submissions. The dispatcher keeps
//! draining until the queue is empty, handing every pending job to a worker,
//! and only then closes the worker slots. Workers finish whatever they are
//! running before exiting, and `stop` returns once all of them are joined.

mod worker;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};
use worker::Worker;

/// A unit of work executed to completion by one worker.
pub trait Job: Send + 'static {
    fn run(self: Box<Self>);
}

impl<F> Job for F
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) {
        (*self)()
    }
}

/// Errors returned by the pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is stopped")]
    Stopped,

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("failed to spawn pool thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Lifecycle of the pool threads.
enum State {
    /// Created, queue open, no threads yet.
    Idle(Receiver<Box<dyn Job>>),
    /// Dispatcher running; the handle is joined on stop.
    Running(JoinHandle<()>),
    /// Stop in progress or finished.
    Stopped,
}

/// A fixed set of workers fed from a bounded job queue.
pub struct WorkerPool {
    max_workers: usize,
    capacity: usize,
    /// Producer side of the job queue. `None` once stopping.
    jobs: Mutex<Option<SyncSender<Box<dyn Job>>>>,
    state: Mutex<State>,
    stopped: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Create a pool of `workers` workers and a backlog of `queue_len` jobs.
    ///
    /// A worker count of zero is raised to one; a pool without workers could
    /// never drain its queue.
    pub fn new(workers: usize, queue_len: usize) -> Self {
        let max_workers = workers.max(1);
        let (jobs_tx, jobs_rx) = mpsc::sync_channel(queue_len);

        Self {
            max_workers,
            capacity: queue_len,
            jobs: Mutex::new(Some(jobs_tx)),
            state: Mutex::new(State::Idle(jobs_rx)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of workers, i.e. the maximum number of concurrently running jobs.
    pub fn worker_count(&self) -> usize {
        self.max_workers
    }

    /// Backlog capacity of the job queue.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Start the workers and the dispatcher.
    pub fn run(&self) -> Result<(), PoolError> {
        let mut state = lock(&self.state);

        let jobs = match std::mem::replace(&mut *state, State::Stopped) {
            State::Idle(jobs) => jobs,
            other => {
                let err = match other {
                    State::Running(_) => PoolError::AlreadyRunning,
                    _ => PoolError::Stopped,
                };
                *state = other;
                return Err(err);
            }
        };

        // Each worker has at most one registration outstanding, so workers
        // never block on this channel.
        let (ready_tx, ready_rx) = mpsc::sync_channel(self.max_workers);

        let mut workers = Vec::with_capacity(self.max_workers);
        for id in 0..self.max_workers {
            match Worker::start(id, ready_tx.clone()) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    // Dropping the started workers stops them.
                    *state = State::Idle(jobs);
                    return Err(e.into());
                }
            }
        }
        drop(ready_tx);

        let stopped = Arc::clone(&self.stopped);
        let dispatcher = thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || {
                dispatch(jobs, ready_rx, workers);
                stopped.store(true, Ordering::Release);
            })?;

        info!(
            workers = self.max_workers,
            backlog = self.capacity,
            "Worker pool started"
        );

        *state = State::Running(dispatcher);
        Ok(())
    }

    /// Submit a job, blocking while the backlog is full.
    ///
    /// Fails once `stop` has begun; the job is dropped without running.
    pub fn handle<J: Job>(&self, job: J) -> Result<(), PoolError> {
        self.handle_boxed(Box::new(job))
    }

    /// Submit an already boxed job. See [`WorkerPool::handle`].
    pub fn handle_boxed(&self, job: Box<dyn Job>) -> Result<(), PoolError> {
        // Clone out of the lock so a blocked send doesn't hold it.
        let jobs = lock(&self.jobs).clone().ok_or(PoolError::Stopped)?;
        jobs.send(job).map_err(|_| PoolError::Stopped)
    }

    /// Drain the queue, run every pending job, then terminate the workers.
    ///
    /// Returns once all workers have exited. A no-op when already stopped.
    pub fn stop(&self) {
        if self.stopped() {
            return;
        }

        // No new submissions. Senders cloned by in-progress `handle` calls
        // keep the queue open until their send completes.
        drop(lock(&self.jobs).take());

        let previous = std::mem::replace(&mut *lock(&self.state), State::Stopped);
        match previous {
            State::Running(dispatcher) => {
                if dispatcher.join().is_err() {
                    warn!("Dispatcher thread panicked");
                }
                // In case the dispatcher died before recording it.
                self.stopped.store(true, Ordering::Release);
                info!("Worker pool stopped");
            }
            State::Idle(jobs) => {
                let dropped = jobs.try_iter().count();
                if dropped > 0 {
                    warn!(dropped, "Pool stopped before running; queued jobs discarded");
                }
                self.stopped.store(true, Ordering::Release);
            }
            // A concurrent stop owns the dispatcher.
            State::Stopped => {}
        }
    }

    /// Whether the pool has fully halted.
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Dispatcher loop: pair each queued job with the next idle worker.
///
/// Returns after the queue is closed and drained and every worker exited.
fn dispatch(jobs: Receiver<Box<dyn Job>>, ready: Receiver<usize>, mut workers: Vec<Worker>) {
    'jobs: for job in jobs.iter() {
        let mut job = Some(job);

        while job.is_some() {
            let id = match ready.recv() {
                Ok(id) => id,
                // All workers are gone; nothing can run the rest.
                Err(_) => break 'jobs,
            };

            match workers[id].assign(job.take()) {
                Ok(()) => {}
                Err(returned) => {
                    warn!(worker = id, "Worker unavailable, retrying hand-off");
                    job = returned;
                }
            }
        }
    }

    let pending = jobs.try_iter().count();
    if pending > 0 {
        warn!(pending, "Dispatcher exiting with undispatched jobs");
    }

    debug!("Job queue drained, stopping workers");
    for worker in &mut workers {
        worker.stop();
        debug!(worker = worker.id(), "Worker stopped");
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Barrier, Condvar};
    use std::time::{Duration, Instant};

    /// A gate jobs can wait on until the test opens it.
    #[derive(Default)]
    struct Gate {
        open: Mutex<bool>,
        cond: Condvar,
    }

    impl Gate {
        fn wait(&self) {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cond.wait(open).unwrap();
            }
        }

        fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.cond.notify_all();
        }
    }

    #[test]
    fn test_runs_all_jobs() {
        let pool = WorkerPool::new(3, 10);
        pool.run().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.handle(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.stop();
        assert!(pool.stopped());
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_run_twice_fails() {
        let pool = WorkerPool::new(1, 1);
        pool.run().unwrap();
        assert!(matches!(pool.run(), Err(PoolError::AlreadyRunning)));

        pool.stop();
        assert!(matches!(pool.run(), Err(PoolError::Stopped)));
    }

    #[test]
    fn test_workers_run_concurrently() {
        let workers = 4;
        let pool = WorkerPool::new(workers, 0);
        pool.run().unwrap();

        // Every job waits for all the others: only completes if all four
        // are running at the same time.
        let barrier = Arc::new(Barrier::new(workers));
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..workers {
            let barrier = Arc::clone(&barrier);
            let done = Arc::clone(&done);
            pool.handle(move || {
                barrier.wait();
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.stop();
        assert_eq!(done.load(Ordering::SeqCst), workers);
    }

    #[test]
    fn test_concurrency_bounded_by_worker_count() {
        let pool = WorkerPool::new(2, 16);
        pool.run().unwrap();

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..12 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            pool.handle(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                active.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.stop();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handle_blocks_when_backlog_full() {
        let pool = Arc::new(WorkerPool::new(1, 1));
        pool.run().unwrap();
        let gate = Arc::new(Gate::default());

        // Occupies the worker.
        let g = Arc::clone(&gate);
        pool.handle(move || g.wait()).unwrap();

        // Wait until the worker holds the first job so the queue is empty.
        thread::sleep(Duration::from_millis(50));

        // Fills the backlog slot, plus one held by the dispatcher.
        pool.handle(|| {}).unwrap();
        pool.handle(|| {}).unwrap();

        // This one has nowhere to go and must block.
        let (tx, rx) = mpsc::channel();
        let p = Arc::clone(&pool);
        let submitter = thread::spawn(move || {
            p.handle(|| {}).unwrap();
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        gate.open();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        submitter.join().unwrap();

        pool.stop();
    }

    #[test]
    fn test_stop_drains_queued_jobs() {
        let pool = WorkerPool::new(1, 8);
        pool.run().unwrap();
        let gate = Arc::new(Gate::default());
        let finished = Arc::new(AtomicUsize::new(0));

        let g = Arc::clone(&gate);
        pool.handle(move || g.wait()).unwrap();

        for _ in 0..8 {
            let finished = Arc::clone(&finished);
            pool.handle(move || {
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        // Release the blocker shortly after stop begins.
        let g = Arc::clone(&gate);
        let opener = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            g.open();
        });

        let started = Instant::now();
        pool.stop();
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(finished.load(Ordering::SeqCst), 8);
        opener.join().unwrap();
    }

    #[test]
    fn test_handle_after_stop_is_rejected() {
        let pool = WorkerPool::new(2, 2);
        pool.run().unwrap();
        pool.stop();

        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        let result = pool.handle(move || r.store(true, Ordering::SeqCst));

        assert!(matches!(result, Err(PoolError::Stopped)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_handle_during_stop_is_rejected() {
        let pool = Arc::new(WorkerPool::new(1, 4));
        pool.run().unwrap();
        let gate = Arc::new(Gate::default());

        // Keeps the drain in progress until the gate opens.
        let g = Arc::clone(&gate);
        pool.handle(move || g.wait()).unwrap();

        let p = Arc::clone(&pool);
        let stopper = thread::spawn(move || p.stop());

        // Wait until stop has closed submissions.
        let started = Instant::now();
        while lock(&pool.jobs).is_some() {
            assert!(started.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!pool.stopped());

        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        let result = pool.handle(move || r.store(true, Ordering::SeqCst));
        assert!(matches!(result, Err(PoolError::Stopped)));

        gate.open();
        stopper.join().unwrap();
        assert!(pool.stopped());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let pool = WorkerPool::new(2, 2);
        assert!(!pool.stopped());
        pool.run().unwrap();
        pool.stop();
        pool.stop();
        assert!(pool.stopped());
    }

    #[test]
    fn test_stop_without_run() {
        let pool = WorkerPool::new(2, 4);
        pool.handle(|| {}).unwrap();
        pool.stop();
        assert!(pool.stopped());
        assert!(matches!(pool.handle(|| {}), Err(PoolError::Stopped)));
    }

    #[test]
    fn test_zero_workers_raised_to_one() {
        let pool = WorkerPool::new(0, 0);
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(pool.capacity(), 0);
    }
}
