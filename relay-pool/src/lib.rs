//! A dynamically sized worker-thread pool.
//!
//! [`WorkerPool`] executes submitted closures on a set of worker threads
//! that grows on demand up to a configured ceiling and shrinks again
//! while the pool sits idle: each time a full idle period passes without
//! work arriving, one ready worker is retired. Threads are cheap to
//! start, so there is no point keeping a warm pool around between
//! bursts.
//!
//! All coordination runs through one dispatcher thread that selects over
//! three events (task arrival, the idle timer, a stop request) and
//! hands tasks to workers over a rendezvous channel. A hand-off on that
//! channel succeeds immediately only when a worker is already waiting,
//! which is exactly the "reuse an idle worker, otherwise spawn" decision
//! the dispatcher needs.
//!
//! Two shutdown disciplines are provided:
//!
//! - [`stop`](WorkerPool::stop): running tasks finish, queued tasks are
//!   abandoned.
//! - [`stop_wait`](WorkerPool::stop_wait): every queued task is executed
//!   before the call returns.
//!
//! # Example
//!
//! ```
//! use relay_pool::WorkerPool;
//! use std::sync::mpsc::channel;
//!
//! let pool = WorkerPool::new(2, 0);
//! let (tx, rx) = channel();
//!
//! for i in 0..5 {
//!     let tx = tx.clone();
//!     pool.submit(move || {
//!         tx.send(i * i).unwrap();
//!     });
//! }
//! pool.stop_wait();
//!
//! let mut squares: Vec<i32> = rx.try_iter().collect();
//! squares.sort();
//! assert_eq!(squares, vec![0, 1, 4, 9, 16]);
//! ```
//!
//! Tasks provide no ordering guarantee between workers; only consecutive
//! tasks that happen to run on the same worker execute in submission
//! order. A task that blocks forever wedges its worker; there is no
//! per-task timeout or cancellation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{after, bounded, select, Receiver, Sender, TrySendError};
use crossbeam_utils::sync::WaitGroup;

/// A unit of work. Captured state must be moved into the closure; results
/// travel back over whatever channel the closure captured.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Workers idle for one full timer period are retired, one per period.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

const MIN_IDLE_TIMEOUT: Duration = Duration::from_millis(1);

/// A pool of worker threads whose concurrency never exceeds the
/// configured maximum.
///
/// The pool is running as soon as [`new`](WorkerPool::new) returns and
/// must be shut down with [`stop`](WorkerPool::stop) or
/// [`stop_wait`](WorkerPool::stop_wait); dropping the pool performs a
/// `stop_wait`.
pub struct WorkerPool {
    task_tx: Sender<Task>,
    task_rx: Receiver<Task>,
    /// Rendezvous channel to the workers. `None` is the kill signal.
    dispatch_tx: Sender<Option<Task>>,
    dispatch_rx: Receiver<Option<Task>>,
    /// `true` asks the dispatcher to drain the task queue before exiting.
    stop_tx: Sender<bool>,
    stop_rx: Receiver<bool>,
    max_workers: Arc<AtomicUsize>,
    idle_timeout_nanos: Arc<AtomicU64>,
    state: Mutex<PoolState>,
}

struct PoolState {
    running: bool,
    /// Joined by `stop`/`stop_wait`; the dispatcher and every worker hold
    /// a clone.
    wait: Option<WaitGroup>,
}

impl WorkerPool {
    /// Creates and starts a pool.
    ///
    /// `max_workers` is the worker-thread ceiling (values below 1 are
    /// treated as 1). `max_waits` sizes the task queue: a
    /// [`submit`](WorkerPool::submit) beyond it blocks until the
    /// dispatcher catches up. With `max_waits == 0` every submit
    /// rendezvouses with the dispatcher directly.
    #[must_use]
    pub fn new(max_workers: usize, max_waits: usize) -> Self {
        let (task_tx, task_rx) = bounded(max_waits);
        let (dispatch_tx, dispatch_rx) = bounded(0);
        let (stop_tx, stop_rx) = bounded(2);

        let pool = Self {
            task_tx,
            task_rx,
            dispatch_tx,
            dispatch_rx,
            stop_tx,
            stop_rx,
            max_workers: Arc::new(AtomicUsize::new(max_workers.max(1))),
            idle_timeout_nanos: Arc::new(AtomicU64::new(DEFAULT_IDLE_TIMEOUT.as_nanos() as u64)),
            state: Mutex::new(PoolState {
                running: false,
                wait: None,
            }),
        };
        pool.start();
        pool
    }

    /// Starts the dispatcher if the pool is stopped. Called by the
    /// constructor; useful again after a `stop` to reuse the pool.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        if state.running {
            return;
        }
        state.running = true;

        let wait = WaitGroup::new();
        let dispatcher = Dispatcher {
            task_rx: self.task_rx.clone(),
            dispatch_tx: self.dispatch_tx.clone(),
            dispatch_rx: self.dispatch_rx.clone(),
            stop_rx: self.stop_rx.clone(),
            max_workers: Arc::clone(&self.max_workers),
            idle_timeout_nanos: Arc::clone(&self.idle_timeout_nanos),
            wait: wait.clone(),
            cur_workers: 0,
        };
        state.wait = Some(wait);

        thread::Builder::new()
            .name("relay-pool-dispatcher".into())
            .spawn(move || dispatcher.run())
            .expect("failed to spawn pool dispatcher thread");
    }

    /// Returns `true` while the pool accepts and dispatches tasks.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    /// Returns the worker-thread ceiling.
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.max_workers.load(Ordering::Relaxed)
    }

    /// Changes the worker-thread ceiling of a live pool.
    ///
    /// # Panics
    ///
    /// Panics if `max_workers` is 0; silently clamping a misconfigured
    /// ceiling could deadlock callers that size work to it.
    pub fn set_max_workers(&self, max_workers: usize) {
        assert!(max_workers >= 1, "WorkerPool: max_workers must be at least 1");
        self.max_workers.store(max_workers, Ordering::Relaxed);
    }

    /// Returns the idle period after which one ready worker is retired.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_nanos(self.idle_timeout_nanos.load(Ordering::Relaxed))
    }

    /// Changes the idle period of a live pool. Takes effect when the
    /// current period elapses.
    ///
    /// # Panics
    ///
    /// Panics if `timeout` is shorter than one millisecond.
    pub fn set_idle_timeout(&self, timeout: Duration) {
        assert!(
            timeout >= MIN_IDLE_TIMEOUT,
            "WorkerPool: idle timeout must be at least 1ms"
        );
        self.idle_timeout_nanos
            .store(timeout.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Enqueues `task` for asynchronous execution.
    ///
    /// Blocks while the task queue is at capacity (see
    /// [`new`](WorkerPool::new)). Tasks must not be submitted after the
    /// pool has been stopped.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.task_tx.send(Box::new(task));
    }

    /// Enqueues `task` and blocks until it has been executed.
    pub fn submit_wait<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done_rx) = bounded::<()>(0);
        self.submit(move || {
            task();
            drop(done_tx);
        });
        // Disconnect doubles as the completion signal; it also fires when
        // the task panicked and its captures unwound.
        let _ = done_rx.recv();
    }

    /// Stops the pool, waiting only for the tasks currently being
    /// executed. Queued tasks that were never dispatched are abandoned.
    ///
    /// Idempotent; concurrent calls all block until shutdown completes.
    pub fn stop(&self) {
        self.shutdown(false);
    }

    /// Stops the pool after draining the task queue: every task already
    /// submitted is executed before this returns.
    pub fn stop_wait(&self) {
        self.shutdown(true);
    }

    fn shutdown(&self, wait_for_queued: bool) {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return;
        }

        // The stop channel is buffered, so this returns even while the
        // dispatcher is blocked handing off a task.
        let _ = self.stop_tx.send(wait_for_queued);
        if let Some(wait) = state.wait.take() {
            wait.wait();
        }
        state.running = false;
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop_wait();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.max_workers())
            .field("idle_timeout", &self.idle_timeout())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// The single-threaded event loop that owns the worker count.
///
/// `cur_workers` has no atomic because this thread is its only writer;
/// everything the dispatcher decides is based on its own bookkeeping.
struct Dispatcher {
    task_rx: Receiver<Task>,
    dispatch_tx: Sender<Option<Task>>,
    dispatch_rx: Receiver<Option<Task>>,
    stop_rx: Receiver<bool>,
    max_workers: Arc<AtomicUsize>,
    idle_timeout_nanos: Arc<AtomicU64>,
    wait: WaitGroup,
    cur_workers: usize,
}

impl Dispatcher {
    fn run(mut self) {
        let task_rx = self.task_rx.clone();
        let stop_rx = self.stop_rx.clone();

        let mut idle = false;
        let mut stopping = false;

        loop {
            let timeout = after(self.idle_timeout());
            select! {
                recv(task_rx) -> task => {
                    if let Ok(task) = task {
                        self.dispatch(task);
                        idle = false;
                    }
                }
                recv(timeout) -> _ => {
                    // A full period without work: retire one ready worker.
                    if idle && self.cur_workers > 0 && self.kill_idle_worker() {
                        self.cur_workers -= 1;
                    }
                    idle = true;
                }
                recv(stop_rx) -> wait_for_queued => {
                    match wait_for_queued {
                        Ok(true) => stopping = true,
                        // A plain stop (or a disconnected pool) ends the
                        // loop immediately; queued tasks are abandoned.
                        _ => break,
                    }
                }
            }

            if stopping && task_rx.is_empty() {
                break;
            }
        }

        // Terminal cleanup: hand every remaining worker a kill signal.
        // Busy workers pick theirs up after finishing the current task.
        while self.cur_workers > 0 {
            let _ = self.dispatch_tx.send(None);
            self.cur_workers -= 1;
        }
        // Dropping self.wait lets a pending stop() return.
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_nanos(self.idle_timeout_nanos.load(Ordering::Relaxed))
    }

    /// Sends the task to a worker, growing the pool when that pays off.
    fn dispatch(&mut self, task: Task) {
        if self.cur_workers >= self.max_workers.load(Ordering::Relaxed) {
            // At the ceiling: block until some worker comes back for more.
            let _ = self.dispatch_tx.send(Some(task));
            return;
        }

        // Below the ceiling: a rendezvous try_send succeeds only if a
        // worker is already waiting. Otherwise spawn one, seeded with the
        // task as its first unit of work.
        match self.dispatch_tx.try_send(Some(task)) {
            Ok(()) => {}
            Err(TrySendError::Full(Some(task))) => self.spawn_worker(task),
            Err(_) => {}
        }
    }

    fn spawn_worker(&mut self, first: Task) {
        let dispatch_rx = self.dispatch_rx.clone();
        let wait = self.wait.clone();
        thread::Builder::new()
            .name("relay-pool-worker".into())
            .spawn(move || worker(first, dispatch_rx, wait))
            .expect("failed to spawn pool worker thread");
        self.cur_workers += 1;
    }

    /// Offers a kill signal to whichever worker is waiting right now.
    /// Fails when none is ready, meaning every worker is mid-task.
    fn kill_idle_worker(&self) -> bool {
        self.dispatch_tx.try_send(None).is_ok()
    }
}

/// Worker thread body: run the seed task, then serve the dispatch channel
/// until a kill signal (or the channel closing) arrives.
fn worker(first: Task, dispatch_rx: Receiver<Option<Task>>, wait: WaitGroup) {
    let mut task = Some(first);
    while let Some(run) = task {
        // A panicking task must not take the worker down: the dispatcher
        // still counts this thread and terminal cleanup would block
        // signalling a worker that no longer exists.
        let _ = catch_unwind(AssertUnwindSafe(run));
        task = match dispatch_rx.recv() {
            Ok(next) => next,
            Err(_) => None,
        };
    }
    drop(wait);
}
