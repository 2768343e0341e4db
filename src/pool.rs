//! Worker pool for executing task bodies off the owning context's thread.
//!
//! The pool manages a set of OS threads separate from whatever drives the
//! contexts. It supports:
//!
//! - **Capacity management**: threads are spawned lazily up to a ceiling and
//!   idle threads above `min_threads` retire after a timeout.
//! - **Ordering**: jobs whose cancellation token has been cancelled run
//!   first, then higher priority before lower, FIFO within a priority. The
//!   ordering key is computed when a worker picks a job, so cancelling a
//!   token moves that job to the front of the queue retroactively.
//! - **Nested waits**: a worker that blocks waiting for a nested synchronous
//!   task raises the effective ceiling for the duration of its wait, so
//!   nested work cannot starve the pool.
//!
//! # The shared pool
//!
//! `Task::run_in_thread` uses a process-wide pool ([`WorkerPool::global`])
//! with a ceiling of [`DEFAULT_MAX_THREADS`] threads, overridable through
//! the `TASKCELL_POOL_MAX_THREADS` and `TASKCELL_POOL_IDLE_TIMEOUT_MS`
//! environment variables. Tests that need to control the ceiling construct
//! their own pool and use the `*_on` dispatch variants.

use crate::cancel::CancelToken;
use crate::context::Priority;
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle as ThreadJoinHandle};
use std::time::Duration;

/// Ceiling of the shared pool, matching the dispatcher this was modeled on.
pub const DEFAULT_MAX_THREADS: usize = 10;

/// Default idle timeout before retiring excess threads.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable overriding the shared pool's thread ceiling.
pub const ENV_POOL_MAX_THREADS: &str = "TASKCELL_POOL_MAX_THREADS";
/// Environment variable overriding the shared pool's idle timeout (ms).
pub const ENV_POOL_IDLE_TIMEOUT_MS: &str = "TASKCELL_POOL_IDLE_TIMEOUT_MS";

static GLOBAL_POOL: OnceLock<WorkerPool> = OnceLock::new();

thread_local! {
    static IS_POOL_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// A job queued for execution on the pool.
struct Job {
    seq: u64,
    priority: Priority,
    token: Option<CancelToken>,
    work: Box<dyn FnOnce() + Send + 'static>,
}

impl Job {
    /// Ordering key, largest runs first. Cancelled jobs jump the queue so
    /// their bodies can observe cancellation and finish quickly.
    fn key(&self) -> (bool, Priority, std::cmp::Reverse<u64>) {
        let cancelled = self.token.as_ref().is_some_and(CancelToken::is_cancelled);
        (cancelled, self.priority, std::cmp::Reverse(self.seq))
    }
}

struct PoolInner {
    /// Minimum number of threads to keep alive.
    min_threads: usize,
    /// Maximum number of threads allowed, before the sync-wait allowance.
    max_threads: usize,
    /// Current number of live threads.
    active_threads: AtomicUsize,
    /// Number of threads currently executing a job.
    busy_threads: AtomicUsize,
    /// Pool workers currently blocked in a nested synchronous wait. Each
    /// one raises the effective ceiling by one.
    sync_waiters: AtomicUsize,
    /// Next job sequence number (FIFO tiebreak).
    next_seq: AtomicU64,
    /// Pending jobs; the condvar pairs with this mutex.
    queue: Mutex<Vec<Job>>,
    cond: Condvar,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Idle timeout for excess threads.
    idle_timeout: Duration,
    /// Thread name prefix.
    thread_name_prefix: String,
    /// Callback when a worker thread starts.
    on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Callback when a worker thread stops.
    on_thread_stop: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Thread join handles for cleanup.
    thread_handles: Mutex<Vec<ThreadJoinHandle<()>>>,
}

impl PoolInner {
    fn effective_max(&self) -> usize {
        self.max_threads + self.sync_waiters.load(Ordering::Acquire)
    }
}

/// The worker pool for executing task bodies.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

/// A cloneable handle to a [`WorkerPool`].
#[derive(Clone)]
pub struct PoolHandle {
    inner: Arc<PoolInner>,
}

/// Configuration options for a [`WorkerPool`].
#[derive(Clone)]
pub struct PoolOptions {
    /// Minimum number of threads to keep alive.
    pub min_threads: usize,
    /// Maximum number of threads allowed.
    pub max_threads: usize,
    /// Idle timeout before retiring excess threads.
    pub idle_timeout: Duration,
    /// Thread name prefix.
    pub thread_name_prefix: String,
    /// Callback when a worker thread starts.
    pub on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Callback when a worker thread stops.
    pub on_thread_stop: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_threads: 0,
            max_threads: DEFAULT_MAX_THREADS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            thread_name_prefix: "taskcell".to_string(),
            on_thread_start: None,
            on_thread_stop: None,
        }
    }
}

impl PoolOptions {
    /// Returns the default options with environment overrides applied.
    ///
    /// Unparseable values are reported and ignored rather than failing the
    /// caller; the shared pool is constructed lazily and has no error path.
    #[must_use]
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(value) = read_env(ENV_POOL_MAX_THREADS) {
            match value.parse::<usize>() {
                Ok(n) if n > 0 => options.max_threads = n,
                _ => tracing::warn!(
                    var = ENV_POOL_MAX_THREADS,
                    value = %value,
                    "ignoring unparseable pool ceiling override"
                ),
            }
        }
        if let Some(value) = read_env(ENV_POOL_IDLE_TIMEOUT_MS) {
            match value.parse::<u64>() {
                Ok(ms) => options.idle_timeout = Duration::from_millis(ms),
                Err(_) => tracing::warn!(
                    var = ENV_POOL_IDLE_TIMEOUT_MS,
                    value = %value,
                    "ignoring unparseable idle timeout override"
                ),
            }
        }
        options
    }
}

impl fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("min_threads", &self.min_threads)
            .field("max_threads", &self.max_threads)
            .field("idle_timeout", &self.idle_timeout)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("on_thread_start", &self.on_thread_start.is_some())
            .field("on_thread_stop", &self.on_thread_stop.is_some())
            .finish()
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl WorkerPool {
    /// Creates a pool with the given thread limits and default options.
    ///
    /// # Panics
    ///
    /// Panics if `max_threads` is 0.
    #[must_use]
    pub fn new(min_threads: usize, max_threads: usize) -> Self {
        Self::with_options(PoolOptions {
            min_threads,
            max_threads,
            ..PoolOptions::default()
        })
    }

    /// Creates a pool from options.
    ///
    /// # Panics
    ///
    /// Panics if `options.max_threads` is 0.
    #[must_use]
    pub fn with_options(options: PoolOptions) -> Self {
        assert!(options.max_threads > 0, "max_threads must be at least 1");
        let max_threads = options.max_threads.max(options.min_threads);

        let inner = Arc::new(PoolInner {
            min_threads: options.min_threads,
            max_threads,
            active_threads: AtomicUsize::new(0),
            busy_threads: AtomicUsize::new(0),
            sync_waiters: AtomicUsize::new(0),
            next_seq: AtomicU64::new(1),
            queue: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            idle_timeout: options.idle_timeout,
            thread_name_prefix: options.thread_name_prefix,
            on_thread_start: options.on_thread_start,
            on_thread_stop: options.on_thread_stop,
            thread_handles: Mutex::new(Vec::with_capacity(max_threads)),
        });

        let pool = Self { inner };
        for _ in 0..pool.inner.min_threads {
            spawn_thread(&pool.inner);
        }
        pool
    }

    /// Returns the process-wide shared pool.
    pub fn global() -> &'static Self {
        GLOBAL_POOL.get_or_init(|| Self::with_options(PoolOptions::from_env()))
    }

    /// Returns a cloneable handle to this pool.
    #[must_use]
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Enqueues a job for execution.
    ///
    /// `token`, when present, participates in queue ordering: once it is
    /// cancelled the job runs ahead of everything that is not cancelled.
    pub fn submit(
        &self,
        priority: Priority,
        token: Option<CancelToken>,
        work: impl FnOnce() + Send + 'static,
    ) {
        submit_on(&self.inner, priority, token, Box::new(work));
    }

    /// Returns the number of jobs waiting in the queue.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().expect("lock poisoned").len()
    }

    /// Returns the number of live worker threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Returns the number of threads currently executing a job.
    #[must_use]
    pub fn busy_threads(&self) -> usize {
        self.inner.busy_threads.load(Ordering::Relaxed)
    }

    /// Returns `true` if the pool is shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Initiates shutdown. Queued jobs still execute; workers exit once the
    /// queue drains.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _guard = self.inner.queue.lock().expect("lock poisoned");
        self.inner.cond.notify_all();
    }

    /// Shuts down and waits for all threads to exit.
    ///
    /// Returns `true` if all threads exited before `timeout` elapsed.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();

        let deadline = std::time::Instant::now() + timeout;
        while self.inner.active_threads.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            {
                let _guard = self.inner.queue.lock().expect("lock poisoned");
                self.inner.cond.notify_all();
            }
            thread::sleep(Duration::from_millis(10).min(remaining));
        }

        let mut handles = self.inner.thread_handles.lock().expect("lock poisoned");
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        true
    }

    /// Marks the calling thread as blocked in a nested synchronous wait.
    ///
    /// Only meaningful on pool worker threads: while the guard lives, the
    /// effective ceiling is one higher so the nested work can be scheduled.
    /// On any other thread the guard is inert.
    pub(crate) fn enter_sync_wait(&self) -> SyncWaitGuard {
        enter_sync_wait_on(&self.inner)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // The shared pool is never dropped; explicit pools drain briefly.
        self.shutdown();
        let _ = self.shutdown_and_wait(Duration::from_secs(5));
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("min_threads", &self.inner.min_threads)
            .field("max_threads", &self.inner.max_threads)
            .field("active_threads", &self.active_threads())
            .field("busy_threads", &self.busy_threads())
            .field("pending", &self.pending_count())
            .field("sync_waiters", &self.inner.sync_waiters.load(Ordering::Relaxed))
            .finish()
    }
}

impl PoolHandle {
    /// Enqueues a job for execution. See [`WorkerPool::submit`].
    pub fn submit(
        &self,
        priority: Priority,
        token: Option<CancelToken>,
        work: impl FnOnce() + Send + 'static,
    ) {
        submit_on(&self.inner, priority, token, Box::new(work));
    }

    /// Returns the number of jobs waiting in the queue.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().expect("lock poisoned").len()
    }

    /// Returns the number of live worker threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Returns `true` if the pool is shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn enter_sync_wait(&self) -> SyncWaitGuard {
        enter_sync_wait_on(&self.inner)
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("active_threads", &self.active_threads())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Guard for a nested synchronous wait; see [`WorkerPool::enter_sync_wait`].
pub(crate) struct SyncWaitGuard {
    inner: Option<Arc<PoolInner>>,
}

impl Drop for SyncWaitGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.sync_waiters.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

fn enter_sync_wait_on(inner: &Arc<PoolInner>) -> SyncWaitGuard {
    if !IS_POOL_WORKER.with(Cell::get) {
        return SyncWaitGuard { inner: None };
    }
    inner.sync_waiters.fetch_add(1, Ordering::AcqRel);
    tracing::debug!(
        sync_waiters = inner.sync_waiters.load(Ordering::Relaxed),
        "pool worker blocked in nested sync wait; raising effective ceiling"
    );
    // The raised ceiling may allow a queued job to start right away.
    maybe_spawn_thread(inner);
    {
        let _guard = inner.queue.lock().expect("lock poisoned");
        inner.cond.notify_one();
    }
    SyncWaitGuard {
        inner: Some(Arc::clone(inner)),
    }
}

fn submit_on(
    inner: &Arc<PoolInner>,
    priority: Priority,
    token: Option<CancelToken>,
    work: Box<dyn FnOnce() + Send + 'static>,
) {
    if inner.shutdown.load(Ordering::Acquire) {
        tracing::warn!("job submitted to a pool that is shutting down; it may never run");
    }
    let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(seq, priority = %priority, "enqueueing pool job");
    {
        let mut queue = inner.queue.lock().expect("lock poisoned");
        queue.push(Job {
            seq,
            priority,
            token,
            work,
        });
    }
    maybe_spawn_thread(inner);
    let _guard = inner.queue.lock().expect("lock poisoned");
    inner.cond.notify_one();
}

fn spawn_thread(inner: &Arc<PoolInner>) {
    let inner_clone = Arc::clone(inner);
    let thread_id = inner.active_threads.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-worker-{}", inner.thread_name_prefix, thread_id);

    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || {
            IS_POOL_WORKER.with(|flag| flag.set(true));
            if let Some(ref callback) = inner_clone.on_thread_start {
                callback();
            }

            worker_loop(&inner_clone);

            if let Some(ref callback) = inner_clone.on_thread_stop {
                callback();
            }
            inner_clone.active_threads.fetch_sub(1, Ordering::Relaxed);
        })
        .expect("failed to spawn pool worker thread");

    inner
        .thread_handles
        .lock()
        .expect("lock poisoned")
        .push(handle);
}

fn maybe_spawn_thread(inner: &Arc<PoolInner>) {
    let active = inner.active_threads.load(Ordering::Relaxed);
    let busy = inner.busy_threads.load(Ordering::Relaxed);
    let pending = inner.queue.lock().expect("lock poisoned").len();

    // Spawn when there is work, every live thread is occupied, and the
    // (possibly raised) ceiling leaves room.
    if pending > 0 && busy >= active && active < inner.effective_max() {
        spawn_thread(inner);
    }
}

/// Removes and returns the best job: cancelled first, then priority,
/// then FIFO. The key is computed live so a cancellation that happened
/// after enqueueing still reorders the queue.
fn pop_best(queue: &mut Vec<Job>) -> Option<Job> {
    let best = queue
        .iter()
        .enumerate()
        .max_by_key(|(_, job)| job.key())
        .map(|(index, _)| index)?;
    Some(queue.swap_remove(best))
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let job = {
            let mut queue = inner.queue.lock().expect("lock poisoned");
            loop {
                if let Some(job) = pop_best(&mut queue) {
                    break Some(job);
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    break None;
                }

                let active = inner.active_threads.load(Ordering::Relaxed);
                if active > inner.min_threads {
                    let (guard, result) = inner
                        .cond
                        .wait_timeout(queue, inner.idle_timeout)
                        .expect("lock poisoned");
                    queue = guard;
                    if result.timed_out()
                        && queue.is_empty()
                        && inner.active_threads.load(Ordering::Relaxed) > inner.min_threads
                    {
                        // Retire this excess thread.
                        break None;
                    }
                } else {
                    queue = inner.cond.wait(queue).expect("lock poisoned");
                }
            }
        };

        let Some(job) = job else {
            return;
        };

        tracing::trace!(seq = job.seq, priority = %job.priority, "pool worker picked job");
        inner.busy_threads.fetch_add(1, Ordering::Relaxed);
        (job.work)();
        inner.busy_threads.fetch_sub(1, Ordering::Relaxed);
    }
}
