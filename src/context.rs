//! Execution contexts: the run-loop collaborator that owns a thread.
//!
//! A [`Context`] is a priority-ordered queue of deferred callbacks plus the
//! machinery to drive them: exactly one thread at a time iterates a context,
//! and everything scheduled on it runs on that thread. The task core depends
//! on three operations — [`Context::schedule_idle`],
//! [`Context::is_owned_by_current_thread`], and [`Context::current`] — and
//! this module provides a working loop around them so the crate is usable
//! and testable without a host event loop.
//!
//! # Thread-default contexts
//!
//! [`Context::enter`] pushes a context onto a thread-local stack;
//! [`Context::current`] returns the top of that stack. Tasks created without
//! an explicit context bind to the current one, falling back to the
//! process-wide default ([`Context::global`]). Iterating a context enters it
//! for the duration of each dispatched callback, so callbacks observe
//! themselves as running "in" their context.
//!
//! # Ordering
//!
//! Idle items dispatch highest priority first, FIFO within a priority. Timer
//! semantics are deliberately absent; timeouts compose externally.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, ThreadId};

/// Scheduling priority for idle items and worker-pool jobs.
///
/// The ordering is total: `Low < Default < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Runs after everything else.
    Low,
    /// The priority tasks start with.
    #[default]
    Default,
    /// Runs before default and low items.
    High,
}

impl Priority {
    /// Returns a short human-readable label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Default => "default",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, prioritized one-shot callback that can be attached to a context.
///
/// Sources exist so that callers composing a task out of external events can
/// hand the deferred piece a diagnostic identity; `Task::attach_source`
/// fills in the task's priority and, if the source is unnamed, its name.
pub struct Source {
    name: Option<Cow<'static, str>>,
    priority: Option<Priority>,
    callback: Box<dyn FnOnce() + Send + 'static>,
}

impl Source {
    /// Creates a source around a callback, with no name and no priority.
    #[must_use]
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: None,
            priority: None,
            callback: Box::new(callback),
        }
    }

    /// Returns the source's name, if set.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Sets the source's name.
    pub fn set_name(&mut self, name: impl Into<Cow<'static, str>>) {
        self.name = Some(name.into());
    }

    /// Returns the source's priority, if set.
    #[must_use]
    pub const fn priority(&self) -> Option<Priority> {
        self.priority
    }

    /// Sets the source's priority.
    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = Some(priority);
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

struct IdleItem {
    priority: Priority,
    seq: u64,
    name: Option<Cow<'static, str>>,
    run: Box<dyn FnOnce() + Send + 'static>,
}

impl PartialEq for IdleItem {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for IdleItem {}

impl PartialOrd for IdleItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IdleItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: highest priority first, then FIFO within a priority.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Owner {
    thread: ThreadId,
    depth: u32,
}

struct ContextInner {
    queue: Mutex<BinaryHeap<IdleItem>>,
    cond: Condvar,
    owner: Mutex<Option<Owner>>,
    quit: AtomicBool,
    next_seq: AtomicU64,
}

/// A run-loop context: a priority idle queue driven by one thread at a time.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Context>> = const { RefCell::new(Vec::new()) };
}

static GLOBAL_CONTEXT: OnceLock<Context> = OnceLock::new();

/// Guard that pops the entered context from the thread-default stack.
pub struct ContextGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

impl Context {
    /// Creates a new context with an empty idle queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                queue: Mutex::new(BinaryHeap::new()),
                cond: Condvar::new(),
                owner: Mutex::new(None),
                quit: AtomicBool::new(false),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the process-wide default context.
    ///
    /// Tasks created with no explicit context and no thread-default context
    /// bind here; something must iterate it for their completions to run.
    #[must_use]
    pub fn global() -> Self {
        GLOBAL_CONTEXT.get_or_init(Self::new).clone()
    }

    /// Returns the context on top of this thread's thread-default stack.
    #[must_use]
    pub fn current() -> Option<Self> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().cloned())
    }

    /// Pushes this context onto the thread-default stack.
    ///
    /// The guard pops it again on drop. While entered, [`Context::current`]
    /// on this thread returns this context.
    #[must_use]
    pub fn enter(&self) -> ContextGuard {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(self.clone());
        });
        ContextGuard {
            _not_send: std::marker::PhantomData,
        }
    }

    /// Schedules a callback to run on the next loop iteration.
    pub fn schedule_idle(&self, priority: Priority, callback: impl FnOnce() + Send + 'static) {
        self.schedule_idle_named(priority, None, callback);
    }

    /// Schedules a named callback to run on the next loop iteration.
    pub fn schedule_idle_named(
        &self,
        priority: Priority,
        name: Option<Cow<'static, str>>,
        callback: impl FnOnce() + Send + 'static,
    ) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(priority = %priority, seq, name = ?name, "scheduling idle item");
        let mut queue = self.inner.queue.lock().expect("lock poisoned");
        queue.push(IdleItem {
            priority,
            seq,
            name,
            run: Box::new(callback),
        });
        drop(queue);
        self.inner.cond.notify_one();
    }

    /// Attaches a one-shot source to this context.
    ///
    /// The source runs as an idle item at its priority (default when unset).
    pub fn attach(&self, source: Source) {
        let Source {
            name,
            priority,
            callback,
        } = source;
        self.schedule_idle_named(priority.unwrap_or_default(), name, callback);
    }

    /// Returns `true` if the calling thread is currently driving this context.
    #[must_use]
    pub fn is_owned_by_current_thread(&self) -> bool {
        let owner = self.inner.owner.lock().expect("lock poisoned");
        owner
            .as_ref()
            .is_some_and(|o| o.thread == thread::current().id())
    }

    /// Returns the number of idle items waiting to be dispatched.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().expect("lock poisoned").len()
    }

    /// Dispatches one pending idle item.
    ///
    /// With `may_block`, waits until an item is available or [`quit`] is
    /// called. Returns `true` if an item was dispatched. Returns `false`
    /// without dispatching if another thread is driving this context.
    ///
    /// [`quit`]: Context::quit
    pub fn iterate(&self, may_block: bool) -> bool {
        let Some(_ownership) = self.acquire() else {
            tracing::warn!("context is being driven by another thread; refusing to iterate");
            return false;
        };

        let item = {
            let mut queue = self.inner.queue.lock().expect("lock poisoned");
            loop {
                if let Some(item) = queue.pop() {
                    break item;
                }
                if !may_block || self.inner.quit.load(Ordering::Acquire) {
                    return false;
                }
                queue = self
                    .inner
                    .cond
                    .wait(queue)
                    .expect("lock poisoned");
            }
        };

        tracing::trace!(
            priority = %item.priority,
            seq = item.seq,
            name = ?item.name,
            "dispatching idle item"
        );
        let _entered = self.enter();
        (item.run)();
        true
    }

    /// Drives this context until [`quit`](Context::quit) is called.
    pub fn run(&self) {
        self.inner.quit.store(false, Ordering::Release);
        while !self.inner.quit.load(Ordering::Acquire) {
            self.iterate(true);
        }
    }

    /// Stops a [`run`](Context::run) in progress on the driving thread.
    ///
    /// Pending idle items stay queued and dispatch on the next run.
    pub fn quit(&self) {
        self.inner.quit.store(true, Ordering::Release);
        let _guard = self.inner.queue.lock().expect("lock poisoned");
        self.inner.cond.notify_all();
    }

    fn acquire(&self) -> Option<OwnershipGuard<'_>> {
        let mut owner = self.inner.owner.lock().expect("lock poisoned");
        let current = thread::current().id();
        match owner.as_mut() {
            None => {
                *owner = Some(Owner {
                    thread: current,
                    depth: 1,
                });
            }
            Some(o) if o.thread == current => o.depth += 1,
            Some(_) => return None,
        }
        Some(OwnershipGuard { context: self })
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("pending", &self.pending())
            .field("owned_by_current_thread", &self.is_owned_by_current_thread())
            .finish()
    }
}

struct OwnershipGuard<'a> {
    context: &'a Context,
}

impl Drop for OwnershipGuard<'_> {
    fn drop(&mut self) {
        let mut owner = self.context.inner.owner.lock().expect("lock poisoned");
        if let Some(o) = owner.as_mut() {
            o.depth -= 1;
            if o.depth == 0 {
                *owner = None;
            }
        }
    }
}
