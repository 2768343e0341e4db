//! The task primitive: single-assignment results with deferred completion.
//!
//! A [`Task`] represents one asynchronous operation. It is created on the
//! thread that initiates the operation, bound to that thread's [`Context`],
//! and handed whatever will eventually produce the result: the creating
//! function itself (inline return), a worker-pool body
//! ([`Task::run_in_thread`]), or arbitrary code that calls a `return_*`
//! method later.
//!
//! # Lifecycle
//!
//! ```text
//! CREATED --return_*--> RETURNED --idle--> COMPLETED --propagate--> CONSUMED
//! ```
//!
//! Exactly one return is permitted across all threads. The completion
//! callback and the `completed` flag are delivered through an idle item on
//! the owning context, never from inside the return call, so a caller's
//! callback cannot run before the function that created the task has
//! returned to its caller. The callback observes `completed == false`; the
//! flag flips once the callback has run, and observers connected with
//! [`Task::connect_completed`] are then notified.
//!
//! # Cancellation
//!
//! With a bound [`CancelToken`] and `check_cancellable` enabled (the
//! default), cancellation always wins: whatever the operation returns, the
//! caller propagates the cancellation error. Opt-in return-on-cancel
//! additionally lets cancellation preempt an in-flight worker body; see
//! [`Task::set_return_on_cancel`].
//!
//! # Defects
//!
//! Returning twice, consuming the result twice, or dropping a task that
//! never returned are caller bugs. They are reported through `tracing` at
//! the point of detection and never corrupt the task: the first valid
//! transition wins.

mod bridge;
mod result_cell;

use crate::cancel::CancelToken;
use crate::context::{Context, Priority, Source};
use crate::error::Error;
use crate::event::{Emitter, HandlerId};
use crate::pool::WorkerPool;
use bridge::CancelBridge;
use result_cell::{ResultCell, Taken};
use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

/// The object an operation is performed on, shared with worker bodies.
pub type SourceObject = Arc<dyn Any + Send + Sync + 'static>;

/// Opaque task-local data; its cleanup is its `Drop` impl.
pub type TaskData = Arc<dyn Any + Send + Sync + 'static>;

/// Completion callback, invoked once on the owning context's thread with
/// the task as its own result handle.
pub type CompletionCallback<T> = Box<dyn FnOnce(Task<T>) + Send + 'static>;

/// Where a return came from, for arbitration against return-on-cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReturnOrigin {
    /// A `return_*` call from the operation itself.
    Caller,
    /// The automatic cancellation return fired by the cancel handler.
    AutoCancel,
}

/// Completed flag plus its observers, shared out so the transition can be
/// delivered even if the task is dropped before ever returning.
struct CompletedState {
    flag: AtomicBool,
    observers: Emitter,
}

impl CompletedState {
    fn complete(&self) {
        if !self.flag.swap(true, Ordering::AcqRel) {
            self.observers.emit();
        }
    }
}

/// State mutated under the per-task lock.
struct TaskMut<T> {
    cell: ResultCell<T>,
    bridge: CancelBridge,
    /// Set while the task runs under `run_in_thread_sync`; the return then
    /// signals the waiting caller instead of scheduling an idle item.
    synchronous: bool,
    thread_complete: bool,
}

struct Shared<T: Send + 'static> {
    context: Context,
    source: Option<Weak<dyn Any + Send + Sync + 'static>>,
    token: Option<CancelToken>,
    callback: Mutex<Option<CompletionCallback<T>>>,
    data: Mutex<Option<TaskData>>,
    name: Mutex<Option<Cow<'static, str>>>,
    source_tag: Mutex<Option<&'static str>>,
    priority: Mutex<Priority>,
    check_cancellable: AtomicBool,
    ever_returned: AtomicBool,
    dispatched: AtomicBool,
    completed: Arc<CompletedState>,
    state: Mutex<TaskMut<T>>,
    cond: Condvar,
    cancel_handler: Mutex<Option<HandlerId>>,
}

/// A reference-counted handle to one asynchronous operation.
pub struct Task<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Task<T> {
    /// Creates a task.
    ///
    /// The task binds to `context`, falling back to the calling thread's
    /// current context and then to the process default. `source` is held
    /// weakly; `token` is owned by the task; `callback`, when present, runs
    /// exactly once on the context's thread after the task returns.
    #[must_use]
    pub fn new(
        context: Option<Context>,
        source: Option<&SourceObject>,
        token: Option<CancelToken>,
        callback: Option<CompletionCallback<T>>,
    ) -> Self {
        let context = context
            .or_else(Context::current)
            .unwrap_or_else(Context::global);
        let has_token = token.is_some();
        Self {
            shared: Arc::new(Shared {
                context,
                source: source.map(Arc::downgrade),
                token,
                callback: Mutex::new(callback),
                data: Mutex::new(None),
                name: Mutex::new(None),
                source_tag: Mutex::new(None),
                priority: Mutex::new(Priority::default()),
                check_cancellable: AtomicBool::new(true),
                ever_returned: AtomicBool::new(false),
                dispatched: AtomicBool::new(false),
                completed: Arc::new(CompletedState {
                    flag: AtomicBool::new(false),
                    observers: Emitter::new(),
                }),
                state: Mutex::new(TaskMut {
                    cell: ResultCell::new(),
                    bridge: CancelBridge::new(has_token),
                    synchronous: false,
                    thread_complete: false,
                }),
                cond: Condvar::new(),
                cancel_handler: Mutex::new(None),
            }),
        }
    }

    /// Creates a task that has already failed and schedules its completion.
    ///
    /// Convenience for operations that detect an error before any real work
    /// starts: the callback still runs asynchronously on the owning
    /// context, exactly as if the operation had run and failed.
    pub fn report_error(
        source: Option<&SourceObject>,
        callback: CompletionCallback<T>,
        source_tag: &'static str,
        error: Error,
    ) {
        let task = Self::new(None, source, None, Some(callback));
        task.set_source_tag(source_tag);
        task.return_error(error);
    }

    /// Returns the context this task is bound to.
    #[must_use]
    pub fn context(&self) -> Context {
        self.shared.context.clone()
    }

    /// Returns the source object, if it is still alive.
    #[must_use]
    pub fn source_object(&self) -> Option<SourceObject> {
        self.shared.source.as_ref().and_then(Weak::upgrade)
    }

    /// Returns the task's cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.shared.token.clone()
    }

    /// Returns the task's priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        *self.shared.priority.lock().expect("lock poisoned")
    }

    /// Sets the task's priority.
    ///
    /// Affects worker-pool ordering and the ordering of completion
    /// notifications among tasks on the same context.
    pub fn set_priority(&self, priority: Priority) {
        *self.shared.priority.lock().expect("lock poisoned") = priority;
    }

    /// Returns the task's diagnostic name.
    #[must_use]
    pub fn name(&self) -> Option<Cow<'static, str>> {
        self.shared.name.lock().expect("lock poisoned").clone()
    }

    /// Sets the task's diagnostic name.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.shared.name.lock().expect("lock poisoned") = Some(Cow::Owned(name.into()));
    }

    /// Sets the task's diagnostic name without allocating.
    pub fn set_static_name(&self, name: &'static str) {
        *self.shared.name.lock().expect("lock poisoned") = Some(Cow::Borrowed(name));
    }

    /// Returns the source tag.
    #[must_use]
    pub fn source_tag(&self) -> Option<&'static str> {
        *self.shared.source_tag.lock().expect("lock poisoned")
    }

    /// Tags the task with the API that created it, for diagnostics and for
    /// callers multiplexing several operations through one callback.
    pub fn set_source_tag(&self, tag: &'static str) {
        *self.shared.source_tag.lock().expect("lock poisoned") = Some(tag);
    }

    /// Returns the task-local data.
    #[must_use]
    pub fn task_data(&self) -> Option<TaskData> {
        self.shared.data.lock().expect("lock poisoned").clone()
    }

    /// Replaces the task-local data.
    ///
    /// The previous data, if any, is dropped (running its cleanup) before
    /// this returns, outside the task's internal locks.
    pub fn set_task_data(&self, data: Option<TaskData>) {
        let previous = {
            let mut slot = self.shared.data.lock().expect("lock poisoned");
            std::mem::replace(&mut *slot, data)
        };
        drop(previous);
    }

    /// Returns whether returns are checked against the cancellation token.
    #[must_use]
    pub fn check_cancellable(&self) -> bool {
        self.shared.check_cancellable.load(Ordering::Acquire)
    }

    /// Enables or disables cancellation checking (default on).
    ///
    /// Disabling while return-on-cancel is enabled is a reported defect and
    /// changes nothing.
    pub fn set_check_cancellable(&self, check: bool) {
        if !check {
            let st = self.shared.state.lock().expect("lock poisoned");
            if st.bridge.return_on_cancel() {
                drop(st);
                self.report_defect(
                    "cannot disable cancellation checking while return-on-cancel is enabled",
                );
                return;
            }
        }
        self.shared.check_cancellable.store(check, Ordering::Release);
    }

    /// Returns the return-on-cancel flag.
    #[must_use]
    pub fn return_on_cancel(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("lock poisoned")
            .bridge
            .return_on_cancel()
    }

    /// Toggles return-on-cancel mode.
    ///
    /// Returns `false`, changing nothing, if cancellation has already been
    /// observed by this task's dispatch — in particular, a worker body that
    /// calls `set_return_on_cancel(false)` learns from the `false` result
    /// that the automatic cancellation return has (or will have) fired and
    /// that the body no longer owns the task's return.
    ///
    /// Enabling return-on-cancel on a task whose cancellation checking is
    /// disabled is a reported defect returning `false`.
    pub fn set_return_on_cancel(&self, enabled: bool) -> bool {
        if enabled && !self.check_cancellable() {
            self.report_defect("return-on-cancel requires cancellation checking");
            return false;
        }
        let mut st = self.shared.state.lock().expect("lock poisoned");
        st.bridge.set_return_on_cancel(enabled)
    }

    /// Returns `true` once the completion notification has been delivered.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.shared.completed.flag.load(Ordering::Acquire)
    }

    /// Returns `true` if the task's result is (or was) an error.
    ///
    /// Unlike [`propagate`](Task::propagate) this does not consult the
    /// cancellation token; it reflects only what was stored.
    #[must_use]
    pub fn had_error(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("lock poisoned")
            .cell
            .had_error()
    }

    /// Connects an observer for the `completed` transition.
    pub fn connect_completed(&self, observer: impl Fn() + Send + Sync + 'static) -> HandlerId {
        self.shared.completed.observers.connect(observer)
    }

    /// Disconnects a `completed` observer.
    pub fn disconnect_completed(&self, id: HandlerId) -> bool {
        self.shared.completed.observers.disconnect(id)
    }

    /// Stores the operation's successful result and schedules completion.
    ///
    /// May be called from any thread, at most once per task across
    /// `return_value`, `return_error`, and their convenience variants.
    pub fn return_value(&self, value: T) {
        self.finish(Ok(value), ReturnOrigin::Caller);
    }

    /// Stores the operation's error and schedules completion.
    pub fn return_error(&self, error: Error) {
        self.finish(Err(error), ReturnOrigin::Caller);
    }

    /// Like [`return_error`](Task::return_error), prefixing the error's
    /// message first.
    pub fn return_prefixed_error(&self, prefix: &str, error: Error) {
        self.finish(Err(error.with_message_prefix(prefix)), ReturnOrigin::Caller);
    }

    /// Completes the task with the cancellation error if its token has been
    /// cancelled. Returns `true` if it did.
    ///
    /// Lets an operation short-circuit before doing any work. The check
    /// ignores `check_cancellable`; it is explicit.
    pub fn return_error_if_cancelled(&self) -> bool {
        let cancelled = self
            .shared
            .token
            .as_ref()
            .is_some_and(CancelToken::is_cancelled);
        if cancelled {
            self.finish(Err(Error::cancelled()), ReturnOrigin::Caller);
        }
        cancelled
    }

    /// Consumes the task's result.
    ///
    /// With cancellation checking enabled and a cancelled token this always
    /// yields the cancellation error, without consuming a stored result —
    /// and therefore keeps yielding it on repeated calls. Otherwise the
    /// stored value or error is transferred out; consuming a second time
    /// (or before any return) is a reported defect yielding
    /// [`ErrorKind::NoResult`](crate::ErrorKind::NoResult).
    pub fn propagate(&self) -> Result<T, Error> {
        let mut st = self.shared.state.lock().expect("lock poisoned");
        if self.check_cancellable()
            && self
                .shared
                .token
                .as_ref()
                .is_some_and(CancelToken::is_cancelled)
        {
            return Err(Error::cancelled());
        }
        match st.cell.take() {
            Taken::Value(value) => Ok(value),
            Taken::Error(error) => Err(error),
            Taken::Empty => {
                drop(st);
                self.report_defect("result consumed before any return");
                Err(Error::no_result())
            }
            Taken::AlreadyTaken => {
                drop(st);
                self.report_defect("result consumed more than once");
                Err(Error::no_result())
            }
        }
    }

    /// Runs `body` on the shared worker pool.
    ///
    /// The body receives the task, its source object (if still alive), its
    /// task-local data, and its token; it must call a `return_*` method
    /// when done and must not assume which thread it runs on, only that it
    /// is off the owning context's thread.
    pub fn run_in_thread<F>(&self, body: F)
    where
        F: FnOnce(Task<T>, Option<SourceObject>, Option<TaskData>, Option<CancelToken>)
            + Send
            + 'static,
    {
        self.dispatch(WorkerPool::global(), body, false);
    }

    /// Runs `body` on the shared worker pool, blocking until the task
    /// returns.
    ///
    /// The completion callback is discarded, not invoked: the caller is
    /// already waiting inline. `completed` still flips, before this
    /// returns. With return-on-cancel, cancellation unblocks this call
    /// while the body keeps running in the background.
    pub fn run_in_thread_sync<F>(&self, body: F)
    where
        F: FnOnce(Task<T>, Option<SourceObject>, Option<TaskData>, Option<CancelToken>)
            + Send
            + 'static,
    {
        self.dispatch(WorkerPool::global(), body, true);
    }

    /// [`run_in_thread`](Task::run_in_thread) on an explicit pool.
    pub fn run_in_thread_on<F>(&self, pool: &WorkerPool, body: F)
    where
        F: FnOnce(Task<T>, Option<SourceObject>, Option<TaskData>, Option<CancelToken>)
            + Send
            + 'static,
    {
        self.dispatch(pool, body, false);
    }

    /// [`run_in_thread_sync`](Task::run_in_thread_sync) on an explicit pool.
    pub fn run_in_thread_sync_on<F>(&self, pool: &WorkerPool, body: F)
    where
        F: FnOnce(Task<T>, Option<SourceObject>, Option<TaskData>, Option<CancelToken>)
            + Send
            + 'static,
    {
        self.dispatch(pool, body, true);
    }

    /// Attaches a deferred callback to the task's context, stamped with the
    /// task's priority and, if the source is unnamed, the task's name.
    pub fn attach_source(&self, mut source: Source) {
        self.apply_source_defaults(&mut source);
        self.shared.context.attach(source);
    }

    /// Stamps `source` with this task's priority and, if the source is
    /// unnamed, the task's name. [`attach_source`](Task::attach_source)
    /// applies this automatically; it is separate for callers attaching the
    /// source to a context of their own.
    pub fn apply_source_defaults(&self, source: &mut Source) {
        source.set_priority(self.priority());
        if source.name().is_none() {
            if let Some(name) = self.name() {
                source.set_name(name);
            }
        }
    }

    fn dispatch<F>(&self, pool: &WorkerPool, body: F, synchronous: bool)
    where
        F: FnOnce(Task<T>, Option<SourceObject>, Option<TaskData>, Option<CancelToken>)
            + Send
            + 'static,
    {
        if self.shared.dispatched.swap(true, Ordering::AcqRel) {
            self.report_defect("task dispatched to a worker thread more than once");
            return;
        }
        {
            let mut st = self.shared.state.lock().expect("lock poisoned");
            st.synchronous = synchronous;
            st.thread_complete = false;
        }

        // Connect before queueing: on an already-cancelled token the handler
        // runs here and now, so a return-on-cancel task completes before its
        // body has even been scheduled. The handler holds a weak reference;
        // the token must not keep the task alive.
        if let Some(token) = &self.shared.token {
            let weak = Arc::downgrade(&self.shared);
            let id = token.connect(move || {
                if let Some(shared) = weak.upgrade() {
                    Task { shared }.thread_cancelled();
                }
            });
            *self.shared.cancel_handler.lock().expect("lock poisoned") = Some(id);
        }

        let task_for_body = self.clone();
        let task_after = self.clone();
        let source = self.source_object();
        let data = self.task_data();
        let token = self.cancel_token();
        let name = self.name();
        pool.submit(self.priority(), token.clone(), move || {
            tracing::trace!(task = name.as_deref().unwrap_or("unnamed"), "worker body starting");
            body(task_for_body, source, data, token);
            task_after.disconnect_cancel_handler();
        });

        if synchronous {
            let _allowance = pool.enter_sync_wait();
            let mut st = self.shared.state.lock().expect("lock poisoned");
            while !st.thread_complete {
                st = self.shared.cond.wait(st).expect("lock poisoned");
            }
            drop(st);
            // Synchronous runs never invoke the callback.
            let callback = self.shared.callback.lock().expect("lock poisoned").take();
            drop(callback);
            self.shared.completed.complete();
        }
    }

    /// Token cancel handler for dispatched tasks. Decides and fires inside
    /// one critical section so the worker body's toggle can never
    /// interleave with the auto-return.
    fn thread_cancelled(&self) {
        let mut st = self.shared.state.lock().expect("lock poisoned");
        if st.bridge.on_cancel() {
            tracing::debug!(
                task = self.debug_name().as_ref(),
                "cancellation preempting in-flight worker body"
            );
            self.finish_locked(st, Err(Error::cancelled()), ReturnOrigin::AutoCancel);
        }
    }

    fn finish(&self, result: Result<T, Error>, origin: ReturnOrigin) {
        let st = self.shared.state.lock().expect("lock poisoned");
        self.finish_locked(st, result, origin);
    }

    fn finish_locked(
        &self,
        mut st: MutexGuard<'_, TaskMut<T>>,
        result: Result<T, Error>,
        origin: ReturnOrigin,
    ) {
        let shared = &self.shared;

        // A return that lost to the return-on-cancel auto-return is dropped
        // silently; the body was told to stop touching task state and its
        // result has nowhere to go.
        if origin == ReturnOrigin::Caller && st.bridge.swallows_returns() {
            drop(st);
            tracing::trace!(
                task = self.debug_name().as_ref(),
                "return after cancellation auto-return; dropping result"
            );
            drop(result);
            return;
        }
        // The auto-return itself may lose to a return the body got in just
        // before cancellation was observed; that is not a defect either.
        if origin == ReturnOrigin::AutoCancel && shared.ever_returned.load(Ordering::Acquire) {
            drop(st);
            drop(result);
            return;
        }

        if shared
            .ever_returned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            drop(st);
            self.report_defect("result returned more than once");
            drop(result);
            return;
        }

        // Cancellation wins over whatever the operation produced.
        let mut discarded = None;
        let result = if origin == ReturnOrigin::Caller
            && self.check_cancellable()
            && shared.token.as_ref().is_some_and(CancelToken::is_cancelled)
        {
            discarded = Some(result);
            Err(Error::cancelled())
        } else {
            result
        };

        tracing::trace!(
            task = self.debug_name().as_ref(),
            ok = result.is_ok(),
            origin = ?origin,
            "task returned"
        );
        let stored = match result {
            Ok(value) => st.cell.store_value(value).is_ok(),
            Err(error) => st.cell.store_error(error).is_ok(),
        };
        if !stored {
            // Unreachable: the ever-returned latch guards the cell.
            tracing::error!(
                task = self.debug_name().as_ref(),
                "result cell rejected a store after the return latch was won"
            );
        }

        if st.synchronous {
            st.thread_complete = true;
            drop(st);
            shared.cond.notify_all();
        } else {
            drop(st);
            self.schedule_completion();
        }
        // Replaced results are dropped outside the lock: their cleanup may
        // run arbitrary code.
        drop(discarded);
    }

    fn schedule_completion(&self) {
        let task = self.clone();
        let name = self
            .name()
            .unwrap_or(Cow::Borrowed("task-complete"));
        tracing::trace!(
            task = name.as_ref(),
            owned = self.shared.context.is_owned_by_current_thread(),
            "deferring completion notification to owning context"
        );
        self.shared.context.schedule_idle_named(
            self.priority(),
            Some(name),
            move || task.deliver_completion(),
        );
    }

    /// Runs on the owning context's thread: callback first (observing
    /// `completed == false`), then the flag flip, then observers.
    fn deliver_completion(&self) {
        let callback = self.shared.callback.lock().expect("lock poisoned").take();
        if let Some(callback) = callback {
            callback(self.clone());
        }
        self.shared.completed.complete();
    }

    fn disconnect_cancel_handler(&self) {
        let id = self
            .shared
            .cancel_handler
            .lock()
            .expect("lock poisoned")
            .take();
        if let (Some(id), Some(token)) = (id, self.shared.token.as_ref()) {
            token.disconnect(id);
        }
    }

    fn debug_name(&self) -> Cow<'static, str> {
        self.name().unwrap_or(Cow::Borrowed("unnamed"))
    }

    fn report_defect(&self, what: &str) {
        tracing::error!(
            task = self.debug_name().as_ref(),
            source_tag = self.source_tag().unwrap_or("-"),
            "{what}; this likely indicates a bug in the caller"
        );
    }
}

impl<T: Send + 'static> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name())
            .field("priority", &self.priority())
            .field("completed", &self.is_completed())
            .field("ever_returned", &self.shared.ever_returned.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Send + 'static> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(id) = self
            .cancel_handler
            .get_mut()
            .expect("lock poisoned")
            .take()
        {
            if let Some(token) = self.token.as_ref() {
                token.disconnect(id);
            }
        }

        if self.ever_returned.load(Ordering::Acquire) {
            return;
        }

        let had_callback = self.callback.get_mut().expect("lock poisoned").is_some();
        let name = self.name.get_mut().expect("lock poisoned").take();
        let tag = self
            .source_tag
            .get_mut()
            .expect("lock poisoned")
            .unwrap_or("-");
        let label = name.as_deref().unwrap_or("unnamed").to_string();
        if had_callback {
            tracing::error!(
                task = %label,
                source_tag = tag,
                "task dropped without ever returning a result; this likely indicates a bug in the caller"
            );
        } else {
            tracing::debug!(
                task = %label,
                source_tag = tag,
                "task dropped without ever returning a result"
            );
        }

        // The completed transition is still owed to observers, and it is
        // still delivered asynchronously.
        let completed = Arc::clone(&self.completed);
        let priority = *self.priority.get_mut().expect("lock poisoned");
        self.context
            .schedule_idle_named(priority, name, move || completed.complete());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::AtomicUsize;

    fn drained(ctx: &Context) {
        while ctx.iterate(false) {}
    }

    #[test]
    fn accessors_round_trip() {
        let ctx = Context::new();
        let task: Task<i32> = Task::new(Some(ctx.clone()), None, None, None);

        assert_eq!(task.priority(), Priority::Default);
        task.set_priority(Priority::High);
        assert_eq!(task.priority(), Priority::High);

        assert!(task.name().is_none());
        task.set_name("renamed".to_string());
        assert_eq!(task.name().as_deref(), Some("renamed"));
        task.set_static_name("static name");
        assert!(matches!(task.name(), Some(Cow::Borrowed("static name"))));

        assert!(task.source_tag().is_none());
        task.set_source_tag("accessors_round_trip");
        assert_eq!(task.source_tag(), Some("accessors_round_trip"));

        assert!(task.check_cancellable());
        task.set_check_cancellable(false);
        assert!(!task.check_cancellable());

        assert_eq!(task.context(), ctx);
        task.return_value(1);
        drained(&ctx);
    }

    #[test]
    fn task_data_replacement_runs_cleanup() {
        struct Flagged(Arc<AtomicBool>);
        impl Drop for Flagged {
            fn drop(&mut self) {
                self.0.store(true, Ordering::Relaxed);
            }
        }

        let ctx = Context::new();
        let task: Task<bool> = Task::new(Some(ctx.clone()), None, None, None);

        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));

        task.set_task_data(Some(Arc::new(Flagged(Arc::clone(&first)))));
        assert!(!first.load(Ordering::Relaxed));

        task.set_task_data(Some(Arc::new(Flagged(Arc::clone(&second)))));
        assert!(first.load(Ordering::Relaxed));
        assert!(!second.load(Ordering::Relaxed));

        task.return_value(true);
        drained(&ctx);
        drop(task);
        assert!(second.load(Ordering::Relaxed));
    }

    #[test]
    fn second_return_is_rejected_first_wins() {
        let ctx = Context::new();
        let task: Task<i32> = Task::new(Some(ctx.clone()), None, None, None);

        task.return_value(1);
        task.return_value(2);
        drained(&ctx);

        assert_eq!(task.propagate().expect("first return wins"), 1);
    }

    #[test]
    fn propagate_twice_is_a_defect_for_values() {
        let ctx = Context::new();
        let task: Task<i32> = Task::new(Some(ctx.clone()), None, None, None);
        task.return_value(5);
        drained(&ctx);

        assert_eq!(task.propagate().expect("stored value"), 5);
        let second = task.propagate().expect_err("double consumption");
        assert_eq!(second.kind(), ErrorKind::NoResult);
    }

    #[test]
    fn propagate_after_cancel_is_idempotent() {
        let ctx = Context::new();
        let token = CancelToken::new();
        let task: Task<i32> =
            Task::new(Some(ctx.clone()), None, Some(token.clone()), None);

        token.cancel();
        task.return_value(7);
        drained(&ctx);

        for _ in 0..3 {
            let err = task.propagate().expect_err("cancellation wins");
            assert_eq!(err.kind(), ErrorKind::Cancelled);
        }
    }

    #[test]
    fn source_object_is_weakly_held() {
        let ctx = Context::new();
        let object: SourceObject = Arc::new(AtomicUsize::new(9));
        let task: Task<i32> = Task::new(Some(ctx.clone()), Some(&object), None, None);

        assert!(task.source_object().is_some());
        drop(object);
        assert!(task.source_object().is_none());

        task.return_value(0);
        drained(&ctx);
    }

    #[test]
    fn return_on_cancel_requires_checking() {
        let ctx = Context::new();
        let token = CancelToken::new();
        let task: Task<i32> = Task::new(Some(ctx.clone()), None, Some(token), None);

        task.set_check_cancellable(false);
        assert!(!task.set_return_on_cancel(true));
        assert!(!task.return_on_cancel());

        task.set_check_cancellable(true);
        assert!(task.set_return_on_cancel(true));
        // Disabling checking while armed is refused.
        task.set_check_cancellable(false);
        assert!(task.check_cancellable());

        task.return_value(3);
        drained(&ctx);
    }

    #[test]
    fn report_error_completes_in_idle() {
        let ctx = Context::new();
        let _guard = ctx.enter();
        let seen = Arc::new(Mutex::new(None));

        let seen_clone = Arc::clone(&seen);
        Task::<i32>::report_error(
            None,
            Box::new(move |task| {
                assert_eq!(task.source_tag(), Some("report_error_test"));
                let err = task.propagate().expect_err("reported error");
                *seen_clone.lock().expect("lock poisoned") = Some(err.kind());
            }),
            "report_error_test",
            Error::failed("early failure"),
        );

        assert!(seen.lock().expect("lock poisoned").is_none());
        drained(&ctx);
        assert_eq!(
            *seen.lock().expect("lock poisoned"),
            Some(ErrorKind::Failed)
        );
    }
}
