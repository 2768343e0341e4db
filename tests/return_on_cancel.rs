//! Return-on-cancel tests: the opt-in mode where cancellation preempts an
//! in-flight worker body, the atomicity of toggling it mid-body, and the
//! guarantee that cancellation never delivers a completion callback from
//! inside the cancellation signal itself.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use taskcell::test_utils::{init_test_logging, wait_until};
use taskcell::{CancelToken, Context, Error, ErrorKind, Task, WorkerPool};

const MAGIC: i64 = 0x5EED;

const STARTING: usize = 0;
const RUNNING: usize = 1;
const CANCELLED: usize = 2;
const COMPLETED: usize = 3;

fn init_test(name: &str) {
    init_test_logging();
    taskcell::test_phase!(name);
}

/// The body used by the mode tests, mirroring a cooperative worker: once
/// released, it completes normally unless the automatic cancellation return
/// has already claimed the task, which it learns from the failing toggle.
fn cooperative_body(
    state: Arc<AtomicUsize>,
    started: mpsc::Sender<()>,
    release: Arc<Mutex<()>>,
) -> impl FnOnce(
    Task<i64>,
    Option<taskcell::SourceObject>,
    Option<taskcell::TaskData>,
    Option<CancelToken>,
) + Send
       + 'static {
    move |task, _source, _data, _token| {
        state.store(RUNNING, Ordering::Release);
        started.send(()).expect("main gone");

        drop(release.lock().expect("lock poisoned"));

        if !task.return_on_cancel() || task.set_return_on_cancel(false) {
            state.store(COMPLETED, Ordering::Release);
            task.return_value(MAGIC);
        } else {
            state.store(CANCELLED, Ordering::Release);
            // The automatic return already completed the task; this return
            // must be swallowed silently.
            task.return_value(MAGIC);
        }
    }
}

#[test]
fn default_mode_does_not_return_early() {
    init_test("default_mode_does_not_return_early");
    let ctx = Context::new();
    let _guard = ctx.enter();
    let pool = WorkerPool::new(0, 2);

    let token = CancelToken::new();
    let state = Arc::new(AtomicUsize::new(STARTING));
    let callback_ran = Arc::new(AtomicBool::new(false));
    let (started_tx, started_rx) = mpsc::channel();
    let release = Arc::new(Mutex::new(()));

    let ctx_clone = ctx.clone();
    let callback_ran_clone = Arc::clone(&callback_ran);
    let task: Task<i64> = Task::new(
        None,
        None,
        Some(token.clone()),
        Some(Box::new(move |task| {
            assert!(task.had_error());
            let err = task.propagate().expect_err("cancelled result");
            assert_eq!(err.kind(), ErrorKind::Cancelled);
            callback_ran_clone.store(true, Ordering::Release);
            ctx_clone.quit();
        })),
    );

    let hold = release.lock().expect("lock poisoned");
    task.run_in_thread_on(
        &pool,
        cooperative_body(Arc::clone(&state), started_tx, Arc::clone(&release)),
    );
    drop(task);

    started_rx.recv().expect("body started");
    assert_eq!(state.load(Ordering::Acquire), RUNNING);
    assert!(!callback_ran.load(Ordering::Acquire));

    // Cancelling does not complete the task; the body owns the return and
    // runs to completion once released.
    token.cancel();
    drop(hold);
    ctx.run();

    assert_eq!(state.load(Ordering::Acquire), COMPLETED);
    assert!(callback_ran.load(Ordering::Acquire));
    assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    taskcell::test_complete!("default_mode_does_not_return_early");
}

#[test]
fn return_on_cancel_completes_while_body_runs() {
    init_test("return_on_cancel_completes_while_body_runs");
    let ctx = Context::new();
    let _guard = ctx.enter();
    let pool = WorkerPool::new(0, 2);

    let token = CancelToken::new();
    let state = Arc::new(AtomicUsize::new(STARTING));
    let callback_ran = Arc::new(AtomicBool::new(false));
    let notified = Arc::new(AtomicBool::new(false));
    let (started_tx, started_rx) = mpsc::channel();
    let release = Arc::new(Mutex::new(()));

    let ctx_clone = ctx.clone();
    let callback_ran_clone = Arc::clone(&callback_ran);
    let task: Task<i64> = Task::new(
        None,
        None,
        Some(token.clone()),
        Some(Box::new(move |task| {
            let err = task.propagate().expect_err("cancelled result");
            assert_eq!(err.kind(), ErrorKind::Cancelled);
            callback_ran_clone.store(true, Ordering::Release);
            ctx_clone.quit();
        })),
    );
    let notified_clone = Arc::clone(&notified);
    task.connect_completed(move || {
        notified_clone.store(true, Ordering::Release);
    });
    assert!(task.set_return_on_cancel(true));

    let hold = release.lock().expect("lock poisoned");
    task.run_in_thread_on(
        &pool,
        cooperative_body(Arc::clone(&state), started_tx, Arc::clone(&release)),
    );
    drop(task);

    started_rx.recv().expect("body started");
    assert_eq!(state.load(Ordering::Acquire), RUNNING);
    assert!(!callback_ran.load(Ordering::Acquire));

    // Cancellation completes the task immediately; the body is still
    // blocked on the release gate.
    token.cancel();
    ctx.run();
    assert!(callback_ran.load(Ordering::Acquire));
    assert!(notified.load(Ordering::Acquire));
    assert_eq!(state.load(Ordering::Acquire), RUNNING);

    // The body then observes the failed toggle, marks itself cancelled, and
    // its own late return is a silent no-op.
    drop(hold);
    assert!(wait_until(Duration::from_secs(5), || {
        state.load(Ordering::Acquire) == CANCELLED
    }));
    assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    taskcell::test_complete!("return_on_cancel_completes_while_body_runs");
}

/// A task cancelled before dispatch completes immediately, but the body
/// still runs so its side effects happen.
#[test]
fn precancelled_dispatch_completes_immediately() {
    init_test("precancelled_dispatch_completes_immediately");
    let ctx = Context::new();
    let _guard = ctx.enter();
    let pool = WorkerPool::new(0, 2);

    let token = CancelToken::new();
    let state = Arc::new(AtomicUsize::new(STARTING));
    let callback_ran = Arc::new(AtomicBool::new(false));
    let (started_tx, started_rx) = mpsc::channel();
    let release = Arc::new(Mutex::new(()));

    let ctx_clone = ctx.clone();
    let callback_ran_clone = Arc::clone(&callback_ran);
    let task: Task<i64> = Task::new(
        None,
        None,
        Some(token.clone()),
        Some(Box::new(move |task| {
            let err = task.propagate().expect_err("cancelled result");
            assert_eq!(err.kind(), ErrorKind::Cancelled);
            callback_ran_clone.store(true, Ordering::Release);
            ctx_clone.quit();
        })),
    );
    assert!(task.set_return_on_cancel(true));
    token.cancel();

    task.run_in_thread_on(
        &pool,
        cooperative_body(Arc::clone(&state), started_tx, Arc::clone(&release)),
    );
    drop(task);

    // The completion is already in flight, independent of the body.
    ctx.run();
    assert!(callback_ran.load(Ordering::Acquire));

    started_rx.recv().expect("body still runs");
    assert!(wait_until(Duration::from_secs(5), || {
        state.load(Ordering::Acquire) == CANCELLED
    }));
    assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    taskcell::test_complete!("precancelled_dispatch_completes_immediately");
}

#[test]
fn sync_variant_without_return_on_cancel_waits_for_body() {
    init_test("sync_variant_without_return_on_cancel_waits_for_body");
    let pool = Arc::new(WorkerPool::new(0, 2));

    let token = CancelToken::new();
    let state = Arc::new(AtomicUsize::new(STARTING));
    let (started_tx, started_rx) = mpsc::channel();
    let release = Arc::new(Mutex::new(()));

    let task: Task<i64> = Task::new(None, None, Some(token.clone()), None);

    let hold = release.lock().expect("lock poisoned");
    let runner = {
        let task = task.clone();
        let pool = Arc::clone(&pool);
        let body = cooperative_body(Arc::clone(&state), started_tx, Arc::clone(&release));
        thread::spawn(move || {
            task.run_in_thread_sync_on(&pool, body);
        })
    };

    started_rx.recv().expect("body started");
    token.cancel();
    drop(hold);
    runner.join().expect("runner thread panicked");

    assert_eq!(state.load(Ordering::Acquire), COMPLETED);
    let err = task.propagate().expect_err("cancellation wins");
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    taskcell::test_complete!("sync_variant_without_return_on_cancel_waits_for_body");
}

#[test]
fn sync_variant_with_return_on_cancel_unblocks_early() {
    init_test("sync_variant_with_return_on_cancel_unblocks_early");
    let pool = Arc::new(WorkerPool::new(0, 2));

    let token = CancelToken::new();
    let state = Arc::new(AtomicUsize::new(STARTING));
    let (started_tx, started_rx) = mpsc::channel();
    let release = Arc::new(Mutex::new(()));

    let task: Task<i64> = Task::new(None, None, Some(token.clone()), None);
    assert!(task.set_return_on_cancel(true));

    let hold = release.lock().expect("lock poisoned");
    let runner = {
        let task = task.clone();
        let pool = Arc::clone(&pool);
        let body = cooperative_body(Arc::clone(&state), started_tx, Arc::clone(&release));
        thread::spawn(move || {
            task.run_in_thread_sync_on(&pool, body);
        })
    };

    started_rx.recv().expect("body started");
    token.cancel();
    runner.join().expect("runner thread panicked");

    // The sync call returned while the body is still blocked on the gate.
    assert_eq!(state.load(Ordering::Acquire), RUNNING);
    assert!(task.is_completed());
    let err = task.propagate().expect_err("cancellation wins");
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    drop(hold);
    assert!(wait_until(Duration::from_secs(5), || {
        state.load(Ordering::Acquire) == CANCELLED
    }));
    assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    taskcell::test_complete!("sync_variant_with_return_on_cancel_unblocks_early");
}

#[test]
fn sync_variant_precancelled_returns_before_body_starts() {
    init_test("sync_variant_precancelled_returns_before_body_starts");
    let pool = Arc::new(WorkerPool::new(0, 1));

    let token = CancelToken::new();
    let state = Arc::new(AtomicUsize::new(STARTING));
    let (started_tx, started_rx) = mpsc::channel();
    let release = Arc::new(Mutex::new(()));

    let task: Task<i64> = Task::new(None, None, Some(token.clone()), None);
    assert!(task.set_return_on_cancel(true));
    token.cancel();

    // Clog the single worker so the body cannot possibly start before the
    // sync call returns.
    let gate = Arc::new(Mutex::new(()));
    let clog_guard = gate.lock().expect("lock poisoned");
    {
        let gate = Arc::clone(&gate);
        pool.submit(taskcell::Priority::High, None, move || {
            drop(gate.lock().expect("lock poisoned"));
        });
    }
    assert!(wait_until(Duration::from_secs(5), || pool.busy_threads() == 1));

    {
        let task = task.clone();
        let pool_clone = Arc::clone(&pool);
        let body = cooperative_body(Arc::clone(&state), started_tx, Arc::clone(&release));
        // Already-cancelled + return-on-cancel: the sync call finishes even
        // though the body is stuck behind the clog.
        task.run_in_thread_sync_on(&pool_clone, body);
    }
    assert_eq!(state.load(Ordering::Acquire), STARTING);
    let err = task.propagate().expect_err("cancellation wins");
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    // The body still runs for its side effects.
    drop(clog_guard);
    started_rx.recv().expect("body still runs");
    assert!(wait_until(Duration::from_secs(5), || {
        state.load(Ordering::Acquire) == CANCELLED
    }));
    assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    taskcell::test_complete!("sync_variant_precancelled_returns_before_body_starts");
}

/// Step-locked body for the toggle-atomicity tests. After every toggle it
/// reports the observed result and waits for the main thread.
fn toggling_body(
    steps: mpsc::Sender<usize>,
    go: mpsc::Receiver<()>,
) -> impl FnOnce(
    Task<i64>,
    Option<taskcell::SourceObject>,
    Option<taskcell::TaskData>,
    Option<CancelToken>,
) + Send
       + 'static {
    move |task, _source, _data, _token| {
        steps.send(1).expect("main gone");
        go.recv().expect("main gone");

        let step = if task.set_return_on_cancel(false) { 2 } else { 3 };
        steps.send(step).expect("main gone");
        go.recv().expect("main gone");

        let step = if task.set_return_on_cancel(true) { 4 } else { 5 };
        steps.send(step).expect("main gone");
        go.recv().expect("main gone");

        let step = if task.set_return_on_cancel(true) { 6 } else { 7 };
        steps.send(step).expect("main gone");
        go.recv().expect("main gone");

        task.return_value(MAGIC);
    }
}

/// Without cancellation every toggle succeeds; the cancel at the end still
/// wins over the body's value.
#[test]
fn toggle_succeeds_until_cancellation() {
    init_test("toggle_succeeds_until_cancellation");
    let ctx = Context::new();
    let _guard = ctx.enter();
    let pool = WorkerPool::new(0, 2);

    let token = CancelToken::new();
    let callback_ran = Arc::new(AtomicBool::new(false));
    let (steps_tx, steps_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel();

    let ctx_clone = ctx.clone();
    let callback_ran_clone = Arc::clone(&callback_ran);
    let task: Task<i64> = Task::new(
        None,
        None,
        Some(token.clone()),
        Some(Box::new(move |task| {
            let err = task.propagate().expect_err("cancelled result");
            assert_eq!(err.kind(), ErrorKind::Cancelled);
            callback_ran_clone.store(true, Ordering::Release);
            ctx_clone.quit();
        })),
    );
    assert!(task.set_return_on_cancel(true));
    task.run_in_thread_on(&pool, toggling_body(steps_tx, go_rx));
    drop(task);

    assert_eq!(steps_rx.recv().expect("step"), 1);
    go_tx.send(()).expect("body gone");
    assert_eq!(steps_rx.recv().expect("step"), 2);
    go_tx.send(()).expect("body gone");
    assert_eq!(steps_rx.recv().expect("step"), 4);
    go_tx.send(()).expect("body gone");
    assert_eq!(steps_rx.recv().expect("step"), 6);

    // Cancel before releasing the final step: the body's return loses.
    token.cancel();
    assert!(!callback_ran.load(Ordering::Acquire));
    go_tx.send(()).expect("body gone");

    ctx.run();
    assert!(callback_ran.load(Ordering::Acquire));
    assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    taskcell::test_complete!("toggle_succeeds_until_cancellation");
}

/// Cancelling while return-on-cancel is temporarily off does not complete
/// the task, and freezes the toggle in both directions.
#[test]
fn toggle_fails_after_cancellation_observed() {
    init_test("toggle_fails_after_cancellation_observed");
    let ctx = Context::new();
    let _guard = ctx.enter();
    let pool = WorkerPool::new(0, 2);

    let token = CancelToken::new();
    let callback_ran = Arc::new(AtomicBool::new(false));
    let (steps_tx, steps_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel();

    let ctx_clone = ctx.clone();
    let callback_ran_clone = Arc::clone(&callback_ran);
    let task: Task<i64> = Task::new(
        None,
        None,
        Some(token.clone()),
        Some(Box::new(move |task| {
            let err = task.propagate().expect_err("cancelled result");
            assert_eq!(err.kind(), ErrorKind::Cancelled);
            callback_ran_clone.store(true, Ordering::Release);
            ctx_clone.quit();
        })),
    );
    assert!(task.set_return_on_cancel(true));
    task.run_in_thread_on(&pool, toggling_body(steps_tx, go_rx));

    assert_eq!(steps_rx.recv().expect("step"), 1);
    assert!(task.return_on_cancel());
    go_tx.send(()).expect("body gone");

    // The body turned the mode off.
    assert_eq!(steps_rx.recv().expect("step"), 2);
    assert!(!task.return_on_cancel());

    // Cancel lands while disarmed: no completion happens.
    token.cancel();
    while ctx.iterate(false) {}
    assert!(!callback_ran.load(Ordering::Acquire));
    go_tx.send(()).expect("body gone");

    // Both re-arming attempts fail; the body still owns the return.
    assert_eq!(steps_rx.recv().expect("step"), 5);
    assert!(!task.return_on_cancel());
    go_tx.send(()).expect("body gone");
    assert_eq!(steps_rx.recv().expect("step"), 7);
    go_tx.send(()).expect("body gone");

    ctx.run();
    assert!(callback_ran.load(Ordering::Acquire));

    drop(task);
    assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    taskcell::test_complete!("toggle_fails_after_cancellation_observed");
}

/// The completion callback is never invoked from inside the cancellation
/// signal: a handler that returns on the task only schedules completion.
#[test]
fn cancellation_is_observed_asynchronously() {
    init_test("cancellation_is_observed_asynchronously");

    // A few rounds to shake out timing between the cancel and the loop.
    for round in 0..5 {
        taskcell::test_section!(format!("round {round}"));
        let ctx = Context::new();
        let _guard = ctx.enter();

        let token = CancelToken::new();
        let callback_ran = Arc::new(AtomicBool::new(false));
        let notified = Arc::new(AtomicBool::new(false));

        let ctx_clone = ctx.clone();
        let callback_ran_clone = Arc::clone(&callback_ran);
        let task: Task<bool> = Task::new(
            None,
            None,
            Some(token.clone()),
            Some(Box::new(move |task| {
                assert!(task.had_error());
                let err = task.propagate().expect_err("cancelled result");
                assert_eq!(err.kind(), ErrorKind::Cancelled);
                callback_ran_clone.store(true, Ordering::Release);
                ctx_clone.quit();
            })),
        );
        let notified_clone = Arc::clone(&notified);
        task.connect_completed(move || {
            notified_clone.store(true, Ordering::Release);
        });

        // The "implementation": reacts to cancellation by returning on the
        // task, the way an async operation's cancel handler would.
        let impl_task = task.clone();
        token.connect(move || {
            impl_task.return_error(Error::failed("interrupted"));
            // Still inside the cancellation signal: nothing has completed.
            assert!(!impl_task.is_completed());
        });

        let callback_ran_probe = Arc::clone(&callback_ran);
        let notified_probe = Arc::clone(&notified);
        let token_clone = token.clone();
        ctx.schedule_idle(taskcell::Priority::Default, move || {
            token_clone.cancel();
            // The cancel ran the handler synchronously, but completion is
            // deferred to a later loop iteration.
            assert!(!callback_ran_probe.load(Ordering::Acquire));
            assert!(!notified_probe.load(Ordering::Acquire));
        });

        ctx.run();
        assert!(callback_ran.load(Ordering::Acquire));
        assert!(notified.load(Ordering::Acquire));
        assert!(task.is_completed());
    }
    taskcell::test_complete!("cancellation_is_observed_asynchronously");
}
