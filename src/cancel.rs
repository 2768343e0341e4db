//! Cancellation tokens.
//!
//! A [`CancelToken`] is the external cancellation collaborator consumed by
//! the task core: callers create one, hand it to a task, and later request
//! cancellation from any thread. The token itself carries no policy; it is a
//! latch with an observer list.
//!
//! # Handler semantics
//!
//! - The first [`cancel`](CancelToken::cancel) wins; later calls are no-ops.
//! - [`connect`](CancelToken::connect) on an already-cancelled token invokes
//!   the handler synchronously and registers nothing.
//! - A connected handler runs exactly once, on the thread that called
//!   `cancel` (or `connect`, in the already-cancelled case). Handlers that
//!   need a different thread must marshal themselves; the task core does so
//!   through its deferred completion path.
//! - `cancel()` must not be called from within a handler connected to the
//!   same token. The latch makes the nested call a no-op, but the contract
//!   exists so that handler code stays portable to stricter token
//!   implementations.

use crate::event::HandlerId;
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type CancelHandler = Arc<dyn Fn() + Send + Sync + 'static>;

struct TokenInner {
    cancelled: AtomicBool,
    handlers: Mutex<SmallVec<[(HandlerId, CancelHandler); 2]>>,
    next_id: AtomicU64,
}

/// A clonable cancellation latch with observer registration.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Creates a token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                handlers: Mutex::new(SmallVec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Returns `true` if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Requests cancellation.
    ///
    /// The first call flips the latch and runs every connected handler on
    /// the calling thread; subsequent calls do nothing. Handlers are drained
    /// as they run, so no handler observes more than one cancellation.
    pub fn cancel(&self) {
        let drained = {
            let mut handlers = self.inner.handlers.lock().expect("lock poisoned");
            if self
                .inner
                .cancelled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            std::mem::take(&mut *handlers)
        };
        tracing::trace!(handlers = drained.len(), "cancellation requested");
        for (_, handler) in drained {
            handler();
        }
    }

    /// Connects a cancellation handler.
    ///
    /// If the token is already cancelled the handler is invoked immediately
    /// on this thread and [`HandlerId::NONE`] is returned; otherwise the
    /// handler is registered and its handle returned.
    pub fn connect(&self, handler: impl Fn() + Send + Sync + 'static) -> HandlerId {
        {
            let mut handlers = self.inner.handlers.lock().expect("lock poisoned");
            if !self.inner.cancelled.load(Ordering::Acquire) {
                let id = HandlerId::from_raw(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
                handlers.push((id, Arc::new(handler)));
                return id;
            }
        }
        handler();
        HandlerId::NONE
    }

    /// Disconnects a previously connected handler.
    ///
    /// Returns `false` if the handler was never registered, already ran, or
    /// was already disconnected.
    pub fn disconnect(&self, id: HandlerId) -> bool {
        if id.is_none() {
            return false;
        }
        let mut handlers = self.inner.handlers.lock().expect("lock poisoned");
        let before = handlers.len();
        handlers.retain(|(other, _)| *other != id);
        handlers.len() != before
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field(
                "handlers",
                &self.inner.handlers.lock().expect("lock poisoned").len(),
            )
            .finish()
    }
}

impl PartialEq for CancelToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for CancelToken {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn cancel_flips_latch_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn handler_runs_on_cancel() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        let id = token.connect(move || {
            hits_clone.fetch_add(1, Ordering::Relaxed);
        });
        assert!(!id.is_none());

        token.cancel();
        token.cancel();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn connect_after_cancel_fires_immediately() {
        let token = CancelToken::new();
        token.cancel();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let id = token.connect(move || {
            hits_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert!(id.is_none());
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn disconnect_prevents_delivery() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        let id = token.connect(move || {
            hits_clone.fetch_add(1, Ordering::Relaxed);
        });
        assert!(token.disconnect(id));

        token.cancel();
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn racing_cancels_run_handlers_once() {
        for _ in 0..50 {
            let token = CancelToken::new();
            let hits = Arc::new(AtomicUsize::new(0));

            let hits_clone = Arc::clone(&hits);
            token.connect(move || {
                hits_clone.fetch_add(1, Ordering::Relaxed);
            });

            let mut threads = Vec::new();
            for _ in 0..4 {
                let token = token.clone();
                threads.push(thread::spawn(move || token.cancel()));
            }
            for t in threads {
                t.join().expect("cancel thread panicked");
            }

            assert_eq!(hits.load(Ordering::Relaxed), 1);
        }
    }
}
