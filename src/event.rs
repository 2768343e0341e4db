//! Plain observer/emitter glue.
//!
//! [`Emitter`] is the event-emission mechanism behind the task `completed`
//! property: observers connect and disconnect by handle, and emission calls
//! every connected observer outside the internal lock so observers may
//! connect or disconnect other observers without deadlocking.
//!
//! There is deliberately no dynamic property system here; the handful of
//! notification points in this crate are served by this one small type.

use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Identifies a connected observer so it can be disconnected later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    /// A handle that refers to no connected observer.
    ///
    /// Returned by connect operations that invoked the observer immediately
    /// instead of registering it. Disconnecting it is a no-op.
    pub const NONE: Self = Self(0);

    /// Returns `true` if this handle refers to no connected observer.
    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

type Observer = Arc<dyn Fn() + Send + Sync + 'static>;

/// A list of observers that can be notified of a unit event.
pub struct Emitter {
    observers: Mutex<SmallVec<[(HandlerId, Observer); 2]>>,
    next_id: AtomicU64,
}

impl Emitter {
    /// Creates an emitter with no observers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(SmallVec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Connects an observer and returns its handle.
    pub fn connect(&self, observer: impl Fn() + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .lock()
            .expect("lock poisoned")
            .push((id, Arc::new(observer)));
        id
    }

    /// Disconnects the observer with the given handle.
    ///
    /// Returns `false` if no such observer is connected.
    pub fn disconnect(&self, id: HandlerId) -> bool {
        if id.is_none() {
            return false;
        }
        let mut observers = self.observers.lock().expect("lock poisoned");
        let before = observers.len();
        observers.retain(|(other, _)| *other != id);
        observers.len() != before
    }

    /// Notifies every connected observer.
    ///
    /// The observer list is snapshotted first; observers run outside the
    /// lock and may freely connect or disconnect.
    pub fn emit(&self) {
        let snapshot: SmallVec<[Observer; 2]> = self
            .observers
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in snapshot {
            observer();
        }
    }

    /// Returns the number of connected observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.lock().expect("lock poisoned").len()
    }

    /// Returns `true` if no observers are connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("observers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_reaches_all_observers() {
        let emitter = Emitter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            emitter.connect(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            });
        }

        emitter.emit();
        assert_eq!(hits.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn disconnect_removes_observer() {
        let emitter = Emitter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        let id = emitter.connect(move || {
            hits_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert!(emitter.disconnect(id));
        assert!(!emitter.disconnect(id));
        emitter.emit();
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn observer_may_disconnect_during_emit() {
        let emitter = Arc::new(Emitter::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let emitter_clone = Arc::clone(&emitter);
        let hits_clone = Arc::clone(&hits);
        let id = Arc::new(Mutex::new(HandlerId::NONE));
        let id_clone = Arc::clone(&id);
        let registered = emitter.connect(move || {
            hits_clone.fetch_add(1, Ordering::Relaxed);
            let id = *id_clone.lock().expect("lock poisoned");
            emitter_clone.disconnect(id);
        });
        *id.lock().expect("lock poisoned") = registered;

        emitter.emit();
        emitter.emit();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn none_handle_is_inert() {
        let emitter = Emitter::new();
        assert!(HandlerId::NONE.is_none());
        assert!(!emitter.disconnect(HandlerId::NONE));
    }
}
