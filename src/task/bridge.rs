//! Cancellation-bridge state machine.
//!
//! Arbitrates the single permitted return between a worker body and the
//! cancellation handler when return-on-cancel is in play. The bridge is
//! plain data; the task's state mutex serializes every access, so the
//! {inspect, fire, flip} sequences here are atomic with respect to both the
//! toggle operation and the token's cancel handler.
//!
//! The rules this encodes:
//!
//! - Toggling return-on-cancel succeeds only before the cancel handler has
//!   run. Once cancellation has been observed, both `set(true)` and
//!   `set(false)` fail, so the worker body and the cancellation path can
//!   never both believe they own the return.
//! - The auto-return fires at most once, and only while armed.
//! - After the auto-return fires, the body's own returns are swallowed
//!   silently rather than reported as defects.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeState {
    /// No token is bound; return-on-cancel can never engage.
    NotCancellable,
    /// Token bound, return-on-cancel off, no cancellation observed.
    Idle,
    /// Return-on-cancel on, no cancellation observed.
    Armed,
    /// Cancellation observed while disarmed: the body still owns the
    /// return, but the mode can no longer be toggled.
    CancelSeen,
    /// Cancellation observed while armed: the auto-return fired and owns
    /// the task's single return.
    CancelFired,
}

#[derive(Debug)]
pub(crate) struct CancelBridge {
    state: BridgeState,
}

impl CancelBridge {
    pub(crate) const fn new(has_token: bool) -> Self {
        Self {
            state: if has_token {
                BridgeState::Idle
            } else {
                BridgeState::NotCancellable
            },
        }
    }

    /// Attempts to toggle return-on-cancel. Returns `false` (and changes
    /// nothing) once cancellation has been observed, or when no token is
    /// bound.
    pub(crate) fn set_return_on_cancel(&mut self, enabled: bool) -> bool {
        match (self.state, enabled) {
            (BridgeState::Idle | BridgeState::Armed, true) => {
                self.state = BridgeState::Armed;
                true
            }
            (BridgeState::Idle | BridgeState::Armed, false) => {
                self.state = BridgeState::Idle;
                true
            }
            (
                BridgeState::NotCancellable | BridgeState::CancelSeen | BridgeState::CancelFired,
                _,
            ) => false,
        }
    }

    /// Returns the user-visible return-on-cancel flag.
    pub(crate) const fn return_on_cancel(&self) -> bool {
        matches!(self.state, BridgeState::Armed | BridgeState::CancelFired)
    }

    /// Records that the token's cancel handler ran. Returns `true` when the
    /// caller must fire the automatic cancellation return.
    pub(crate) fn on_cancel(&mut self) -> bool {
        match self.state {
            BridgeState::Armed => {
                self.state = BridgeState::CancelFired;
                true
            }
            BridgeState::Idle => {
                self.state = BridgeState::CancelSeen;
                false
            }
            BridgeState::NotCancellable
            | BridgeState::CancelSeen
            | BridgeState::CancelFired => false,
        }
    }

    /// Returns `true` if the auto-return fired and later caller returns
    /// must be dropped silently.
    pub(crate) const fn swallows_returns(&self) -> bool {
        matches!(self.state, BridgeState::CancelFired)
    }
}
