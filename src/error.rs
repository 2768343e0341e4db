//! Error types and error handling strategy for taskcell.
//!
//! Two error classes exist in this crate and they never mix:
//!
//! - **Operation errors** are the outcome of a task. They travel through the
//!   task's result cell as [`Error`] values and are fully recoverable: the
//!   caller retrieves them with `Task::propagate` and handles them. The
//!   synthesized cancellation error is the only variant the runtime itself
//!   produces; everything else is an opaque caller payload.
//! - **Usage defects** (double return, disposal before return, double
//!   consumption, toggle races) indicate a caller bug. They are reported
//!   loudly via `tracing::error!` at the point of detection and never corrupt
//!   the state machine: the first valid transition wins and the invalid call
//!   becomes a no-op.
//!
//! Errors are explicit and typed; there are no stringly-typed errors and
//! worker bodies are expected to report failure via `return_error` rather
//! than by unwinding.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// The kind of operation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The operation was cancelled.
    ///
    /// This is the stable variant recognized by the cancellation bridge:
    /// whenever a task's token is cancelled and cancellation checking is
    /// enabled, the propagated error has this kind regardless of what the
    /// operation returned.
    Cancelled,
    /// The operation failed.
    Failed,
    /// No result is available to propagate.
    ///
    /// Surfaced when a result is consumed more than once, or consumed before
    /// any return happened. Both are usage defects; this kind keeps the
    /// propagation API total after the defect has been reported.
    NoResult,
    /// A caller-supplied error payload the runtime merely stores and forwards.
    User,
}

impl ErrorKind {
    /// Returns a short human-readable label for the kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::NoResult => "no result",
            Self::User => "user",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged operation error carried through a task's result cell.
#[derive(Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Cow<'static, str>,
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Creates an error with the given kind and message.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Creates the cancellation error.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation was cancelled")
    }

    /// Creates a generic failure error.
    #[must_use]
    pub fn failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Failed, message)
    }

    /// Creates an opaque caller-payload error.
    #[must_use]
    pub fn user(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::User, message)
    }

    /// Creates the no-result defect error.
    #[must_use]
    pub(crate) fn no_result() -> Self {
        Self::new(ErrorKind::NoResult, "no result available")
    }

    /// Attaches an underlying source error.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns a copy of this error with `prefix` prepended to the message.
    ///
    /// The kind and source are preserved, so a prefixed cancellation error is
    /// still recognized as cancellation.
    #[must_use]
    pub fn with_message_prefix(mut self, prefix: &str) -> Self {
        self.message = Cow::Owned(format!("{prefix}{}", self.message));
        self
    }

    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` if this is the cancellation error.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("source", &self.source.as_ref().map(|s| s.to_string()))
            .finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

/// Convenience alias for results carrying a taskcell [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
