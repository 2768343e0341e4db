//! Taskcell: a single-assignment task primitive for thread-based runtimes.
//!
//! # Overview
//!
//! A [`Task`] represents one asynchronous operation with strict one-shot
//! semantics: exactly one return stores the result, exactly one propagation
//! consumes it, and the completion notification is delivered exactly once —
//! always on the thread that drives the task's owning [`Context`], never
//! from inside the return call and never from inside a cancellation
//! handler.
//!
//! Operations can complete three ways: the initiating code returns a result
//! inline, a body runs on the bounded priority [`WorkerPool`], or arbitrary
//! code satisfies the task later. Cancellation is consumed from an external
//! [`CancelToken`]: by default it overrides whatever the operation returns,
//! and the opt-in return-on-cancel mode lets it preempt an in-flight worker
//! body without racing the body for the task's single return.
//!
//! # Core Guarantees
//!
//! - **One return**: concurrent returns race-freely elect one winner; the
//!   rest are reported as caller bugs and change nothing.
//! - **Deferred completion**: the completion callback never runs before the
//!   function that created the task has returned to its caller.
//! - **Cancellation wins**: with checking enabled, a cancelled token always
//!   propagates as the cancellation error.
//! - **Priority ordering**: worker dispatch and completion notifications
//!   both honor task priority.
//!
//! # Module Structure
//!
//! - [`task`]: the task core (state machine, returns, propagation, dispatch)
//! - [`context`]: run-loop contexts and deferred sources
//! - [`pool`]: the bounded growable worker pool
//! - [`cancel`]: cancellation tokens
//! - [`event`]: observer/emitter glue for the `completed` property
//! - [`error`]: the tagged operation error
//! - [`test_utils`]: tracing-based test logging helpers

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
pub mod context;
pub mod error;
pub mod event;
pub mod pool;
pub mod task;
pub mod test_utils;

pub use cancel::CancelToken;
pub use context::{Context, ContextGuard, Priority, Source};
pub use error::{Error, ErrorKind, Result};
pub use event::{Emitter, HandlerId};
pub use pool::{PoolHandle, PoolOptions, WorkerPool, DEFAULT_MAX_THREADS};
pub use task::{CompletionCallback, SourceObject, Task, TaskData};
