//! A Tokio-based background work dispatcher: callers enqueue deferred,
//! cancellation-aware units of work; a hosted loop drains the queue and runs
//! each item under a bounded concurrency cap, with a two-phase graceful
//! shutdown that never strands a dispatched item.

mod completion;
mod dispatcher;
mod error;
mod gate;
mod options;
mod queue;
mod work;

pub use completion::CompletionHandle;
pub use dispatcher::{Dispatcher, DispatcherState};
pub use error::DispatchError;
pub use options::{DispatcherOptions, DEFAULT_GRACE_PERIOD, DEFAULT_MAX_CONCURRENCY};
pub use work::{WorkError, WorkFuture, WorkItem};
