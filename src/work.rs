use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

/// The error type work items report. A cooperatively-cancelled item returns a
/// boxed [`crate::DispatchError::Cancelled`] so the dispatcher can tell
/// cancellation apart from a genuine fault.
pub type WorkError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The future a work item produces once invoked.
pub type WorkFuture = Pin<Box<dyn Future<Output = Result<(), WorkError>> + Send + 'static>>;

/// A deferred unit of work. Invoked exactly once with the dispatcher's
/// task-lifetime cancellation token; the item decides for itself whether and
/// how to honor it.
pub type WorkItem = Box<dyn FnOnce(CancellationToken) -> WorkFuture + Send + 'static>;
