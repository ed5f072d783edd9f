use crate::work::WorkError;

use thiserror::Error;

/// Errors surfaced by the `work_dispatch` crate.
#[derive(Error, Debug)]
pub enum DispatchError {
  #[error("max_concurrency must be at least 1, got {0}")]
  InvalidConfiguration(usize),

  #[error("work queue is closed; the dispatcher is shutting down or already stopped")]
  QueueClosed,

  #[error("operation cancelled")]
  Cancelled,

  #[error("work item failed: {0}")]
  WorkItemFailed(#[source] WorkError),

  #[error("work item panicked during execution")]
  WorkItemPanicked,

  #[error("completion channel closed before the work item settled: {0}")]
  ResultChannelClosed(String),

  #[error("completion result already taken")]
  ResultUnavailable,
}

impl DispatchError {
  /// True when a boxed work-item error is a cooperative-cancellation report.
  pub(crate) fn is_cancellation(err: &WorkError) -> bool {
    matches!(err.downcast_ref::<DispatchError>(), Some(DispatchError::Cancelled))
  }
}
