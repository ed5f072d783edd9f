use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::work::{WorkError, WorkFuture, WorkItem};

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A handle to a work item enqueued with
/// [`Dispatcher::enqueue_with_completion`].
///
/// Resolves exactly once with the item's value, fault, or cancellation, as if
/// the work had been awaited directly.
#[derive(Debug)]
pub struct CompletionHandle<R: Send + 'static> {
  result_receiver: Option<oneshot::Receiver<Result<R, DispatchError>>>,
}

impl<R: Send + 'static> CompletionHandle<R> {
  /// Awaits the outcome of the enqueued item.
  ///
  /// # Errors
  /// Returns [`DispatchError::WorkItemFailed`] if the item returned an error,
  /// [`DispatchError::WorkItemPanicked`] if it panicked,
  /// [`DispatchError::Cancelled`] if it reported cooperative cancellation,
  /// [`DispatchError::ResultChannelClosed`] if the dispatcher stopped before
  /// the item ran, and [`DispatchError::ResultUnavailable`] on a second call.
  pub async fn await_result(mut self) -> Result<R, DispatchError> {
    match self.result_receiver.take() {
      Some(rx) => match rx.await {
        Ok(outcome) => outcome,
        Err(recv_error) => {
          // Sender dropped without settling: the item never ran, most likely
          // because the dispatcher stopped with the item still queued.
          warn!("Completion channel closed before the work item settled: {}", recv_error);
          Err(DispatchError::ResultChannelClosed(recv_error.to_string()))
        }
      },
      None => Err(DispatchError::ResultUnavailable),
    }
  }
}

impl Dispatcher {
  /// Enqueues `work` and returns a handle resolving with its outcome.
  ///
  /// The wrapper settles the handle's channel itself, so from the dispatch
  /// loop's point of view the item always succeeds: a fault or panic inside
  /// `work` is delivered to the caller, never logged twice or allowed to
  /// escape into the loop.
  pub async fn enqueue_with_completion<R, F, Fut>(
    &self,
    work: F,
  ) -> Result<CompletionHandle<R>, DispatchError>
  where
    R: Send + 'static,
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<R, WorkError>> + Send + 'static,
  {
    let (result_tx, result_rx) = oneshot::channel::<Result<R, DispatchError>>();

    let item: WorkItem = Box::new(move |cancel: CancellationToken| -> WorkFuture {
      Box::pin(async move {
        let outcome = match AssertUnwindSafe(work(cancel)).catch_unwind().await {
          Ok(Ok(value)) => Ok(value),
          Ok(Err(err)) => {
            if DispatchError::is_cancellation(&err) {
              Err(DispatchError::Cancelled)
            } else {
              Err(DispatchError::WorkItemFailed(err))
            }
          }
          Err(_panic_payload) => Err(DispatchError::WorkItemPanicked),
        };

        // A dropped receiver just means nobody is listening anymore; it must
        // not fault the dispatcher.
        if result_tx.send(outcome).is_err() {
          warn!("Completion receiver dropped before the work item settled; outcome discarded.");
        }
        Ok(())
      })
    });

    self.enqueue(item).await?;
    Ok(CompletionHandle {
      result_receiver: Some(result_rx),
    })
  }
}
