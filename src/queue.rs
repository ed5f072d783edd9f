use crate::error::DispatchError;
use crate::work::WorkItem;

use std::fmt;

use fibre::mpsc::{
  self, RecvError, UnboundedAsyncReceiver as AsyncReceiver, UnboundedAsyncSender as AsyncSender,
};
use tokio_util::sync::CancellationToken;

/// An unbounded, strict-FIFO queue of pending work items.
///
/// Built on an unbounded async MPSC channel: producers never block, and an
/// item becomes visible to the consumer only once `send` has completed.
/// Splitting yields a cloneable producer for submission sites and a single
/// consumer for the dispatch loop.
pub(crate) struct WorkQueue {
  tx: AsyncSender<WorkItem>,
  rx: AsyncReceiver<WorkItem>,
}

impl fmt::Debug for WorkQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkQueue").field("len", &self.tx.len()).finish_non_exhaustive()
  }
}

impl WorkQueue {
  pub(crate) fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_async();
    Self { tx, rx }
  }

  pub(crate) fn split(self) -> (QueueProducer, QueueConsumer) {
    (QueueProducer { tx: self.tx }, QueueConsumer { rx: self.rx })
  }
}

/// The producer handle. Cloneable and shareable across submission sites.
#[derive(Clone)]
pub(crate) struct QueueProducer {
  tx: AsyncSender<WorkItem>,
}

impl fmt::Debug for QueueProducer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}

impl QueueProducer {
  /// Appends an item to the queue tail.
  ///
  /// The queue is intentionally unbounded, so this never applies
  /// backpressure; the only failure mode is a closed channel.
  pub(crate) async fn send(&self, item: WorkItem) -> Result<(), DispatchError> {
    self.tx.send(item).await.map_err(|_| DispatchError::QueueClosed)
  }

  /// Closes the sending side, after which `send` fails and the consumer
  /// drains whatever is already buffered.
  pub(crate) fn close(&self) {
    let _ = self.tx.close();
  }

  /// True once the consumer half has gone away. Closing the sender side
  /// does not flip this; `send` failure is the signal for that.
  pub(crate) fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }

  /// Number of items currently buffered.
  pub(crate) fn len(&self) -> usize {
    self.tx.len()
  }
}

/// The consumer handle. Not cloneable, enforcing the single-consumer loop.
pub(crate) struct QueueConsumer {
  rx: AsyncReceiver<WorkItem>,
}

impl fmt::Debug for QueueConsumer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueConsumer").finish_non_exhaustive()
  }
}

impl QueueConsumer {
  /// Receives the FIFO head, suspending until an item arrives or `cancel`
  /// fires. Cancellation removes nothing from the queue.
  pub(crate) async fn recv(&self, cancel: &CancellationToken) -> Result<WorkItem, DispatchError> {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(DispatchError::Cancelled),
      recv_result = self.rx.recv() => recv_result.map_err(|_: RecvError| DispatchError::QueueClosed),
    }
  }

  /// Receives the FIFO head with no cancellation path. Used by the shutdown
  /// grace window, where the wait is bounded by a deadline instead.
  pub(crate) async fn recv_uncancellable(&self) -> Result<WorkItem, DispatchError> {
    self.rx.recv().await.map_err(|_: RecvError| DispatchError::QueueClosed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::work::WorkFuture;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  // A work item that records its sequence number when invoked.
  fn tagged_item(tag: usize, sink: Arc<parking_lot::Mutex<Vec<usize>>>) -> WorkItem {
    Box::new(move |_cancel| -> WorkFuture {
      Box::pin(async move {
        sink.lock().push(tag);
        Ok(())
      })
    })
  }

  fn noop_item() -> WorkItem {
    Box::new(|_cancel| -> WorkFuture { Box::pin(async { Ok(()) }) })
  }

  #[tokio::test]
  async fn test_fifo_order_preserved() {
    let (producer, consumer) = WorkQueue::new().split();
    let cancel = CancellationToken::new();
    let sink = Arc::new(parking_lot::Mutex::new(Vec::new()));

    for tag in 0..10 {
      producer.send(tagged_item(tag, sink.clone())).await.unwrap();
    }
    assert_eq!(producer.len(), 10);

    for _ in 0..10 {
      let item = consumer.recv(&cancel).await.unwrap();
      item(cancel.clone()).await.unwrap();
    }

    assert_eq!(*sink.lock(), (0..10).collect::<Vec<_>>());
    assert_eq!(producer.len(), 0);
  }

  #[tokio::test]
  async fn test_recv_cancelled_leaves_queue_intact() {
    let (producer, consumer) = WorkQueue::new().split();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = consumer.recv(&cancel).await;
    assert!(matches!(result, Err(DispatchError::Cancelled)));

    // An already-buffered item must survive a cancelled recv.
    let fresh = CancellationToken::new();
    producer.send(noop_item()).await.unwrap();
    let cancelled_again = consumer.recv(&cancel).await;
    assert!(matches!(cancelled_again, Err(DispatchError::Cancelled)));
    assert_eq!(producer.len(), 1);

    assert!(consumer.recv(&fresh).await.is_ok());
  }

  #[tokio::test]
  async fn test_recv_wakes_on_send() {
    let (producer, consumer) = WorkQueue::new().split();
    let cancel = CancellationToken::new();

    let waiter = tokio::spawn(async move { consumer.recv(&cancel).await.map(|_| ()) });

    tokio::time::sleep(Duration::from_millis(20)).await;
    producer.send(noop_item()).await.unwrap();

    tokio::time::timeout(Duration::from_millis(100), waiter)
      .await
      .expect("recv should wake once an item is enqueued")
      .unwrap()
      .unwrap();
  }

  #[tokio::test]
  async fn test_close_drains_then_reports_closed() {
    let (producer, consumer) = WorkQueue::new().split();
    let cancel = CancellationToken::new();

    producer.send(noop_item()).await.unwrap();
    producer.close();

    assert!(consumer.recv(&cancel).await.is_ok());
    let result = consumer.recv(&cancel).await;
    assert!(matches!(result, Err(DispatchError::QueueClosed)));

    let send_result = producer.send(noop_item()).await;
    assert!(matches!(send_result, Err(DispatchError::QueueClosed)));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_producers_deliver_every_item() {
    let (producer, consumer) = WorkQueue::new().split();
    let cancel = CancellationToken::new();
    let num_items = 200usize;
    let received = Arc::new(AtomicUsize::new(0));

    let mut senders = Vec::new();
    for _ in 0..num_items {
      let p = producer.clone();
      senders.push(tokio::spawn(async move {
        p.send(noop_item()).await.unwrap();
      }));
    }
    for handle in senders {
      handle.await.unwrap();
    }

    for _ in 0..num_items {
      consumer.recv(&cancel).await.unwrap();
      received.fetch_add(1, Ordering::SeqCst);
    }
    assert_eq!(received.load(Ordering::SeqCst), num_items);
    assert_eq!(producer.len(), 0);
  }
}
