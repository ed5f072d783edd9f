use crate::error::DispatchError;
use crate::gate::ConcurrencyGate;
use crate::options::DispatcherOptions;
use crate::queue::{QueueConsumer, QueueProducer, WorkQueue};
use crate::work::WorkItem;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_DISPATCH_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Lifecycle of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
  NotStarted,
  Running,
  /// Shutdown was signaled; the grace window and the in-flight wait are in
  /// progress. No new long-term work is admitted.
  Draining,
  /// Every dispatched item has finished and the loop has exited.
  Stopped,
}

/// A process-local background work dispatcher.
///
/// Callers enqueue [`WorkItem`]s; a hosted loop dequeues them in FIFO order
/// and runs each on its own task under a concurrency cap. Shutdown is a
/// two-phase drain: a short grace window catches items enqueued concurrently
/// with the shutdown signal, then the loop waits for every in-flight
/// execution to finish before reporting [`DispatcherState::Stopped`].
pub struct Dispatcher {
  name: Arc<String>,
  gate: Arc<ConcurrencyGate>,
  queue_tx: QueueProducer,
  queue_rx: Mutex<Option<QueueConsumer>>,
  in_flight: Arc<DashMap<u64, ()>>,
  drained: Arc<Notify>,
  shutdown_token: CancellationToken,
  lifetime_token: CancellationToken,
  state: Arc<Mutex<DispatcherState>>,
  grace_period: Duration,
  tokio_handle: TokioHandle,
  worker_join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
  /// Creates a dispatcher in the `NotStarted` state. Nothing runs until
  /// [`Dispatcher::start`] is called by the host.
  pub fn new(options: DispatcherOptions, tokio_handle: TokioHandle, name: &str) -> Arc<Self> {
    let (queue_tx, queue_rx) = WorkQueue::new().split();

    Arc::new(Self {
      name: Arc::new(name.to_string()),
      gate: ConcurrencyGate::new(options.max_concurrency()),
      queue_tx,
      queue_rx: Mutex::new(Some(queue_rx)),
      in_flight: Arc::new(DashMap::new()),
      drained: Arc::new(Notify::new()),
      shutdown_token: CancellationToken::new(),
      lifetime_token: CancellationToken::new(),
      state: Arc::new(Mutex::new(DispatcherState::NotStarted)),
      grace_period: options.grace_period(),
      tokio_handle,
      worker_join_handle: Mutex::new(None),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn state(&self) -> DispatcherState {
    *self.state.lock()
  }

  /// Number of dispatched items that have not yet finished.
  pub fn in_flight_count(&self) -> usize {
    self.in_flight.len()
  }

  /// Number of items waiting in the queue.
  pub fn queued_count(&self) -> usize {
    self.queue_tx.len()
  }

  /// Free slots on the concurrency gate.
  pub fn available_permits(&self) -> usize {
    self.gate.available()
  }

  pub fn max_concurrency(&self) -> usize {
    self.gate.max_permits()
  }

  /// The shutdown signal observed by the dispatch loop. A host lifecycle
  /// manager may cancel this directly instead of calling
  /// [`Dispatcher::shutdown`]; the loop then drains and stops on its own.
  pub fn shutdown_token(&self) -> CancellationToken {
    self.shutdown_token.clone()
  }

  /// Appends a work item to the queue. Returns as soon as the item is
  /// admitted; the queue is unbounded so a slow consumer never blocks
  /// producers.
  pub async fn enqueue(&self, item: WorkItem) -> Result<(), DispatchError> {
    if self.shutdown_token.is_cancelled() || self.queue_tx.is_closed() {
      warn!(name = %*self.name, "Enqueue: dispatcher is shutting down or stopped; rejecting work item.");
      return Err(DispatchError::QueueClosed);
    }
    trace!(name = %*self.name, "Enqueueing work item.");
    self.queue_tx.send(item).await
  }

  /// Begins the dequeue loop. Called once by the host; a second call warns
  /// and does nothing.
  pub fn start(&self) {
    {
      let mut state = self.state.lock();
      if *state != DispatcherState::NotStarted {
        warn!(name = %*self.name, state = ?*state, "Start: dispatcher already started.");
        return;
      }
      *state = DispatcherState::Running;
    }

    let queue_rx = match self.queue_rx.lock().take() {
      Some(consumer) => consumer,
      None => {
        warn!(name = %*self.name, "Start: queue consumer already taken.");
        return;
      }
    };

    let name = self.name.clone();
    let gate = self.gate.clone();
    let tasks_tokio_handle = self.tokio_handle.clone();
    let in_flight = self.in_flight.clone();
    let drained = self.drained.clone();
    let shutdown_token = self.shutdown_token.clone();
    let lifetime_token = self.lifetime_token.clone();
    let state = self.state.clone();
    let grace_period = self.grace_period;

    let span = info_span!("dispatch_loop", name = %*self.name);
    let join_handle = self.tokio_handle.spawn(
      async move {
        Self::run_dispatch_loop(
          name,
          gate,
          queue_rx,
          tasks_tokio_handle,
          in_flight,
          drained,
          shutdown_token,
          lifetime_token,
          state,
          grace_period,
        )
        .await;
      }
      .instrument(span),
    );

    *self.worker_join_handle.lock() = Some(join_handle);
  }

  /// Signals shutdown and waits for the loop to reach `Stopped`.
  ///
  /// Returns only once every dispatched item has finished, which is what the
  /// host treats as "the component terminated". Safe to call more than once.
  pub async fn shutdown(self: Arc<Self>) -> Result<(), DispatchError> {
    let already_initiated = self.shutdown_token.is_cancelled();
    if !already_initiated {
      info!(name = %*self.name, "Initiating dispatcher shutdown.");
      self.shutdown_token.cancel();
    } else {
      info!(name = %*self.name, "Shutdown already in progress or initiated earlier.");
    }

    let handle_to_await: Option<JoinHandle<()>> = {
      let mut guard = self.worker_join_handle.lock();
      guard.take()
    };

    if let Some(handle) = handle_to_await {
      info!(name = %*self.name, "Waiting for dispatch loop to join.");
      match handle.await {
        Ok(()) => info!(name = %*self.name, "Dispatch loop joined."),
        Err(join_error) => {
          error!(name = %*self.name, "Error joining dispatch loop: {:?}. The loop task may have panicked.", join_error);
        }
      }
    } else {
      let mut state = self.state.lock();
      if *state == DispatcherState::NotStarted {
        // Never started, so there is nothing to drain.
        *state = DispatcherState::Stopped;
      }
      trace!(name = %*self.name, "No dispatch loop handle to join (never started, or already joined).");
    }

    self.queue_tx.close();
    Ok(())
  }

  async fn run_dispatch_loop(
    name: Arc<String>,
    gate: Arc<ConcurrencyGate>,
    queue_rx: QueueConsumer,
    tasks_tokio_handle: TokioHandle,
    in_flight: Arc<DashMap<u64, ()>>,
    drained: Arc<Notify>,
    shutdown_token: CancellationToken,
    lifetime_token: CancellationToken,
    state: Arc<Mutex<DispatcherState>>,
    grace_period: Duration,
  ) {
    info!(name = %*name, "Dispatch loop started.");

    loop {
      match queue_rx.recv(&shutdown_token).await {
        Ok(item) => {
          Self::dispatch_one(
            item,
            &name,
            &gate,
            &tasks_tokio_handle,
            &in_flight,
            &drained,
            &lifetime_token,
          );
        }
        Err(DispatchError::Cancelled) => {
          info!(name = %*name, "Shutdown signal received. Dispatch loop entering drain.");
          break;
        }
        Err(dequeue_error) => {
          if shutdown_token.is_cancelled() {
            break;
          }
          // The queue failed underneath us. Looping on a broken queue would
          // hang the host un-observably, so this is an implicit shutdown.
          error!(
            name = %*name,
            "Dequeue infrastructure fault: {}. Treating as an implicit shutdown trigger.",
            dequeue_error
          );
          break;
        }
      }
    }

    *state.lock() = DispatcherState::Draining;
    // The per-item lifetime signal fires at shutdown; items honoring it can
    // wind down early, but nothing pre-empts a mid-flight gate acquisition.
    lifetime_token.cancel();
    info!(name = %*name, "Draining: grace window open for {:?}.", grace_period);

    // Phase A: keep dequeuing for a bounded window to catch items a producer
    // enqueued concurrently with the shutdown signal.
    let grace_deadline = Instant::now() + grace_period;
    loop {
      match timeout_at(grace_deadline, queue_rx.recv_uncancellable()).await {
        Ok(Ok(item)) => {
          debug!(name = %*name, "Dispatching straggler dequeued during the grace window.");
          Self::dispatch_one(
            item,
            &name,
            &gate,
            &tasks_tokio_handle,
            &in_flight,
            &drained,
            &lifetime_token,
          );
        }
        Ok(Err(_queue_closed)) => {
          debug!(name = %*name, "Work queue closed during the grace window; nothing more can arrive.");
          break;
        }
        Err(_window_elapsed) => break,
      }
    }

    // Phase B: wait for the in-flight set to stabilize empty. Stragglers
    // dispatched moments ago may still be registering completions, so the
    // notify future is armed before every emptiness check.
    loop {
      let completion = drained.notified();
      if in_flight.is_empty() {
        break;
      }
      trace!(name = %*name, in_flight = in_flight.len(), "Waiting for in-flight work to finish.");
      completion.await;
    }

    *state.lock() = DispatcherState::Stopped;
    info!(name = %*name, "Dispatch loop stopped. All dispatched work completed.");
  }

  fn dispatch_one(
    item: WorkItem,
    name: &Arc<String>,
    gate: &Arc<ConcurrencyGate>,
    tasks_tokio_handle: &TokioHandle,
    in_flight: &Arc<DashMap<u64, ()>>,
    drained: &Arc<Notify>,
    lifetime_token: &CancellationToken,
  ) {
    let dispatch_id = NEXT_DISPATCH_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);

    // Registered before the execution task exists, so the drain can never
    // miss a dispatched item.
    in_flight.insert(dispatch_id, ());
    debug!(name = %**name, %dispatch_id, "Dequeued work item. Spawning execution.");

    let gate = gate.clone();
    let in_flight_cleanup = in_flight.clone();
    let drained = drained.clone();
    let item_lifetime_token = lifetime_token.clone();
    let name_for_execution = name.clone();
    let name_for_span = name.clone();

    tasks_tokio_handle.spawn(
      async move {
        // Not cancellable: an item already pulled off the queue is committed
        // to run, even while the host is stopping.
        let permit = gate.acquire_owned().await;

        let work_future = (item)(item_lifetime_token);
        match AssertUnwindSafe(work_future).catch_unwind().await {
          Ok(Ok(())) => {
            trace!(name = %*name_for_execution, %dispatch_id, "Work item completed.");
          }
          Ok(Err(ref err)) if DispatchError::is_cancellation(err) => {
            debug!(name = %*name_for_execution, %dispatch_id, "Work item reported cancellation.");
          }
          Ok(Err(err)) => {
            error!(name = %*name_for_execution, %dispatch_id, "Work item failed: {}", err);
          }
          Err(_panic_payload) => {
            error!(name = %*name_for_execution, %dispatch_id, "Work item panicked during execution.");
          }
        }

        // Permit back first, then the in-flight entry: the drain counts an
        // item as done only once its gate slot has been returned.
        drop(permit);
        in_flight_cleanup.remove(&dispatch_id);
        drained.notify_waiters();
      }
      .instrument(info_span!("work_item", name = %*name_for_span, %dispatch_id)),
    );
  }
}

impl Drop for Dispatcher {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(
        name = %*self.name,
        "Dispatcher dropped without explicit shutdown. Signaling the loop to drain and closing the queue."
      );
      // Signal only; never block in drop. The loop drains on its own and the
      // runtime reaps its task.
      self.shutdown_token.cancel();
      self.queue_tx.close();
    } else {
      trace!(name = %*self.name, "Drop: shutdown already initiated; nothing to signal.");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::WorkQueue;

  // A queue that fails underneath the loop (every producer gone, no shutdown
  // signal) must drain and stop rather than hang the host.
  #[tokio::test]
  async fn test_queue_fault_without_shutdown_drains_the_loop() {
    let (producer, consumer) = WorkQueue::new().split();
    drop(producer);

    let shutdown_token = CancellationToken::new();
    let lifetime_token = CancellationToken::new();
    let state = Arc::new(Mutex::new(DispatcherState::Running));

    let loop_future = Dispatcher::run_dispatch_loop(
      Arc::new("queue_fault".to_string()),
      ConcurrencyGate::new(1),
      consumer,
      tokio::runtime::Handle::current(),
      Arc::new(DashMap::new()),
      Arc::new(Notify::new()),
      shutdown_token.clone(),
      lifetime_token.clone(),
      state.clone(),
      Duration::from_millis(10),
    );

    tokio::time::timeout(Duration::from_secs(1), loop_future)
      .await
      .expect("A queue fault must terminate the loop, not leave it stuck.");

    assert!(
      !shutdown_token.is_cancelled(),
      "The loop must stop on its own, without the shutdown signal."
    );
    assert!(lifetime_token.is_cancelled(), "Entering the drain fires the lifetime signal.");
    assert_eq!(*state.lock(), DispatcherState::Stopped);
  }
}
