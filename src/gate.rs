use crate::error::DispatchError;

use std::sync::Arc;

use futures_intrusive::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// A counting admission gate bounding how many work items execute at once.
///
/// Backed by a fair async semaphore so waiters are admitted in arrival order.
/// Permits are returned through [`GatePermit`]'s `Drop`, guaranteeing the 1:1
/// acquire/release pairing even when the protected work faults or panics.
#[derive(Debug)]
pub(crate) struct ConcurrencyGate {
  permits: Semaphore,
  max: usize,
}

/// A held permit. Dropping it releases exactly one slot back to the gate.
#[derive(Debug)]
pub(crate) struct GatePermit {
  gate: Arc<ConcurrencyGate>,
}

impl Drop for GatePermit {
  fn drop(&mut self) {
    self.gate.permits.release(1);
  }
}

impl ConcurrencyGate {
  pub(crate) fn new(max: usize) -> Arc<Self> {
    Arc::new(Self {
      permits: Semaphore::new(true, max),
      max,
    })
  }

  /// Acquires one permit, suspending until a slot frees up.
  ///
  /// Deliberately not cancellable: an item already pulled off the queue is
  /// committed to run, so the shutdown drain relies on this wait surviving
  /// the shutdown signal.
  pub(crate) async fn acquire_owned(self: Arc<Self>) -> GatePermit {
    let mut releaser = self.permits.acquire(1).await;
    // Transfer ownership of the slot to the RAII permit.
    releaser.disarm();
    drop(releaser);
    GatePermit { gate: self }
  }

  /// Acquires one permit unless `cancel` fires first.
  // The dispatch loop only ever takes the uncancellable path; this is the
  // cancellable half of the gate's contract for other callers.
  #[allow(dead_code)]
  pub(crate) async fn acquire_owned_cancellable(
    self: Arc<Self>,
    cancel: &CancellationToken,
  ) -> Result<GatePermit, DispatchError> {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(DispatchError::Cancelled),
      mut releaser = self.permits.acquire(1) => {
        releaser.disarm();
        drop(releaser);
        Ok(GatePermit { gate: self.clone() })
      }
    }
  }

  /// Number of permits currently free.
  pub(crate) fn available(&self) -> usize {
    self.permits.permits()
  }

  pub(crate) fn max_permits(&self) -> usize {
    self.max
  }
}
