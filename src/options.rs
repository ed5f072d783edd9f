use crate::error::DispatchError;

use std::time::Duration;

/// Default concurrency cap, effectively unbounded for normal workloads.
pub const DEFAULT_MAX_CONCURRENCY: usize = 200;

/// Default duration of the shutdown grace window, during which items enqueued
/// concurrently with the shutdown signal are still dispatched.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Validated dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherOptions {
  max_concurrency: usize,
  grace_period: Duration,
}

impl Default for DispatcherOptions {
  fn default() -> Self {
    Self {
      max_concurrency: DEFAULT_MAX_CONCURRENCY,
      grace_period: DEFAULT_GRACE_PERIOD,
    }
  }
}

impl DispatcherOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the maximum number of concurrently executing work items.
  ///
  /// Fails with [`DispatchError::InvalidConfiguration`] for a cap of zero.
  /// The cap is advisory relative to the runtime's own scheduling limits;
  /// achieved concurrency may be lower under resource starvation.
  pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Result<Self, DispatchError> {
    if max_concurrency < 1 {
      return Err(DispatchError::InvalidConfiguration(max_concurrency));
    }
    self.max_concurrency = max_concurrency;
    Ok(self)
  }

  /// Sets the shutdown grace window. A tunable, not a contract: it only
  /// bridges the race between a producer enqueuing and shutdown firing.
  pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
    self.grace_period = grace_period;
    self
  }

  pub fn max_concurrency(&self) -> usize {
    self.max_concurrency
  }

  pub fn grace_period(&self) -> Duration {
    self.grace_period
  }
}
