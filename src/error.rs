use thiserror::Error;

/// Errors raised by the pool itself, as opposed to the failure reasons of
/// individual tasks.
///
/// A pool's aggregate is rejected with its source's error type, which must
/// be constructible from a `PoolError`. Sources without a richer error type
/// can simply use `PoolError` directly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("Task {index} panicked while being polled")]
  TaskPanicked { index: u64 },

  #[error("Pool was dropped before its aggregate settled")]
  Cancelled,

  #[error("Source failed to produce the next task: {0}")]
  Source(String),
}
