use futures::future::{self, BoxFuture, Ready};
use futures::FutureExt;
use std::future::{Future, IntoFuture};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

/// The type-erased future the pool keeps in flight for each task.
pub type TaskToExecute<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

/// Anything the pool can run as a task: a value that eventually settles with
/// `Ok(value)` or `Err(reason)`.
///
/// Implemented for every `Send + 'static` [`IntoFuture`] whose output is a
/// `Result`, which covers async blocks, boxed futures and already-settled
/// values such as [`fulfilled`] and [`rejected`].
pub trait IntoTask {
  type Value: Send + 'static;
  type Reason: Send + 'static;

  fn into_task(self) -> TaskToExecute<Self::Value, Self::Reason>;
}

impl<F, T, E> IntoTask for F
where
  F: IntoFuture<Output = Result<T, E>>,
  F::IntoFuture: Send + 'static,
  T: Send + 'static,
  E: Send + 'static,
{
  type Value = T;
  type Reason = E;

  fn into_task(self) -> TaskToExecute<T, E> {
    Box::pin(self.into_future())
  }
}

/// An already-successful task.
pub fn fulfilled<T, E>(value: T) -> Ready<Result<T, E>> {
  future::ready(Ok(value))
}

/// An already-failed task.
pub fn rejected<T, E>(reason: E) -> Ready<Result<T, E>> {
  future::ready(Err(reason))
}

/// What a task settled with, or the payload of its panic.
pub(crate) type TaskOutcome<T, E> = std::thread::Result<Result<T, E>>;

/// A task in flight, tagged with its submission index so the pool can find
/// its key once it settles.
pub(crate) type RunningTask<T, E> = BoxFuture<'static, (u64, TaskOutcome<T, E>)>;

/// Wraps `task` so that a panic while polling it becomes its outcome.
pub(crate) fn run_caught<I: IntoTask>(index: u64, task: I) -> RunningTask<I::Value, I::Reason> {
  AssertUnwindSafe(task.into_task())
    .catch_unwind()
    .map(move |outcome| (index, outcome))
    .boxed()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::PoolError;

  use futures::task::noop_waker_ref;
  use std::task::{Context, Poll};

  fn assert_owned<T: Send + 'static>() {}

  // Holds for every task type without extra bounds at the use site.
  fn task_types_are_owned<I: IntoTask>() {
    assert_owned::<I::Value>();
    assert_owned::<I::Reason>();
    assert_owned::<RunningTask<I::Value, I::Reason>>();
  }

  #[test]
  fn task_values_and_reasons_outlive_the_pool() {
    task_types_are_owned::<Ready<Result<String, PoolError>>>();
    task_types_are_owned::<TaskToExecute<Vec<u8>, String>>();
  }

  #[test]
  fn running_task_reports_its_index_and_catches_panics() {
    let mut cx = Context::from_waker(noop_waker_ref());

    let mut ok = run_caught(3, fulfilled::<u32, PoolError>(7));
    match ok.as_mut().poll(&mut cx) {
      Poll::Ready((3, Ok(Ok(7)))) => {}
      _ => panic!("expected task 3 to settle with 7"),
    }

    let mut panicking = run_caught(4, async {
      if true {
        panic!("boom");
      }
      Ok::<u32, PoolError>(0)
    });
    match panicking.as_mut().poll(&mut cx) {
      Poll::Ready((4, Err(_))) => {}
      _ => panic!("expected task 4 to report its panic"),
    }
  }
}
