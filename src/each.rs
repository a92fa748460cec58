//! Shorthand constructors for common pool shapes.

use crate::concurrency::Concurrency;
use crate::error::PoolError;
use crate::pool::{EachLimit, PoolAggregate};
use crate::source::Source;
use crate::task::IntoTask;

use std::sync::Arc;

use parking_lot::Mutex;

/// A pool with unlimited concurrency and both callbacks set.
pub fn of<S, T, E, F, G>(source: S, on_fulfilled: F, on_rejected: G) -> EachLimit<S>
where
  S: Source + Send + 'static,
  S::Key: Send,
  S::Item: IntoTask<Value = T, Reason = E>,
  S::Error: From<PoolError>,
  F: FnMut(T, S::Key, &PoolAggregate<S>) + Send + 'static,
  G: FnMut(E, S::Key, &PoolAggregate<S>) + Send + 'static,
{
  EachLimit::new(source).on_fulfilled(on_fulfilled).on_rejected(on_rejected)
}

/// Like [`of`], with at most `concurrency` tasks in flight.
pub fn of_limit<S, T, E, F, G>(
  source: S,
  concurrency: impl Into<Concurrency>,
  on_fulfilled: F,
  on_rejected: G,
) -> EachLimit<S>
where
  S: Source + Send + 'static,
  S::Key: Send,
  S::Item: IntoTask<Value = T, Reason = E>,
  S::Error: From<PoolError>,
  F: FnMut(T, S::Key, &PoolAggregate<S>) + Send + 'static,
  G: FnMut(E, S::Key, &PoolAggregate<S>) + Send + 'static,
{
  of(source, on_fulfilled, on_rejected).concurrency(concurrency)
}

/// Like [`of_limit`], but the first failing task rejects the aggregate with
/// its reason, stopping the pool.
pub fn of_limit_all<S, T, E, F>(source: S, concurrency: impl Into<Concurrency>, on_fulfilled: F) -> EachLimit<S>
where
  S: Source + Send + 'static,
  S::Key: Send,
  S::Item: IntoTask<Value = T, Reason = E>,
  S::Error: From<PoolError> + From<E>,
  F: FnMut(T, S::Key, &PoolAggregate<S>) + Send + 'static,
{
  of_limit(source, concurrency, on_fulfilled, |reason: E, _key, aggregate: &PoolAggregate<S>| {
    aggregate.reject(reason.into());
  })
}

/// Runs every task and collects the `(key, value)` pairs, sorted by key.
///
/// The first failing task rejects the whole run.
pub async fn all<S, T, E>(source: S, concurrency: impl Into<Concurrency>) -> Result<Vec<(S::Key, T)>, S::Error>
where
  S: Source + Send + 'static,
  S::Key: Ord + Send + 'static,
  S::Item: IntoTask<Value = T, Reason = E>,
  S::Error: From<PoolError> + From<E> + Clone,
  T: Send + 'static,
{
  let collected = Arc::new(Mutex::new(Vec::new()));
  let sink = collected.clone();
  of_limit_all(source, concurrency, move |value, key, _aggregate| {
    sink.lock().push((key, value));
  })
  .wait()
  .await?;

  let mut values = std::mem::take(&mut *collected.lock());
  values.sort_by(|left, right| left.0.cmp(&right.0));
  Ok(values)
}

/// Runs every task and collects each `(key, outcome)`, sorted by key.
///
/// Task failures are collected, never raised; only a source failure rejects
/// the run.
pub async fn settle_all<S, T, E>(
  source: S,
  concurrency: impl Into<Concurrency>,
) -> Result<Vec<(S::Key, Result<T, E>)>, S::Error>
where
  S: Source + Send + 'static,
  S::Key: Ord + Send + 'static,
  S::Item: IntoTask<Value = T, Reason = E>,
  S::Error: From<PoolError> + Clone,
  T: Send + 'static,
  E: Send + 'static,
{
  let collected = Arc::new(Mutex::new(Vec::new()));
  let fulfilled_sink = collected.clone();
  let rejected_sink = collected.clone();
  of_limit(
    source,
    concurrency,
    move |value, key, _aggregate| fulfilled_sink.lock().push((key, Ok(value))),
    move |reason, key, _aggregate| rejected_sink.lock().push((key, Err(reason))),
  )
  .wait()
  .await?;

  let mut outcomes = std::mem::take(&mut *collected.lock());
  outcomes.sort_by(|left, right| left.0.cmp(&right.0));
  Ok(outcomes)
}
